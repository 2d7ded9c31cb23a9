//! Broadcast Transport Tests
//!
//! ## Test Scopes
//! - **Data Structures**: Node identity and wire protocol encoding.
//! - **Local Bus**: Fan-out, self-delivery and peer disconnection.
//! - **Gossip Transport**: Join handshake and topic delivery over real UDP sockets.

#[cfg(test)]
mod tests {
    use crate::pubsub::PubSub;
    use crate::pubsub::local::LocalBus;
    use crate::pubsub::service::GossipPubSub;
    use crate::pubsub::types::{GossipMessage, NodeId, NodeState};
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_id_ordering_is_lexicographic() {
        let a = NodeId::from("node-a");
        let b = NodeId::from("node-b");

        assert!(a < b);
        assert_eq!(a.to_string(), "node-a");
    }

    // ============================================================
    // WIRE PROTOCOL TESTS
    // ============================================================

    #[test]
    fn test_publish_message_serialization() {
        let msg = GossipMessage::Publish {
            from: NodeId::from("node-a"),
            message_id: "m-1".to_string(),
            topic: "QUEUE_task".to_string(),
            payload: vec![1, 2, 3],
        };

        let encoded = bincode::serialize(&msg).expect("encode");
        let decoded: GossipMessage = bincode::deserialize(&encoded).expect("decode");

        match decoded {
            GossipMessage::Publish {
                from,
                message_id,
                topic,
                payload,
            } => {
                assert_eq!(from, NodeId::from("node-a"));
                assert_eq!(message_id, "m-1");
                assert_eq!(topic, "QUEUE_task");
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    // ============================================================
    // LOCAL BUS TESTS
    // ============================================================

    #[tokio::test]
    async fn test_local_bus_delivers_to_all_subscribers_including_self() {
        // ARRANGE
        let bus = LocalBus::new();
        let a = bus.endpoint(NodeId::from("a"));
        let b = bus.endpoint(NodeId::from("b"));
        let mut sub_a = a.subscribe("topic");
        let mut sub_b = b.subscribe("topic");

        // ACT
        a.publish("topic", b"hello".to_vec()).unwrap();

        // ASSERT
        assert_eq!(sub_a.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(sub_b.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_local_bus_isolates_topics() {
        let bus = LocalBus::new();
        let a = bus.endpoint(NodeId::from("a"));
        let mut other = a.subscribe("other");

        a.publish("topic", b"hello".to_vec()).unwrap();

        assert!(other.try_recv().is_err(), "No delivery across topics");
    }

    #[tokio::test]
    async fn test_local_bus_disconnect_stops_delivery_both_ways() {
        // ARRANGE
        let bus = LocalBus::new();
        let a = bus.endpoint(NodeId::from("a"));
        let b = bus.endpoint(NodeId::from("b"));
        let mut sub_a = a.subscribe("topic");
        let mut sub_b = b.subscribe("topic");

        // ACT
        bus.disconnect(&NodeId::from("b"));
        b.publish("topic", b"from-b".to_vec()).unwrap();
        a.publish("topic", b"from-a".to_vec()).unwrap();

        // ASSERT
        assert_eq!(sub_a.recv().await.unwrap(), b"from-a".to_vec());
        assert!(sub_a.try_recv().is_err(), "Disconnected peer must not reach others");
        assert!(sub_b.recv().await.is_none(), "Disconnected peer stops receiving");
        assert_eq!(a.active_nodes(), vec![NodeId::from("a")]);
    }

    #[tokio::test]
    async fn test_local_bus_active_nodes_sorted() {
        let bus = LocalBus::new();
        let b = bus.endpoint(NodeId::from("b"));
        let _a = bus.endpoint(NodeId::from("a"));

        assert_eq!(b.active_nodes(), vec![NodeId::from("a"), NodeId::from("b")]);
    }

    // ============================================================
    // GOSSIP TRANSPORT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_gossip_creation() {
        let service = GossipPubSub::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .expect("Failed to create service");

        assert_eq!(service.members.len(), 1);

        let members = service.get_alive_members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].state, NodeState::Alive);
        assert_ne!(service.local_addr().port(), 0, "Bound port must be resolved");
    }

    #[tokio::test]
    async fn test_gossip_join_and_publish() {
        // ARRANGE
        let a = GossipPubSub::new("127.0.0.1:0".parse().unwrap(), vec![])
            .await
            .unwrap();
        a.clone().start().await;

        let b = GossipPubSub::new("127.0.0.1:0".parse().unwrap(), vec![a.local_addr()])
            .await
            .unwrap();
        b.clone().start().await;

        let mut sub_b = b.subscribe("topic");
        let mut sub_a = a.subscribe("topic");

        timeout(RECV_TIMEOUT, async {
            while !b.members.contains_key(&a.local_node_id()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("B should learn A through the join ack");

        // ACT
        a.publish("topic", b"payload".to_vec()).unwrap();

        // ASSERT
        let local = timeout(RECV_TIMEOUT, sub_a.recv()).await.unwrap();
        assert_eq!(local, Some(b"payload".to_vec()), "Own publication delivered locally");

        let remote = timeout(RECV_TIMEOUT, sub_b.recv()).await.unwrap();
        assert_eq!(remote, Some(b"payload".to_vec()));

        assert_eq!(a.active_nodes().len(), 2);
    }
}
