//! Queue Channel
//!
//! Outbound port of the queue manager (ownership requests, queue snapshots) and its
//! implementation over a `PubSub` topic. Inbound messages are decoded by a listener task and
//! handed to the registered sinks.

use crate::pubsub::PubSub;
use crate::pubsub::types::NodeId;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::manager::SubTaskQueueManager;
use super::types::{self, ProcessingChannelMessage, SubTaskQueue, SubTaskQueueRequest};

/// Handles an inbound ownership request; returns whether ownership was handed over.
pub type QueueRequestSink = Arc<dyn Fn(SubTaskQueueRequest) -> bool + Send + Sync>;
/// Handles an inbound snapshot; returns whether the local queue changed.
pub type QueueUpdateSink = Arc<dyn Fn(SubTaskQueue) -> bool + Send + Sync>;

pub trait SubTaskQueueChannel: Send + Sync {
    fn request_queue_ownership(&self, node_id: &NodeId);
    fn publish_queue(&self, queue: &SubTaskQueue);
    fn active_nodes_count(&self) -> usize;
    fn active_nodes(&self) -> Vec<NodeId>;
}

pub struct SubTaskQueueChannelPubSub {
    pubsub: Arc<dyn PubSub>,
    topic: String,
    request_sink: RwLock<Option<QueueRequestSink>>,
    update_sink: RwLock<Option<QueueUpdateSink>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SubTaskQueueChannelPubSub {
    pub fn new(pubsub: Arc<dyn PubSub>, topic: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pubsub,
            topic: topic.into(),
            request_sink: RwLock::new(None),
            update_sink: RwLock::new(None),
            listener: Mutex::new(None),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_queue_request_sink(&self, sink: QueueRequestSink) {
        *self
            .request_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    pub fn set_queue_update_sink(&self, sink: QueueUpdateSink) {
        *self
            .update_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Routes inbound requests and snapshots to `manager` without keeping it alive.
    pub fn bind_manager(&self, manager: &Arc<SubTaskQueueManager>) {
        let weak = Arc::downgrade(manager);
        self.set_queue_request_sink(Arc::new(move |request| {
            weak.upgrade()
                .is_some_and(|manager| manager.process_queue_request_message(request))
        }));

        let weak = Arc::downgrade(manager);
        self.set_queue_update_sink(Arc::new(move |queue| {
            weak.upgrade()
                .is_some_and(|manager| manager.process_queue_message(queue))
        }));
    }

    /// Subscribes the topic and starts dispatching inbound messages.
    pub async fn listen(self: &Arc<Self>, subscription_wait: Duration) {
        let mut subscription = self.pubsub.subscribe(&self.topic);
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(bytes) = subscription.recv().await {
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                channel.on_channel_message(&bytes);
            }
        });

        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        if !subscription_wait.is_zero() {
            tokio::time::sleep(subscription_wait).await;
        }
    }

    fn on_channel_message(&self, bytes: &[u8]) {
        match types::decode::<ProcessingChannelMessage>(bytes) {
            Ok(ProcessingChannelMessage::QueueRequest(request)) => {
                let sink = self
                    .request_sink
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(sink) = sink {
                    sink(request);
                }
            }
            Ok(ProcessingChannelMessage::Queue(queue)) => {
                let sink = self
                    .update_sink
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(sink) = sink {
                    sink(queue);
                }
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable message on {}: {}", self.topic, e);
            }
        }
    }

    fn publish_message(&self, message: &ProcessingChannelMessage) {
        let result = types::encode(message).and_then(|bytes| {
            self.pubsub
                .publish(&self.topic, bytes)
                .map_err(|e| super::error::ProcessingError::Transport(e.to_string()))
        });

        if let Err(e) = result {
            tracing::warn!("Failed to publish on {}: {}", self.topic, e);
        }
    }
}

impl SubTaskQueueChannel for SubTaskQueueChannelPubSub {
    fn request_queue_ownership(&self, node_id: &NodeId) {
        self.publish_message(&ProcessingChannelMessage::QueueRequest(SubTaskQueueRequest {
            node_id: node_id.clone(),
        }));
    }

    fn publish_queue(&self, queue: &SubTaskQueue) {
        self.publish_message(&ProcessingChannelMessage::Queue(queue.clone()));
    }

    fn active_nodes_count(&self) -> usize {
        self.pubsub.active_nodes().len()
    }

    fn active_nodes(&self) -> Vec<NodeId> {
        self.pubsub.active_nodes()
    }
}

impl Drop for SubTaskQueueChannelPubSub {
    fn drop(&mut self) {
        let listener = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}
