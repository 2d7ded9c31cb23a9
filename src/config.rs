//! Runtime configuration.
//!
//! `ProcessingConfig` carries the protocol policy values shared by every queue of a node.
//! `NodeConfig` is the command line of the `processing-node` binary.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingConfig {
    /// Lock age after which the owner may hand a subtask to another peer.
    pub processing_timeout: Duration,
    /// How long an ownership request waits for an answer before rollback.
    pub queue_response_timeout: Duration,
    /// Concurrent grab/execute loops per task.
    pub worker_count: usize,
    /// Pause after subscribing a queue channel, letting the transport settle.
    pub subscription_wait: Duration,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            queue_response_timeout: DEFAULT_QUEUE_RESPONSE_TIMEOUT,
            worker_count: 1,
            subscription_wait: Duration::ZERO,
        }
    }
}

impl ProcessingConfig {
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_queue_response_timeout(mut self, timeout: Duration) -> Self {
        self.queue_response_timeout = timeout;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_subscription_wait(mut self, wait: Duration) -> Self {
        self.subscription_wait = wait;
        self
    }
}

/// Command line of a processing node.
#[derive(Debug, Clone, Parser)]
#[command(name = "processing-node", about = "Peer of a coordinator-free processing group")]
pub struct NodeConfig {
    /// UDP address of the gossip transport.
    #[arg(long)]
    pub bind: SocketAddr,

    /// Gossip address of an existing peer (repeatable).
    #[arg(long = "seed")]
    pub seeds: Vec<SocketAddr>,

    /// HTTP port = gossip port + offset.
    #[arg(long, default_value_t = 1000)]
    pub http_port_offset: u16,

    #[arg(long, default_value_t = 10_000)]
    pub processing_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pub response_timeout_ms: u64,

    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Default log filter; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl NodeConfig {
    pub fn processing_config(&self) -> ProcessingConfig {
        ProcessingConfig::default()
            .with_processing_timeout(Duration::from_millis(self.processing_timeout_ms))
            .with_queue_response_timeout(Duration::from_millis(self.response_timeout_ms))
            .with_worker_count(self.workers)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind.ip(), self.bind.port().saturating_add(self.http_port_offset))
    }
}
