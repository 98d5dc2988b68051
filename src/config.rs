//! Node configuration.

use std::time::Duration;

use crate::model::NodeId;

/// Default interval between registry polls in `wait_for_*`.
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Sleep between registry polls in `wait_for_table_space` and
    /// `wait_for_table`.
    pub wait_poll_interval: Duration,
}

impl NodeConfig {
    pub fn builder(node_id: impl Into<NodeId>) -> NodeConfigBuilder {
        NodeConfigBuilder {
            node_id: node_id.into(),
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        }
    }

    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::builder(node_id).build()
    }
}

#[derive(Debug)]
pub struct NodeConfigBuilder {
    node_id: NodeId,
    wait_poll_interval: Duration,
}

impl NodeConfigBuilder {
    pub fn wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    pub fn build(self) -> NodeConfig {
        NodeConfig {
            node_id: self.node_id,
            wait_poll_interval: self.wait_poll_interval,
        }
    }
}
