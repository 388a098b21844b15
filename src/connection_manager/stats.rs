//! Connection statistics

use serde::Serialize;

/// Number of live topics per kind
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopicCounts {
    pub channels: usize,
    pub dm_threads: usize,
    pub users: usize,
}

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    /// Users with at least one open connection
    pub online_users: usize,
    pub topics: TopicCounts,
}
