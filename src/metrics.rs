//! Metrics for the pub/sub layer

use iroh_metrics::{Counter, MetricsGroup};

/// Enum of metrics for the module
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "pubsub")]
#[non_exhaustive]
pub struct Metrics {
    /// Objects published by this node.
    pub published: Counter,
    /// Missing ranges reported by the sync engine.
    pub missing_ranges: Counter,
    /// Data fetches issued, including prefetches.
    pub fetches: Counter,
    /// Speculative fetches of the next sequence number.
    pub prefetches: Counter,
    /// Mapping lookups issued.
    pub mapping_lookups: Counter,
    /// Objects handed to subscribers.
    pub delivered: Counter,
    /// Fetched objects dropped because they were already delivered.
    pub duplicates: Counter,
    /// Objects dropped because validation failed.
    pub validation_rejected: Counter,
    /// Data fetches the engine gave up on.
    pub fetches_failed: Counter,
    /// Mapping lookups the engine gave up on.
    pub mapping_lookups_failed: Counter,
    /// Extra blocks handed to the sync engine.
    pub extra_blocks_sent: Counter,
    /// Extra blocks received from peers.
    pub extra_blocks_recv: Counter,
    /// Received extra blocks that failed to decode.
    pub extra_blocks_malformed: Counter,
    /// Number of times the main actor loop ticked.
    pub actor_tick_main: Counter,
}
