//! Metric ingestion filter.
//!
//! Raw metric lines arrive over TCP and UDP, get parsed and matched against
//! the wildcard patterns of all stored triggers, and matched points are
//! flushed to the store in batches. Unmatched and malformed traffic is
//! counted and dropped; ingestion never blocks on a slow store.

pub mod flusher;
pub mod index;
pub mod listener;
pub mod metrics;
pub mod parser;
pub mod worker;

#[cfg(test)]
mod tests;

use klaxon_common::types::MetricPoint;

/// A parsed point together with the patterns its name matched.
#[derive(Debug, Clone)]
pub struct MatchedPoint {
    pub point: MetricPoint,
    pub patterns: Vec<String>,
}
