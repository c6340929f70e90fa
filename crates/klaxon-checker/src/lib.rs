//! Periodic trigger evaluation.
//!
//! The scheduler feeds a worker pool from the due-trigger set, dirty-pattern
//! announcements and a periodic full sweep. Each check runs under a
//! store-side advisory lock, evaluates the trigger's targets over the recent
//! metric window, derives per-metric state and emits transition events with
//! maintenance and schedule suppression applied.

pub mod cache;
pub mod check;
pub mod error;
pub mod expression;
pub mod functions;
pub mod target;
pub mod worker;

#[cfg(test)]
mod tests;
