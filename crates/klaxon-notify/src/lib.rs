//! Notification pipeline with pluggable contact-type senders.
//!
//! Events drained from the store are resolved against tag subscriptions,
//! throttled per `(contact, trigger)` and scheduled into a send-time sorted
//! set. A second worker pops due notifications, groups them and dispatches
//! through the [`Sender`] registered for the contact type. Built-in senders
//! cover email (SMTP) and webhooks.

pub mod channels;
pub mod error;
pub mod events;
pub mod notifications;
pub mod plugin;
pub mod scheduler;
pub mod selfstate;


use async_trait::async_trait;
use error::NotifyResult;
use klaxon_common::types::{ContactData, EventData, TriggerData};

/// A dispatch adapter for one contact type.
///
/// Senders are built once from their settings map at startup and must
/// tolerate concurrent `send_events` calls. They never retry internally;
/// retry and backoff belong to the notifications fetcher. A successful
/// return means "handed off to the external service".
#[async_trait]
pub trait Sender: Send + Sync {
    /// Delivers one or more events for `contact`. With `throttled` set the
    /// batch represents events coalesced while the pair was throttled.
    async fn send_events(
        &self,
        events: &[EventData],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
    ) -> NotifyResult<()>;

    /// The contact type this sender serves (e.g. `"email"`).
    fn sender_type(&self) -> &str;
}
