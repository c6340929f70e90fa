use klaxon_common::types::TriggerData;
use klaxon_store::error::StoreResult;
use klaxon_store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trigger definition cache with per-entry expiry, refreshed lazily on
/// access. Stale entries are simply refetched; a missing trigger drops its
/// entry.
pub struct TriggerCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, TriggerData)>>,
}

impl TriggerCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<TriggerData>> {
        {
            let entries = self.entries.lock();
            if let Some((inserted, trigger)) = entries.get(id) {
                if inserted.elapsed() < self.ttl {
                    return Ok(Some(trigger.clone()));
                }
            }
        }

        match self.store.get_trigger(id).await? {
            Some(trigger) => {
                self.entries
                    .lock()
                    .insert(id.to_string(), (Instant::now(), trigger.clone()));
                Ok(Some(trigger))
            }
            None => {
                self.entries.lock().remove(id);
                Ok(None)
            }
        }
    }

}
