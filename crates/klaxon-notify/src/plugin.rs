use crate::error::{NotifyError, NotifyResult};
use crate::Sender;
use std::collections::HashMap;
use std::sync::Arc;

/// Free-form sender settings from the `[[notifier.senders]]` config list.
/// Every map carries at least a `type` key.
pub type SenderSettings = HashMap<String, String>;

/// Constructs a [`Sender`] from its settings map.
pub trait SenderPlugin: Send + Sync {
    fn type_name(&self) -> &str;

    fn build(&self, settings: &SenderSettings) -> NotifyResult<Arc<dyn Sender>>;
}

/// Registry from contact-type string to a configured sender instance.
///
/// Plugins describe how to build a sender; `configure` walks the sender
/// definitions from config and instantiates one sender per contact type.
pub struct SenderRegistry {
    plugins: HashMap<String, Box<dyn SenderPlugin>>,
    senders: HashMap<String, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            senders: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn SenderPlugin>) {
        self.plugins.insert(plugin.type_name().to_string(), plugin);
    }

    /// Instantiates senders for every definition. Unknown types and invalid
    /// settings are startup failures.
    pub fn configure(&mut self, definitions: &[SenderSettings]) -> NotifyResult<()> {
        for settings in definitions {
            let sender_type = settings
                .get("type")
                .ok_or_else(|| {
                    NotifyError::InvalidConfig("sender definition is missing 'type'".into())
                })?
                .clone();
            let plugin = self
                .plugins
                .get(&sender_type)
                .ok_or_else(|| NotifyError::UnknownSenderType(sender_type.clone()))?;
            let sender = plugin.build(settings)?;
            tracing::info!(sender_type = %sender_type, "Sender configured");
            self.senders.insert(sender_type, sender);
        }
        Ok(())
    }

    pub fn get(&self, contact_type: &str) -> Option<Arc<dyn Sender>> {
        self.senders.get(contact_type).cloned()
    }

    pub fn sender_types(&self) -> Vec<&str> {
        self.senders.keys().map(String::as_str).collect()
    }

    /// Registers an already built sender directly. Tests and embedders use
    /// this to bypass plugin construction.
    pub fn insert(&mut self, sender: Arc<dyn Sender>) {
        self.senders.insert(sender.sender_type().to_string(), sender);
    }
}

impl Default for SenderRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::channels::email::EmailPlugin));
        registry.register(Box::new(crate::channels::webhook::WebhookPlugin));
        registry
    }
}
