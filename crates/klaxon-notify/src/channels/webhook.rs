use crate::error::{NotifyError, NotifyResult};
use crate::plugin::{SenderPlugin, SenderSettings};
use crate::Sender;
use async_trait::async_trait;
use klaxon_common::types::{ContactData, EventData, TriggerData};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs the event batch as JSON. The contact value is the endpoint URL; an
/// optional `url` setting with a `${contact_value}` placeholder rewrites it.
pub struct WebhookSender {
    client: reqwest::Client,
    url_template: Option<String>,
}

impl WebhookSender {
    pub fn new(url_template: Option<String>, timeout: Duration) -> NotifyResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url_template,
        })
    }

    fn endpoint(&self, contact: &ContactData) -> String {
        match &self.url_template {
            Some(template) => template.replace("${contact_value}", &contact.value),
            None => contact.value.clone(),
        }
    }

    fn payload(
        events: &[EventData],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
    ) -> serde_json::Value {
        serde_json::json!({
            "trigger": {
                "id": trigger.id,
                "name": trigger.name,
                "desc": trigger.desc,
                "tags": trigger.tags,
            },
            "events": events,
            "contact": {
                "id": contact.id,
                "type": contact.contact_type,
                "value": contact.value,
                "user": contact.user,
            },
            "throttled": throttled,
        })
    }
}

#[async_trait]
impl Sender for WebhookSender {
    async fn send_events(
        &self,
        events: &[EventData],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
    ) -> NotifyResult<()> {
        let url = self.endpoint(contact);
        let response = self
            .client
            .post(&url)
            .json(&Self::payload(events, contact, trigger, throttled))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(url = %url, trigger_id = %trigger.id, events = events.len(), "Webhook handed off");
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "webhook"
    }
}

pub struct WebhookPlugin;

impl SenderPlugin for WebhookPlugin {
    fn type_name(&self) -> &str {
        "webhook"
    }

    fn build(&self, settings: &SenderSettings) -> NotifyResult<Arc<dyn Sender>> {
        let timeout = match settings.get("timeout_secs") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                NotifyError::InvalidConfig(format!("webhook: invalid timeout_secs '{raw}'"))
            })?),
            None => DEFAULT_TIMEOUT,
        };
        let sender = WebhookSender::new(settings.get("url").cloned(), timeout)?;
        Ok(Arc::new(sender))
    }
}
