use crate::error::{NotifyError, NotifyResult};
use crate::plugin::{SenderPlugin, SenderSettings};
use crate::Sender;
use async_trait::async_trait;
use chrono::DateTime;
use klaxon_common::types::{ContactData, EventData, TriggerData};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    /// Base URL of the web UI, linked from the mail body when set.
    front_uri: Option<String>,
}

impl EmailSender {
    pub fn new(
        smtp_host: &str,
        smtp_port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: &str,
        front_uri: Option<String>,
    ) -> NotifyResult<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?.port(smtp_port);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }
        Ok(Self {
            transport: builder.build(),
            from: from.to_string(),
            front_uri,
        })
    }

    fn subject(events: &[EventData], trigger: &TriggerData) -> String {
        let state = events.last().map(|e| e.state.to_string()).unwrap_or_default();
        format!(
            "{state} {} [{}] ({} events)",
            trigger.name,
            trigger.tags.join(", "),
            events.len()
        )
    }

    fn body(&self, events: &[EventData], trigger: &TriggerData, throttled: bool) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Trigger: {}", trigger.name));
        if let Some(desc) = &trigger.desc {
            lines.push(desc.clone());
        }
        lines.push(String::new());
        for event in events {
            let time = DateTime::from_timestamp(event.timestamp, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| event.timestamp.to_string());
            let value = event
                .value
                .map(|v| format!(" = {v}"))
                .unwrap_or_default();
            lines.push(format!(
                "{time}: {}{value} ({} to {})",
                event.metric, event.old_state, event.state
            ));
        }
        if throttled {
            lines.push(String::new());
            lines.push(
                "These events were collected while notifications for this trigger were \
                 throttled."
                    .to_string(),
            );
        }
        if let Some(front_uri) = &self.front_uri {
            lines.push(String::new());
            lines.push(format!("{front_uri}/trigger/{}", trigger.id));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Sender for EmailSender {
    async fn send_events(
        &self,
        events: &[EventData],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
    ) -> NotifyResult<()> {
        let message = Message::builder()
            .from(self.from.parse()?)
            .to(contact.value.parse()?)
            .subject(Self::subject(events, trigger))
            .header(ContentType::TEXT_PLAIN)
            .body(self.body(events, trigger, throttled))?;

        self.transport.send(message).await?;
        tracing::debug!(
            contact = %contact.value,
            trigger_id = %trigger.id,
            events = events.len(),
            "Email handed off"
        );
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "email"
    }
}

pub struct EmailPlugin;

impl SenderPlugin for EmailPlugin {
    fn type_name(&self) -> &str {
        "email"
    }

    fn build(&self, settings: &SenderSettings) -> NotifyResult<Arc<dyn Sender>> {
        let smtp_host = settings
            .get("smtp_host")
            .ok_or_else(|| NotifyError::InvalidConfig("email: smtp_host is required".into()))?;
        let smtp_port = match settings.get("smtp_port") {
            Some(raw) => raw.parse().map_err(|_| {
                NotifyError::InvalidConfig(format!("email: invalid smtp_port '{raw}'"))
            })?,
            None => 25,
        };
        let from = settings
            .get("from")
            .ok_or_else(|| NotifyError::InvalidConfig("email: from is required".into()))?;

        let sender = EmailSender::new(
            smtp_host,
            smtp_port,
            settings.get("smtp_username").map(String::as_str),
            settings.get("smtp_password").map(String::as_str),
            from,
            settings.get("front_uri").cloned(),
        )?;
        Ok(Arc::new(sender))
    }
}
