//! Transactional email plugin.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

use formplug_core::form::value_to_text;
use formplug_core::{PluginError, PluginResult};
use formplug_events::Event;

use crate::context::PluginContext;
use crate::handler::{ExecutionMode, PluginHandler, PluginMetadata};
use crate::settings::{Issues, PluginSettings, ValidationError, parse_raw};

pub const PLUGIN_TYPE: &str = "email";

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("token pattern is valid"));

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSettings {
    pub recipient_email: String,
    pub subject: String,
    pub message: String,
    #[serde(default)]
    pub send_to_submitter: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter_email_field_id: Option<String>,
}

pub fn is_valid_email(address: &str) -> bool {
    EMAIL.is_match(address.trim())
}

pub fn validate(raw: &JsonValue) -> Result<PluginSettings, ValidationError> {
    let settings: EmailSettings = parse_raw(PLUGIN_TYPE, raw)?;
    let mut issues = Issues::default();

    issues.check(is_valid_email(&settings.recipient_email), || {
        format!("recipientEmail `{}` is not a valid address", settings.recipient_email)
    });
    issues.check(!settings.subject.trim().is_empty(), || "subject is empty".to_string());
    issues.check(!settings.message.trim().is_empty(), || "message is empty".to_string());
    if settings.send_to_submitter {
        issues.check(
            settings
                .submitter_email_field_id
                .as_deref()
                .is_some_and(|f| !f.trim().is_empty()),
            || "sendToSubmitter requires submitterEmailFieldId".to_string(),
        );
    }

    issues.finish(PLUGIN_TYPE, PluginSettings::Email(settings))
}

/// Replace `{{fieldId}}` tokens with the matching field values.
///
/// Unknown fields render as an empty string.
pub fn render_template(template: &str, values: &Map<String, JsonValue>) -> String {
    TOKEN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            values.get(&caps[1]).map(value_to_text).unwrap_or_default()
        })
        .into_owned()
}

/// A message ready for the mail provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailerError {
    #[error("mail provider timed out")]
    Timeout,
    #[error("mail transport error: {0}")]
    Transport(String),
    #[error("mail provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl From<MailerError> for PluginError {
    fn from(err: MailerError) -> Self {
        match err {
            MailerError::Timeout => PluginError::delivery_timeout(err.to_string()),
            other => PluginError::execution(other.to_string()),
        }
    }
}

/// Transactional email transport. Returns the provider's message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailerError>;
}

/// Mailer for an HTTP transactional email API.
///
/// Sends `{from, to, subject, text}` as JSON with a bearer token and reads
/// the message id from the `id` field of the reply.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
    timeout: Duration,
}

impl HttpMailer {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            from: from.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailerError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&json!({
                "from": self.from,
                "to": email.to,
                "subject": email.subject,
                "text": email.text,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MailerError::Timeout
                } else {
                    MailerError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let reply: JsonValue = resp.json().await.unwrap_or(JsonValue::Null);
        Ok(reply
            .get("id")
            .and_then(JsonValue::as_str)
            .unwrap_or("accepted")
            .to_string())
    }
}

/// Mailer that only logs. Used when no provider is configured.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailerError> {
        let id = format!("log-{}", uuid::Uuid::now_v7());
        tracing::info!(to = %email.to, subject = %email.subject, message_id = %id, "email not sent (log mailer)");
        Ok(id)
    }
}

fn acknowledgement(to: String, form_title: &str) -> OutgoingEmail {
    OutgoingEmail {
        to,
        subject: format!("We received your response to {form_title}"),
        text: format!(
            "Thank you for your submission.\n\nThis message confirms that your response to \"{form_title}\" has been received."
        ),
    }
}

pub struct EmailHandler {
    mailer: std::sync::Arc<dyn Mailer>,
}

impl EmailHandler {
    pub fn new(mailer: std::sync::Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    async fn field_values(&self, event: &Event, ctx: &PluginContext) -> PluginResult<Map<String, JsonValue>> {
        if let Some(response_id) = event.response_id() {
            if let Some(response) = ctx.response(response_id).await? {
                return Ok(response.data);
            }
            ctx.logger().warn("response not found; rendering without field values");
        }
        Ok(event
            .payload()
            .get("data")
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default())
    }

    async fn acknowledge(&self, to: String, event: &Event, ctx: &PluginContext) -> PluginResult<String> {
        let title = ctx
            .form(event.form_id())
            .await?
            .map(|f| f.title)
            .unwrap_or_else(|| "our form".to_string());
        Ok(self.mailer.send(&acknowledgement(to, &title)).await?)
    }
}

#[async_trait]
impl PluginHandler for EmailHandler {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            plugin_type: PLUGIN_TYPE.into(),
            name: "Email notification".into(),
            description: "Send an email for each event, with optional submitter acknowledgement".into(),
            execution_mode: ExecutionMode::Isolated,
        }
    }

    async fn execute(
        &self,
        settings: &PluginSettings,
        event: &Event,
        ctx: &PluginContext,
    ) -> PluginResult<JsonValue> {
        let PluginSettings::Email(settings) = settings else {
            return Err(PluginError::validation("email handler received non-email settings"));
        };

        let values = self.field_values(event, ctx).await?;
        let notification = OutgoingEmail {
            to: settings.recipient_email.clone(),
            subject: render_template(&settings.subject, &values),
            text: render_template(&settings.message, &values),
        };
        let message_id = self.mailer.send(&notification).await?;
        ctx.logger().info(&format!("notification sent to {}", notification.to));

        let mut acknowledgement_id = None;
        let mut acknowledgement_error = None;
        if settings.send_to_submitter {
            let address = settings
                .submitter_email_field_id
                .as_deref()
                .and_then(|field| values.get(field))
                .map(value_to_text)
                .map(|s| s.trim().to_string())
                .filter(|s| is_valid_email(s));

            match address {
                // The notification is already out; a retry would send it twice.
                Some(to) => match self.acknowledge(to, event, ctx).await {
                    Ok(id) => acknowledgement_id = Some(id),
                    Err(e) => {
                        ctx.logger().warn(&format!("submitter acknowledgement failed: {e}"));
                        acknowledgement_error = Some(e.to_string());
                    }
                },
                None => ctx
                    .logger()
                    .warn("submitter email field is empty or invalid; acknowledgement skipped"),
            }
        }

        Ok(json!({
            "messageId": message_id,
            "recipient": notification.to,
            "acknowledgementId": acknowledgement_id,
            "acknowledgementError": acknowledgement_error,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use formplug_core::{ErrorKind, FormId, FormMeta, JobId, OrganizationId, PluginConfigId, Response, ResponseId};

    use crate::context::{DataAccessError, FormReader, ResponseReader};

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutgoingEmail>>,
        fail_with: Option<MailerError>,
        /// Fail every send after this many have succeeded.
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: &OutgoingEmail) -> Result<String, MailerError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|n| sent.len() >= n) {
                return Err(MailerError::Transport("connection reset".into()));
            }
            sent.push(email.clone());
            Ok(format!("msg-{}", sent.len()))
        }
    }

    struct Fixture {
        response: Response,
    }

    #[async_trait]
    impl ResponseReader for Fixture {
        async fn get_by_id(&self, id: ResponseId) -> Result<Option<Response>, DataAccessError> {
            Ok((id == self.response.id).then(|| self.response.clone()))
        }
    }

    #[async_trait]
    impl FormReader for Fixture {
        async fn get_by_id(&self, id: FormId) -> Result<Option<FormMeta>, DataAccessError> {
            Ok(Some(FormMeta {
                id,
                organization_id: OrganizationId::new(),
                title: "Event RSVP".into(),
            }))
        }
    }

    fn setup(data: JsonValue) -> (Event, PluginContext) {
        let form_id = FormId::new();
        let response = Response {
            id: ResponseId::new(),
            form_id,
            data: data.as_object().cloned().unwrap_or_default(),
            submitted_at: Utc::now(),
        };
        let event = Event::form_submitted(form_id, OrganizationId::new(), response.id);
        let fixture = Arc::new(Fixture { response });
        let ctx = PluginContext::new(
            JobId::new(),
            PluginConfigId::new(),
            PLUGIN_TYPE,
            fixture.clone(),
            fixture,
        );
        (event, ctx)
    }

    #[test]
    fn template_substitutes_known_fields() {
        let values = json!({"name": "Ada", "guests": 2}).as_object().cloned().unwrap();
        assert_eq!(
            render_template("Hi {{name}}, party of {{ guests }}{{missing}}!", &values),
            "Hi Ada, party of 2!"
        );
        assert_eq!(render_template("no tokens", &values), "no tokens");
    }

    #[test]
    fn validate_checks_fields() {
        assert!(validate(&json!({
            "recipientEmail": "ops@example.com",
            "subject": "New response",
            "message": "Someone answered"
        }))
        .is_ok());

        let err = validate(&json!({
            "recipientEmail": "not-an-address",
            "subject": " ",
            "message": "x",
            "sendToSubmitter": true
        }))
        .unwrap_err();
        assert_eq!(err.issues.len(), 3);

        assert!(validate(&json!({"subject": "x"})).is_err());
    }

    #[tokio::test]
    async fn sends_rendered_notification() {
        let mailer = Arc::new(RecordingMailer::default());
        let handler = EmailHandler::new(mailer.clone());
        let (event, ctx) = setup(json!({"name": "Grace"}));
        let settings = validate(&json!({
            "recipientEmail": "ops@example.com",
            "subject": "RSVP from {{name}}",
            "message": "{{name}} is coming"
        }))
        .unwrap();

        let result = handler.execute(&settings, &event, &ctx).await.unwrap();

        assert_eq!(result["messageId"], "msg-1");
        assert!(result["acknowledgementId"].is_null());
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "RSVP from Grace");
        assert_eq!(sent[0].text, "Grace is coming");
    }

    #[tokio::test]
    async fn acknowledges_submitter_when_address_present() {
        let mailer = Arc::new(RecordingMailer::default());
        let handler = EmailHandler::new(mailer.clone());
        let (event, ctx) = setup(json!({"email": "guest@example.org"}));
        let settings = validate(&json!({
            "recipientEmail": "ops@example.com",
            "subject": "New RSVP",
            "message": "check the dashboard",
            "sendToSubmitter": true,
            "submitterEmailFieldId": "email"
        }))
        .unwrap();

        let result = handler.execute(&settings, &event, &ctx).await.unwrap();

        assert_eq!(result["acknowledgementId"], "msg-2");
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[1].to, "guest@example.org");
        assert!(sent[1].subject.contains("Event RSVP"));
    }

    #[tokio::test]
    async fn failed_acknowledgement_keeps_the_sent_notification() {
        let mailer = Arc::new(RecordingMailer {
            fail_after: Some(1),
            ..Default::default()
        });
        let handler = EmailHandler::new(mailer.clone());
        let (event, ctx) = setup(json!({"email": "guest@example.org"}));
        let settings = validate(&json!({
            "recipientEmail": "ops@example.com",
            "subject": "New RSVP",
            "message": "check the dashboard",
            "sendToSubmitter": true,
            "submitterEmailFieldId": "email"
        }))
        .unwrap();

        let result = handler.execute(&settings, &event, &ctx).await.unwrap();

        assert_eq!(result["messageId"], "msg-1");
        assert!(result["acknowledgementId"].is_null());
        assert!(result["acknowledgementError"].as_str().unwrap().contains("connection reset"));
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skips_acknowledgement_for_invalid_address() {
        let mailer = Arc::new(RecordingMailer::default());
        let handler = EmailHandler::new(mailer.clone());
        let (event, ctx) = setup(json!({"email": "nope"}));
        let settings = validate(&json!({
            "recipientEmail": "ops@example.com",
            "subject": "New RSVP",
            "message": "x",
            "sendToSubmitter": true,
            "submitterEmailFieldId": "email"
        }))
        .unwrap();

        handler.execute(&settings, &event, &ctx).await.unwrap();
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mailer_timeout_maps_to_delivery_timeout() {
        let mailer = Arc::new(RecordingMailer {
            fail_with: Some(MailerError::Timeout),
            ..Default::default()
        });
        let handler = EmailHandler::new(mailer);
        let (event, ctx) = setup(json!({}));
        let settings = validate(&json!({
            "recipientEmail": "ops@example.com",
            "subject": "s",
            "message": "m"
        }))
        .unwrap();

        let err = handler.execute(&settings, &event, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeliveryTimeout);
    }
}
