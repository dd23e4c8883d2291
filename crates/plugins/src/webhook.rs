//! Webhook delivery plugin.
//!
//! POSTs a minimal JSON notification to a configured endpoint. The payload
//! never carries response content; receivers fetch what they need
//! through the API with their own credentials.
//!
//! Two retry layers exist. This module retries the HTTP call itself within a
//! single invocation (`DeliveryPolicy`). The dispatcher independently retries
//! the whole invocation when it fails.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sha2::Sha256;

use formplug_core::{PluginError, PluginResult, RetryPolicy};
use formplug_events::Event;

use crate::context::PluginContext;
use crate::handler::{ExecutionMode, PluginHandler, PluginMetadata};
use crate::settings::{Issues, PluginSettings, ValidationError, parse_raw};

pub const PLUGIN_TYPE: &str = "webhook";

pub const SIGNATURE_HEADER: &str = "x-formplug-signature";
pub const EVENT_HEADER: &str = "x-formplug-event";
pub const DELIVERY_HEADER: &str = "x-formplug-delivery";

const MAX_RESPONSE_BODY_CHARS: usize = 1000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

pub fn validate(raw: &JsonValue) -> Result<PluginSettings, ValidationError> {
    let settings: WebhookSettings = parse_raw(PLUGIN_TYPE, raw)?;
    let mut issues = Issues::default();

    match url::Url::parse(&settings.url) {
        Ok(url) => {
            issues.check(matches!(url.scheme(), "http" | "https"), || {
                format!("url must use http or https, got `{}`", url.scheme())
            });
            issues.check(url.host_str().is_some(), || "url has no host".to_string());
        }
        Err(e) => issues.push(format!("url is not valid: {e}")),
    }

    if let Some(secret) = &settings.secret {
        issues.check(!secret.is_empty(), || "secret must not be empty when set".to_string());
    }

    for (name, value) in &settings.headers {
        issues.check(HeaderName::from_bytes(name.as_bytes()).is_ok(), || {
            format!("header name `{name}` is not valid")
        });
        issues.check(HeaderValue::from_str(value).is_ok(), || {
            format!("header `{name}` has an invalid value")
        });
    }

    issues.finish(PLUGIN_TYPE, PluginSettings::Webhook(settings))
}

/// Build the notification body for `event`.
pub fn build_payload(event: &Event, form_title: Option<&str>) -> JsonValue {
    let mut data = serde_json::Map::new();
    if let Some(title) = form_title {
        data.insert("formTitle".into(), JsonValue::String(title.to_string()));
    }

    let mut payload = json!({
        "event": event.event_type(),
        "formId": event.form_id(),
        "organizationId": event.organization_id(),
        "timestamp": event.timestamp(),
        "data": data,
    });
    if let Some(response_id) = event.response_id() {
        payload["responseId"] = json!(response_id);
    }
    payload
}

/// Hex HMAC-SHA256 of `body` keyed by `secret`, prefixed with the algorithm.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Delivery-level retry settings for one invocation.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_secs(5)),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl DeliveryPolicy {
    /// Longest one invocation can take when every attempt times out.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        let waits: Duration = (1..attempts).map(|a| self.retry.delay_for_attempt(a)).sum();
        self.request_timeout * attempts + waits
    }
}

#[derive(Debug)]
enum DeliveryFailure {
    Timeout,
    Transport(String),
    Status(StatusCode, String),
}

impl DeliveryFailure {
    fn into_plugin_error(self, attempts: u32) -> PluginError {
        match self {
            DeliveryFailure::Timeout => PluginError::delivery_timeout(format!(
                "webhook endpoint timed out after {attempts} attempt(s)"
            )),
            DeliveryFailure::Transport(msg) => PluginError::execution(format!(
                "webhook delivery failed after {attempts} attempt(s): {msg}"
            )),
            DeliveryFailure::Status(status, body) => PluginError::execution(format!(
                "webhook endpoint responded {status} after {attempts} attempt(s): {body}"
            )),
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_RESPONSE_BODY_CHARS).collect()
}

pub struct WebhookHandler {
    client: reqwest::Client,
    policy: DeliveryPolicy,
}

impl WebhookHandler {
    pub fn new(client: reqwest::Client, policy: DeliveryPolicy) -> Self {
        Self { client, policy }
    }

    fn headers(&self, settings: &WebhookSettings, event: &Event, ctx: &PluginContext, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                headers.insert(n, v);
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("formplug-webhooks/1.0"));
        if let Ok(v) = HeaderValue::from_str(event.event_type().as_str()) {
            headers.insert(EVENT_HEADER, v);
        }
        if let Ok(v) = HeaderValue::from_str(&ctx.job_id().to_string()) {
            headers.insert(DELIVERY_HEADER, v);
        }
        if let Some(secret) = &settings.secret {
            if let Ok(v) = HeaderValue::from_str(&sign(secret, body)) {
                headers.insert(SIGNATURE_HEADER, v);
            }
        }
        headers
    }

    async fn deliver(
        &self,
        settings: &WebhookSettings,
        headers: HeaderMap,
        body: Vec<u8>,
        ctx: &PluginContext,
    ) -> PluginResult<JsonValue> {
        let max_attempts = self.policy.retry.max_attempts.max(1);
        let mut last = DeliveryFailure::Transport("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            let result = self
                .client
                .post(&settings.url)
                .timeout(self.policy.request_timeout)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    ctx.logger()
                        .info(&format!("webhook delivered with status {status} on attempt {attempt}"));
                    return Ok(json!({
                        "status": status.as_u16(),
                        "body": truncate(&text),
                        "attempts": attempt,
                    }));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = truncate(&resp.text().await.unwrap_or_default());
                    if !is_retryable_status(status) {
                        return Err(DeliveryFailure::Status(status, text).into_plugin_error(attempt));
                    }
                    last = DeliveryFailure::Status(status, text);
                }
                Err(e) if e.is_timeout() => last = DeliveryFailure::Timeout,
                Err(e) => last = DeliveryFailure::Transport(e.to_string()),
            }

            if self.policy.retry.allows_another_attempt(attempt) {
                let delay = self.policy.retry.delay_for_attempt(attempt);
                ctx.logger().warn(&format!(
                    "webhook attempt {attempt} failed ({last:?}); retrying in {}ms",
                    delay.as_millis()
                ));
                tokio::time::sleep(delay).await;
            }
        }

        Err(last.into_plugin_error(max_attempts))
    }
}

#[async_trait]
impl PluginHandler for WebhookHandler {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            plugin_type: PLUGIN_TYPE.into(),
            name: "Webhook".into(),
            description: "POST a signed notification to an HTTP endpoint".into(),
            execution_mode: ExecutionMode::Isolated,
        }
    }

    async fn execute(
        &self,
        settings: &PluginSettings,
        event: &Event,
        ctx: &PluginContext,
    ) -> PluginResult<JsonValue> {
        let PluginSettings::Webhook(settings) = settings else {
            return Err(PluginError::validation("webhook handler received non-webhook settings"));
        };

        let title = ctx.form(event.form_id()).await?.map(|f| f.title);
        let payload = build_payload(event, title.as_deref());
        let body = serde_json::to_vec(&payload)
            .map_err(|e| PluginError::execution(format!("failed to encode payload: {e}")))?;
        let headers = self.headers(settings, event, ctx, &body);

        self.deliver(settings, headers, body, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::routing::post;
    use formplug_core::{ErrorKind, FormId, FormMeta, JobId, OrganizationId, PluginConfigId, Response, ResponseId};
    use tokio::sync::Mutex;

    use crate::context::{DataAccessError, FormReader, ResponseReader};

    struct NoResponses;

    #[async_trait]
    impl ResponseReader for NoResponses {
        async fn get_by_id(&self, _id: ResponseId) -> Result<Option<Response>, DataAccessError> {
            Ok(None)
        }
    }

    struct OneForm(String);

    #[async_trait]
    impl FormReader for OneForm {
        async fn get_by_id(&self, id: FormId) -> Result<Option<FormMeta>, DataAccessError> {
            Ok(Some(FormMeta {
                id,
                organization_id: OrganizationId::new(),
                title: self.0.clone(),
            }))
        }
    }

    fn ctx() -> PluginContext {
        PluginContext::new(
            JobId::new(),
            PluginConfigId::new(),
            PLUGIN_TYPE,
            Arc::new(NoResponses),
            Arc::new(OneForm("Customer survey".into())),
        )
    }

    fn fast_policy(max_attempts: u32) -> DeliveryPolicy {
        DeliveryPolicy {
            retry: RetryPolicy::immediate(max_attempts),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[derive(Clone, Default)]
    struct Captured {
        hits: Arc<AtomicU32>,
        last: Arc<Mutex<Option<(AxumHeaders, String)>>>,
    }

    /// Serve `router` on an ephemeral port, returning its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    /// Endpoint that fails `failures` times with 503, then returns 200.
    async fn flaky_endpoint(failures: u32, captured: Captured) -> String {
        let router = Router::new().route(
            "/hook",
            post(move |headers: AxumHeaders, body: String| {
                let captured = captured.clone();
                async move {
                    let n = captured.hits.fetch_add(1, Ordering::SeqCst);
                    *captured.last.lock().await = Some((headers, body));
                    if n < failures {
                        (AxumStatus::SERVICE_UNAVAILABLE, "busy")
                    } else {
                        (AxumStatus::OK, "ok")
                    }
                }
            }),
        );
        serve(router).await
    }

    fn settings(url: &str, secret: Option<&str>) -> PluginSettings {
        validate(&json!({
            "url": url,
            "secret": secret,
            "headers": {"x-tenant": "acme"}
        }))
        .unwrap()
    }

    #[test]
    fn validate_accepts_http_and_https_only() {
        assert!(validate(&json!({"url": "https://example.com/hooks"})).is_ok());
        assert!(validate(&json!({"url": "http://localhost:9000"})).is_ok());

        let err = validate(&json!({"url": "ftp://example.com"})).unwrap_err();
        assert!(err.issues[0].contains("http or https"));

        assert!(validate(&json!({"url": "not a url"})).is_err());
        assert!(validate(&json!({})).is_err());
    }

    #[test]
    fn validate_rejects_bad_headers_and_empty_secret() {
        let err = validate(&json!({
            "url": "https://example.com",
            "secret": "",
            "headers": {"bad header": "x"}
        }))
        .unwrap_err();
        assert_eq!(err.issues.len(), 2);
    }

    #[test]
    fn payload_is_minimal() {
        let response_id = ResponseId::new();
        let event = Event::form_submitted(FormId::new(), OrganizationId::new(), response_id);
        let payload = build_payload(&event, Some("Survey"));

        assert_eq!(payload["event"], "form.submitted");
        assert_eq!(payload["responseId"], json!(response_id));
        assert_eq!(payload["data"], json!({"formTitle": "Survey"}));
        assert!(payload.get("answers").is_none());

        let keys: Vec<_> = payload.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn worst_case_counts_every_timeout_and_wait() {
        let policy = DeliveryPolicy {
            retry: RetryPolicy::fixed(3, Duration::from_millis(200)),
            request_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.worst_case(), Duration::from_millis(3_400));

        let single = DeliveryPolicy {
            retry: RetryPolicy::fixed(1, Duration::from_secs(5)),
            request_timeout: Duration::from_secs(2),
        };
        assert_eq!(single.worst_case(), Duration::from_secs(2));
    }

    #[test]
    fn signature_is_stable_hex() {
        let sig = sign("s3cret", b"{}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert_eq!(sig, sign("s3cret", b"{}"));
        assert_ne!(sig, sign("other", b"{}"));
    }

    #[tokio::test]
    async fn delivers_signed_payload() {
        let captured = Captured::default();
        let url = flaky_endpoint(0, captured.clone()).await;
        let handler = WebhookHandler::new(reqwest::Client::new(), fast_policy(3));
        let event = Event::form_submitted(FormId::new(), OrganizationId::new(), ResponseId::new());

        let result = handler
            .execute(&settings(&url, Some("topsecret")), &event, &ctx())
            .await
            .unwrap();

        assert_eq!(result["status"], 200);
        assert_eq!(result["attempts"], 1);

        let (headers, body) = captured.last.lock().await.clone().unwrap();
        assert_eq!(headers["x-tenant"], "acme");
        assert_eq!(headers[EVENT_HEADER], "form.submitted");
        assert_eq!(
            headers[SIGNATURE_HEADER].to_str().unwrap(),
            sign("topsecret", body.as_bytes())
        );

        let sent: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(sent["data"]["formTitle"], "Customer survey");
    }

    #[tokio::test]
    async fn retries_server_errors_within_one_invocation() {
        let captured = Captured::default();
        let url = flaky_endpoint(2, captured.clone()).await;
        let handler = WebhookHandler::new(reqwest::Client::new(), fast_policy(3));
        let event = Event::form_submitted(FormId::new(), OrganizationId::new(), ResponseId::new());

        let result = handler.execute(&settings(&url, None), &event, &ctx()).await.unwrap();

        assert_eq!(result["attempts"], 3);
        assert_eq!(captured.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_delivery_is_an_execution_error() {
        let captured = Captured::default();
        let url = flaky_endpoint(10, captured.clone()).await;
        let handler = WebhookHandler::new(reqwest::Client::new(), fast_policy(2));
        let event = Event::form_submitted(FormId::new(), OrganizationId::new(), ResponseId::new());

        let err = handler.execute(&settings(&url, None), &event, &ctx()).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::HandlerExecutionError);
        assert!(err.message.contains("503"));
        assert_eq!(captured.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/hook",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (AxumStatus::GONE, "gone")
                }
            }),
        );
        let url = serve(router).await;
        let handler = WebhookHandler::new(reqwest::Client::new(), fast_policy(3));
        let event = Event::form_submitted(FormId::new(), OrganizationId::new(), ResponseId::new());

        let err = handler.execute(&settings(&url, None), &event, &ctx()).await.unwrap_err();

        assert!(err.message.contains("410"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_endpoint_yields_delivery_timeout() {
        let router = Router::new().route(
            "/hook",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let url = serve(router).await;
        let handler = WebhookHandler::new(
            reqwest::Client::new(),
            DeliveryPolicy {
                retry: RetryPolicy::immediate(2),
                request_timeout: Duration::from_millis(100),
            },
        );
        let event = Event::form_submitted(FormId::new(), OrganizationId::new(), ResponseId::new());

        let err = handler.execute(&settings(&url, None), &event, &ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeliveryTimeout);
    }
}
