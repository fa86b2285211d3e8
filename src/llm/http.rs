use reqwest::RequestBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Sends one JSON request and maps the outcome onto [`ProviderError`].
///
/// `describe_error` pulls a message out of the provider's error envelope; when
/// it returns `None` a generic message is used instead.
pub(crate) async fn post_json<B, R>(
    provider: &'static str,
    request: RequestBuilder,
    body: &B,
    describe_error: fn(&Value) -> Option<String>,
) -> Result<R, ProviderError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = request
        .header("content-type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|err| ProviderError::Transport(err.to_string()))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| ProviderError::Transport(err.to_string()))?;

    if !status.is_success() {
        let message = error_message(provider, status.as_u16(), &text, describe_error);
        warn!(provider, status = status.as_u16(), %message, "provider returned error status");
        return Err(ProviderError::from_status(status.as_u16(), message));
    }

    debug!(provider, bytes = text.len(), "provider response received");
    serde_json::from_str::<R>(&text).map_err(|err| ProviderError::DecodingFailed(err.to_string()))
}

pub(crate) fn error_message(
    provider: &str,
    status: u16,
    body: &str,
    describe_error: fn(&Value) -> Option<String>,
) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(describe_error)
        .unwrap_or_else(|| format!("{provider} request failed with status {status}"))
}

/// `{"error": {"message": ..}}`, shared by Anthropic and OpenAI.
pub(crate) fn nested_error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    let message = error.get("message").and_then(Value::as_str)?;
    match error.get("type").and_then(Value::as_str) {
        Some(kind) => Some(format!("{kind}: {message}")),
        None => Some(message.to_string()),
    }
}
