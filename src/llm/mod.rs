mod anthropic;
mod gemini;
pub(crate) mod http;
mod openai;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ProviderError;
use crate::message::{ContentBlock, Message, Role, StopReason, TokenUsage, ToolCall};
use crate::schema::{Schema, SchemaKind, SchemaType};
use crate::tools::ToolDefinition;

pub use anthropic::{AnthropicModel, AnthropicModelConfig};
pub use gemini::{GeminiModel, GeminiModelConfig};
pub use openai::{OpenAiModel, OpenAiModelConfig};

/// Property name used when a non-object output schema has to be wrapped in
/// an object for providers that only accept object roots.
pub(crate) const WRAPPED_VALUE_KEY: &str = "value";

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    /// OpenAI and Gemini have a native "none" mode. Anthropic has none, so the
    /// Anthropic client approximates it by sending no tools at all.
    None,
    Tool(String),
}

/// Structured generation: one call whose result must conform to `schema`.
#[derive(Clone, Copy, Debug)]
pub struct GenerateRequest<'a> {
    pub messages: &'a [Message],
    pub schema: &'a Schema,
    pub system_prompt: Option<&'a str>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl<'a> GenerateRequest<'a> {
    pub fn new(messages: &'a [Message], schema: &'a Schema) -> Self {
        Self {
            messages,
            schema,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn system_prompt(mut self, system_prompt: &'a str) -> Self {
        self.system_prompt = Some(system_prompt);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Tool planning: one call that may answer with tool calls, text, or both.
#[derive(Clone, Copy, Debug)]
pub struct ToolCallRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub tool_choice: &'a ToolChoice,
    pub system_prompt: Option<&'a str>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Shape the final, tool-free answer should take.
    pub response_schema: Option<&'a Schema>,
}

impl<'a> ToolCallRequest<'a> {
    pub fn new(messages: &'a [Message], tools: &'a [ToolDefinition]) -> Self {
        Self {
            messages,
            tools,
            tool_choice: &ToolChoice::Auto,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            response_schema: None,
        }
    }

    pub fn tool_choice(mut self, tool_choice: &'a ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    pub fn system_prompt(mut self, system_prompt: &'a str) -> Self {
        self.system_prompt = Some(system_prompt);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn response_schema(mut self, schema: &'a Schema) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatResponse<T> {
    pub result: T,
    pub assistant_message: Message,
    pub usage: TokenUsage,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallResponse {
    pub tool_calls: Vec<ToolCall>,
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub usage: TokenUsage,
    pub stop_reason: Option<StopReason>,
    pub model: String,
}

impl ToolCallResponse {
    /// The assistant turn to append to history: text first, then tool uses in
    /// the order the provider returned them.
    pub fn assistant_message(&self) -> Message {
        let mut contents = Vec::new();
        if let Some(text) = self.text.as_ref().filter(|text| !text.is_empty()) {
            contents.push(ContentBlock::Text { text: text.clone() });
        }
        contents.extend(self.tool_calls.iter().cloned().map(ContentBlock::ToolUse));
        Message::new(Role::Assistant, contents)
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider name used in errors and logs.
    fn provider_name(&self) -> &'static str;

    async fn generate_value(
        &self,
        request: GenerateRequest<'_>,
    ) -> Result<ChatResponse<Value>, ProviderError>;

    async fn plan_tool_calls(
        &self,
        request: ToolCallRequest<'_>,
    ) -> Result<ToolCallResponse, ProviderError>;
}

/// Typed decoding on top of [`ChatModel::generate_value`].
#[async_trait]
pub trait ChatModelExt: ChatModel {
    async fn generate<T>(
        &self,
        messages: &[Message],
        system_prompt: Option<&str>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ChatResponse<T>, ProviderError>
    where
        T: SchemaType + DeserializeOwned + Send,
    {
        let schema = T::schema();
        let request = GenerateRequest {
            messages,
            schema: &schema,
            system_prompt,
            temperature,
            max_tokens,
        };
        let response = self.generate_value(request).await?;
        decode_response(response)
    }
}

impl<M: ChatModel + ?Sized> ChatModelExt for M {}

pub(crate) fn decode_response<T: DeserializeOwned>(
    response: ChatResponse<Value>,
) -> Result<ChatResponse<T>, ProviderError> {
    let result = serde_json::from_value::<T>(response.result)
        .map_err(|err| ProviderError::DecodingFailed(err.to_string()))?;

    Ok(ChatResponse {
        result,
        assistant_message: response.assistant_message,
        usage: response.usage,
    })
}

/// Wraps non-object schemas as `{"value": schema}` for providers whose
/// structured output must have an object root. Returns `None` when no
/// wrapping is needed.
pub(crate) fn wrap_root(schema: &Schema) -> Option<Schema> {
    if schema.kind() == SchemaKind::Object {
        return None;
    }

    Schema::object()
        .property(WRAPPED_VALUE_KEY, schema.clone())
        .build()
        .ok()
}

pub(crate) fn unwrap_root(value: Value, wrapped: bool) -> Value {
    if !wrapped {
        return value;
    }
    match value {
        Value::Object(mut map) => map.remove(WRAPPED_VALUE_KEY).unwrap_or(Value::Null),
        other => other,
    }
}

/// System prompt addendum used by providers that cannot combine a native
/// response schema with tool calling.
pub(crate) fn final_answer_instructions(schema_json: &Value) -> String {
    format!(
        "When you have finished using tools, reply with only a JSON value (no prose, no code fences) that conforms to this JSON Schema:\n{schema_json}"
    )
}

pub(crate) fn merge_system_prompt(base: Option<&str>, extra: Option<String>) -> Option<String> {
    match (base.filter(|base| !base.is_empty()), extra) {
        (Some(base), Some(extra)) => Some(format!("{base}\n\n{extra}")),
        (Some(base), None) => Some(base.to_string()),
        (None, extra) => extra,
    }
}

/// Pulls a JSON value out of model text, tolerating surrounding prose and
/// markdown code fences.
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = unfenced
        && let Ok(value) = serde_json::from_str::<Value>(inner)
    {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end])
        {
            return Some(value);
        }
    }

    None
}

/// Structured result from free text, trying the bare value first and then the
/// `{"value": ..}` wrapper.
pub(crate) fn decode_structured_text<T: DeserializeOwned>(text: &str) -> Option<T> {
    let value = extract_json(text)?;
    if let Ok(decoded) = serde_json::from_value::<T>(value.clone()) {
        return Some(decoded);
    }
    match value {
        Value::Object(mut map) if map.len() == 1 => map
            .remove(WRAPPED_VALUE_KEY)
            .and_then(|inner| serde_json::from_value::<T>(inner).ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        result: i64,
    }

    #[test]
    fn extract_json_handles_fences_and_prose() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("```json\n{\"a\": 2}\n```"),
            Some(json!({"a": 2}))
        );
        assert_eq!(
            extract_json("Here you go: {\"a\": 3} hope that helps"),
            Some(json!({"a": 3}))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn decode_structured_text_accepts_wrapped_values() {
        assert_eq!(
            decode_structured_text::<Answer>(r#"{"result":4}"#),
            Some(Answer { result: 4 })
        );
        assert_eq!(
            decode_structured_text::<Vec<i64>>(r#"{"value":[1,2]}"#),
            Some(vec![1, 2])
        );
        assert_eq!(decode_structured_text::<Answer>("four"), None);
    }

    #[test]
    fn wrap_root_only_wraps_non_objects() {
        let object = Schema::object().build().expect("schema builds");
        assert!(wrap_root(&object).is_none());

        let wrapped = wrap_root(&Schema::array(Schema::integer())).expect("wrapped");
        assert_eq!(wrapped.required(), [WRAPPED_VALUE_KEY.to_string()]);
        assert_eq!(unwrap_root(json!({"value": [1]}), true), json!([1]));
        assert_eq!(unwrap_root(json!({"value": [1]}), false), json!({"value": [1]}));
    }

    #[test]
    fn assistant_message_orders_text_before_tool_uses() {
        let response = ToolCallResponse {
            tool_calls: vec![ToolCall::new("c1", "lookup", "{}")],
            text: Some("checking".to_string()),
            ..Default::default()
        };
        let message = response.assistant_message();
        assert_eq!(message.role, Role::Assistant);
        assert!(matches!(message.contents[0], ContentBlock::Text { .. }));
        assert!(matches!(message.contents[1], ContentBlock::ToolUse(_)));
    }

    #[test]
    fn merge_system_prompt_joins_parts() {
        assert_eq!(
            merge_system_prompt(Some("be brief"), Some("json only".to_string())).as_deref(),
            Some("be brief\n\njson only")
        );
        assert_eq!(merge_system_prompt(Some(""), None), None);
    }
}
