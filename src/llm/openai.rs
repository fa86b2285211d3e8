use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::http::{nested_error_message, post_json};
use crate::llm::{
    ChatModel, ChatResponse, GenerateRequest, ToolCallRequest, ToolCallResponse, ToolChoice,
    unwrap_root, wrap_root,
};
use crate::message::{
    ContentBlock, MediaKind, MediaSource, Message, Role, StopReason, TokenUsage, ToolCall,
};
use crate::schema::{Schema, dialect};

const PROVIDER: &str = "openai";
const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const RESPONSE_FORMAT_NAME: &str = "response";

#[derive(Debug, Clone)]
/// Runtime configuration for [`OpenAiModel`].
pub struct OpenAiModelConfig {
    /// OpenAI API key, sent as a Bearer token.
    pub api_key: String,
    /// Model id (for example `gpt-4o-mini`).
    pub model: String,
    /// Sent as `OpenAI-Organization` when set.
    pub organization: Option<String>,
    /// Any OpenAI-compatible chat-completions base URL.
    pub api_base_url: Option<String>,
    /// Default sampling temperature.
    pub temperature: Option<f32>,
    /// Optional nucleus sampling parameter.
    pub top_p: Option<f32>,
    /// Maximum output tokens per call; `None` leaves it to the server.
    pub max_tokens: Option<u32>,
}

impl OpenAiModelConfig {
    /// Creates a config with sensible defaults.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            organization: None,
            api_base_url: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone)]
/// Chat Completions client implementing [`ChatModel`].
pub struct OpenAiModel {
    client: Client,
    config: OpenAiModelConfig,
}

impl OpenAiModel {
    pub fn new(config: OpenAiModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Reads `OPENAI_API_KEY` and, if present, `OPENAI_ORGANIZATION`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::MissingApiKey("OPENAI_API_KEY"))?;

        let mut config = OpenAiModelConfig::new(api_key, model);
        config.organization = std::env::var("OPENAI_ORGANIZATION").ok();
        Self::new(config)
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        debug!(
            provider = PROVIDER,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "sending request"
        );

        let mut http = self
            .client
            .post(self.endpoint())
            .header("authorization", format!("Bearer {}", self.config.api_key));
        if let Some(organization) = &self.config.organization {
            http = http.header("OpenAI-Organization", organization);
        }

        post_json(PROVIDER, http, request, nested_error_message).await
    }
}

#[async_trait]
impl ChatModel for OpenAiModel {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    async fn generate_value(
        &self,
        request: GenerateRequest<'_>,
    ) -> Result<ChatResponse<Value>, ProviderError> {
        let (payload, wrapped) = build_generate_request(&self.config, &request)?;
        let response = self.send(&payload).await?;
        normalize_structured(response, wrapped)
    }

    async fn plan_tool_calls(
        &self,
        request: ToolCallRequest<'_>,
    ) -> Result<ToolCallResponse, ProviderError> {
        let payload = build_tool_request(&self.config, &request)?;
        let response = self.send(&payload).await?;
        normalize_response(response, &self.config.model)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<OpenAiToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum UserContent {
    Text(String),
    Parts(Vec<UserPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    type_: &'static str,
    function: FunctionDefinition,
}

#[derive(Debug, Serialize)]
struct FunctionDefinition {
    name: String,
    description: String,
    strict: bool,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiToolChoice {
    Mode(&'static str),
    Specific {
        #[serde(rename = "type")]
        type_: &'static str,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Serialize)]
struct ToolChoiceFunction {
    name: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    type_: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: &'static str,
    strict: bool,
    schema: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    type_: String,
    function: OpenAiToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    model: Option<String>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiAssistantMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiAssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

fn response_format(schema: &Schema) -> (ResponseFormat, bool) {
    let wrapped = wrap_root(schema);
    let format = ResponseFormat {
        type_: "json_schema",
        json_schema: JsonSchemaFormat {
            name: RESPONSE_FORMAT_NAME,
            strict: true,
            schema: dialect::openai(wrapped.as_ref().unwrap_or(schema)),
        },
    };
    (format, wrapped.is_some())
}

fn build_generate_request(
    config: &OpenAiModelConfig,
    request: &GenerateRequest<'_>,
) -> Result<(ChatCompletionRequest, bool), ProviderError> {
    let messages = to_openai_messages(request.system_prompt, request.messages, true)?;
    let (format, wrapped) = response_format(request.schema);

    let payload = ChatCompletionRequest {
        model: config.model.clone(),
        messages,
        tools: None,
        tool_choice: None,
        response_format: Some(format),
        temperature: request.temperature.or(config.temperature),
        top_p: config.top_p,
        max_tokens: request.max_tokens.or(config.max_tokens),
    };

    Ok((payload, wrapped))
}

fn build_tool_request(
    config: &OpenAiModelConfig,
    request: &ToolCallRequest<'_>,
) -> Result<ChatCompletionRequest, ProviderError> {
    let messages = to_openai_messages(request.system_prompt, request.messages, false)?;

    let (tools, tool_choice) = if request.tools.is_empty() {
        (None, None)
    } else {
        let tools = request
            .tools
            .iter()
            .map(|tool| OpenAiTool {
                type_: "function",
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    strict: true,
                    parameters: dialect::openai(tool.input_schema()),
                },
            })
            .collect::<Vec<_>>();
        let choice = match request.tool_choice {
            ToolChoice::Auto => OpenAiToolChoice::Mode("auto"),
            ToolChoice::Required => OpenAiToolChoice::Mode("required"),
            ToolChoice::None => OpenAiToolChoice::Mode("none"),
            ToolChoice::Tool(name) => OpenAiToolChoice::Specific {
                type_: "function",
                function: ToolChoiceFunction { name: name.clone() },
            },
        };
        (Some(tools), Some(choice))
    };

    Ok(ChatCompletionRequest {
        model: config.model.clone(),
        messages,
        tools,
        tool_choice,
        response_format: request
            .response_schema
            .map(|schema| response_format(schema).0),
        temperature: request.temperature.or(config.temperature),
        top_p: config.top_p,
        max_tokens: request.max_tokens.or(config.max_tokens),
    })
}

/// Tool results become standalone `tool` role messages, emitted before any
/// text that shares their canonical user message.
fn to_openai_messages(
    system_prompt: Option<&str>,
    messages: &[Message],
    allow_media: bool,
) -> Result<Vec<OpenAiMessage>, ProviderError> {
    let mut out = Vec::new();

    if let Some(system) = system_prompt.filter(|system| !system.is_empty()) {
        out.push(OpenAiMessage::System {
            content: system.to_string(),
        });
    }

    for message in messages {
        match message.role {
            Role::User => {
                let mut parts = Vec::new();
                for block in &message.contents {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                parts.push(UserPart::Text { text: text.clone() });
                            }
                        }
                        ContentBlock::ToolResult {
                            call_id, output, ..
                        } => out.push(OpenAiMessage::Tool {
                            tool_call_id: call_id.clone(),
                            content: output.content(),
                        }),
                        ContentBlock::Media(media) => {
                            if !allow_media || media.kind != MediaKind::Image {
                                return Err(ProviderError::MediaNotSupported {
                                    media_kind: media.kind.to_string(),
                                    provider: PROVIDER,
                                });
                            }
                            let url = match &media.source {
                                MediaSource::Base64(data) => {
                                    format!("data:{};base64,{data}", media.mime_type)
                                }
                                MediaSource::Url(url) => url.clone(),
                            };
                            parts.push(UserPart::ImageUrl {
                                image_url: ImageUrl { url },
                            });
                        }
                        ContentBlock::ToolUse(_) => {}
                    }
                }

                let content = match parts.pop() {
                    None => continue,
                    Some(UserPart::Text { text }) if parts.is_empty() => UserContent::Text(text),
                    Some(last) => {
                        parts.push(last);
                        UserContent::Parts(parts)
                    }
                };
                out.push(OpenAiMessage::User { content });
            }
            Role::Assistant => {
                let mut tool_calls = Vec::new();
                let mut tool_outputs = Vec::new();
                for block in &message.contents {
                    match block {
                        ContentBlock::ToolUse(call) => tool_calls.push(OpenAiToolCall {
                            id: call.id.clone(),
                            type_: function_type(),
                            function: OpenAiToolCallFunction {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        }),
                        ContentBlock::ToolResult {
                            call_id, output, ..
                        } => tool_outputs.push(OpenAiMessage::Tool {
                            tool_call_id: call_id.clone(),
                            content: output.content(),
                        }),
                        // Assistant turns are text-only on chat completions.
                        ContentBlock::Media(media) => {
                            return Err(ProviderError::MediaNotSupported {
                                media_kind: media.kind.to_string(),
                                provider: PROVIDER,
                            });
                        }
                        ContentBlock::Text { .. } => {}
                    }
                }
                let content = message.text();

                if content.is_some() || !tool_calls.is_empty() {
                    out.push(OpenAiMessage::Assistant {
                        content,
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                    });
                }
                out.extend(tool_outputs);
            }
        }
    }

    Ok(out)
}

fn first_choice(
    response: ChatCompletionResponse,
) -> Result<(OpenAiAssistantMessage, Option<String>, TokenUsage, Option<String>), ProviderError> {
    let usage = response
        .usage
        .map(|usage| {
            TokenUsage::new(
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
            )
        })
        .unwrap_or_default();

    let choice = response.choices.into_iter().next().ok_or_else(|| {
        ProviderError::DecodingFailed("openai response missing choices".to_string())
    })?;
    let message = choice.message.ok_or_else(|| {
        ProviderError::DecodingFailed("openai response missing choice message".to_string())
    })?;

    Ok((message, choice.finish_reason, usage, response.model))
}

fn normalize_response(
    response: ChatCompletionResponse,
    fallback_model: &str,
) -> Result<ToolCallResponse, ProviderError> {
    let (message, finish_reason, usage, model) = first_choice(response)?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|call| ToolCall::new(call.id, call.function.name, call.function.arguments))
        .collect();

    Ok(ToolCallResponse {
        tool_calls,
        text: message.content.filter(|text| !text.is_empty()),
        thinking: message.reasoning_content.filter(|text| !text.is_empty()),
        usage,
        stop_reason: finish_reason.as_deref().map(stop_reason),
        model: model.unwrap_or_else(|| fallback_model.to_string()),
    })
}

fn normalize_structured(
    response: ChatCompletionResponse,
    wrapped: bool,
) -> Result<ChatResponse<Value>, ProviderError> {
    let (message, _, usage, _) = first_choice(response)?;

    if let Some(refusal) = message.refusal.filter(|text| !text.is_empty()) {
        return Err(ProviderError::DecodingFailed(format!(
            "model refused to answer: {refusal}"
        )));
    }

    let content = message.content.unwrap_or_default();
    let value = serde_json::from_str::<Value>(&content)
        .map_err(|err| ProviderError::DecodingFailed(err.to_string()))?;

    Ok(ChatResponse {
        result: unwrap_root(value, wrapped),
        assistant_message: Message::assistant(content),
        usage,
    })
}

fn stop_reason(raw: &str) -> StopReason {
    match raw {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        other => StopReason::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::{Media, ToolResult};
    use crate::tools::ToolDefinition;

    fn lookup_tool() -> ToolDefinition {
        ToolDefinition::new(
            "lookup",
            "Look up something",
            Schema::object()
                .property("query", Schema::string())
                .optional_property("limit", Schema::integer())
                .build()
                .expect("schema builds"),
        )
        .expect("definition builds")
    }

    #[test]
    fn build_tool_request_serializes_messages_tools_and_tool_choice() {
        let call = ToolCall::new("call_1", "lookup", r#"{"query":"rust"}"#);
        let messages = vec![
            Message::user("Find docs"),
            Message::new(
                Role::Assistant,
                vec![
                    ContentBlock::Text {
                        text: "Calling tool".to_string(),
                    },
                    ContentBlock::ToolUse(call.clone()),
                ],
            ),
            Message::tool_result(&call, ToolResult::Json(json!({"result": "ok"}))),
        ];

        let mut config = OpenAiModelConfig::new("key", "gpt-test");
        config.temperature = Some(0.2);
        config.max_tokens = Some(512);

        let tools = [lookup_tool()];
        let choice = ToolChoice::Tool("lookup".to_string());
        let request = ToolCallRequest::new(&messages, &tools)
            .tool_choice(&choice)
            .system_prompt("You are helpful");

        let value = serde_json::to_value(build_tool_request(&config, &request).expect("builds"))
            .expect("serializes");

        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], "You are helpful");
        assert_eq!(value["messages"][1]["content"], "Find docs");
        assert_eq!(value["messages"][2]["role"], "assistant");
        assert_eq!(
            value["messages"][2]["tool_calls"][0]["function"]["arguments"],
            "{\"query\":\"rust\"}"
        );
        assert_eq!(value["messages"][3]["role"], "tool");
        assert_eq!(value["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(value["messages"][3]["content"], "{\"result\":\"ok\"}");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["strict"], true);
        assert_eq!(
            value["tools"][0]["function"]["parameters"]["required"],
            json!(["query", "limit"])
        );
        assert_eq!(
            value["tools"][0]["function"]["parameters"]["properties"]["limit"]["type"],
            json!(["integer", "null"])
        );
        assert_eq!(
            value["tool_choice"],
            json!({"type": "function", "function": {"name": "lookup"}})
        );
        assert!((value["temperature"].as_f64().unwrap_or_default() - 0.2).abs() < 1e-6);
        assert_eq!(value["max_tokens"], 512);
        assert!(value.get("response_format").is_none());
    }

    #[test]
    fn tool_choice_modes_map_to_strings() {
        let config = OpenAiModelConfig::new("key", "gpt-test");
        let messages = vec![Message::user("hi")];
        let tools = [lookup_tool()];

        for (choice, expected) in [
            (ToolChoice::Auto, "auto"),
            (ToolChoice::Required, "required"),
            (ToolChoice::None, "none"),
        ] {
            let request = ToolCallRequest::new(&messages, &tools).tool_choice(&choice);
            let value =
                serde_json::to_value(build_tool_request(&config, &request).expect("builds"))
                    .expect("serializes");
            assert_eq!(value["tool_choice"], expected);
        }

        let request = ToolCallRequest::new(&messages, &[]);
        let value = serde_json::to_value(build_tool_request(&config, &request).expect("builds"))
            .expect("serializes");
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
    }

    #[test]
    fn generate_request_uses_strict_json_schema() {
        let config = OpenAiModelConfig::new("key", "gpt-test");
        let messages = vec![Message::new(
            Role::User,
            vec![
                ContentBlock::Text {
                    text: "describe".to_string(),
                },
                ContentBlock::Media(Media {
                    kind: MediaKind::Image,
                    mime_type: "image/png".to_string(),
                    source: MediaSource::Base64("aGk=".to_string()),
                }),
            ],
        )];
        let schema = Schema::array(Schema::string());

        let (payload, wrapped) =
            build_generate_request(&config, &GenerateRequest::new(&messages, &schema))
                .expect("builds");
        let value = serde_json::to_value(payload).expect("serializes");

        assert!(wrapped);
        assert_eq!(value["response_format"]["type"], "json_schema");
        assert_eq!(value["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            value["response_format"]["json_schema"]["schema"]["properties"]["value"]["type"],
            "array"
        );
        assert_eq!(
            value["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,aGk="
        );
    }

    #[test]
    fn tool_request_rejects_media() {
        let config = OpenAiModelConfig::new("key", "gpt-test");
        let messages = vec![Message::new(
            Role::User,
            vec![ContentBlock::Media(Media {
                kind: MediaKind::Audio,
                mime_type: "audio/wav".to_string(),
                source: MediaSource::Url("https://example.com/a.wav".to_string()),
            })],
        )];
        let err = build_tool_request(&config, &ToolCallRequest::new(&messages, &[]))
            .expect_err("media rejected");
        assert_eq!(
            err,
            ProviderError::MediaNotSupported {
                media_kind: "audio".to_string(),
                provider: "openai",
            }
        );
    }

    #[test]
    fn assistant_media_is_rejected_before_sending() {
        let config = OpenAiModelConfig::new("key", "gpt-test");
        let messages = vec![
            Message::user("hi"),
            Message::new(
                Role::Assistant,
                vec![
                    ContentBlock::Text {
                        text: "here is a picture".to_string(),
                    },
                    ContentBlock::Media(Media {
                        kind: MediaKind::Image,
                        mime_type: "image/png".to_string(),
                        source: MediaSource::Base64("aGk=".to_string()),
                    }),
                ],
            ),
        ];
        let schema = Schema::string();

        let err = build_tool_request(&config, &ToolCallRequest::new(&messages, &[]))
            .expect_err("media rejected");
        assert_eq!(
            err,
            ProviderError::MediaNotSupported {
                media_kind: "image".to_string(),
                provider: "openai",
            }
        );
        assert!(
            build_generate_request(&config, &GenerateRequest::new(&messages, &schema)).is_err()
        );
    }

    #[test]
    fn tool_results_on_assistant_turns_become_tool_messages() {
        let config = OpenAiModelConfig::new("key", "gpt-test");
        let call = ToolCall::new("call_1", "lookup", "{}");
        let messages = vec![
            Message::user("hi"),
            Message::new(
                Role::Assistant,
                vec![
                    ContentBlock::ToolUse(call.clone()),
                    ContentBlock::ToolResult {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        output: ToolResult::text("done"),
                    },
                ],
            ),
        ];

        let value = serde_json::to_value(
            build_tool_request(&config, &ToolCallRequest::new(&messages, &[])).expect("builds"),
        )
        .expect("serializes");

        assert_eq!(value["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(value["messages"][2]["role"], "tool");
        assert_eq!(value["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(value["messages"][2]["content"], "done");
    }

    #[test]
    fn normalize_response_extracts_tool_calls_usage_and_finish_reason() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "model": "gpt-test-0613",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_x",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"query\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18}
        }))
        .expect("response decodes");

        let normalized = normalize_response(response, "gpt-test").expect("normalizes");
        assert!(normalized.text.is_none());
        assert_eq!(
            normalized.tool_calls,
            vec![ToolCall::new("call_x", "lookup", "{\"query\":\"rust\"}")]
        );
        assert_eq!(normalized.usage, TokenUsage::new(11, 7));
        assert_eq!(normalized.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(normalized.model, "gpt-test-0613");
    }

    #[test]
    fn normalize_response_requires_choices() {
        let response: ChatCompletionResponse =
            serde_json::from_value(json!({"choices": []})).expect("response decodes");
        let err = normalize_response(response, "gpt-test").expect_err("should fail");
        assert!(matches!(err, ProviderError::DecodingFailed(message) if message.contains("missing choices")));
    }

    #[test]
    fn normalize_structured_parses_content_and_refusals() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "{\"value\":[\"a\"]}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 3}
        }))
        .expect("response decodes");
        let chat = normalize_structured(response, true).expect("structured");
        assert_eq!(chat.result, json!(["a"]));
        assert_eq!(chat.usage.total_tokens(), 5);

        let refused: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": null, "refusal": "cannot help"}}]
        }))
        .expect("response decodes");
        assert!(matches!(
            normalize_structured(refused, false),
            Err(ProviderError::DecodingFailed(message)) if message.contains("cannot help")
        ));
    }
}
