use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ProviderError;
use crate::llm::http::{nested_error_message, post_json};
use crate::llm::{
    ChatModel, ChatResponse, GenerateRequest, ToolCallRequest, ToolCallResponse, ToolChoice,
    final_answer_instructions, merge_system_prompt, unwrap_root, wrap_root,
};
use crate::message::{
    ContentBlock, MediaKind, MediaSource, Message, Role, StopReason, TokenUsage, ToolCall,
};
use crate::schema::dialect;

const PROVIDER: &str = "anthropic";
const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_API_VERSION: &str = "2023-06-01";
/// Synthetic tool forced during structured generation; its input is the result.
const STRUCTURED_OUTPUT_TOOL: &str = "structured_output";

#[derive(Debug, Clone)]
/// Runtime configuration for [`AnthropicModel`].
pub struct AnthropicModelConfig {
    /// Anthropic API key, sent as `x-api-key`.
    pub api_key: String,
    /// Model id (for example `claude-sonnet-4-5`).
    pub model: String,
    /// `anthropic-version` header value.
    pub api_version: String,
    /// Optional base URL override for proxies or compatible endpoints.
    pub api_base_url: Option<String>,
    /// Maximum output tokens per call. Anthropic requires this field.
    pub max_tokens: u32,
    /// Default sampling temperature.
    pub temperature: Option<f32>,
    /// Optional nucleus sampling parameter.
    pub top_p: Option<f32>,
}

impl AnthropicModelConfig {
    /// Creates a config with sensible defaults.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            api_base_url: None,
            max_tokens: 4096,
            temperature: None,
            top_p: None,
        }
    }
}

#[derive(Debug, Clone)]
/// Anthropic Messages API client implementing [`ChatModel`].
pub struct AnthropicModel {
    client: Client,
    config: AnthropicModelConfig,
}

impl AnthropicModel {
    pub fn new(config: AnthropicModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Creates a client using `ANTHROPIC_API_KEY` from the environment.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::MissingApiKey("ANTHROPIC_API_KEY"))?;
        Self::new(AnthropicModelConfig::new(api_key, model))
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/messages")
    }

    async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse, ProviderError> {
        debug!(
            provider = PROVIDER,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "sending request"
        );

        let http = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version);

        post_json(PROVIDER, http, request, nested_error_message).await
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
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
        Ok(normalize_response(response, &self.config.model))
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        thinking: String,
    },
    RedactedThinking {
        data: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn build_generate_request(
    config: &AnthropicModelConfig,
    request: &GenerateRequest<'_>,
) -> Result<(MessagesRequest, bool), ProviderError> {
    let messages = to_anthropic_messages(request.messages, true)?;
    let wrapped_schema = wrap_root(request.schema);
    let input_schema = dialect::anthropic(wrapped_schema.as_ref().unwrap_or(request.schema));

    let payload = MessagesRequest {
        model: config.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(config.max_tokens),
        messages,
        system: merge_system_prompt(request.system_prompt, None),
        temperature: request.temperature.or(config.temperature),
        top_p: config.top_p,
        tools: Some(vec![AnthropicTool {
            name: STRUCTURED_OUTPUT_TOOL.to_string(),
            description: "Return the final answer as structured data.".to_string(),
            input_schema,
        }]),
        tool_choice: Some(AnthropicToolChoice::Tool {
            name: STRUCTURED_OUTPUT_TOOL.to_string(),
        }),
    };

    Ok((payload, wrapped_schema.is_some()))
}

fn build_tool_request(
    config: &AnthropicModelConfig,
    request: &ToolCallRequest<'_>,
) -> Result<MessagesRequest, ProviderError> {
    let messages = to_anthropic_messages(request.messages, false)?;

    let instructions = request
        .response_schema
        .map(|schema| final_answer_instructions(&dialect::anthropic(schema)));

    // No native "none": the closest equivalent is not offering any tools.
    let offer_tools = !request.tools.is_empty() && *request.tool_choice != ToolChoice::None;

    let (tools, tool_choice) = if offer_tools {
        let tools = request
            .tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: dialect::anthropic(tool.input_schema()),
            })
            .collect::<Vec<_>>();
        let choice = match request.tool_choice {
            ToolChoice::Auto | ToolChoice::None => AnthropicToolChoice::Auto,
            ToolChoice::Required => AnthropicToolChoice::Any,
            ToolChoice::Tool(name) => AnthropicToolChoice::Tool { name: name.clone() },
        };
        (Some(tools), Some(choice))
    } else {
        (None, None)
    };

    Ok(MessagesRequest {
        model: config.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(config.max_tokens),
        messages,
        system: merge_system_prompt(request.system_prompt, instructions),
        temperature: request.temperature.or(config.temperature),
        top_p: config.top_p,
        tools,
        tool_choice,
    })
}

/// Consecutive same-role messages are merged, since Anthropic expects
/// alternating turns and wants every tool result for one assistant turn in a
/// single user message.
fn to_anthropic_messages(
    messages: &[Message],
    allow_media: bool,
) -> Result<Vec<AnthropicMessage>, ProviderError> {
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        let mut blocks = Vec::new();
        for block in &message.contents {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        blocks.push(AnthropicBlock::Text { text: text.clone() });
                    }
                }
                ContentBlock::ToolUse(call) => blocks.push(AnthropicBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments_value(),
                }),
                ContentBlock::ToolResult {
                    call_id, output, ..
                } => blocks.push(AnthropicBlock::ToolResult {
                    tool_use_id: call_id.clone(),
                    content: output.content(),
                    is_error: output.is_error().then_some(true),
                }),
                ContentBlock::Media(media) => {
                    if !allow_media || media.kind != MediaKind::Image {
                        return Err(ProviderError::MediaNotSupported {
                            media_kind: media.kind.to_string(),
                            provider: PROVIDER,
                        });
                    }
                    let source = match &media.source {
                        MediaSource::Base64(data) => AnthropicImageSource::Base64 {
                            media_type: media.mime_type.clone(),
                            data: data.clone(),
                        },
                        MediaSource::Url(url) => AnthropicImageSource::Url { url: url.clone() },
                    };
                    blocks.push(AnthropicBlock::Image { source });
                }
            }
        }

        if blocks.is_empty() {
            continue;
        }

        match out.last_mut() {
            Some(previous) if previous.role == role => previous.content.extend(blocks),
            _ => out.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }

    Ok(out)
}

fn normalize_response(response: MessagesResponse, fallback_model: &str) -> ToolCallResponse {
    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ResponseBlock::Text { text } => text_parts.push(text),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id, name, input.to_string()))
            }
            ResponseBlock::Thinking { thinking } => thinking_parts.push(thinking),
            ResponseBlock::RedactedThinking { data } => {
                thinking_parts.push(format!("[redacted:{} bytes]", data.len()))
            }
            ResponseBlock::Unknown => {}
        }
    }

    ToolCallResponse {
        tool_calls,
        text: join_parts(text_parts),
        thinking: join_parts(thinking_parts),
        usage: response
            .usage
            .map(|usage| TokenUsage::new(usage.input_tokens, usage.output_tokens))
            .unwrap_or_default(),
        stop_reason: response.stop_reason.as_deref().map(stop_reason),
        model: response
            .model
            .unwrap_or_else(|| fallback_model.to_string()),
    }
}

fn normalize_structured(
    response: MessagesResponse,
    wrapped: bool,
) -> Result<ChatResponse<Value>, ProviderError> {
    let usage = response
        .usage
        .as_ref()
        .map(|usage| TokenUsage::new(usage.input_tokens, usage.output_tokens))
        .unwrap_or_default();

    let input = response
        .content
        .into_iter()
        .find_map(|block| match block {
            ResponseBlock::ToolUse { name, input, .. } if name == STRUCTURED_OUTPUT_TOOL => {
                Some(input)
            }
            _ => None,
        })
        .ok_or_else(|| {
            ProviderError::DecodingFailed(
                "anthropic response contained no structured output".to_string(),
            )
        })?;

    let result = unwrap_root(input, wrapped);
    Ok(ChatResponse {
        assistant_message: Message::assistant(result.to_string()),
        result,
        usage,
    })
}

fn stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        "stop_sequence" => StopReason::StopSequence,
        "refusal" => StopReason::ContentFilter,
        other => StopReason::Other(other.to_string()),
    }
}

fn join_parts(parts: Vec<String>) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
