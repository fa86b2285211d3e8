use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::llm::http::post_json;
use crate::llm::{
    ChatModel, ChatResponse, GenerateRequest, ToolCallRequest, ToolCallResponse, ToolChoice,
    final_answer_instructions, merge_system_prompt,
};
use crate::message::{
    ContentBlock, MediaKind, MediaSource, Message, Role, StopReason, TokenUsage, ToolCall,
    ToolResult,
};
use crate::schema::dialect;

const PROVIDER: &str = "gemini";
const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
/// Runtime configuration for [`GeminiModel`].
pub struct GeminiModelConfig {
    /// Google AI Studio API key, sent as the `key` query parameter.
    pub api_key: String,
    /// Model id (for example `gemini-2.5-flash`).
    pub model: String,
    /// Optional base URL override; defaults to the public `v1beta` endpoint.
    pub api_base_url: Option<String>,
    /// Default sampling temperature.
    pub temperature: Option<f32>,
    /// Optional nucleus sampling parameter.
    pub top_p: Option<f32>,
    /// `generationConfig.maxOutputTokens`; `None` leaves it to the model.
    pub max_output_tokens: Option<u32>,
}

impl GeminiModelConfig {
    /// Creates a config with sensible defaults.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_base_url: None,
            temperature: None,
            top_p: None,
            max_output_tokens: Some(4096),
        }
    }
}

#[derive(Debug, Clone)]
/// Gemini `generateContent` client implementing [`ChatModel`].
pub struct GeminiModel {
    client: Client,
    config: GeminiModelConfig,
}

impl GeminiModel {
    pub fn new(config: GeminiModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Creates a client using `GOOGLE_API_KEY`, falling back to
    /// `GEMINI_API_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| ProviderError::MissingApiKey("GOOGLE_API_KEY (or GEMINI_API_KEY)"))?;

        Self::new(GeminiModelConfig::new(api_key, model))
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/models/{}:generateContent", self.config.model)
    }

    async fn send(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        let tools = request.tools.as_ref().map_or(0, |tools| {
            tools
                .iter()
                .map(|tool| tool.function_declarations.len())
                .sum::<usize>()
        });
        debug!(
            provider = PROVIDER,
            model = %self.config.model,
            contents = request.contents.len(),
            tools,
            "sending request"
        );

        let http = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())]);

        post_json(PROVIDER, http, request, gemini_error_message).await
    }
}

#[async_trait]
impl ChatModel for GeminiModel {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    async fn generate_value(
        &self,
        request: GenerateRequest<'_>,
    ) -> Result<ChatResponse<Value>, ProviderError> {
        let payload = build_generate_request(&self.config, &request)?;
        let response = self.send(&payload).await?;
        normalize_structured(response)
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
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct FileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GeminiFunctionCall {
    /// Only some models return one; it is never sent back.
    #[serde(default, skip_serializing)]
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionCallingConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    thoughts_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// `{"error": {"code", "message", "status"}}`
fn gemini_error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    let message = error.get("message").and_then(Value::as_str)?;
    match error.get("status").and_then(Value::as_str) {
        Some(status) => Some(format!("{status}: {message}")),
        None => Some(message.to_string()),
    }
}

fn build_generate_request(
    config: &GeminiModelConfig,
    request: &GenerateRequest<'_>,
) -> Result<GenerateContentRequest, ProviderError> {
    Ok(GenerateContentRequest {
        contents: to_gemini_contents(request.messages, true)?,
        system_instruction: system_instruction(merge_system_prompt(request.system_prompt, None)),
        tools: None,
        tool_config: None,
        generation_config: Some(GenerationConfig {
            temperature: request.temperature.or(config.temperature),
            top_p: config.top_p,
            max_output_tokens: request.max_tokens.or(config.max_output_tokens),
            response_mime_type: Some("application/json"),
            response_schema: Some(dialect::gemini(request.schema)),
        }),
    })
}

/// Gemini rejects `responseSchema` combined with function calling, so a
/// final-answer schema travels in the system instruction instead.
fn build_tool_request(
    config: &GeminiModelConfig,
    request: &ToolCallRequest<'_>,
) -> Result<GenerateContentRequest, ProviderError> {
    let contents = to_gemini_contents(request.messages, false)?;

    let instructions = request
        .response_schema
        .map(|schema| final_answer_instructions(&dialect::gemini(schema)));

    let (tools, tool_config) = if request.tools.is_empty() {
        (None, None)
    } else {
        let declarations = request
            .tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: dialect::gemini(tool.input_schema()),
            })
            .collect::<Vec<_>>();

        let (mode, allowed_function_names) = match request.tool_choice {
            ToolChoice::Auto => ("AUTO", None),
            ToolChoice::Required => ("ANY", None),
            ToolChoice::None => ("NONE", None),
            ToolChoice::Tool(name) => ("ANY", Some(vec![name.clone()])),
        };

        (
            Some(vec![GeminiTool {
                function_declarations: declarations,
            }]),
            Some(GeminiToolConfig {
                function_calling_config: FunctionCallingConfig {
                    mode,
                    allowed_function_names,
                },
            }),
        )
    };

    Ok(GenerateContentRequest {
        contents,
        system_instruction: system_instruction(merge_system_prompt(
            request.system_prompt,
            instructions,
        )),
        tools,
        tool_config,
        generation_config: Some(GenerationConfig {
            temperature: request.temperature.or(config.temperature),
            top_p: config.top_p,
            max_output_tokens: request.max_tokens.or(config.max_output_tokens),
            ..GenerationConfig::default()
        }),
    })
}

fn system_instruction(system: Option<String>) -> Option<GeminiContent> {
    system.map(|text| GeminiContent {
        role: None,
        parts: vec![GeminiPart::text(text)],
    })
}

/// Consecutive same-role contents are merged so every function response for
/// one model turn lands in a single user turn.
fn to_gemini_contents(
    messages: &[Message],
    allow_media: bool,
) -> Result<Vec<GeminiContent>, ProviderError> {
    let mut contents: Vec<GeminiContent> = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
        };

        let mut parts = Vec::new();
        for block in &message.contents {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(GeminiPart::text(text.clone()));
                    }
                }
                ContentBlock::ToolUse(call) => parts.push(GeminiPart {
                    function_call: Some(GeminiFunctionCall {
                        id: None,
                        name: Some(call.name.clone()),
                        args: Some(call.arguments_value()),
                    }),
                    ..GeminiPart::default()
                }),
                ContentBlock::ToolResult { name, output, .. } => parts.push(GeminiPart {
                    function_response: Some(GeminiFunctionResponse {
                        name: name.clone(),
                        response: tool_result_payload(output),
                    }),
                    ..GeminiPart::default()
                }),
                ContentBlock::Media(media) => {
                    if !allow_media || media.kind != MediaKind::Image {
                        return Err(ProviderError::MediaNotSupported {
                            media_kind: media.kind.to_string(),
                            provider: PROVIDER,
                        });
                    }
                    parts.push(match &media.source {
                        MediaSource::Base64(data) => GeminiPart {
                            inline_data: Some(InlineData {
                                mime_type: media.mime_type.clone(),
                                data: data.clone(),
                            }),
                            ..GeminiPart::default()
                        },
                        MediaSource::Url(url) => GeminiPart {
                            file_data: Some(FileData {
                                mime_type: media.mime_type.clone(),
                                file_uri: url.clone(),
                            }),
                            ..GeminiPart::default()
                        },
                    });
                }
            }
        }

        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(previous) if previous.role.as_deref() == Some(role) => {
                previous.parts.extend(parts)
            }
            _ => contents.push(GeminiContent {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    Ok(contents)
}

/// `functionResponse.response` must be an object.
fn tool_result_payload(output: &ToolResult) -> Value {
    match output {
        ToolResult::Text(text) => json!({"result": text}),
        ToolResult::Json(value @ Value::Object(_)) => value.clone(),
        ToolResult::Json(value) => json!({"result": value}),
        ToolResult::Error(message) => json!({"error": message}),
    }
}

struct Candidate {
    parts: Vec<GeminiPart>,
    finish_reason: Option<String>,
    usage: TokenUsage,
    model: Option<String>,
}

fn first_candidate(response: GenerateContentResponse) -> Result<Candidate, ProviderError> {
    let usage = response
        .usage_metadata
        .map(|usage| {
            TokenUsage::new(
                usage.prompt_token_count.unwrap_or(0),
                usage
                    .candidates_token_count
                    .unwrap_or(0)
                    .saturating_add(usage.thoughts_token_count.unwrap_or(0)),
            )
        })
        .unwrap_or_default();

    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .map(|reason| format!(" (blocked: {reason})"))
            .unwrap_or_default();
        return Err(ProviderError::DecodingFailed(format!(
            "gemini response missing candidates{reason}"
        )));
    };

    Ok(Candidate {
        parts: candidate
            .content
            .map(|content| content.parts)
            .unwrap_or_default(),
        finish_reason: candidate.finish_reason,
        usage,
        model: response.model_version,
    })
}

fn normalize_response(
    response: GenerateContentResponse,
    fallback_model: &str,
) -> Result<ToolCallResponse, ProviderError> {
    let candidate = first_candidate(response)?;

    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for part in candidate.parts {
        if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                thinking_parts.push(text);
            } else {
                text_parts.push(text);
            }
        }

        if let Some(function_call) = part.function_call {
            let Some(name) = function_call.name else {
                return Err(ProviderError::DecodingFailed(
                    "gemini functionCall missing name".to_string(),
                ));
            };
            let id = function_call
                .id
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
            let arguments = function_call.args.unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCall::new(id, name, arguments.to_string()));
        }
    }

    let stop_reason = if tool_calls.is_empty() {
        candidate.finish_reason.as_deref().map(stop_reason)
    } else {
        Some(StopReason::ToolUse)
    };

    Ok(ToolCallResponse {
        tool_calls,
        text: join_parts(text_parts),
        thinking: join_parts(thinking_parts),
        usage: candidate.usage,
        stop_reason,
        model: candidate
            .model
            .unwrap_or_else(|| fallback_model.to_string()),
    })
}

fn normalize_structured(
    response: GenerateContentResponse,
) -> Result<ChatResponse<Value>, ProviderError> {
    let candidate = first_candidate(response)?;

    let text = candidate
        .parts
        .into_iter()
        .filter(|part| !part.thought.unwrap_or(false))
        .filter_map(|part| part.text)
        .collect::<String>();

    let result = serde_json::from_str::<Value>(&text)
        .map_err(|err| ProviderError::DecodingFailed(err.to_string()))?;

    Ok(ChatResponse {
        result,
        assistant_message: Message::assistant(text),
        usage: candidate.usage,
    })
}

fn stop_reason(raw: &str) -> StopReason {
    match raw {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            StopReason::ContentFilter
        }
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
