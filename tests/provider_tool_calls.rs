use serde::Deserialize;
use serde_json::json;
use structured_agent_rs::{
    AnthropicModel, AnthropicModelConfig, ChatModel, ChatModelExt, GeminiModel,
    GeminiModelConfig, Message, OpenAiModel, OpenAiModelConfig, Schema, SchemaType, StopReason,
    TokenUsage, ToolCallRequest, ToolChoice, ToolDefinition,
};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn lookup_tool() -> ToolDefinition {
    ToolDefinition::new(
        "lookup",
        "Look up a term",
        Schema::object()
            .property("query", Schema::string())
            .build()
            .expect("schema builds"),
    )
    .expect("definition builds")
}

#[derive(Debug, Deserialize, PartialEq)]
struct City {
    name: String,
}

impl SchemaType for City {
    fn schema() -> Schema {
        Schema::object()
            .property("name", Schema::string())
            .build()
            .expect("schema builds")
    }
}

#[tokio::test]
async fn anthropic_tool_call_response_is_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-test",
            "tool_choice": {"type": "any"},
            "tools": [{"name": "lookup"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-test-20250101",
            "content": [
                {"type": "text", "text": "Looking it up."},
                {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"query": "rust"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 21, "output_tokens": 9}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = AnthropicModelConfig::new("test-key", "claude-test");
    config.api_base_url = Some(server.uri());
    let model = AnthropicModel::new(config).expect("client builds");

    let messages = vec![Message::user("what is rust?")];
    let tools = [lookup_tool()];
    let response = model
        .plan_tool_calls(ToolCallRequest::new(&messages, &tools).tool_choice(&ToolChoice::Required))
        .await
        .expect("request succeeds");

    assert_eq!(response.text.as_deref(), Some("Looking it up."));
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "toolu_1");
    assert_eq!(response.tool_calls[0].arguments_value(), json!({"query": "rust"}));
    assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    assert_eq!(response.usage, TokenUsage::new(21, 9));
    assert_eq!(response.model, "claude-test-20250101");
}

#[tokio::test]
async fn openai_tool_call_response_keeps_raw_arguments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(header("openai-organization", "org-1"))
        .and(body_partial_json(json!({
            "tool_choice": "auto",
            "tools": [{"type": "function", "function": {"name": "lookup", "strict": true}}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "model": "gpt-test-0001",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"query\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 30, "completion_tokens": 12, "total_tokens": 42}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = OpenAiModelConfig::new("test-key", "gpt-test");
    config.api_base_url = Some(server.uri());
    config.organization = Some("org-1".to_string());
    let model = OpenAiModel::new(config).expect("client builds");

    let messages = vec![Message::user("what is rust?")];
    let tools = [lookup_tool()];
    let response = model
        .plan_tool_calls(ToolCallRequest::new(&messages, &tools))
        .await
        .expect("request succeeds");

    assert!(response.text.is_none());
    assert_eq!(response.tool_calls[0].id, "call_abc");
    assert_eq!(response.tool_calls[0].arguments, r#"{"query":"rust"}"#);
    assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    assert_eq!(response.usage, TokenUsage::new(30, 12));
}

#[tokio::test]
async fn gemini_tool_call_response_gets_synthesized_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-test:generateContent"))
        .and(query_param("key", "test-key"))
        .and(body_partial_json(json!({
            "toolConfig": {"functionCallingConfig": {"mode": "AUTO"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "lookup", "args": {"query": "rust"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 6, "totalTokenCount": 18}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = GeminiModelConfig::new("test-key", "gemini-test");
    config.api_base_url = Some(server.uri());
    let model = GeminiModel::new(config).expect("client builds");

    let messages = vec![Message::user("what is rust?")];
    let tools = [lookup_tool()];
    let response = model
        .plan_tool_calls(ToolCallRequest::new(&messages, &tools))
        .await
        .expect("request succeeds");

    assert_eq!(response.tool_calls.len(), 1);
    assert!(response.tool_calls[0].id.starts_with("call_"));
    assert_eq!(response.tool_calls[0].name, "lookup");
    assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    assert_eq!(response.usage, TokenUsage::new(12, 6));
    assert_eq!(response.model, "gemini-test");
}

#[tokio::test]
async fn structured_generation_decodes_per_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "tool_choice": {"type": "tool", "name": "structured_output"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "tool_use", "id": "toolu_9", "name": "structured_output", "input": {"name": "Paris"}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 4, "output_tokens": 2}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": {"type": "json_schema", "json_schema": {"strict": true}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"value\":[3,1,2]}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-test:generateContent"))
        .and(body_partial_json(json!({
            "generationConfig": {"responseMimeType": "application/json"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "{\"name\": \"Lyon\"}"}]}, "finishReason": "STOP"}]
        })))
        .mount(&server)
        .await;

    let messages = vec![Message::user("name a city")];

    let mut anthropic = AnthropicModelConfig::new("k", "claude-test");
    anthropic.api_base_url = Some(server.uri());
    let city = AnthropicModel::new(anthropic)
        .expect("client builds")
        .generate::<City>(&messages, None, None, None)
        .await
        .expect("anthropic generates");
    assert_eq!(city.result, City { name: "Paris".to_string() });
    assert_eq!(city.usage, TokenUsage::new(4, 2));

    let mut openai = OpenAiModelConfig::new("k", "gpt-test");
    openai.api_base_url = Some(server.uri());
    let numbers = OpenAiModel::new(openai)
        .expect("client builds")
        .generate::<Vec<i64>>(&messages, Some("list numbers"), Some(0.0), Some(64))
        .await
        .expect("openai generates");
    assert_eq!(numbers.result, vec![3, 1, 2]);

    let mut gemini = GeminiModelConfig::new("k", "gemini-test");
    gemini.api_base_url = Some(server.uri());
    let city = GeminiModel::new(gemini)
        .expect("client builds")
        .generate::<City>(&messages, None, None, None)
        .await
        .expect("gemini generates");
    assert_eq!(city.result, City { name: "Lyon".to_string() });
}
