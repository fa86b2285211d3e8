//! Provider-agnostic structured output and tool calling for LLMs.
//!
//! Surface:
//! - `Schema` builder plus per-provider schema dialects (Anthropic, OpenAI, Gemini)
//! - `ChatModel` clients for the three wire protocols, with uniform error mapping
//! - `ToolSet` registry that turns handler failures into `ToolResult::Error`
//! - `Conversation` with fail-fast single-flight sends and rollback
//! - `Agent` loop that runs tools until the model returns a typed answer

pub mod agent;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod message;
pub mod schema;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentStep, query, run};
pub use conversation::{Conversation, ConversationConfig, ConversationEvent, ConversationEvents};
pub use error::{AgentError, ConversationError, ProviderError, SchemaError, ToolError};
pub use llm::{
    AnthropicModel, AnthropicModelConfig, ChatModel, ChatModelExt, ChatResponse, GeminiModel,
    GeminiModelConfig, GenerateRequest, OpenAiModel, OpenAiModelConfig, ToolCallRequest,
    ToolCallResponse, ToolChoice,
};
pub use message::{
    ContentBlock, Media, MediaKind, MediaSource, Message, Role, StopReason, TokenUsage, ToolCall,
    ToolResult,
};
pub use schema::{Constraints, EnumCase, ObjectBuilder, Property, Schema, SchemaKind, SchemaType};
pub use tools::{Tool, ToolDefinition, ToolSet};
