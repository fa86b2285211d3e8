use std::sync::Arc;

use async_stream::try_stream;
use futures_util::future::join_all;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AgentError, ToolError};
use crate::llm::{ChatModel, ToolCallRequest, ToolChoice, decode_structured_text};
use crate::message::{Message, ToolCall, ToolResult};
use crate::schema::{Schema, SchemaKind, SchemaType};
use crate::tools::{Tool, ToolDefinition, ToolSet};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_steps: u32,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: ToolChoice,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            tool_choice: ToolChoice::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep<T> {
    /// Partial assistant message: reasoning text, or prose that did not
    /// decode as the final answer.
    Thinking(Message),
    ToolCall(ToolCall),
    ToolResult {
        call_id: String,
        name: String,
        output: ToolResult,
    },
    FinalResponse(T),
}

#[derive(Default)]
pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    tools: Vec<Tool>,
    config: AgentConfig,
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn shared_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.config.max_steps = max_steps;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = Some(max_tokens);
        self
    }

    pub fn tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.config.tool_choice = tool_choice;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        if self.config.max_steps == 0 {
            return Err(AgentError::Config(
                "max_steps must be at least 1".to_string(),
            ));
        }

        if let ToolChoice::Tool(name) = &self.config.tool_choice
            && !self.tools.iter().any(|tool| tool.name() == name)
        {
            return Err(ToolError::NotFound(name.clone()).into());
        }

        let tools = ToolSet::new(self.tools)?;
        let definitions = tools.definitions();

        Ok(Agent {
            model,
            tools,
            definitions,
            config: self.config,
            history: Vec::new(),
        })
    }
}

/// Tool-using loop that ends in a structured answer.
///
/// Each step sends the full history, the tool set and the expected answer
/// schema to the model. Tool calls are executed and their results appended
/// before the next step; a reply that decodes as `T` ends the run. The loop
/// gives up with [`AgentError::MaxStepsExceeded`] after `max_steps` model
/// calls. History is kept across runs until [`Agent::clear_history`].
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: ToolSet,
    definitions: Vec<ToolDefinition>,
    config: AgentConfig,
    history: Vec<Message>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn query<T>(&mut self, prompt: impl Into<String>) -> Result<T, AgentError>
    where
        T: SchemaType + DeserializeOwned + Send + 'static,
    {
        let stream = self.run::<T>(prompt);
        futures_util::pin_mut!(stream);

        let mut final_response = None;
        while let Some(step) = stream.next().await {
            if let AgentStep::FinalResponse(value) = step? {
                final_response = Some(value);
            }
        }

        final_response.ok_or(AgentError::MissingFinalResponse)
    }

    pub fn run<T>(
        &mut self,
        prompt: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentStep<T>, AgentError>> + '_
    where
        T: SchemaType + DeserializeOwned + Send + 'static,
    {
        let prompt = prompt.into();

        try_stream! {
            self.history.push(Message::user(prompt));
            let schema = T::schema();
            let max_steps = self.config.max_steps;

            for step in 1..=max_steps {
                debug!(
                    step,
                    max_steps,
                    messages = self.history.len(),
                    provider = self.model.provider_name(),
                    "agent step"
                );

                let request = ToolCallRequest {
                    tool_choice: &self.config.tool_choice,
                    system_prompt: self.config.system_prompt.as_deref(),
                    temperature: self.config.temperature,
                    max_tokens: self.config.max_tokens,
                    response_schema: Some(&schema),
                    ..ToolCallRequest::new(&self.history, &self.definitions)
                };
                let response = self.model.plan_tool_calls(request).await?;

                if let Some(thinking) = response.thinking.clone() {
                    yield AgentStep::Thinking(Message::assistant(thinking));
                }

                let assistant_message = response.assistant_message();

                if !response.tool_calls.is_empty() {
                    for call in &response.tool_calls {
                        yield AgentStep::ToolCall(call.clone());
                    }

                    let tools = &self.tools;
                    let outputs = join_all(
                        response
                            .tool_calls
                            .iter()
                            .map(|call| execute_tool_call(tools, call)),
                    )
                    .await;

                    // The tool_use turn and its results land together, so a
                    // stream dropped mid-turn never leaves an unanswered call.
                    self.history.push(assistant_message);
                    self.history.extend(
                        response
                            .tool_calls
                            .iter()
                            .zip(&outputs)
                            .map(|(call, output)| Message::tool_result(call, output.clone())),
                    );

                    for (call, output) in response.tool_calls.iter().zip(outputs) {
                        yield AgentStep::ToolResult {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            output,
                        };
                    }
                    continue;
                }

                if !assistant_message.contents.is_empty() {
                    self.history.push(assistant_message);
                }

                let text = response.text.unwrap_or_default();
                if let Some(value) = decode_final::<T>(&schema, &text) {
                    yield AgentStep::FinalResponse(value);
                    return;
                }

                debug!(step, "final answer did not decode, asking for JSON");
                if !text.trim().is_empty() {
                    yield AgentStep::Thinking(Message::assistant(text));
                }
                self.history.push(Message::user(correction_prompt(&schema)));
            }

            warn!(max_steps, "agent exceeded max steps");
            Err::<(), AgentError>(AgentError::MaxStepsExceeded { max_steps })?;
        }
    }
}

/// Unknown tools are reported back to the model rather than failing the run.
async fn execute_tool_call(tools: &ToolSet, call: &ToolCall) -> ToolResult {
    match tools.execute(&call.name, &call.arguments).await {
        Ok(output) => output,
        Err(err) => {
            warn!(tool = %call.name, call_id = %call.id, "model requested unknown tool");
            ToolResult::Error(match err {
                ToolError::NotFound(name) => format!("Unknown tool '{name}'."),
                other => other.to_string(),
            })
        }
    }
}

/// String answers are accepted as bare prose; everything else must be JSON.
fn decode_final<T: DeserializeOwned>(schema: &Schema, text: &str) -> Option<T> {
    if let Some(value) = decode_structured_text::<T>(text) {
        return Some(value);
    }
    if schema.kind() == SchemaKind::String && !text.trim().is_empty() {
        return serde_json::from_value::<T>(Value::String(text.trim().to_string())).ok();
    }
    None
}

fn correction_prompt(schema: &Schema) -> String {
    format!(
        "Your last reply was not a valid final answer. Either call a tool or reply with only a JSON value (no prose, no code fences) that conforms to this JSON Schema:\n{}",
        schema.to_json()
    )
}

pub async fn query<T>(agent: &mut Agent, prompt: impl Into<String>) -> Result<T, AgentError>
where
    T: SchemaType + DeserializeOwned + Send + 'static,
{
    agent.query(prompt).await
}

pub fn run<T>(
    agent: &mut Agent,
    prompt: impl Into<String>,
) -> impl Stream<Item = Result<AgentStep<T>, AgentError>> + '_
where
    T: SchemaType + DeserializeOwned + Send + 'static,
{
    agent.run(prompt)
}
