use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::message::ToolResult;
use crate::schema::{Schema, SchemaType};

static TOOL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("tool name pattern is valid"));

type ToolHandler = dyn Fn(String) -> BoxFuture<'static, ToolResult> + Send + Sync;

#[derive(Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    name: String,
    description: String,
    input_schema: Schema,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Schema,
    ) -> Result<Self, ToolError> {
        let name = name.into();
        if !TOOL_NAME.is_match(&name) {
            return Err(ToolError::InvalidName(name));
        }

        Ok(Self {
            name,
            description: description.into(),
            input_schema,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }
}

/// A tool definition plus its executable handler.
#[derive(Clone)]
pub struct Tool {
    definition: ToolDefinition,
    handler: Arc<ToolHandler>,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("definition", &self.definition)
            .finish()
    }
}

impl Tool {
    /// Typed tool: arguments are decoded into `A`, whose schema is advertised
    /// to the model.
    pub fn new<A, F, Fut, E>(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Result<Self, ToolError>
    where
        A: SchemaType + DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, E>> + Send + 'static,
        E: fmt::Display,
    {
        let definition = ToolDefinition::new(name, description, A::schema())?;
        Ok(Self::from_parts(definition, handler))
    }

    /// Untyped tool: the handler receives the arguments as a JSON value.
    pub fn with_schema<F, Fut, E>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Schema,
        handler: F,
    ) -> Result<Self, ToolError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, E>> + Send + 'static,
        E: fmt::Display,
    {
        let definition = ToolDefinition::new(name, description, schema)?;
        Ok(Self::from_parts(definition, handler))
    }

    fn from_parts<P, F, Fut, E>(definition: ToolDefinition, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult, E>> + Send + 'static,
        E: fmt::Display,
    {
        let tool_name = definition.name.clone();
        let handler = Arc::new(handler);

        let erased = move |arguments: String| -> BoxFuture<'static, ToolResult> {
            let raw = if arguments.trim().is_empty() {
                "{}"
            } else {
                arguments.as_str()
            };
            let parsed = serde_json::from_str::<P>(raw);
            let handler = handler.clone();
            let tool_name = tool_name.clone();

            Box::pin(async move {
                let args = match parsed {
                    Ok(args) => args,
                    Err(err) => {
                        return ToolResult::Error(format!(
                            "invalid arguments for tool '{tool_name}': {err}"
                        ));
                    }
                };

                match AssertUnwindSafe(async move { handler(args).await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(err)) => ToolResult::Error(err.to_string()),
                    Err(_) => ToolResult::Error(format!("tool '{tool_name}' panicked")),
                }
            })
        };

        Self {
            definition,
            handler: Arc::new(erased),
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Runs the handler. Argument decode failures, handler errors and panics
    /// all come back as [`ToolResult::Error`].
    pub async fn call(&self, arguments: &str) -> ToolResult {
        (self.handler)(arguments.to_string()).await
    }
}

/// Name-indexed tool registry.
#[derive(Clone, Debug, Default)]
pub struct ToolSet {
    tools: Vec<Tool>,
    index: HashMap<String, usize>,
}

impl ToolSet {
    pub fn new(tools: Vec<Tool>) -> Result<Self, ToolError> {
        let mut index = HashMap::new();
        for (position, tool) in tools.iter().enumerate() {
            if index.insert(tool.name().to_string(), position).is_some() {
                return Err(ToolError::Duplicate(tool.name().to_string()));
            }
        }

        Ok(Self { tools, index })
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.index.get(name).map(|position| &self.tools[*position])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| tool.definition().clone())
            .collect()
    }

    pub async fn execute(&self, name: &str, arguments: &str) -> Result<ToolResult, ToolError> {
        let Some(tool) = self.get(name) else {
            return Err(ToolError::NotFound(name.to_string()));
        };

        debug!(tool = name, "executing tool");
        let result = tool.call(arguments).await;
        if let ToolResult::Error(message) = &result {
            warn!(tool = name, %message, "tool returned an error result");
        }
        Ok(result)
    }
}
