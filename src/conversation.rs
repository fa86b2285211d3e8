//! Stateful multi-turn chat over a single [`ChatModel`].
//!
//! A [`Conversation`] is either idle or sending. A second `send` while one is
//! in flight fails fast with [`ConversationError::AlreadySending`]; nothing is
//! queued. A failed or cancelled send leaves the history exactly as it was
//! before the call.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ConversationError, ProviderError};
use crate::llm::{ChatModel, ChatResponse, GenerateRequest, ToolCallRequest, decode_response};
use crate::message::{Message, TokenUsage};
use crate::schema::SchemaType;

#[derive(Debug, Clone, Default)]
pub struct ConversationConfig {
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    UserMessage(Message),
    AssistantMessage(Message),
    /// Cumulative usage after the latest successful send.
    UsageUpdated(TokenUsage),
    Error(String),
    Cleared,
}

#[derive(Debug, Default)]
struct State {
    history: Vec<Message>,
    usage: TokenUsage,
    /// Bumped by `clear()` so an in-flight send does not touch the new history.
    generation: u64,
}

pub struct Conversation {
    model: Arc<dyn ChatModel>,
    config: ConversationConfig,
    state: Mutex<State>,
    sending: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<ConversationEvent>>>,
}

impl Conversation {
    pub fn new<M>(model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        Self::from_shared(Arc::new(model), ConversationConfig::default())
    }

    pub fn with_config<M>(model: M, config: ConversationConfig) -> Self
    where
        M: ChatModel + 'static,
    {
        Self::from_shared(Arc::new(model), config)
    }

    pub fn from_shared(model: Arc<dyn ChatModel>, config: ConversationConfig) -> Self {
        Self {
            model,
            config,
            state: Mutex::new(State::default()),
            sending: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    pub fn history(&self) -> Vec<Message> {
        self.state().history.clone()
    }

    pub fn usage(&self) -> TokenUsage {
        self.state().usage
    }

    pub fn turn_count(&self) -> usize {
        self.state().history.len() / 2
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Resets history and usage. Legal while a send is in flight; that send's
    /// result is then returned to its caller but not recorded.
    pub fn clear(&self) {
        {
            let mut state = self.state();
            state.history.clear();
            state.usage = TokenUsage::default();
            state.generation += 1;
        }
        self.emit(ConversationEvent::Cleared);
    }

    /// Opens the event stream. Only the most recent subscriber receives
    /// events; subscribing again ends any earlier stream.
    pub fn subscribe(&self) -> ConversationEvents {
        let (sender, receiver) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(sender);
        ConversationEvents { receiver }
    }

    /// Sends a plain-text turn and returns the assistant's text.
    pub async fn send(
        &self,
        prompt: impl Into<String>,
    ) -> Result<ChatResponse<String>, ConversationError> {
        self.exchange(prompt.into(), |messages| async move {
            let request = ToolCallRequest {
                system_prompt: self.config.system_prompt.as_deref(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
                ..ToolCallRequest::new(&messages, &[])
            };
            let response = self.model.plan_tool_calls(request).await?;

            Ok::<_, ProviderError>(ChatResponse {
                assistant_message: response.assistant_message(),
                result: response.text.unwrap_or_default(),
                usage: response.usage,
            })
        })
        .await
    }

    /// Sends a turn whose reply must decode as `T`.
    pub async fn send_structured<T>(
        &self,
        prompt: impl Into<String>,
    ) -> Result<ChatResponse<T>, ConversationError>
    where
        T: SchemaType + DeserializeOwned + Send,
    {
        self.exchange(prompt.into(), |messages| async move {
            let schema = T::schema();
            let request = GenerateRequest {
                system_prompt: self.config.system_prompt.as_deref(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
                ..GenerateRequest::new(&messages, &schema)
            };
            let response = self.model.generate_value(request).await?;
            decode_response(response)
        })
        .await
    }

    async fn exchange<T, F, Fut>(
        &self,
        prompt: String,
        call: F,
    ) -> Result<ChatResponse<T>, ConversationError>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Result<ChatResponse<T>, ProviderError>>,
    {
        let _busy = BusyGuard::acquire(&self.sending)?;

        let user_message = Message::user(prompt);
        let (messages, mut rollback) = {
            let mut state = self.state();
            let checkpoint = state.history.len();
            state.history.push(user_message.clone());
            let rollback = Rollback {
                state: &self.state,
                checkpoint,
                generation: state.generation,
                armed: true,
            };
            (state.history.clone(), rollback)
        };
        self.emit(ConversationEvent::UserMessage(user_message));

        match call(messages).await {
            Ok(response) => {
                rollback.disarm();
                let recorded_usage = {
                    let mut state = self.state();
                    if state.generation == rollback.generation {
                        state.history.push(response.assistant_message.clone());
                        state.usage += response.usage;
                        Some(state.usage)
                    } else {
                        None
                    }
                };
                if let Some(usage) = recorded_usage {
                    self.emit(ConversationEvent::AssistantMessage(
                        response.assistant_message.clone(),
                    ));
                    self.emit(ConversationEvent::UsageUpdated(usage));
                } else {
                    debug!("conversation cleared during send, reply not recorded");
                }
                Ok(response)
            }
            Err(err) => {
                drop(rollback);
                self.emit(ConversationEvent::Error(err.to_string()));
                Err(err.into())
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn emit(&self, event: ConversationEvent) {
        let mut events = lock(&self.events);
        if let Some(sender) = events.as_ref()
            && sender.send(event).is_err()
        {
            *events = None;
        }
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("provider", &self.model.provider_name())
            .field("config", &self.config)
            .field("sending", &self.is_sending())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ConversationError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConversationError::AlreadySending)?;
        Ok(Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Truncates history back to `checkpoint` unless disarmed. Runs on error and
/// when the send future is dropped mid-flight.
struct Rollback<'a> {
    state: &'a Mutex<State>,
    checkpoint: usize,
    generation: u64,
    armed: bool,
}

impl Rollback<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock(self.state);
        if state.generation == self.generation {
            state.history.truncate(self.checkpoint);
            debug!(history = state.history.len(), "rolled back conversation history");
        }
    }
}

/// Event stream returned by [`Conversation::subscribe`].
#[derive(Debug)]
pub struct ConversationEvents {
    receiver: mpsc::UnboundedReceiver<ConversationEvent>,
}

impl Stream for ConversationEvents {
    type Item = ConversationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
