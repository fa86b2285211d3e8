use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("enum schema must declare at least one case")]
    EmptyEnum,
    #[error("property name must not be empty")]
    EmptyPropertyName,
    #[error("duplicate property: {0}")]
    DuplicateProperty(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid tool name '{0}': must match ^[a-zA-Z0-9_-]{{1,64}}$")]
    InvalidName(String),
    #[error("duplicate tool registered: {0}")]
    Duplicate(String),
}

/// Failures at the provider boundary. Every HTTP or decode failure is
/// translated into one of these once, inside the client that saw it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rejected credentials")]
    Unauthorized,
    #[error("provider rate limit exceeded")]
    RateLimitExceeded,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("provider server error {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("unexpected provider status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },
    #[error("failed to decode provider response: {0}")]
    DecodingFailed(String),
    #[error("{media_kind} content is not supported by {provider} in this request")]
    MediaNotSupported {
        media_kind: String,
        provider: &'static str,
    },
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("missing API key: set {0}")]
    MissingApiKey(&'static str),
}

impl ProviderError {
    /// Maps a non-success HTTP status and the provider's message onto the
    /// canonical taxonomy.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            429 => Self::RateLimitExceeded,
            400 => Self::InvalidRequest(message),
            404 => Self::ModelNotFound(message),
            500..=599 => Self::ServerError { status, message },
            _ => Self::UnexpectedStatus { status, message },
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("conversation is already sending a message")]
    AlreadySending,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("agent exceeded max steps ({max_steps})")]
    MaxStepsExceeded { max_steps: u32 },
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
    #[error("agent configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_maps_canonical_kinds() {
        assert_eq!(
            ProviderError::from_status(401, "x".into()),
            ProviderError::Unauthorized
        );
        assert_eq!(
            ProviderError::from_status(403, "x".into()),
            ProviderError::Unauthorized
        );
        assert_eq!(
            ProviderError::from_status(429, "slow down".into()),
            ProviderError::RateLimitExceeded
        );
        assert_eq!(
            ProviderError::from_status(400, "bad schema".into()),
            ProviderError::InvalidRequest("bad schema".into())
        );
        assert_eq!(
            ProviderError::from_status(404, "no such model".into()),
            ProviderError::ModelNotFound("no such model".into())
        );
        assert_eq!(
            ProviderError::from_status(503, "overloaded".into()),
            ProviderError::ServerError {
                status: 503,
                message: "overloaded".into()
            }
        );
        assert!(matches!(
            ProviderError::from_status(409, "conflict".into()),
            ProviderError::UnexpectedStatus { status: 409, .. }
        ));
    }
}
