use thiserror::Error;

/// Failure of a single provider call, carrying enough structure for the
/// retry executor to classify it without inspecting error text.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success HTTP status.
    #[error("provider returned {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never produced an HTTP response (connect/read failure,
    /// client-side timeout, TLS error).
    #[error("transport error: {0}")]
    Transport(String),

    /// No rate-gate token became available within the acquire timeout.
    #[error("rate gate timed out after {waited_ms}ms for identity '{identity}'")]
    RateGate { identity: String, waited_ms: u64 },

    /// Credential loading or token exchange failed.
    #[error("auth error: {0}")]
    Auth(String),

    /// The provider answered 2xx but the body did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),
}

/// Outcome of classifying a failed attempt.
///
/// `Retryable` failures are worth another attempt with backoff; `Terminal`
/// ones must surface to the caller immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// HTTP statuses the provider is known to return transiently.
///
/// 403 is included because quota exhaustion surfaces as 403 on several GCP
/// APIs; permission-denied reads are handled separately at the call sites
/// that tolerate them.
const RETRYABLE_STATUSES: &[u16] = &[403, 409, 412, 429, 500, 502, 503, 504];

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            ProviderError::Http { status, .. } if RETRYABLE_STATUSES.contains(status) => {
                ErrorClass::Retryable
            }
            ProviderError::Http { .. } => ErrorClass::Terminal,
            ProviderError::Transport(_) => ErrorClass::Retryable,
            ProviderError::RateGate { .. } => ErrorClass::Retryable,
            ProviderError::Auth(_) => ErrorClass::Terminal,
            ProviderError::UnexpectedResponse(_) => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }

    /// True for the concurrent-modification statuses an IAM set can return
    /// when the policy etag went stale under us.
    pub fn is_iam_conflict(&self) -> bool {
        matches!(self.status(), Some(409) | Some(412))
    }

    pub fn is_permission_denied(&self) -> bool {
        self.status() == Some(403)
    }

    pub(crate) fn transport(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// Failure of an operator-initiated action (admin surface or CLI).
#[derive(Debug, Error)]
pub enum ActionError {
    /// The referenced identity / project / billing account is unknown.
    #[error("{0}")]
    NotFound(String),

    /// A safety gate refused the mutation; the message says which.
    #[error("{0}")]
    Refused(String),

    /// The provider call behind the action failed after retries.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}
