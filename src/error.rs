// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Every fallible subsystem maps its failures into one of these kinds so that
// callers can apply a uniform policy:
//
//   - Network / RateLimited / transient Rejected  -> retried inside the port,
//     then surfaced; the signal stage skips the symbol, the manage stage
//     defers the action.
//   - Auth / Configuration / DatabaseCorrupt      -> fatal; the engine refuses
//     to start or to keep trading.
//   - InsufficientFunds / RiskBlocked             -> normal operational
//     outcomes, logged at info, never alerted as errors.
//   - DataStale / DataMissing                     -> suppress the signal for
//     the cycle.
//   - MlModel                                     -> degrade to the heuristic
//     fallback, never block trading.
//   - Notifier                                    -> never affects trading
//     state.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("exchange rejected request (code {code}): {message}")]
    ExchangeRejected { code: String, message: String },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("blocked by risk gate: {0}")]
    RiskBlocked(String),

    #[error("stale market data: {0}")]
    DataStale(String),

    #[error("missing market data: {0}")]
    DataMissing(String),

    #[error("transient database error: {0}")]
    DatabaseTransient(String),

    #[error("database corrupt: {0}")]
    DatabaseCorrupt(String),

    #[error("ml model error: {0}")]
    MlModel(String),

    #[error("notifier error: {0}")]
    Notifier(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// `true` for error kinds that must stop the engine rather than be
    /// retried or skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Auth(_) | Self::DatabaseCorrupt(_)
        )
    }

    /// `true` for error kinds the originating port may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::DatabaseTransient(_)
        )
    }

    /// `true` for kinds that are expected operational outcomes rather than
    /// faults (no alert, info-level log only).
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::InsufficientFunds(_) | Self::RiskBlocked(_))
    }

    /// Short stable label used for system-event records and /status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Auth(_) => "auth",
            Self::Network(_) => "network",
            Self::RateLimited { .. } => "rate_limit",
            Self::ExchangeRejected { .. } => "exchange_rejected",
            Self::InsufficientFunds(_) => "insufficient_funds",
            Self::RiskBlocked(_) => "risk_blocked",
            Self::DataStale(_) => "data_stale",
            Self::DataMissing(_) => "data_missing",
            Self::DatabaseTransient(_) => "database_transient",
            Self::DatabaseCorrupt(_) => "database_corrupt",
            Self::MlModel(_) => "ml_model",
            Self::Notifier(_) => "notifier",
            Self::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, ref msg)
                if err.code == rusqlite::ErrorCode::DatabaseCorrupt
                    || err.code == rusqlite::ErrorCode::NotADatabase =>
            {
                Self::DatabaseCorrupt(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            other => Self::DatabaseTransient(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}
