// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Containment policy: each coordinator catches and degrades on its own errors.
// Only startup surfaces errors to main, where they map to exit codes
// (1 = config, 2 = unrecoverable exchange).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid configuration. `path` is the exact YAML path the
    /// validator expected (e.g. `margin.by_regime.ranging.safety_threshold`).
    #[error("config error at `{path}`: {message}")]
    Config { path: String, message: String },

    /// Network failures, rate limits, 5xx — retried with bounded attempts,
    /// then escalated to counters.
    #[error("exchange transient error: {0}")]
    ExchangeTransient(String),

    /// The exchange accepted the request and said no (insufficient margin,
    /// order would liquidate, ...). Carries the venue error code.
    #[error("exchange rejected request (code {code}): {message}")]
    ExchangeSemantic { code: String, message: String },

    /// Empty strings, NaN, unexpected JSON shapes. Sanitized to "missing".
    #[error("parse error: {0}")]
    Parse(String),

    /// Internal invariant violated (negative size, rewound stop). The
    /// offending state is rejected, never propagated to the user.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Process exit code for startup failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 1,
            _ => 2,
        }
    }
}
