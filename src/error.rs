//! Top-level error taxonomy for benchmark execution
//!
//! Only a small set of failures propagate out of the engine: invalid specs,
//! engine construction failing for every model, and fatal pre-benchmark hook
//! failures. Everything else is confined to a single result record and shows
//! up in the report instead.

use thiserror::Error;

use crate::engine::EngineError;

/// Errors that abort a benchmark (or a whole model pass) rather than a
/// single run.
#[derive(Error, Debug)]
pub enum WazaError {
    /// Invalid or missing input. The benchmark never starts.
    #[error("spec error: {0}")]
    Spec(String),

    /// The engine factory failed for a model. Other models may still proceed;
    /// the benchmark aborts only if construction fails for all of them.
    #[error("engine construction failed for model '{model}': {source}")]
    EngineConstruct {
        model: String,
        #[source]
        source: EngineError,
    },

    /// A `before_benchmark` hook with `error_on_fail` did not succeed.
    #[error("hook failure at {scope}: {message}")]
    Hook { scope: String, message: String },

    /// Filesystem failure outside any single run (results directory,
    /// fixture root discovery).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Report serialization failure. Reports are designed to always
    /// serialize, so this indicates a bug rather than bad input.
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl WazaError {
    /// Process exit code for the CLI wrapper. Every propagated error is an
    /// infrastructure failure.
    pub fn exit_code(&self) -> i32 {
        2
    }
}
