//! Failure taxonomy for calls to the generation service.
//!
//! `CallError` travels inside `anyhow::Error` like every other failure in the
//! crate; task boundaries recover it with `downcast_ref` to decide how loudly
//! to log.

use thiserror::Error;

const RAW_PREVIEW_CHARS: usize = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Network, HTTP or deadline failure. Eligible for retry on the next
    /// scheduling opportunity, never within the same task.
    #[error("transient generation failure: {0}")]
    Transient(String),

    /// No usable generation profile is configured.
    #[error("generation is not configured: {0}")]
    Config(String),

    /// The response could not be parsed into the expected shape.
    #[error("unparseable generation response: {message}")]
    Format { message: String, raw: String },

    /// The response parsed but is missing required fields.
    #[error("invalid generation response: {0}")]
    Validation(String),
}

impl CallError {
    pub fn format(message: impl Into<String>, raw: &str) -> Self {
        CallError::Format {
            message: message.into(),
            raw: raw.chars().take(RAW_PREVIEW_CHARS).collect(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }
}

pub fn call_error(err: &anyhow::Error) -> Option<&CallError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CallError>())
}

/// Log a background task failure according to its class. Background failures
/// never surface to the user, so this is the only place they end up.
pub fn log_background_failure(task: &str, err: &anyhow::Error) {
    match call_error(err) {
        Some(CallError::Transient(reason)) => {
            tracing::warn!("{} failed transiently, will retry on a later tick: {}", task, reason)
        }
        Some(CallError::Config(reason)) => {
            tracing::debug!("{} skipped, generation not configured: {}", task, reason)
        }
        Some(CallError::Format { message, raw }) => {
            tracing::warn!("{} got an unparseable response ({}): {}", task, message, raw)
        }
        Some(CallError::Validation(reason)) => {
            tracing::warn!("{} got an invalid response: {}", task, reason)
        }
        None => tracing::error!("{} failed: {:#}", task, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn call_error_survives_context_wrapping() {
        let err: anyhow::Result<()> = Err(CallError::Transient("503".to_string()).into());
        let wrapped = err.context("summarizing agent a1").unwrap_err();
        assert_eq!(
            call_error(&wrapped),
            Some(&CallError::Transient("503".to_string()))
        );
    }

    #[test]
    fn format_error_truncates_raw_response() {
        let raw = "x".repeat(2_000);
        let CallError::Format { raw, .. } = CallError::format("bad json", &raw) else {
            panic!("expected format error");
        };
        assert_eq!(raw.len(), RAW_PREVIEW_CHARS);
    }

    #[test]
    fn plain_errors_are_not_classified() {
        let err = anyhow::anyhow!("disk full");
        assert!(call_error(&err).is_none());
    }
}
