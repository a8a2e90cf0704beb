use thiserror::Error;

use crate::dispatch::TierKind;

#[derive(Debug, Error)]
pub enum GustError {
    #[error("another request is already in flight")]
    Busy,

    #[error("backend unavailable: {backend}")]
    BackendUnavailable { backend: TierKind },

    #[error("failed to launch external tool: {0}")]
    ToolLaunchFailed(String),

    #[error("tool exited with code {code}: {stderr}")]
    ToolExitError { code: i32, stderr: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("side-channel content did not look like a response")]
    InvalidResult,

    #[error("inference error from {backend}: {message}")]
    Inference { backend: TierKind, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GustError {
    /// Extract the backend tier from variants that carry one.
    pub fn backend(&self) -> Option<TierKind> {
        match self {
            Self::BackendUnavailable { backend } => Some(*backend),
            Self::Inference { backend, .. } => Some(*backend),
            Self::ToolLaunchFailed(_) | Self::ToolExitError { .. } | Self::InvalidResult => {
                Some(TierKind::OutOfBand)
            }
            _ => None,
        }
    }

    /// Returns true when a later tier may still produce an answer.
    /// Gate rejections and caller cancellation end the request outright.
    pub fn is_fallthrough(&self) -> bool {
        !matches!(self, Self::Busy | Self::Cancelled)
    }

    /// Plain-text message safe to show to a user.
    /// Does not leak URLs, connection details, or upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Busy => "a response is already being generated, try again when it finishes"
                .to_string(),
            Self::BackendUnavailable { backend } => {
                format!("the {} backend is not available", backend.label())
            }
            Self::ToolLaunchFailed(_) => "the external assistant tool could not be started".to_string(),
            Self::ToolExitError { code, stderr } => {
                if stderr.trim().is_empty() {
                    format!("the external assistant tool failed (exit code {code})")
                } else {
                    // Tools print banners first, the actual error is at the end.
                    let preview: String = stderr
                        .trim_end()
                        .chars()
                        .rev()
                        .take(200)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    let prefix = if preview.len() < stderr.trim_end().len() {
                        "..."
                    } else {
                        ""
                    };
                    format!("the external assistant tool failed (exit code {code}): {prefix}{preview}")
                }
            }
            Self::Timeout(ms) => format!("no response arrived after {ms}ms"),
            Self::InvalidResult => "the response could not be recognised".to_string(),
            Self::Inference { backend, message } => {
                format!("the {} backend failed: {message}", backend.label())
            }
            Self::Cancelled => "the request was cancelled".to_string(),
            Self::Request(_) => "request to the remote backend failed".to_string(),
            Self::SchemaParse(_) => "failed to parse backend response".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Io(_) => "a local file operation failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_exit_message_keeps_the_tail() {
        let stderr = format!("{}\nfatal: shortcut not found", "banner ".repeat(100));
        let msg = GustError::ToolExitError { code: 1, stderr }.user_message();
        assert!(msg.ends_with("fatal: shortcut not found"));
        assert!(msg.contains("..."));
    }

    #[test]
    fn busy_and_cancel_do_not_fall_through() {
        assert!(!GustError::Busy.is_fallthrough());
        assert!(!GustError::Cancelled.is_fallthrough());
        assert!(GustError::Timeout(10).is_fallthrough());
        assert!(GustError::InvalidResult.is_fallthrough());
    }

    #[test]
    fn request_errors_are_sanitized() {
        let msg = GustError::SchemaParse("raw body {\"secret\":1}".into()).user_message();
        assert!(!msg.contains("secret"));
    }
}
