use schemars::JsonSchema;
use serde::Deserialize;

use crate::config::BackendPreference;
use crate::request::{Capability, Request, Turn};

/// Largest query + context accepted over MCP.
pub const MAX_INPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AskRequest {
    /// The question, instruction, or raw prompt.
    pub query: String,
    /// Optional supporting text (e.g. extracted page content).
    pub context: Option<String>,
    /// Prior conversation turns, oldest first. Only the most recent 10 are used.
    pub history: Option<Vec<Turn>>,
    /// "summarize", "answer_question" (default), or "raw_prompt".
    pub capability: Option<Capability>,
    /// Override the configured backend preference for this call:
    /// "local_only", "cloud_preferred", or "auto".
    pub preference: Option<BackendPreference>,
}

impl AskRequest {
    /// Validate and build the immutable request plus any preference override.
    pub fn into_request(self) -> Result<(Request, Option<BackendPreference>), String> {
        let context_len = self.context.as_ref().map_or(0, |c| c.len());
        if self.query.trim().is_empty() && context_len == 0 {
            return Err("query must not be empty".to_string());
        }
        if self.query.len() + context_len > MAX_INPUT_BYTES {
            return Err(format!(
                "query and context exceed {MAX_INPUT_BYTES} bytes"
            ));
        }

        let capability = self.capability.unwrap_or_default();
        let mut request = Request::new(self.query, capability);
        if let Some(context) = self.context {
            request = request.with_context(context);
        }
        if let Some(history) = self.history {
            request = request.with_history(history);
        }
        Ok((request, self.preference))
    }
}
