use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Most-recent conversation turns kept on a request. Older turns are dropped.
pub const MAX_HISTORY_TURNS: usize = 10;

/// Average characters per token used for the size estimate.
const CHARS_PER_TOKEN: usize = 4;

/// What the caller wants done with the query and context.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Summarize the supplied context (e.g. page text).
    Summarize,
    /// Answer the query, grounded in the context when present.
    #[default]
    #[serde(alias = "answer")]
    AnswerQuestion,
    /// Forward the query unchanged.
    #[serde(alias = "raw")]
    RawPrompt,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// One orchestrated request. Fields are private so a built request cannot change
/// while tiers are being attempted.
#[derive(Debug, Clone)]
pub struct Request {
    query: String,
    context: Option<String>,
    history: Vec<Turn>,
    capability: Capability,
}

impl Request {
    pub fn new(query: impl Into<String>, capability: Capability) -> Self {
        Self {
            query: query.into(),
            context: None,
            history: Vec::new(),
            capability,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = (!context.trim().is_empty()).then_some(context);
        self
    }

    /// Attach conversation history, keeping only the newest `MAX_HISTORY_TURNS`.
    pub fn with_history(mut self, mut history: Vec<Turn>) -> Self {
        if history.len() > MAX_HISTORY_TURNS {
            history.drain(..history.len() - MAX_HISTORY_TURNS);
        }
        self.history = history;
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Render the single text prompt every backend receives.
    pub fn prompt(&self) -> String {
        let mut out = String::new();

        if !self.history.is_empty() {
            out.push_str("Conversation so far:\n");
            for turn in &self.history {
                let who = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                out.push_str(&format!("{who}: {}\n", turn.text));
            }
            out.push('\n');
        }

        match (self.capability, self.context.as_deref()) {
            (Capability::Summarize, Some(ctx)) => {
                out.push_str("Summarize the following content.\n\n");
                out.push_str(ctx);
                if !self.query.trim().is_empty() {
                    out.push_str("\n\nFocus: ");
                    out.push_str(&self.query);
                }
            }
            (Capability::Summarize, None) => {
                out.push_str("Summarize the following content.\n\n");
                out.push_str(&self.query);
            }
            (Capability::AnswerQuestion, Some(ctx)) => {
                out.push_str("Use the context below to answer the question.\n\nContext:\n");
                out.push_str(ctx);
                out.push_str("\n\nQuestion: ");
                out.push_str(&self.query);
            }
            (Capability::AnswerQuestion, None) => {
                out.push_str("Question: ");
                out.push_str(&self.query);
            }
            (Capability::RawPrompt, ctx) => {
                out.push_str(&self.query);
                if let Some(ctx) = ctx {
                    out.push_str("\n\n");
                    out.push_str(ctx);
                }
            }
        }

        out
    }

    /// Rough token count of the rendered prompt (characters / 4, rounded up).
    pub fn estimated_tokens(&self) -> usize {
        self.prompt().chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, text: &str) -> Turn {
        Turn {
            role,
            text: text.to_string(),
        }
    }

    #[test]
    fn history_is_bounded_to_newest_turns() {
        let history: Vec<Turn> = (0..15).map(|i| turn(Role::User, &format!("t{i}"))).collect();
        let req = Request::new("q", Capability::AnswerQuestion).with_history(history);
        assert_eq!(req.history().len(), MAX_HISTORY_TURNS);
        assert_eq!(req.history()[0].text, "t5");
        assert_eq!(req.history()[9].text, "t14");
    }

    #[test]
    fn raw_prompt_is_forwarded_verbatim() {
        let req = Request::new("What is the capital of France?", Capability::RawPrompt);
        assert_eq!(req.prompt(), "What is the capital of France?");
    }

    #[test]
    fn answer_prompt_contains_context_and_question() {
        let req = Request::new("Who wrote it?", Capability::AnswerQuestion)
            .with_context("An article about Hamlet.");
        let prompt = req.prompt();
        assert!(prompt.contains("Context:\nAn article about Hamlet."));
        assert!(prompt.ends_with("Question: Who wrote it?"));
    }

    #[test]
    fn blank_context_is_ignored() {
        let req = Request::new("q", Capability::Summarize).with_context("   ");
        assert!(req.context().is_none());
    }

    #[test]
    fn history_is_rendered_before_the_task() {
        let req = Request::new("and Spain?", Capability::AnswerQuestion).with_history(vec![
            turn(Role::User, "capital of France?"),
            turn(Role::Assistant, "Paris."),
        ]);
        let prompt = req.prompt();
        assert!(prompt.starts_with("Conversation so far:\nUser: capital of France?\nAssistant: Paris.\n"));
    }

    #[test]
    fn token_estimate_rounds_up() {
        let req = Request::new("abcde", Capability::RawPrompt);
        assert_eq!(req.estimated_tokens(), 2);
    }
}
