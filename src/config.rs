use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::dispatch::async_poll::PollSettings;
use crate::error::GustError;

/// Which tiers a request may use. Read once at the start of each request.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Only the on-device backend; its failure is returned verbatim.
    #[serde(alias = "local")]
    LocalOnly,
    /// Skip the on-device backend entirely.
    #[serde(alias = "cloud")]
    CloudPreferred,
    /// On-device first, then fall back.
    #[default]
    Auto,
}

impl BackendPreference {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "local_only" | "local-only" => Some(Self::LocalOnly),
            "cloud" | "cloud_preferred" | "cloud-preferred" => Some(Self::CloudPreferred),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::CloudPreferred => "cloud_preferred",
            Self::Auto => "auto",
        }
    }

    /// Whether tiers after the on-device one may be tried.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::LocalOnly)
    }
}

/// An executable plus argument template. Arguments are passed without a shell.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(executable: &str, args: &[&str]) -> Self {
        Self {
            executable: executable.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_checks: u32,
    pub deadline_ms: u64,
    /// Side-channel content must be longer than this to count as a result.
    pub min_result_chars: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_checks: 24,
            deadline_ms: 120_000,
            min_result_chars: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub tool_timeout_ms: u64,
    /// Directory for transient input/output files. Defaults to the OS temp dir.
    pub transient_dir: Option<PathBuf>,
    /// Direct-capture command; `{input}` and `{output}` are substituted.
    pub capture: Option<CommandSpec>,
    /// Fire-and-forget command; `{input}` and `{prompt}` are substituted.
    pub launch: Option<CommandSpec>,
    /// Command that prints the current side-channel content to stdout.
    pub side_channel: Option<CommandSpec>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self {
                enabled: true,
                tool_timeout_ms: 60_000,
                transient_dir: None,
                capture: Some(CommandSpec::new(
                    "shortcuts",
                    &["run", "Ask Assistant", "--input-path", "{input}", "--output-path", "{output}"],
                )),
                launch: Some(CommandSpec::new(
                    "shortcuts",
                    &["run", "Ask Assistant", "--input-path", "{input}"],
                )),
                side_channel: Some(CommandSpec::new("pbpaste", &[])),
            }
        } else {
            Self {
                enabled: false,
                tool_timeout_ms: 60_000,
                transient_dir: None,
                capture: None,
                launch: None,
                side_channel: Some(CommandSpec::new("xclip", &["-selection", "clipboard", "-o"])),
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub enabled: bool,
    /// OpenAI-compatible chat completions endpoint of the on-device server.
    pub base_url: String,
    pub model: String,
    /// URL probed once per process to decide availability.
    pub probe_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:11434/v1/chat/completions".to_string(),
            model: "llama3.2".to_string(),
            probe_url: Some("http://127.0.0.1:11434/v1/models".to_string()),
            timeout_ms: 60_000,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub pacing_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { pacing_ms: 30 }
    }
}

/// Phrases that mark out-of-band output as a tool failure rather than an answer.
pub fn default_failure_signatures() -> Vec<String> {
    [
        "error:",
        "command not found",
        "couldn't",
        "could not",
        "not authorized",
        "shortcut not found",
        "unable to run",
        "the operation couldn",
        "timed out",
        "rate limit",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub preference: BackendPreference,
    /// Prompts estimated above this many tokens skip the on-device tier.
    pub local_token_ceiling: usize,
    pub failure_signatures: Vec<String>,
    pub poll: PollConfig,
    pub bridge: BridgeConfig,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub stream: StreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preference: BackendPreference::Auto,
            local_token_ceiling: 4_096,
            failure_signatures: default_failure_signatures(),
            poll: PollConfig::default(),
            bridge: BridgeConfig::default(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Config {
    /// Load from `$GUST_CONFIG`, else `./gust.toml`, else defaults; then apply
    /// environment overrides. Never fails: a broken file is logged and ignored.
    pub fn load() -> Self {
        let path = env::var("GUST_CONFIG").ok().map(PathBuf::from).or_else(|| {
            let local = PathBuf::from("gust.toml");
            local.exists().then_some(local)
        });

        let mut config = match path {
            Some(ref p) => match Self::from_file(p) {
                Ok(config) => {
                    tracing::info!(path = %p.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %p.display(), "ignoring config file: {e}");
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env(|key| env::var(key).ok());
        config.normalize();
        config
    }

    pub fn from_file(path: &Path) -> Result<Self, GustError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, GustError> {
        toml::from_str(text).map_err(|e| GustError::Config(e.to_string()))
    }

    /// Apply `GUST_*` overrides using `lookup` as the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("GUST_BACKEND") {
            match BackendPreference::parse(&raw) {
                Some(pref) => self.preference = pref,
                None => tracing::warn!(value = %raw, "GUST_BACKEND not recognised, keeping {}", self.preference.as_str()),
            }
        }
        if let Some(key) = lookup("GUST_REMOTE_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.remote.api_key = Some(key);
        }
        if let Some(url) = lookup("GUST_REMOTE_URL") {
            self.remote.base_url = url;
        }
        if let Some(url) = lookup("GUST_LOCAL_URL") {
            self.local.base_url = url;
        }
    }

    /// Clamp values that would make the poll race or timeouts meaningless.
    pub fn normalize(&mut self) {
        if self.poll.interval_ms == 0 {
            tracing::warn!("poll.interval_ms = 0, using 100");
            self.poll.interval_ms = 100;
        }
        if self.poll.max_checks == 0 {
            tracing::warn!("poll.max_checks = 0, using 1");
            self.poll.max_checks = 1;
        }
        if self.poll.deadline_ms < self.poll.interval_ms {
            tracing::warn!(
                deadline_ms = self.poll.deadline_ms,
                interval_ms = self.poll.interval_ms,
                "poll.deadline_ms shorter than one interval, raising it"
            );
            self.poll.deadline_ms = self.poll.interval_ms;
        }
        if self.bridge.tool_timeout_ms == 0 {
            tracing::warn!("bridge.tool_timeout_ms = 0, using 60000");
            self.bridge.tool_timeout_ms = 60_000;
        }
        if self.remote.api_key.is_none() {
            tracing::warn!("GUST_REMOTE_API_KEY not set, remote backend unavailable");
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll.interval_ms),
            max_checks: self.poll.max_checks,
            deadline: Duration::from_millis(self.poll.deadline_ms),
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.tool_timeout_ms)
    }

    pub fn stream_pacing(&self) -> Duration {
        Duration::from_millis(self.stream.pacing_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_only_forbids_fallback() {
        assert!(!BackendPreference::LocalOnly.allows_fallback());
        assert!(BackendPreference::CloudPreferred.allows_fallback());
        assert!(BackendPreference::Auto.allows_fallback());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            preference = "cloud"
            [poll]
            interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.preference, BackendPreference::CloudPreferred);
        assert_eq!(config.poll.interval_ms, 250);
        assert_eq!(config.poll.max_checks, 24);
        assert_eq!(config.local_token_ceiling, 4_096);
    }

    #[test]
    fn env_overrides_preference_and_key() {
        let mut config = Config::default();
        config.apply_env(|k| match k {
            "GUST_BACKEND" => Some("local".to_string()),
            "GUST_REMOTE_API_KEY" => Some("sk-test".to_string()),
            _ => None,
        });
        assert_eq!(config.preference, BackendPreference::LocalOnly);
        assert_eq!(config.remote.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn unknown_preference_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|k| (k == "GUST_BACKEND").then(|| "bogus".to_string()));
        assert_eq!(config.preference, BackendPreference::Auto);
    }

    #[test]
    fn normalize_clamps_degenerate_poll_values() {
        let mut config = Config::default();
        config.poll.max_checks = 0;
        config.poll.interval_ms = 1_000;
        config.poll.deadline_ms = 10;
        config.normalize();
        assert_eq!(config.poll.max_checks, 1);
        assert_eq!(config.poll.deadline_ms, 1_000);
    }

    #[test]
    fn remote_key_is_redacted_in_debug() {
        let mut config = Config::default();
        config.remote.api_key = Some("sk-secret".into());
        let dbg = format!("{:?}", config.remote);
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("[REDACTED]"));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = Config::from_toml("preference = [").unwrap_err();
        assert!(matches!(err, GustError::Config(_)));
    }
}
