use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::CommandSpec;
use crate::error::GustError;

/// Cap on a single side-channel read.
pub const MAX_CHANNEL_BYTES: usize = 1024 * 1024; // 1MB

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A shared, externally mutable slot (e.g. the clipboard). Read-only from here.
pub trait SideChannel: Send + Sync {
    fn read(&self) -> BoxFuture<'_, Result<String, GustError>>;
}

/// Decides whether changed side-channel content is a real result or noise.
pub trait ResultValidator: Send + Sync {
    fn accepts(&self, content: &str) -> bool;
}

/// Accepts content that looks like prose: more than `min_chars` characters and
/// containing a space or sentence-ending punctuation.
///
/// This is a best-effort filter. Unrelated prose copied by the user passes it,
/// and a very short genuine answer does not.
#[derive(Debug, Clone, Copy)]
pub struct ProseHeuristic {
    pub min_chars: usize,
}

impl ResultValidator for ProseHeuristic {
    fn accepts(&self, content: &str) -> bool {
        let trimmed = content.trim();
        trimmed.chars().count() > self.min_chars
            && trimmed
                .chars()
                .any(|c| c == ' ' || matches!(c, '.' | '!' | '?' | '。' | '！' | '？'))
    }
}

/// Reads the side channel by running a command that prints it (`pbpaste`,
/// `wl-paste`, `xclip -o`, ...).
pub struct CommandSideChannel {
    spec: CommandSpec,
}

impl CommandSideChannel {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    async fn read_once(&self) -> Result<String, GustError> {
        let mut child = Command::new(&self.spec.executable)
            .args(&self.spec.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GustError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to spawn {}: {e}", self.spec.executable),
                ))
            })?;

        let mut buf = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            stdout
                .take(MAX_CHANNEL_BYTES as u64)
                .read_to_end(&mut buf)
                .await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            // Most clipboard readers exit non-zero when the slot is empty.
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl SideChannel for CommandSideChannel {
    fn read(&self) -> BoxFuture<'_, Result<String, GustError>> {
        Box::pin(async move {
            tokio::time::timeout(READ_TIMEOUT, self.read_once())
                .await
                .map_err(|_| GustError::Timeout(READ_TIMEOUT.as_millis() as u64))?
        })
    }
}
