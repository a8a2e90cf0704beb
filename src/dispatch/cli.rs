use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{BridgeConfig, CommandSpec};
use crate::dispatch::async_poll::{self, PollResolution, PollSettings};
use crate::dispatch::side_channel::{ResultValidator, SideChannel};
use crate::dispatch::{ResponseOutcome, Tier, TierKind};
use crate::error::GustError;
use crate::request::Request;

pub const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Atomic counter for unique transient filenames within one process.
static TRANSIENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Input/output file pair for one direct-capture invocation.
/// Both files are removed on drop, whatever happened in between.
pub struct TransientFiles {
    input: PathBuf,
    output: PathBuf,
}

impl TransientFiles {
    /// Create a uniquely named pair in `dir` and write `payload` to the input.
    pub async fn create(dir: &Path, payload: &str) -> Result<Self, GustError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = TRANSIENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let stem = format!("gust-{}-{ts}-{seq}", std::process::id());

        // Constructed first so a failed write still cleans up.
        let files = Self {
            input: dir.join(format!("{stem}.in.txt")),
            output: dir.join(format!("{stem}.out.txt")),
        };
        tokio::fs::write(&files.input, payload.as_bytes()).await?;
        Ok(files)
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Read and delete the output file. None if missing or blank.
    pub async fn take_output(&self) -> Result<Option<String>, GustError> {
        let bytes = match tokio::fs::read(&self.output).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let _ = tokio::fs::remove_file(&self.output).await;

        let capped = &bytes[..bytes.len().min(MAX_OUTPUT_BYTES)];
        let text = String::from_utf8_lossy(capped).trim().to_string();
        Ok((!text.is_empty()).then_some(text))
    }
}

impl Drop for TransientFiles {
    fn drop(&mut self) {
        for path in [&self.input, &self.output] {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), "failed to remove transient file: {e}");
            }
        }
    }
}

/// What `launch` hands back: either the answer, or a handle to wait on.
pub enum LaunchResult {
    Immediate(String),
    Polling(PollHandle),
}

/// An issued out-of-band request whose result is expected on the side channel.
pub struct PollHandle {
    baseline: String,
    channel: Arc<dyn SideChannel>,
    validator: Arc<dyn ResultValidator>,
    settings: PollSettings,
    launcher: Option<Child>,
    files: Option<TransientFiles>,
}

impl PollHandle {
    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    /// Wait for the side channel to produce a result. Timers, then the launcher
    /// process, then transient files are released before this returns.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<String, GustError> {
        let baseline = std::mem::take(&mut self.baseline);
        let report = async_poll::watch(
            self.channel.clone(),
            self.validator.clone(),
            baseline,
            self.settings,
            cancel,
        )
        .await;

        if let Some(mut child) = self.launcher.take() {
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    tracing::warn!(code = status.code().unwrap_or(-1), "launcher exited with failure");
                }
                Ok(Some(_)) => {}
                _ => {
                    kill_process_group(child.id());
                    let _ = child.kill().await;
                }
            }
        }
        drop(self.files.take());

        let report = report?;
        match report.resolution {
            PollResolution::Found(text) => {
                tracing::info!(
                    checks = report.checks,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "side-channel result accepted"
                );
                Ok(text)
            }
            PollResolution::Timeout if report.rejected > 0 => Err(GustError::InvalidResult),
            PollResolution::Timeout => Err(GustError::Timeout(report.elapsed.as_millis() as u64)),
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        // Reached with a launcher only when the wait was abandoned mid-flight.
        if let Some(child) = self.launcher.take() {
            kill_process_group(child.id());
        }
    }
}

/// Invokes an external automation tool and recovers its result, either from
/// an output file or by watching the side channel.
pub struct OutOfBandBridge {
    config: BridgeConfig,
    capture_available: bool,
    tool_timeout: Duration,
    poll: PollSettings,
    channel: Option<Arc<dyn SideChannel>>,
    validator: Arc<dyn ResultValidator>,
    transient_dir: PathBuf,
}

impl OutOfBandBridge {
    pub fn new(
        config: BridgeConfig,
        tool_timeout: Duration,
        poll: PollSettings,
        channel: Option<Arc<dyn SideChannel>>,
        validator: Arc<dyn ResultValidator>,
    ) -> Self {
        let capture_available = config.enabled
            && config
                .capture
                .as_ref()
                .is_some_and(|c| which_exists(&c.executable));
        if config.enabled && config.capture.is_some() && !capture_available {
            tracing::warn!("direct-capture tool not found in PATH, using side channel only");
        }
        let transient_dir = config
            .transient_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self {
            config,
            capture_available,
            tool_timeout,
            poll,
            channel,
            validator,
            transient_dir,
        }
    }

    pub fn capture_available(&self) -> bool {
        self.capture_available
    }

    pub fn side_channel_available(&self) -> bool {
        self.config.enabled && self.config.launch.is_some() && self.channel.is_some()
    }

    pub fn is_configured(&self) -> bool {
        self.capture_available || self.side_channel_available()
    }

    /// Issue the request. Direct capture is tried first when this platform has
    /// it; an exit-0 run with no output falls through to side-channel polling.
    pub async fn launch(
        &self,
        req: &Request,
        cancel: &CancellationToken,
    ) -> Result<LaunchResult, GustError> {
        if !self.is_configured() {
            return Err(GustError::BackendUnavailable {
                backend: TierKind::OutOfBand,
            });
        }

        let prompt = req.prompt();
        // Snapshot before launching: the tool may write the channel immediately.
        let baseline = self.snapshot().await;

        if self.capture_available {
            let files = TransientFiles::create(&self.transient_dir, &prompt).await?;
            if let Some(text) = self.run_capture(&files, cancel).await? {
                return Ok(LaunchResult::Immediate(text));
            }
            drop(files);

            let (Some(channel), Some(baseline)) = (self.channel.clone(), baseline) else {
                return Err(GustError::Inference {
                    backend: TierKind::OutOfBand,
                    message: "the external tool produced no output".to_string(),
                });
            };
            tracing::info!("direct capture returned no output, watching side channel");
            return Ok(LaunchResult::Polling(PollHandle {
                baseline,
                channel,
                validator: self.validator.clone(),
                settings: self.poll,
                launcher: None,
                files: None,
            }));
        }

        let (Some(spec), Some(channel), Some(baseline)) =
            (self.config.launch.as_ref(), self.channel.clone(), baseline)
        else {
            return Err(GustError::BackendUnavailable {
                backend: TierKind::OutOfBand,
            });
        };

        let files = TransientFiles::create(&self.transient_dir, &prompt).await?;
        let launcher = self.spawn_detached(spec, &files, &prompt)?;
        tracing::info!(executable = %spec.executable, "out-of-band request issued");

        Ok(LaunchResult::Polling(PollHandle {
            baseline,
            channel,
            validator: self.validator.clone(),
            settings: self.poll,
            launcher: Some(launcher),
            files: Some(files),
        }))
    }

    async fn snapshot(&self) -> Option<String> {
        let channel = self.channel.as_ref()?;
        match channel.read().await {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::debug!("side channel baseline read failed, treating as empty: {e}");
                Some(String::new())
            }
        }
    }

    /// Run the capture command to completion and read its output file.
    /// Ok(None) means exit 0 with no output.
    ///
    /// - No shell: Command::new + args
    /// - Own process group so a timeout or cancel kills grandchildren too
    /// - stdout/stderr capped at MAX_OUTPUT_BYTES
    async fn run_capture(
        &self,
        files: &TransientFiles,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, GustError> {
        let Some(spec) = self.config.capture.as_ref() else {
            return Ok(None);
        };
        let start = Instant::now();
        let args = substitute(&spec.args, files, None);

        let mut child = Command::new(&spec.executable)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GustError::ToolLaunchFailed(format!("{}: {e}", spec.executable)))?;

        let child_pid = child.id();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdout_handle = tokio::spawn(read_capped(stdout_pipe));
        let stderr_handle = tokio::spawn(read_capped(stderr_pipe));

        let wait = async {
            let status = child.wait().await?;
            let stdout = stdout_handle.await.unwrap_or_default();
            let stderr = stderr_handle.await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        let (status, stdout, stderr) = tokio::select! {
            result = tokio::time::timeout(self.tool_timeout, wait) => match result {
                Ok(result) => result?,
                Err(_) => {
                    kill_process_group(child_pid);
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    tracing::warn!(executable = %spec.executable, elapsed_ms, "capture tool timed out");
                    return Err(GustError::Timeout(elapsed_ms));
                }
            },
            _ = cancel.cancelled() => {
                kill_process_group(child_pid);
                tracing::info!(executable = %spec.executable, "capture tool cancelled");
                return Err(GustError::Cancelled);
            }
        };

        let stderr_text = String::from_utf8_lossy(&stderr).to_string();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            tracing::warn!(executable = %spec.executable, code, "capture tool failed");
            return Err(GustError::ToolExitError {
                code,
                stderr: stderr_text,
            });
        }

        if !stdout.is_empty() || !stderr_text.is_empty() {
            tracing::debug!(
                executable = %spec.executable,
                stdout = %String::from_utf8_lossy(&stdout),
                stderr = %stderr_text,
                "capture tool console output"
            );
        }

        files.take_output().await
    }

    /// Fire-and-forget launch: no output location, result arrives out of band.
    fn spawn_detached(
        &self,
        spec: &CommandSpec,
        files: &TransientFiles,
        prompt: &str,
    ) -> Result<Child, GustError> {
        let args = substitute(&spec.args, files, Some(prompt));
        Command::new(&spec.executable)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GustError::ToolLaunchFailed(format!("{}: {e}", spec.executable)))
    }
}

impl Tier for OutOfBandBridge {
    fn kind(&self) -> TierKind {
        TierKind::OutOfBand
    }

    fn availability(&self) -> Option<bool> {
        Some(self.is_configured())
    }

    fn attempt<'a>(
        &'a self,
        req: &'a Request,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ResponseOutcome> {
        Box::pin(async move {
            let result = match self.launch(req, cancel).await {
                Ok(LaunchResult::Immediate(text)) => Ok(text),
                Ok(LaunchResult::Polling(handle)) => handle.wait(cancel).await,
                Err(e) => Err(e),
            };
            if let Err(ref e) = result {
                tracing::warn!("out-of-band attempt failed: {e}");
            }
            result.into()
        })
    }
}

/// Replace `{input}`, `{output}` and (when given) `{prompt}` in each argument.
fn substitute(template: &[String], files: &TransientFiles, prompt: Option<&str>) -> Vec<String> {
    let input = files.input().to_string_lossy();
    let output = files.output().to_string_lossy();
    template
        .iter()
        .map(|a| {
            let arg = a.replace("{input}", &input).replace("{output}", &output);
            match prompt {
                Some(p) => arg.replace("{prompt}", p),
                None => arg,
            }
        })
        .collect()
}

async fn read_capped<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(pipe) = pipe {
        let mut capped = pipe.take(MAX_OUTPUT_BYTES as u64);
        if let Err(e) = capped.read_to_end(&mut buf).await {
            tracing::warn!("pipe read error: {e}");
        }
    }
    buf
}

/// SIGKILL the whole process group led by `pid`. None means already reaped.
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // process_group(0) made the child its group leader (pgid == pid).
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

/// Check if an executable exists in PATH.
fn which_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).exists();
    }
    std::process::Command::new("which")
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transient_files_are_removed_on_drop() {
        let dir = std::env::temp_dir();
        let files = TransientFiles::create(&dir, "hello").await.unwrap();
        let input = files.input().to_path_buf();
        let output = files.output().to_path_buf();
        tokio::fs::write(&output, "result").await.unwrap();
        assert!(input.exists());
        drop(files);
        assert!(!input.exists());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn transient_names_are_unique() {
        let dir = std::env::temp_dir();
        let a = TransientFiles::create(&dir, "a").await.unwrap();
        let b = TransientFiles::create(&dir, "b").await.unwrap();
        assert_ne!(a.input(), b.input());
        assert_ne!(a.output(), b.output());
    }

    #[tokio::test]
    async fn blank_output_reads_as_none() {
        let files = TransientFiles::create(&std::env::temp_dir(), "x").await.unwrap();
        tokio::fs::write(files.output(), "  \n").await.unwrap();
        assert_eq!(files.take_output().await.unwrap(), None);
        assert!(!files.output().exists());
    }

    #[tokio::test]
    async fn substitute_fills_placeholders() {
        let files = TransientFiles::create(&std::env::temp_dir(), "x").await.unwrap();
        let template = vec![
            "--in={input}".to_string(),
            "{output}".to_string(),
            "{prompt}".to_string(),
        ];
        let args = substitute(&template, &files, Some("hi there"));
        assert_eq!(args[0], format!("--in={}", files.input().display()));
        assert_eq!(args[1], files.output().display().to_string());
        assert_eq!(args[2], "hi there");

        let args = substitute(&template, &files, None);
        assert_eq!(args[2], "{prompt}");
    }
}
