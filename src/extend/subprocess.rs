//! Shell-command jobs.
//!
//! A subprocess job runs a command line through `sh -c` on the thread
//! backend, polling for exit and the job's cancel flag. A non-zero exit
//! status fails the job.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use crate::core::job::{Job, JobBuilder, JobCtx};
use crate::core::value::TaskValue;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Builder for shell-command jobs.
#[derive(Clone, Debug)]
pub struct SubprocessJob {
    cmd: String,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    capture: bool,
}

impl SubprocessJob {
    /// A job running `cmd` through `sh -c`.
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: None,
            envs: Vec::new(),
            capture: false,
        }
    }

    /// Working directory for the command.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Capture stdout/stderr into the job result instead of inheriting the
    /// parent's streams.
    #[must_use]
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Finish as a thread-kind [`JobBuilder`]; job name defaults to the
    /// command's first word.
    #[must_use]
    pub fn into_builder(self) -> JobBuilder {
        let name = self
            .cmd
            .split_whitespace()
            .next()
            .unwrap_or("sh")
            .to_string();
        let spec = self;
        Job::thread(move |ctx| spec.run(ctx)).name(name)
    }

    fn run(&self, ctx: &JobCtx) -> anyhow::Result<TaskValue> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.cmd);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if self.capture {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.cmd))?;

        let stdout = child.stdout.take().map(collect_stream);
        let stderr = child.stderr.take().map(collect_stream);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if ctx.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("command cancelled");
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout.map(join_stream).unwrap_or_default();
        let stderr = stderr.map(join_stream).unwrap_or_default();
        let code = status.code().unwrap_or(-1);

        if !status.success() {
            if self.capture && !stderr.is_empty() {
                anyhow::bail!("command exited with status {code}: {stderr}");
            }
            anyhow::bail!("command exited with status {code}");
        }
        if self.capture {
            Ok(json!({ "exit_code": code, "stdout": stdout, "stderr": stderr }))
        } else {
            Ok(json!(code))
        }
    }
}

fn collect_stream<R: Read + Send + 'static>(mut stream: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stream.read_to_string(&mut buf);
        buf
    })
}

fn join_stream(handle: std::thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Poll a child until exit or cancellation; kills the child on cancel.
///
/// Returns `None` when cancelled. Shared with the webapp extension.
pub(crate) fn wait_or_cancel(
    child: &mut Child,
    ctx: &JobCtx,
) -> anyhow::Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if ctx.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_name_is_first_word() {
        let builder = SubprocessJob::new("echo hello world").into_builder();
        let job = builder.build();
        assert_eq!(job.name(), "echo");
    }
}
