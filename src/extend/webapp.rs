//! Long-running service jobs.
//!
//! A webapp job launches a server command and treats it as healthy once it
//! survives a startup grace window. The job then stays `running` until the
//! process exits (zero exit completes the job, non-zero fails it) or the job
//! is cancelled, which kills the process.

use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use crate::core::job::{Job, JobBuilder, JobCtx};
use crate::core::value::TaskValue;

use super::subprocess::wait_or_cancel;

/// Builder for service jobs from a command template.
///
/// The template's `{ip}` and `{port}` placeholders are substituted before
/// launch.
#[derive(Clone, Debug)]
pub struct WebappJob {
    template: String,
    ip: String,
    port: u16,
    check_times: u32,
    check_delta: Duration,
}

impl WebappJob {
    /// A service job for `template`, listening on `ip:port`.
    #[must_use]
    pub fn new(template: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            template: template.into(),
            ip: ip.into(),
            port,
            check_times: 5,
            check_delta: Duration::from_millis(500),
        }
    }

    /// Tune the startup grace window: `times` checks, `delta` apart.
    #[must_use]
    pub fn check(mut self, times: u32, delta: Duration) -> Self {
        self.check_times = times;
        self.check_delta = delta;
        self
    }

    /// The address the service is expected to listen on.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Finish as a thread-kind [`JobBuilder`].
    #[must_use]
    pub fn into_builder(self) -> JobBuilder {
        let name = format!("webapp-{}", self.address());
        let spec = self;
        Job::thread(move |ctx| spec.run(ctx)).name(name)
    }

    fn run(&self, ctx: &JobCtx) -> anyhow::Result<TaskValue> {
        let cmd = self
            .template
            .replace("{ip}", &self.ip)
            .replace("{port}", &self.port.to_string());
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .spawn()
            .with_context(|| format!("failed to spawn `{cmd}`"))?;

        // Startup grace window: an early exit is a launch failure.
        for _ in 0..self.check_times {
            std::thread::sleep(self.check_delta);
            if let Some(status) = child.try_wait()? {
                anyhow::bail!(
                    "service `{cmd}` exited during startup with status {}",
                    status.code().unwrap_or(-1)
                );
            }
            if ctx.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(TaskValue::Null);
            }
        }

        match wait_or_cancel(&mut child, ctx)? {
            None => Ok(TaskValue::Null),
            Some(status) if status.success() => Ok(json!({ "address": self.address() })),
            Some(status) => anyhow::bail!(
                "service `{cmd}` exited with status {}",
                status.code().unwrap_or(-1)
            ),
        }
    }
}
