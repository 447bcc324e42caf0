//! Extension job kinds built on the core backends: shell subprocesses,
//! long-running web services, and periodic/conditional resubmission.

pub mod cron;
pub mod subprocess;
pub mod webapp;

pub use cron::{CronJob, SentinelJob};
pub use subprocess::SubprocessJob;
pub use webapp::WebappJob;
