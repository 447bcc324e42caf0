//! Inline backend: runs the callable on the scheduler's own task.
//!
//! Meant for trivially-fast work and generator producers. A long-running
//! local callable stalls condition polling for its duration; use the thread
//! backend for anything that blocks.

use crate::core::error::BackendError;

use super::{run_spec, Backend, LaunchSpec};

/// Backend that invokes the callable synchronously at dispatch.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Create the inline backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Backend for LocalBackend {
    fn launch(&self, spec: LaunchSpec) -> Result<(), BackendError> {
        run_spec(spec);
        Ok(())
    }
}
