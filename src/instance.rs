//! Instance handles.
//!
//! An [`Instance`] pairs an id with the backend that created it, so later
//! calls always reach the same backend. Every method forwards verbatim.

use crate::backend::{AttachIo, Backend, BackendKind, InstanceSpec, LogOptions, LogReader};
use crate::error::Result;
use crate::id::InstanceId;
use crate::pod::InstanceStatus;
use crate::runtime::Signal;
use std::sync::Arc;

/// One container of a pod, bound to its backend.
#[derive(Debug, Clone)]
pub struct Instance {
    id: InstanceId,
    backend: Arc<Backend>,
}

impl Instance {
    pub fn new(id: InstanceId, backend: Arc<Backend>) -> Self {
        Self { id, backend }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn create(&self, spec: &InstanceSpec) -> Result<()> {
        self.backend.create(&self.id, spec).await
    }

    pub async fn start(&self) -> Result<()> {
        self.backend.start(&self.id).await
    }

    pub async fn kill(&self, signal: Signal) -> Result<()> {
        self.backend.kill(&self.id, signal).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.backend.delete(&self.id).await
    }

    pub async fn status(&self) -> Result<InstanceStatus> {
        self.backend.status(&self.id).await
    }

    pub async fn logs(&self, options: &LogOptions) -> Result<LogReader> {
        self.backend.logs(&self.id, options).await
    }

    pub async fn run(&self, command: &[String], io: AttachIo) -> Result<()> {
        self.backend.run(&self.id, command, io).await
    }

    pub async fn wait(&self) -> Result<InstanceStatus> {
        self.backend.wait(&self.id).await
    }
}
