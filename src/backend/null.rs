//! Backend that runs nothing.
//!
//! Instances exist only as ids; each one reports a successful termination
//! as soon as it is created.

use super::{AttachIo, InstanceSpec, LogOptions, LogReader};
use crate::error::{Error, Result};
use crate::id::InstanceId;
use crate::pod::{InstanceState, InstanceStatus};
use crate::runtime::Signal;
use crate::volume::ResolvedVolume;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

const NULL_MESSAGE: &str = "This container is run by a dummy backend which does absolutely nothing.";

/// Tracks created ids and nothing else.
#[derive(Debug, Default)]
pub struct NullBackend {
    /// Instance id → image reference.
    instances: RwLock<HashMap<InstanceId, String>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&self, id: &InstanceId) -> Result<()> {
        if self.instances.read()?.contains_key(id) {
            Ok(())
        } else {
            Err(Error::InstanceNotFound(id.to_string()))
        }
    }

    pub async fn create(&self, id: &InstanceId, spec: &InstanceSpec) -> Result<()> {
        debug!(instance = %id, "null backend create");
        self.instances
            .write()?
            .insert(id.clone(), spec.container.image.clone());
        Ok(())
    }

    pub async fn start(&self, id: &InstanceId) -> Result<()> {
        self.ensure(id)
    }

    pub async fn kill(&self, id: &InstanceId, _signal: Signal) -> Result<()> {
        self.ensure(id)
    }

    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        match self.instances.write()?.remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::InstanceNotFound(id.to_string())),
        }
    }

    pub async fn status(&self, id: &InstanceId) -> Result<InstanceStatus> {
        let image = self
            .instances
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;

        let state = InstanceState::Terminated {
            exit_code: 0,
            signal: None,
            reason: "Completed".to_string(),
            message: NULL_MESSAGE.to_string(),
            started_at: None,
            finished_at: Utc::now(),
        };
        Ok(InstanceStatus::with_state(id.name(), &image, "", state))
    }

    pub async fn logs(&self, id: &InstanceId, _options: &LogOptions) -> Result<LogReader> {
        self.ensure(id)?;
        Ok(Box::new(tokio::io::empty()))
    }

    pub async fn run(&self, id: &InstanceId, _command: &[String], _io: AttachIo) -> Result<()> {
        self.ensure(id)
    }

    pub async fn create_volume(&self, _id: &InstanceId, _volume: &ResolvedVolume) -> Result<()> {
        Ok(())
    }

    pub async fn delete_volume(&self, _id: &InstanceId) -> Result<()> {
        Ok(())
    }

    pub async fn wait(&self, id: &InstanceId) -> Result<InstanceStatus> {
        self.status(id).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageConfig;
    use crate::pod::ContainerSpec;

    #[tokio::test]
    async fn test_lifecycle() {
        let backend = NullBackend::new();
        let id = InstanceId::from_parts("default", "web", "app").unwrap();
        let spec = InstanceSpec {
            container: ContainerSpec::new("app", "example.com/app:1"),
            image_config: ImageConfig::default(),
            hostname: None,
            volumes: Vec::new(),
        };

        assert!(backend.start(&id).await.unwrap_err().is_not_found());

        backend.create(&id, &spec).await.unwrap();
        backend.start(&id).await.unwrap();
        let status = backend.status(&id).await.unwrap();
        assert_eq!(status.state.exit_code(), Some(0));
        assert_eq!(status.image, "example.com/app:1");

        backend.delete(&id).await.unwrap();
        assert!(backend.status(&id).await.unwrap_err().is_not_found());
        assert!(backend.delete(&id).await.unwrap_err().is_not_found());
    }
}
