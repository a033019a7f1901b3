//! Instance and pod state types.
//!
//! - `InstanceState`: the three-state machine every backend reports
//! - `InstanceStatus`: Kubernetes-style container status wrapping it
//! - `ExitEvent`: the single terminal event a watcher publishes
//! - `PodPhase`, `PodStatus`, `PodSummary`: pod-level aggregation

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Instance State Machine
// =============================================================================

/// State of a single instance.
///
/// ```text
///   Waiting ──start──▶ Running ──exit──▶ Terminated
///      │                                    ▲
///      └──────────exit / teardown───────────┘
/// ```
///
/// Terminated is final; only a fresh create leaves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum InstanceState {
    /// Created but not (yet) running.
    Waiting { reason: String, message: String },
    /// Running since `started_at`.
    #[serde(rename_all = "camelCase")]
    Running { started_at: DateTime<Utc> },
    /// Exited or torn down.
    #[serde(rename_all = "camelCase")]
    Terminated {
        exit_code: i32,
        signal: Option<i32>,
        reason: String,
        message: String,
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
    },
}

impl InstanceState {
    /// Waiting state with the given reason and message.
    pub fn waiting(reason: &str, message: &str) -> Self {
        Self::Waiting {
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    /// Short name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "waiting",
            Self::Running { .. } => "running",
            Self::Terminated { .. } => "terminated",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    /// Exit code when terminated.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Terminated { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Running { started_at } => Some(*started_at),
            Self::Terminated { started_at, .. } => *started_at,
            Self::Waiting { .. } => None,
        }
    }
}

/// Terminal event published exactly once per started instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub reason: String,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

impl ExitEvent {
    /// Exit event stamped now.
    pub fn now(exit_code: i32, signal: Option<i32>, reason: &str, message: &str) -> Self {
        Self {
            exit_code,
            signal,
            reason: reason.to_string(),
            message: message.to_string(),
            finished_at: Utc::now(),
        }
    }
}

// =============================================================================
// Instance Status
// =============================================================================

/// Status of one instance, shaped like a Kubernetes container status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Container name within the pod.
    pub name: String,
    pub state: InstanceState,
    pub last_termination_state: Option<InstanceState>,
    pub ready: bool,
    pub restart_count: u32,
    pub image: String,
    pub image_id: String,
    /// Backend-specific id, e.g. `capstan://<id>`.
    pub container_id: String,
    pub started: bool,
}

impl InstanceStatus {
    /// Fresh status after a create.
    ///
    /// A previous status is kept as `last_termination_state`.
    pub fn created(
        name: &str,
        image: &str,
        container_id: &str,
        previous: Option<&InstanceStatus>,
    ) -> Self {
        Self {
            name: name.to_string(),
            state: InstanceState::waiting("Created", "Instance is created"),
            last_termination_state: previous.map(|p| p.state.clone()),
            ready: true,
            restart_count: 0,
            image: image.to_string(),
            image_id: String::new(),
            container_id: container_id.to_string(),
            started: false,
        }
    }

    /// Status carrying an explicit state, as reported by live queries.
    pub fn with_state(name: &str, image: &str, container_id: &str, state: InstanceState) -> Self {
        let started = !matches!(state, InstanceState::Waiting { .. });
        Self {
            name: name.to_string(),
            ready: state.is_running(),
            state,
            last_termination_state: None,
            restart_count: 0,
            image: image.to_string(),
            image_id: String::new(),
            container_id: container_id.to_string(),
            started,
        }
    }

    /// Waiting → Running.
    pub fn mark_running(&mut self, started_at: DateTime<Utc>) -> Result<()> {
        match self.state {
            InstanceState::Waiting { .. } => {
                self.state = InstanceState::Running { started_at };
                self.started = true;
                Ok(())
            }
            _ => Err(self.illegal("waiting")),
        }
    }

    /// Waiting or Running → Terminated.
    pub fn mark_terminated(&mut self, event: &ExitEvent) -> Result<()> {
        if self.state.is_terminated() {
            return Err(self.illegal("waiting or running"));
        }

        self.state = InstanceState::Terminated {
            exit_code: event.exit_code,
            signal: event.signal,
            reason: event.reason.clone(),
            message: event.message.clone(),
            started_at: self.state.started_at(),
            finished_at: event.finished_at,
        };
        self.ready = false;
        Ok(())
    }

    fn illegal(&self, expected: &str) -> Error {
        Error::InvalidState {
            id: self.name.clone(),
            state: self.state.name().to_string(),
            expected: expected.to_string(),
        }
    }
}

// =============================================================================
// Pod Phase
// =============================================================================

/// High-level pod lifecycle phase.
///
/// ```text
///   Pending ──▶ Running ──▶ Succeeded
///      │           │            │
///      └───────────┴────────────┴──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PodPhase {
    /// Containers are being created or waiting to start.
    #[default]
    Pending,
    /// At least one container is running.
    Running,
    /// All containers terminated successfully (exit code 0).
    Succeeded,
    /// A container failed to be created, or terminated with failure.
    Failed,
}

impl PodPhase {
    /// Aggregates container states into a phase.
    ///
    /// `failed` is true when a container could not be created or started.
    pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a InstanceState>, failed: bool) -> Self {
        if failed {
            return Self::Failed;
        }

        let mut any = false;
        let mut all_succeeded = true;
        let mut any_running = false;
        for state in states {
            any = true;
            match state {
                InstanceState::Terminated { exit_code: 0, .. } => {}
                InstanceState::Terminated { .. } => return Self::Failed,
                InstanceState::Running { .. } => {
                    any_running = true;
                    all_succeeded = false;
                }
                InstanceState::Waiting { .. } => all_succeeded = false,
            }
        }

        if any && all_succeeded {
            Self::Succeeded
        } else if any_running {
            Self::Running
        } else {
            Self::Pending
        }
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Pod Status
// =============================================================================

/// Detailed status of a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: PodPhase,
    pub init_container_statuses: Vec<InstanceStatus>,
    pub container_statuses: Vec<InstanceStatus>,
    /// Human-readable message about current state.
    pub message: Option<String>,
}

/// Lightweight pod information for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    pub container_count: usize,
}
