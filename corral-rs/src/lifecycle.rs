//! VM lifecycle state machine.
//!
//! The switchboard records a [`VmStatus`] per instance. Admin actions are
//! only enqueued when the current status accepts them, and the status is
//! advanced when the matching job is acknowledged.
//!
//! ```text
//! absent -> provisioning -> running <-> stopped -> deleted
//!                             \           /
//!                              reinstalling
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::job::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Provisioning,
    Running,
    Stopped,
    Reinstalling,
    /// The last lifecycle job failed and left the instance in an unknown state.
    Error,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmAction {
    Create,
    Start,
    Stop,
    Reboot,
    Delete,
    Reinstall,
}

impl VmAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmAction::Create => "create",
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Reboot => "reboot",
            VmAction::Delete => "delete",
            VmAction::Reinstall => "reinstall",
        }
    }

    pub fn job_kind(&self) -> JobKind {
        match self {
            VmAction::Create => JobKind::Create,
            VmAction::Start => JobKind::Start,
            VmAction::Stop => JobKind::Stop,
            VmAction::Reboot => JobKind::Reboot,
            VmAction::Delete => JobKind::Delete,
            VmAction::Reinstall => JobKind::Reinstall,
        }
    }

    /// The action a job kind performs on an instance, if any.
    pub fn from_job_kind(kind: JobKind) -> Option<VmAction> {
        Some(match kind {
            JobKind::Create => VmAction::Create,
            JobKind::Start => VmAction::Start,
            JobKind::Stop => VmAction::Stop,
            JobKind::Reboot => VmAction::Reboot,
            JobKind::Delete => VmAction::Delete,
            JobKind::Reinstall => VmAction::Reinstall,
            _ => return None,
        })
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "create" => VmAction::Create,
            "start" => VmAction::Start,
            "stop" => VmAction::Stop,
            "reboot" => VmAction::Reboot,
            "delete" => VmAction::Delete,
            "reinstall" => VmAction::Reinstall,
            other => return Err(format!("unknown VM action: {other:?}")),
        })
    }
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Provisioning => "provisioning",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Reinstalling => "reinstalling",
            VmStatus::Error => "error",
            VmStatus::Deleted => "deleted",
        }
    }

    /// Whether `action` may be enqueued for an instance in this status.
    ///
    /// `Create` is never accepted here: creation starts from an absent
    /// instance and inserts the record in `Provisioning`.
    pub fn accepts(&self, action: VmAction) -> bool {
        use VmAction as A;
        use VmStatus as S;
        match (self, action) {
            (_, A::Create) => false,
            (S::Deleted, _) => false,
            (_, A::Delete) => true,
            (S::Stopped | S::Error, A::Start) => true,
            (S::Running | S::Error, A::Stop) => true,
            (S::Running, A::Reboot) => true,
            (S::Running | S::Stopped, A::Reinstall) => true,
            _ => false,
        }
    }

    /// Status recorded when `action` is enqueued.
    pub fn on_enqueue(&self, action: VmAction) -> VmStatus {
        match action {
            VmAction::Create => VmStatus::Provisioning,
            VmAction::Reinstall => VmStatus::Reinstalling,
            _ => *self,
        }
    }

    /// Status recorded when the job for `action` finishes.
    pub fn after(&self, action: VmAction, succeeded: bool) -> VmStatus {
        match (action, succeeded) {
            (VmAction::Create, true) => VmStatus::Running,
            (VmAction::Create, false) => VmStatus::Error,
            (VmAction::Start, true) => VmStatus::Running,
            (VmAction::Stop, true) => VmStatus::Stopped,
            (VmAction::Reboot, true) => VmStatus::Running,
            (VmAction::Delete, true) => VmStatus::Deleted,
            (VmAction::Reinstall, true) => VmStatus::Running,
            (VmAction::Reinstall, false) => VmStatus::Error,
            (VmAction::Start | VmAction::Stop | VmAction::Reboot | VmAction::Delete, false) => *self,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
