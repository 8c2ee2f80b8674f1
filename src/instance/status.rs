use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a tracked bot instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Running,
    Paused,
    Error,
}

/// Operations that move an instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
    Pause,
    Resume,
    Fail,
}

impl InstanceStatus {
    /// Running and paused instances still own a live process.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }

    /// Target state of `transition`, or `None` when the table forbids it.
    pub fn apply(self, transition: Transition) -> Option<InstanceStatus> {
        use InstanceStatus::*;
        match (self, transition) {
            (Stopped | Error, Transition::Start) => Some(Running),
            (_, Transition::Stop) => Some(Stopped),
            (Running, Transition::Pause) => Some(Paused),
            (Paused, Transition::Resume) => Some(Running),
            (_, Transition::Fail) => Some(Error),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_only_from_stopped_or_error() {
        assert_eq!(InstanceStatus::Stopped.apply(Transition::Start), Some(InstanceStatus::Running));
        assert_eq!(InstanceStatus::Error.apply(Transition::Start), Some(InstanceStatus::Running));
        assert_eq!(InstanceStatus::Running.apply(Transition::Start), None);
        assert_eq!(InstanceStatus::Paused.apply(Transition::Start), None);
    }

    #[test]
    fn pause_and_resume_are_strict() {
        assert_eq!(InstanceStatus::Running.apply(Transition::Pause), Some(InstanceStatus::Paused));
        assert_eq!(InstanceStatus::Stopped.apply(Transition::Pause), None);
        assert_eq!(InstanceStatus::Paused.apply(Transition::Pause), None);
        assert_eq!(InstanceStatus::Paused.apply(Transition::Resume), Some(InstanceStatus::Running));
        assert_eq!(InstanceStatus::Running.apply(Transition::Resume), None);
    }

    #[test]
    fn stop_and_fail_from_anywhere() {
        for s in [
            InstanceStatus::Stopped,
            InstanceStatus::Running,
            InstanceStatus::Paused,
            InstanceStatus::Error,
        ] {
            assert_eq!(s.apply(Transition::Stop), Some(InstanceStatus::Stopped));
            assert_eq!(s.apply(Transition::Fail), Some(InstanceStatus::Error));
        }
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&InstanceStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        assert!(InstanceStatus::Paused.is_running());
        assert!(!InstanceStatus::Error.is_running());
    }
}
