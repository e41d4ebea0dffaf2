//! Run record (§3.4): in-memory state the supervisor maintains and the observation
//! server reads a snapshot of on every poll tick.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub running: bool,
    pub current_iteration: u32,
    pub max_iterations: u32,
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub iteration_timeout: Duration,
    pub completed_via_promise: bool,
    pub completed_via_state: bool,
    pub completion_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub viewer_log_path: PathBuf,
    pub last_error: Option<String>,
    pub issue_ref: Option<String>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

impl RunRecord {
    pub fn idle(viewer_log_path: PathBuf) -> Self {
        Self {
            running: false,
            current_iteration: 0,
            max_iterations: 0,
            inactivity_timeout: Duration::from_secs(0),
            iteration_timeout: Duration::from_secs(0),
            completed_via_promise: false,
            completed_via_state: false,
            completion_reason: None,
            started_at: None,
            ended_at: None,
            return_code: None,
            viewer_log_path,
            last_error: None,
            issue_ref: None,
        }
    }

    pub fn completed(&self) -> bool {
        self.completed_via_promise || self.completed_via_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_record_reports_not_running_and_not_completed() {
        let record = RunRecord::idle(PathBuf::from("/tmp/viewer-run.log"));
        assert!(!record.running);
        assert!(!record.completed());
        assert_eq!(record.current_iteration, 0);
    }

    #[test]
    fn completed_is_true_if_either_flag_is_set() {
        let mut record = RunRecord::idle(PathBuf::from("/tmp/viewer-run.log"));
        record.completed_via_state = true;
        assert!(record.completed());
    }
}
