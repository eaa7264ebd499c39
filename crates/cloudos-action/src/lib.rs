use std::collections::BTreeMap;

/// Name -> argument vector. Program first, then its arguments. Never a shell string.
pub type ActionMap = BTreeMap<String, Vec<String>>;

/// Why an action could not run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotAllowed,
    SpawnFailed,
    Timeout,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NotAllowed => "not_allowed",
            FailureKind::SpawnFailed => "spawn_failed",
            FailureKind::Timeout => "timeout",
        }
    }
}

/// Outcome of one action invocation.
///
/// `Failed` means the process never ran to completion (rejected, could not spawn, or was
/// killed on timeout). `ProcessError` means it ran and reported failure through its exit
/// code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        stdout: String,
        stderr: String,
        code: i32,
    },
    #[serde(rename = "error")]
    ProcessError {
        stdout: String,
        stderr: String,
        code: i32,
    },
    Failed {
        kind: FailureKind,
        error: String,
    },
}

impl ExecutionResult {
    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            error: error.into(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ExecutionResult::Success { .. } => "success",
            ExecutionResult::ProcessError { .. } => "error",
            ExecutionResult::Failed { .. } => "failed",
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExecutionResult::Success { code, .. } | ExecutionResult::ProcessError { code, .. } => {
                Some(*code)
            }
            ExecutionResult::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionResult::Failed { .. })
    }
}

/// Point-in-time host metrics.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub os: String,
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_non_empty() {
        let id = SessionId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, SessionId::new());
    }

    #[test]
    fn result_serializes_with_status_tag() {
        let ok = ExecutionResult::Success {
            stdout: "root".to_string(),
            stderr: String::new(),
            code: 0,
        };
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["status"], "success");
        assert_eq!(v["stdout"], "root");
        assert_eq!(v["code"], 0);

        let err = ExecutionResult::ProcessError {
            stdout: String::new(),
            stderr: "boom".to_string(),
            code: 3,
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["code"], 3);

        let failed = ExecutionResult::failed(FailureKind::NotAllowed, "Action not allowed");
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["kind"], "not_allowed");
        assert_eq!(v["error"], "Action not allowed");
    }

    #[test]
    fn failed_has_no_exit_code() {
        let r = ExecutionResult::failed(FailureKind::Timeout, "late");
        assert!(r.is_failed());
        assert_eq!(r.code(), None);
        assert_eq!(r.status(), "failed");
    }
}
