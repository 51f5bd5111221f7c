#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, WorkspaceIdError> {
        let value = value.into();
        validate_workspace_id(&value)?;
        Ok(Self(value))
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkspaceIdError {
    Empty,
    TooLong,
    InvalidFirstChar,
    InvalidChar { ch: char, index: usize },
}

impl std::fmt::Display for WorkspaceIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "workspace id is empty"),
            Self::TooLong => write!(f, "workspace id is longer than 128 chars"),
            Self::InvalidFirstChar => {
                write!(f, "workspace id must start with an ascii alphanumeric char")
            }
            Self::InvalidChar { ch, index } => {
                write!(f, "workspace id has invalid char {ch:?} at index {index}")
            }
        }
    }
}

impl std::error::Error for WorkspaceIdError {}

fn validate_workspace_id(value: &str) -> Result<(), WorkspaceIdError> {
    if value.is_empty() {
        return Err(WorkspaceIdError::Empty);
    }
    if value.len() > 128 {
        return Err(WorkspaceIdError::TooLong);
    }
    let Some(first) = value.chars().next() else {
        return Err(WorkspaceIdError::Empty);
    };
    if !first.is_ascii_alphanumeric() {
        return Err(WorkspaceIdError::InvalidFirstChar);
    }
    for (index, ch) in value.chars().enumerate() {
        if index == 0 {
            continue;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-') {
            continue;
        }
        return Err(WorkspaceIdError::InvalidChar { ch, index });
    }
    Ok(())
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque, process-unique entity id: `<prefix>_<12 hex chars>`.
///
/// The digest covers wall-clock nanos, the pid and a process-local counter,
/// so concurrent processes sharing a store never need id coordination.
pub fn new_id(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{prefix}_{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_id_accepts_common_shapes() {
        for value in ["ws", "my-workspace", "team/repo.main", "a_b-c/d.e"] {
            assert!(WorkspaceId::try_new(value).is_ok(), "{value}");
        }
    }

    #[test]
    fn workspace_id_rejects_bad_input() {
        assert_eq!(WorkspaceId::try_new(""), Err(WorkspaceIdError::Empty));
        assert_eq!(
            WorkspaceId::try_new("-leading"),
            Err(WorkspaceIdError::InvalidFirstChar)
        );
        assert!(matches!(
            WorkspaceId::try_new("has space"),
            Err(WorkspaceIdError::InvalidChar { ch: ' ', .. })
        ));
        assert_eq!(
            WorkspaceId::try_new("x".repeat(129)),
            Err(WorkspaceIdError::TooLong)
        );
    }

    #[test]
    fn new_id_is_prefixed_and_unique() {
        let a = new_id("job");
        let b = new_id("job");
        assert!(a.starts_with("job_"));
        assert_eq!(a.len(), "job_".len() + 12);
        assert_ne!(a, b);
    }
}
