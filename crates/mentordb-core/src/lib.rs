//! Core domain model and host-collaborator contracts for mentordb.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mentordb-core";

/// Local account field matched against external identifier values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchField {
    Id,
    #[serde(rename = "idnumber")]
    IdNumber,
    Email,
    Username,
}

impl MatchField {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "id" => Some(MatchField::Id),
            "idnumber" => Some(MatchField::IdNumber),
            "email" => Some(MatchField::Email),
            "username" => Some(MatchField::Username),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchField::Id => "id",
            MatchField::IdNumber => "idnumber",
            MatchField::Email => "email",
            MatchField::Username => "username",
        }
    }
}

/// What to do with assignments that disappeared from the external source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovePolicy {
    #[default]
    #[serde(alias = "0")]
    Remove,
    #[serde(alias = "1")]
    Keep,
}

impl RemovePolicy {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "0" | "remove" => Some(RemovePolicy::Remove),
            "1" | "keep" => Some(RemovePolicy::Keep),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RemovePolicy::Remove => "remove",
            RemovePolicy::Keep => "keep",
        }
    }
}

/// Terminal state of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    NotConfigured,
    ConnectFailure,
    InsufficientRecords,
    StoreFailure,
    ReadFailure,
}

impl SyncStatus {
    /// Process exit code: 0 success, 4 external read failure, 1 everything else.
    pub fn exit_code(self) -> i32 {
        match self {
            SyncStatus::Success => 0,
            SyncStatus::ReadFailure => 4,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalUser {
    pub id: i64,
}

/// One existing mentor role assignment at a student's user context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleAssignment {
    pub mentor_id: i64,
    pub student_id: i64,
    pub context_id: i64,
}

/// Composite key identifying a mentor relationship.
pub fn pair_key(mentor_id: i64, student_id: i64) -> String {
    format!("{mentor_id}_{student_id}")
}

/// Line-oriented progress reporting for one run.
pub trait ProgressSink {
    /// Emit one line; `level` above zero marks elevated severity.
    fn output(&mut self, message: &str, level: u8);
    /// Signal that the run reached a terminal state.
    fn finished(&mut self);
}

/// Writes progress lines to stdout, indented two spaces per level.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn output(&mut self, message: &str, level: u8) {
        let indent = "  ".repeat(usize::from(level));
        println!("{indent}{message}");
    }

    fn finished(&mut self) {}
}

/// Routes progress lines into the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn output(&mut self, message: &str, level: u8) {
        if level == 0 {
            tracing::info!("{message}");
        } else {
            tracing::warn!("{message}");
        }
    }

    fn finished(&mut self) {
        tracing::debug!("progress sink closed");
    }
}

/// Captures progress lines for assertions.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub lines: Vec<(u8, String)>,
    pub finished: bool,
}

impl BufferSink {
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|(_, line)| line.contains(needle))
    }
}

impl ProgressSink for BufferSink {
    fn output(&mut self, message: &str, level: u8) {
        self.lines.push((level, message.to_string()));
    }

    fn finished(&mut self) {
        self.finished = true;
    }
}

/// Looks up a single local account by match-field equality.
///
/// When several accounts share the value, an arbitrary one is returned.
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn find_user(&self, field: MatchField, value: &str) -> Result<Option<LocalUser>>;
}

/// Resolves the authorization context tied to one user account,
/// creating it on first use.
#[async_trait]
pub trait UserContextResolver: Send + Sync {
    async fn user_context(&self, user_id: i64) -> Result<i64>;
}

/// Query and mutate role assignments at user-context level.
#[async_trait]
pub trait RoleAssigner: Send + Sync {
    /// All assignments of the role at user-context level.
    async fn user_context_assignments(&self, role_id: i64) -> Result<Vec<RoleAssignment>>;
    /// Idempotent: assigning an already-assigned role is a no-op.
    async fn assign(&self, role_id: i64, user_id: i64, context_id: i64) -> Result<()>;
    async fn unassign(&self, role_id: i64, user_id: i64, context_id: i64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_field_labels_round_trip() {
        for field in [
            MatchField::Id,
            MatchField::IdNumber,
            MatchField::Email,
            MatchField::Username,
        ] {
            assert_eq!(MatchField::from_label(field.as_str()), Some(field));
        }
        assert_eq!(MatchField::from_label(" IDNUMBER "), Some(MatchField::IdNumber));
        assert_eq!(MatchField::from_label("fullname"), None);
    }

    #[test]
    fn remove_policy_accepts_reference_numeric_labels() {
        assert_eq!(RemovePolicy::from_label("0"), Some(RemovePolicy::Remove));
        assert_eq!(RemovePolicy::from_label("1"), Some(RemovePolicy::Keep));
        assert_eq!(RemovePolicy::from_label("keep"), Some(RemovePolicy::Keep));
        assert_eq!(RemovePolicy::from_label("2"), None);
    }

    #[test]
    fn status_exit_codes() {
        assert_eq!(SyncStatus::Success.exit_code(), 0);
        assert_eq!(SyncStatus::NotConfigured.exit_code(), 1);
        assert_eq!(SyncStatus::ConnectFailure.exit_code(), 1);
        assert_eq!(SyncStatus::InsufficientRecords.exit_code(), 1);
        assert_eq!(SyncStatus::StoreFailure.exit_code(), 1);
        assert_eq!(SyncStatus::ReadFailure.exit_code(), 4);
    }

    #[test]
    fn pair_key_is_mentor_then_student() {
        assert_eq!(pair_key(12, 7), "12_7");
    }

    #[test]
    fn buffer_sink_records_levels_and_terminal_state() {
        let mut sink = BufferSink::default();
        sink.output("starting", 0);
        sink.output("error: bad row", 1);
        sink.finished();
        assert_eq!(sink.lines.len(), 2);
        assert_eq!(sink.lines[1], (1, "error: bad row".to_string()));
        assert!(sink.contains("bad row"));
        assert!(sink.finished);
    }
}
