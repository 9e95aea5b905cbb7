//! Reconciliation of local mentor role assignments against an
//! admin-configured external database table: one linear pass that adds
//! missing assignments and removes stale ones, plus the settings probe
//! backing the admin "test settings" page.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use mentordb_core::{
    pair_key, MatchField, ProgressSink, RemovePolicy, RoleAssigner, RoleAssignment, SyncStatus,
    UserContextResolver, UserLookup,
};
use mentordb_extdb::{
    build_select, DbConnectionConfig, ExtDb, QuoteDialect, TextCodec,
};

pub const CRATE_NAME: &str = "mentordb-sync";

/// Immutable settings snapshot for one run.
///
/// Field aliases match the key names of the admin settings store, so a
/// dumped settings object deserializes directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    #[serde(alias = "dbtype")]
    pub db_type: String,
    #[serde(alias = "dbhost")]
    pub db_host: String,
    #[serde(alias = "dbuser")]
    pub db_user: String,
    #[serde(alias = "dbpass")]
    pub db_pass: String,
    #[serde(alias = "dbname")]
    pub db_name: String,
    #[serde(alias = "dbencoding")]
    pub db_encoding: String,
    #[serde(alias = "dbsetupsql")]
    pub db_setup_sql: String,
    #[serde(alias = "dbsybasequoting")]
    pub db_sybase_quoting: bool,
    #[serde(alias = "debugdb")]
    pub debug_db: bool,
    /// Abort before touching anything unless the external table holds
    /// strictly more than this many records. Zero skips the check.
    #[serde(alias = "minrecords")]
    pub min_records: u64,
    #[serde(alias = "remotementortable")]
    pub mentor_table: String,
    #[serde(alias = "remoteuserfield")]
    pub remote_user_field: String,
    #[serde(alias = "remotementoridfield")]
    pub remote_mentor_id_field: String,
    #[serde(alias = "localuserfield")]
    pub local_user_field: Option<MatchField>,
    #[serde(alias = "role")]
    pub role_id: i64,
    #[serde(alias = "removeaction")]
    pub remove_action: RemovePolicy,
    pub connect_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            db_type: String::new(),
            db_host: String::new(),
            db_user: String::new(),
            db_pass: String::new(),
            db_name: String::new(),
            db_encoding: "utf-8".to_string(),
            db_setup_sql: String::new(),
            db_sybase_quoting: false,
            debug_db: false,
            min_records: 1,
            mentor_table: String::new(),
            remote_user_field: String::new(),
            remote_mentor_id_field: String::new(),
            local_user_field: None,
            role_id: 0,
            remove_action: RemovePolicy::default(),
            connect_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_type: env_string("MENTORDB_DBTYPE"),
            db_host: env_string("MENTORDB_DBHOST"),
            db_user: env_string("MENTORDB_DBUSER"),
            db_pass: env_string("MENTORDB_DBPASS"),
            db_name: env_string("MENTORDB_DBNAME"),
            db_encoding: std::env::var("MENTORDB_DBENCODING").unwrap_or(defaults.db_encoding),
            db_setup_sql: env_string("MENTORDB_DBSETUPSQL"),
            db_sybase_quoting: env_flag("MENTORDB_DBSYBASEQUOTING"),
            debug_db: env_flag("MENTORDB_DEBUGDB"),
            min_records: env_parse("MENTORDB_MINRECORDS").unwrap_or(defaults.min_records),
            mentor_table: env_string("MENTORDB_REMOTEMENTORTABLE"),
            remote_user_field: env_string("MENTORDB_REMOTEUSERFIELD"),
            remote_mentor_id_field: env_string("MENTORDB_REMOTEMENTORIDFIELD"),
            local_user_field: std::env::var("MENTORDB_LOCALUSERFIELD")
                .ok()
                .as_deref()
                .and_then(MatchField::from_label),
            role_id: env_parse("MENTORDB_ROLE").unwrap_or(0),
            remove_action: std::env::var("MENTORDB_REMOVEACTION")
                .ok()
                .as_deref()
                .and_then(RemovePolicy::from_label)
                .unwrap_or_default(),
            connect_timeout_secs: env_parse("MENTORDB_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout_secs),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn connection_config(&self) -> DbConnectionConfig {
        DbConnectionConfig {
            driver: self.db_type.trim().to_string(),
            host: self.db_host.trim().to_string(),
            username: self.db_user.clone(),
            password: self.db_pass.clone(),
            database: self.db_name.clone(),
            setup_sql: self.db_setup_sql.clone(),
            debug: self.debug_db,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }

    fn quote_dialect(&self) -> QuoteDialect {
        QuoteDialect::from_sybase_flag(self.db_sybase_quoting)
    }
}

fn env_string(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Default)]
struct RunCounters {
    assigned: usize,
    confirmed: usize,
    removed: usize,
    skipped: usize,
}

/// One-shot reconciliation engine. Collaborator stores are injected so
/// the engine carries no host coupling.
pub struct SyncEngine<'a> {
    settings: &'a SyncSettings,
    users: &'a dyn UserLookup,
    contexts: &'a dyn UserContextResolver,
    roles: &'a dyn RoleAssigner,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        settings: &'a SyncSettings,
        users: &'a dyn UserLookup,
        contexts: &'a dyn UserContextResolver,
        roles: &'a dyn RoleAssigner,
    ) -> Self {
        Self {
            settings,
            users,
            contexts,
            roles,
        }
    }

    /// Runs one full sync. Every failure is reported through the trace
    /// and folded into the returned status; nothing propagates out.
    pub async fn sync(&self, trace: &mut dyn ProgressSink) -> SyncStatus {
        let run_id = Uuid::new_v4();
        self.run(trace)
            .instrument(info_span!("mentor_sync", %run_id))
            .await
    }

    async fn run(&self, trace: &mut dyn ProgressSink) -> SyncStatus {
        let settings = self.settings;

        if settings.db_type.trim().is_empty() || settings.db_host.trim().is_empty() {
            trace.finished();
            return SyncStatus::NotConfigured;
        }

        trace.output("Starting mentor synchronisation...", 0);

        let mentor_table = settings.mentor_table.trim().to_string();
        let remote_user_field = settings.remote_user_field.trim().to_lowercase();
        let remote_mentor_id_field = settings.remote_mentor_id_field.trim().to_lowercase();
        let role_id = settings.role_id;

        let complete = !mentor_table.is_empty()
            && !remote_user_field.is_empty()
            && !remote_mentor_id_field.is_empty()
            && role_id != 0;
        let local_user_field = match settings.local_user_field {
            Some(field) if complete => field,
            _ => {
                trace.output("Mentor sync configuration not complete.", 0);
                trace.finished();
                return SyncStatus::NotConfigured;
            }
        };

        trace.output(
            &format!("Stale assignment policy: {}", settings.remove_action.as_str()),
            0,
        );

        let codec = TextCodec::new(&settings.db_encoding);

        let mut extdb = match ExtDb::connect(&settings.connection_config()).await {
            Ok(db) => db,
            Err(err) => {
                trace.output(
                    &format!("Error while communicating with external mentor database: {err}"),
                    0,
                );
                trace.finished();
                return SyncStatus::ConnectFailure;
            }
        };

        // A source that looks empty or broken must not drive removals.
        if settings.min_records > 0 {
            let count_sql = build_select(
                &mentor_table,
                &[],
                &["count(*)"],
                false,
                "",
                settings.quote_dialect(),
                &codec,
            );
            let count = match extdb.scalar_count(&count_sql).await {
                Ok(value) => value.unwrap_or(0),
                Err(err) => {
                    trace.output(
                        &format!("error: counting records in the external mentor table failed: {err}"),
                        1,
                    );
                    extdb.close().await;
                    trace.finished();
                    return SyncStatus::InsufficientRecords;
                }
            };
            if count <= settings.min_records as i64 {
                trace.output(
                    &format!(
                        "Failed to sync because the external db returned {count} records \
                         and the minimum required is {}",
                        settings.min_records
                    ),
                    0,
                );
                extdb.close().await;
                trace.finished();
                return SyncStatus::InsufficientRecords;
            }
        }

        trace.output("Indexing current mentor role assignments", 0);
        let mut current: HashMap<String, RoleAssignment> =
            match self.roles.user_context_assignments(role_id).await {
                Ok(assignments) => assignments
                    .into_iter()
                    .map(|a| (pair_key(a.mentor_id, a.student_id), a))
                    .collect(),
                Err(err) => {
                    trace.output(
                        &format!("error: loading current mentor role assignments failed: {err}"),
                        1,
                    );
                    extdb.close().await;
                    trace.finished();
                    return SyncStatus::StoreFailure;
                }
            };

        trace.output("Starting mentor database user sync", 0);
        let mut counters = RunCounters::default();
        let mut seen: HashSet<String> = HashSet::new();
        let sync_sql = format!("SELECT * FROM {mentor_table}");

        let stream_result = {
            let mut cursor = extdb.query_stream(&sync_sql);
            loop {
                let Some(item) = cursor.next().await else {
                    break Ok(());
                };
                let row = match item {
                    Ok(row) => row,
                    Err(err) => break Err(err),
                };
                let row = codec.decode_row(row.with_lowercase_keys());

                let student_value = row
                    .text(&remote_user_field)
                    .map(|v| v.trim().to_string())
                    .unwrap_or_default();
                let mentor_value = row
                    .text(&remote_mentor_id_field)
                    .map(|v| v.trim().to_string())
                    .unwrap_or_default();

                if student_value.is_empty() || mentor_value.is_empty() {
                    let rendered = serde_json::to_string(&row)
                        .unwrap_or_else(|_| "<unrenderable row>".to_string());
                    trace.output(
                        &format!(
                            "error: invalid external mentor record, user fields are mandatory: {rendered}"
                        ),
                        1,
                    );
                    counters.skipped += 1;
                    continue;
                }

                let row_desc = format!("{mentor_value} => {student_value}");

                let student = match self.users.find_user(local_user_field, &student_value).await {
                    Ok(Some(user)) => user,
                    Ok(None) => {
                        trace.output(
                            &format!(
                                "error: skipping '{row_desc}' due to unknown user {} '{student_value}'",
                                local_user_field.as_str()
                            ),
                            1,
                        );
                        counters.skipped += 1;
                        continue;
                    }
                    Err(err) => {
                        trace.output(
                            &format!("error: skipping '{row_desc}', user lookup failed: {err}"),
                            1,
                        );
                        counters.skipped += 1;
                        continue;
                    }
                };
                let mentor = match self.users.find_user(local_user_field, &mentor_value).await {
                    Ok(Some(user)) => user,
                    Ok(None) => {
                        trace.output(
                            &format!(
                                "error: skipping '{row_desc}' due to unknown user {} '{mentor_value}'",
                                local_user_field.as_str()
                            ),
                            1,
                        );
                        counters.skipped += 1;
                        continue;
                    }
                    Err(err) => {
                        trace.output(
                            &format!("error: skipping '{row_desc}', user lookup failed: {err}"),
                            1,
                        );
                        counters.skipped += 1;
                        continue;
                    }
                };

                let key = pair_key(mentor.id, student.id);
                if current.remove(&key).is_some() || seen.contains(&key) {
                    trace.output(
                        &format!("Mentor role already assigned: {key} (mentorid_studentid)"),
                        0,
                    );
                    counters.confirmed += 1;
                    seen.insert(key);
                    continue;
                }

                trace.output(&format!("Assigning a mentor role: {key} (mentorid_studentid)"), 0);
                match self.contexts.user_context(student.id).await {
                    Ok(context_id) => match self.roles.assign(role_id, mentor.id, context_id).await
                    {
                        Ok(()) => {
                            counters.assigned += 1;
                            seen.insert(key);
                        }
                        Err(err) => trace.output(
                            &format!("error: assigning mentor role for {key} failed: {err}"),
                            1,
                        ),
                    },
                    Err(err) => trace.output(
                        &format!("error: resolving user context for {key} failed: {err}"),
                        1,
                    ),
                }
            }
        };

        extdb.close().await;

        if let Err(err) = stream_result {
            // Abort without removals: an unreadable source says nothing
            // about which assignments are stale.
            trace.output(
                &format!("error: reading the external mentor table failed: {err}"),
                1,
            );
            trace.finished();
            return SyncStatus::ReadFailure;
        }

        // The unassignment pass runs regardless of the remove/keep
        // setting, as the job has always behaved.
        trace.output("Unassigning removed mentors", 0);
        for (key, stale) in current {
            trace.output(&format!("Unassigning: {key} (mentorid_studentid)"), 0);
            if let Err(err) = self
                .roles
                .unassign(role_id, stale.mentor_id, stale.context_id)
                .await
            {
                trace.output(
                    &format!("error: unassigning mentor role for {key} failed: {err}"),
                    1,
                );
                continue;
            }
            counters.removed += 1;
        }

        trace.output(
            &format!(
                "Mentor sync finished: {} assigned, {} already assigned, {} removed, {} skipped",
                counters.assigned, counters.confirmed, counters.removed, counters.skipped
            ),
            0,
        );
        trace.finished();
        SyncStatus::Success
    }
}

/// Outcome of the admin connectivity/shape probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticReport {
    TableNotConfigured,
    ConnectFailed(String),
    ReadFailed(String),
    EmptyTable,
    Columns(Vec<String>),
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticReport::TableNotConfigured => {
                write!(f, "External mentor table not specified.")
            }
            DiagnosticReport::ConnectFailed(reason) => {
                write!(f, "Cannot connect the database: {reason}")
            }
            DiagnosticReport::ReadFailed(reason) => {
                write!(f, "Cannot read the external mentor table: {reason}")
            }
            DiagnosticReport::EmptyTable => write!(f, "External mentor table is empty."),
            DiagnosticReport::Columns(columns) => write!(
                f,
                "External mentor table contains the following columns: {}",
                columns.join(", ")
            ),
        }
    }
}

/// Connectivity and table-shape probe used by the admin settings page,
/// independent of the reconciliation path. Driver debugging is forced on
/// for the probe's own connection; the caller's settings stay untouched.
pub async fn test_settings(settings: &SyncSettings) -> DiagnosticReport {
    let mentor_table = settings.mentor_table.trim().to_string();
    if mentor_table.is_empty() {
        return DiagnosticReport::TableNotConfigured;
    }

    let mut probe = settings.connection_config();
    probe.debug = true;

    let mut extdb = match ExtDb::connect(&probe).await {
        Ok(db) => db,
        Err(err) => return DiagnosticReport::ConnectFailed(err.to_string()),
    };

    let codec = TextCodec::new(&settings.db_encoding);
    let sql = build_select(
        &mentor_table,
        &[],
        &[],
        false,
        "",
        settings.quote_dialect(),
        &codec,
    );
    let result = extdb.query_rows(&sql).await;
    extdb.close().await;

    match result {
        Err(err) => DiagnosticReport::ReadFailed(err.to_string()),
        Ok(rows) => match rows.first() {
            None => DiagnosticReport::EmptyTable,
            Some(row) => DiagnosticReport::Columns(row.column_names()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentordb_core::BufferSink;
    use mentordb_store::MemDirectory;

    #[test]
    fn settings_defaults_match_the_admin_surface() {
        let settings = SyncSettings::default();
        assert_eq!(settings.db_encoding, "utf-8");
        assert_eq!(settings.min_records, 1);
        assert_eq!(settings.remove_action, RemovePolicy::Remove);
        assert_eq!(settings.connect_timeout_secs, 30);
        assert_eq!(settings.local_user_field, None);
        assert_eq!(settings.role_id, 0);
    }

    #[test]
    fn settings_deserialize_from_admin_store_key_names() {
        let settings: SyncSettings = serde_json::from_str(
            r#"{
                "dbtype": "mysql",
                "dbhost": "db.example.com",
                "dbuser": "sync",
                "dbpass": "secret",
                "dbname": "sis",
                "dbsybasequoting": true,
                "minrecords": 25,
                "remotementortable": "mentor_links",
                "remoteuserfield": "STUDENT_CODE",
                "remotementoridfield": "MENTOR_CODE",
                "localuserfield": "idnumber",
                "role": 9,
                "removeaction": "keep"
            }"#,
        )
        .expect("settings parse");
        assert_eq!(settings.db_type, "mysql");
        assert_eq!(settings.min_records, 25);
        assert_eq!(settings.local_user_field, Some(MatchField::IdNumber));
        assert_eq!(settings.remove_action, RemovePolicy::Keep);
        assert_eq!(settings.quote_dialect(), QuoteDialect::Sybase);
        // Untouched keys keep their defaults.
        assert_eq!(settings.db_encoding, "utf-8");
    }

    #[test]
    fn connection_config_trims_connection_essentials() {
        let settings = SyncSettings {
            db_type: " postgres ".into(),
            db_host: " db.example.com ".into(),
            db_user: "sync".into(),
            debug_db: true,
            ..SyncSettings::default()
        };
        let config = settings.connection_config();
        assert_eq!(config.driver, "postgres");
        assert_eq!(config.host, "db.example.com");
        assert!(config.debug);
        assert_eq!(config.connect_timeout_secs, 30);
    }

    #[test]
    fn diagnostic_report_renders_admin_notices() {
        assert_eq!(
            DiagnosticReport::EmptyTable.to_string(),
            "External mentor table is empty."
        );
        assert_eq!(
            DiagnosticReport::Columns(vec!["userid".into(), "mentorid".into()]).to_string(),
            "External mentor table contains the following columns: userid, mentorid"
        );
    }

    #[tokio::test]
    async fn missing_connection_settings_abort_silently() {
        let dir = MemDirectory::new();
        let settings = SyncSettings::default();
        let engine = SyncEngine::new(&settings, &dir, &dir, &dir);
        let mut sink = BufferSink::default();
        let status = engine.sync(&mut sink).await;
        assert_eq!(status, SyncStatus::NotConfigured);
        assert!(sink.lines.is_empty());
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn missing_mapping_settings_abort_with_a_message() {
        let dir = MemDirectory::new();
        let settings = SyncSettings {
            db_type: "sqlite".into(),
            db_host: ":memory:".into(),
            mentor_table: "mentor_links".into(),
            // local_user_field and role left unset
            remote_user_field: "userid".into(),
            remote_mentor_id_field: "mentorid".into(),
            ..SyncSettings::default()
        };
        let engine = SyncEngine::new(&settings, &dir, &dir, &dir);
        let mut sink = BufferSink::default();
        let status = engine.sync(&mut sink).await;
        assert_eq!(status, SyncStatus::NotConfigured);
        assert!(sink.contains("configuration not complete"));
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn unreachable_database_reports_connect_failure() {
        let dir = MemDirectory::new();
        let settings = SyncSettings {
            db_type: "sqlite".into(),
            db_host: "/nonexistent/path/mentors.db".into(),
            mentor_table: "mentor_links".into(),
            remote_user_field: "userid".into(),
            remote_mentor_id_field: "mentorid".into(),
            local_user_field: Some(MatchField::IdNumber),
            role_id: 5,
            ..SyncSettings::default()
        };
        let engine = SyncEngine::new(&settings, &dir, &dir, &dir);
        let mut sink = BufferSink::default();
        let status = engine.sync(&mut sink).await;
        assert_eq!(status, SyncStatus::ConnectFailure);
        assert!(sink.contains("Error while communicating with external mentor database"));
        assert!(sink.finished);
    }
}
