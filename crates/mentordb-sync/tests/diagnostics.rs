//! Admin "test settings" probe against scratch sqlite databases.

use mentordb_sync::{test_settings, DiagnosticReport, SyncSettings};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;

async fn sqlite_db(dir: &tempfile::TempDir, ddl: &str) -> String {
    let path = dir.path().join("probe.db");
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .expect("create probe db");
    if !ddl.is_empty() {
        sqlx::raw_sql(ddl).execute(&mut conn).await.expect("seed ddl");
    }
    conn.close().await.expect("close seed connection");
    path.display().to_string()
}

fn settings(path: &str, table: &str) -> SyncSettings {
    SyncSettings {
        db_type: "sqlite".into(),
        db_host: path.into(),
        mentor_table: table.into(),
        ..SyncSettings::default()
    }
}

#[tokio::test]
async fn missing_table_name_is_reported_before_connecting() {
    let report = test_settings(&settings("/nonexistent/never-touched.db", " ")).await;
    assert_eq!(report, DiagnosticReport::TableNotConfigured);
}

#[tokio::test]
async fn unreachable_database_is_a_connect_failure() {
    let report = test_settings(&settings("/nonexistent/never-there.db", "mentor_links")).await;
    assert!(matches!(report, DiagnosticReport::ConnectFailed(_)));
}

#[tokio::test]
async fn missing_table_is_a_read_failure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = sqlite_db(&tmp, "").await;
    let report = test_settings(&settings(&path, "mentor_links")).await;
    assert!(matches!(report, DiagnosticReport::ReadFailed(_)));
}

#[tokio::test]
async fn empty_table_is_called_out() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = sqlite_db(&tmp, "CREATE TABLE mentor_links (USERID TEXT, MENTORID TEXT)").await;
    let report = test_settings(&settings(&path, "mentor_links")).await;
    assert_eq!(report, DiagnosticReport::EmptyTable);
}

#[tokio::test]
async fn populated_table_reports_its_columns() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = sqlite_db(
        &tmp,
        "CREATE TABLE mentor_links (USERID TEXT, MENTORID TEXT, site TEXT);
         INSERT INTO mentor_links VALUES ('s1', 'm1', 'north');",
    )
    .await;
    let report = test_settings(&settings(&path, "mentor_links")).await;
    assert_eq!(
        report,
        DiagnosticReport::Columns(vec!["USERID".into(), "MENTORID".into(), "site".into()])
    );
}
