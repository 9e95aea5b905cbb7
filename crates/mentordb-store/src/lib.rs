//! Host-side directories for mentordb: the local identity and
//! authorization stores the reconciliation engine mutates, as a
//! Postgres-backed implementation plus an in-memory one for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use mentordb_core::{LocalUser, MatchField, RoleAssigner, RoleAssignment, UserContextResolver, UserLookup};

pub const CRATE_NAME: &str = "mentordb-store";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id       BIGSERIAL PRIMARY KEY,
    idnumber TEXT NOT NULL DEFAULT '',
    email    TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS user_contexts (
    id      BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS role_assignments (
    id         BIGSERIAL PRIMARY KEY,
    role_id    BIGINT NOT NULL,
    user_id    BIGINT NOT NULL,
    context_id BIGINT NOT NULL,
    UNIQUE (role_id, user_id, context_id)
);
";

/// Postgres-backed directory over `users`, `user_contexts` and
/// `role_assignments`.
#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to local directory database")?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("applying directory schema")?;
        Ok(())
    }
}

#[async_trait]
impl UserLookup for PgDirectory {
    async fn find_user(&self, field: MatchField, value: &str) -> Result<Option<LocalUser>> {
        let row = match field {
            MatchField::Id => {
                let Ok(id) = value.parse::<i64>() else {
                    return Ok(None);
                };
                sqlx::query("SELECT id FROM users WHERE id = $1 LIMIT 1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            // Ties are resolved arbitrarily; the first match wins.
            _ => {
                let sql = format!("SELECT id FROM users WHERE {} = $1 LIMIT 1", field.as_str());
                sqlx::query(&sql)
                    .bind(value)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        match row {
            Some(row) => Ok(Some(LocalUser { id: row.try_get("id")? })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl UserContextResolver for PgDirectory {
    async fn user_context(&self, user_id: i64) -> Result<i64> {
        if let Some(row) = sqlx::query("SELECT id FROM user_contexts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.try_get("id")?);
        }
        let row = sqlx::query(
            "INSERT INTO user_contexts (user_id) VALUES ($1)
             ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
             RETURNING id",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }
}

#[async_trait]
impl RoleAssigner for PgDirectory {
    async fn user_context_assignments(&self, role_id: i64) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query(
            "SELECT ra.user_id AS mentor_id, uc.user_id AS student_id, ra.context_id
             FROM role_assignments ra
             INNER JOIN user_contexts uc ON uc.id = ra.context_id
             WHERE ra.role_id = $1",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RoleAssignment {
                    mentor_id: row.try_get("mentor_id")?,
                    student_id: row.try_get("student_id")?,
                    context_id: row.try_get("context_id")?,
                })
            })
            .collect()
    }

    async fn assign(&self, role_id: i64, user_id: i64, context_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO role_assignments (role_id, user_id, context_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (role_id, user_id, context_id) DO NOTHING",
        )
        .bind(role_id)
        .bind(user_id)
        .bind(context_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unassign(&self, role_id: i64, user_id: i64, context_id: i64) -> Result<()> {
        sqlx::query(
            "DELETE FROM role_assignments
             WHERE role_id = $1 AND user_id = $2 AND context_id = $3",
        )
        .bind(role_id)
        .bind(user_id)
        .bind(context_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// One seedable local account for the in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct MemUser {
    pub id: i64,
    pub idnumber: String,
    pub email: String,
    pub username: String,
}

#[derive(Debug, Default)]
struct MemState {
    users: Vec<MemUser>,
    contexts: HashMap<i64, i64>,
    context_owners: HashMap<i64, i64>,
    next_context_id: i64,
    assignments: HashSet<(i64, i64, i64)>,
}

/// In-memory directory with the same contract as [`PgDirectory`].
#[derive(Debug, Default)]
pub struct MemDirectory {
    state: Mutex<MemState>,
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: MemUser) {
        self.state.lock().expect("directory lock").users.push(user);
    }

    pub fn assignment_count(&self) -> usize {
        self.state.lock().expect("directory lock").assignments.len()
    }

    /// (role, mentor, context) triples, unordered.
    pub fn assignments(&self) -> Vec<(i64, i64, i64)> {
        self.state
            .lock()
            .expect("directory lock")
            .assignments
            .iter()
            .copied()
            .collect()
    }

    pub fn has_assignment(&self, role_id: i64, mentor_id: i64, student_id: i64) -> bool {
        let state = self.state.lock().expect("directory lock");
        match state.contexts.get(&student_id) {
            Some(context_id) => state.assignments.contains(&(role_id, mentor_id, *context_id)),
            None => false,
        }
    }

    /// Pre-existing assignment, as if created by an earlier run.
    pub fn seed_assignment(&self, role_id: i64, mentor_id: i64, student_id: i64) {
        let mut state = self.state.lock().expect("directory lock");
        let context_id = context_for(&mut state, student_id);
        state.assignments.insert((role_id, mentor_id, context_id));
    }
}

fn context_for(state: &mut MemState, user_id: i64) -> i64 {
    if let Some(context_id) = state.contexts.get(&user_id) {
        return *context_id;
    }
    state.next_context_id += 1;
    let context_id = state.next_context_id;
    state.contexts.insert(user_id, context_id);
    state.context_owners.insert(context_id, user_id);
    context_id
}

#[async_trait]
impl UserLookup for MemDirectory {
    async fn find_user(&self, field: MatchField, value: &str) -> Result<Option<LocalUser>> {
        let state = self.state.lock().expect("directory lock");
        let found = state.users.iter().find(|user| match field {
            MatchField::Id => user.id.to_string() == value,
            MatchField::IdNumber => user.idnumber == value,
            MatchField::Email => user.email == value,
            MatchField::Username => user.username == value,
        });
        Ok(found.map(|user| LocalUser { id: user.id }))
    }
}

#[async_trait]
impl UserContextResolver for MemDirectory {
    async fn user_context(&self, user_id: i64) -> Result<i64> {
        let mut state = self.state.lock().expect("directory lock");
        Ok(context_for(&mut state, user_id))
    }
}

#[async_trait]
impl RoleAssigner for MemDirectory {
    async fn user_context_assignments(&self, role_id: i64) -> Result<Vec<RoleAssignment>> {
        let state = self.state.lock().expect("directory lock");
        Ok(state
            .assignments
            .iter()
            .filter(|(role, _, _)| *role == role_id)
            .filter_map(|(_, mentor_id, context_id)| {
                state.context_owners.get(context_id).map(|student_id| RoleAssignment {
                    mentor_id: *mentor_id,
                    student_id: *student_id,
                    context_id: *context_id,
                })
            })
            .collect())
    }

    async fn assign(&self, role_id: i64, user_id: i64, context_id: i64) -> Result<()> {
        let mut state = self.state.lock().expect("directory lock");
        state.assignments.insert((role_id, user_id, context_id));
        Ok(())
    }

    async fn unassign(&self, role_id: i64, user_id: i64, context_id: i64) -> Result<()> {
        let mut state = self.state.lock().expect("directory lock");
        state.assignments.remove(&(role_id, user_id, context_id));
        Ok(())
    }
}
