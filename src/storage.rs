//! SQLite storage layer for runs and users.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use std::path::Path;
use std::sync::Arc;

use crate::models::{Run, RunData, RunWithUser, User, UserInfo};

/// Storage manager for run data.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Create a new storage instance.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&db_url).await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Initialize the database schema.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                username TEXT NOT NULL UNIQUE,
                display_username TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&*self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                data TEXT NOT NULL,
                image TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE SET NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at)")
            .execute(&*self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_user_id ON runs(user_id)")
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Check that the database answers.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&*self.pool).await.is_ok()
    }

    /// Insert a user account. Accounts are owned by the auth service; this is
    /// only used to seed test databases.
    #[cfg(test)]
    pub async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name, username, display_username) VALUES (?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.username)
        .bind(&user.display_username)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Store a new run and return it.
    pub async fn save_run(&self, user_id: Option<&str>, data: RunData, image: &str) -> Result<Run> {
        let run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.map(str::to_string),
            data,
            image: image.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO runs (id, user_id, data, image, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.user_id)
        .bind(serde_json::to_string(&run.data)?)
        .bind(&run.image)
        .bind(run.created_at.to_rfc3339())
        .execute(&*self.pool)
        .await?;

        Ok(run)
    }

    /// All runs with their owners, newest first.
    pub async fn list_runs_with_users(&self) -> Result<Vec<RunWithUser>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.user_id, r.data, r.image, r.created_at,
                   u.name AS user_name, u.username AS user_username
            FROM runs r
            LEFT JOIN users u ON u.id = r.user_id
            ORDER BY r.created_at DESC
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        let runs = rows
            .iter()
            .filter_map(|row| match self.row_to_run(row) {
                Ok(run) => Some(run),
                Err(e) => {
                    tracing::warn!("Skipping unreadable run row: {}", e);
                    None
                }
            })
            .collect();

        Ok(runs)
    }

    /// Link a run to a user. Returns false if the run does not exist.
    pub async fn update_run_user(&self, run_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE runs SET user_id = ? WHERE id = ?")
            .bind(user_id)
            .bind(run_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a run. Returns false if the run does not exist.
    pub async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Case-insensitive substring search over name, username and display username.
    /// A negative limit is treated as zero.
    pub async fn search_users(&self, query: &str, limit: i64) -> Result<Vec<User>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let pattern = format!("%{}%", query.to_lowercase());
        let rows = sqlx::query(
            r#"
            SELECT id, name, username, display_username FROM users
            WHERE lower(name) LIKE ?
               OR lower(username) LIKE ?
               OR lower(COALESCE(display_username, '')) LIKE ?
            ORDER BY username
            LIMIT ?
            "#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit.max(0))
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| User {
                id: row.get("id"),
                name: row.get("name"),
                username: row.get("username"),
                display_username: row.get("display_username"),
            })
            .collect())
    }

    fn row_to_run(&self, row: &sqlx::sqlite::SqliteRow) -> Result<RunWithUser> {
        let data_json: String = row.get("data");
        let created_at_str: String = row.get("created_at");
        let user_id: Option<String> = row.get("user_id");
        let user_name: Option<String> = row.get("user_name");
        let user_username: Option<String> = row.get("user_username");

        let user = match (&user_id, user_name, user_username) {
            (Some(id), Some(name), Some(username)) => Some(UserInfo {
                id: id.clone(),
                name,
                username,
            }),
            _ => None,
        };

        Ok(RunWithUser {
            id: row.get("id"),
            user_id,
            data: serde_json::from_str(&data_json)?,
            image: row.get("image"),
            created_at: DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc),
            user,
        })
    }
}
