//! Database initialization
//!
//! Creates the database file on first run, applies connection pragmas and
//! creates every table idempotently. Safe to call on an existing database.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 2;

/// Content-type tags seeded into `content_weights` with weight 1.0
pub const CONTENT_TYPES: [&str; 6] = [
    "SUBSECTION_TEXT",
    "SUBSECTION_PDF",
    "SUBSECTION_VIDEO",
    "TEST_HINTED",
    "TEST_SECTION_FINAL",
    "TEST_GLOBAL_FINAL",
];

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    // WAL lets progress reads proceed while a heartbeat commit holds the writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema_version_table(&pool).await?;
    create_settings_table(&pool).await?;

    // Content hierarchy
    create_topics_table(&pool).await?;
    create_sections_table(&pool).await?;
    create_subsections_table(&pool).await?;
    create_tests_table(&pool).await?;
    create_test_questions_table(&pool).await?;
    create_content_weights_table(&pool).await?;

    // Group-based access
    create_groups_table(&pool).await?;
    create_group_students_table(&pool).await?;
    create_group_topics_table(&pool).await?;

    // Engine-owned state
    create_subsection_progress_table(&pool).await?;
    create_section_progress_table(&pool).await?;
    create_topic_progress_table(&pool).await?;
    create_test_attempts_table(&pool).await?;
    create_activity_sessions_table(&pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&pool)
        .await?;

    for content_type in CONTENT_TYPES {
        ensure_content_weight(&pool, content_type, 1.0).await?;
    }

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_topics_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            is_archived INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_sections_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sections (
            id INTEGER PRIMARY KEY,
            topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            weight REAL NOT NULL DEFAULT 1.0,
            is_archived INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sections_topic ON sections(topic_id, position)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_subsections_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsections (
            id INTEGER PRIMARY KEY,
            section_id INTEGER NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('TEXT', 'PDF', 'VIDEO', 'PRESENTATION')),
            position INTEGER NOT NULL DEFAULT 0,
            min_time_seconds INTEGER,
            weight REAL,
            is_archived INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_subsections_section ON subsections(section_id, position)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_tests_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tests (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('HINTED', 'SECTION_FINAL', 'GLOBAL_FINAL')),
            section_id INTEGER REFERENCES sections(id) ON DELETE CASCADE,
            topic_id INTEGER REFERENCES topics(id) ON DELETE CASCADE,
            passing_score REAL NOT NULL DEFAULT 60.0,
            required_completion REAL,
            duration_minutes INTEGER,
            max_attempts INTEGER,
            is_archived INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_test_questions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_questions (
            id INTEGER PRIMARY KEY,
            test_id INTEGER NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
            position INTEGER NOT NULL DEFAULT 0,
            question_type TEXT NOT NULL
                CHECK (question_type IN ('SINGLE_CHOICE', 'MULTIPLE_CHOICE', 'OPEN_TEXT')),
            correct_answer TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_content_weights_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_weights (
            content_type TEXT PRIMARY KEY,
            weight REAL NOT NULL DEFAULT 1.0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_groups_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            is_archived INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_group_students_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_students (
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL,
            is_archived INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (group_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_group_topics_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_topics (
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
            is_archived INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (group_id, topic_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_subsection_progress_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subsection_progress (
            user_id INTEGER NOT NULL,
            subsection_id INTEGER NOT NULL REFERENCES subsections(id) ON DELETE CASCADE,
            status TEXT NOT NULL CHECK (status IN ('STARTED', 'IN_PROGRESS', 'COMPLETED')),
            time_spent_seconds REAL NOT NULL DEFAULT 0,
            flagged_seconds REAL NOT NULL DEFAULT 0,
            completion_percentage REAL NOT NULL DEFAULT 0
                CHECK (completion_percentage >= 0 AND completion_percentage <= 100),
            last_activity_at TEXT,
            completed_at TEXT,
            PRIMARY KEY (user_id, subsection_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_section_progress_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS section_progress (
            user_id INTEGER NOT NULL,
            section_id INTEGER NOT NULL REFERENCES sections(id) ON DELETE CASCADE,
            status TEXT NOT NULL CHECK (status IN ('STARTED', 'IN_PROGRESS', 'COMPLETED')),
            completion_percentage REAL NOT NULL DEFAULT 0
                CHECK (completion_percentage >= 0 AND completion_percentage <= 100),
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, section_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_topic_progress_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topic_progress (
            user_id INTEGER NOT NULL,
            topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
            status TEXT NOT NULL CHECK (status IN ('STARTED', 'IN_PROGRESS', 'COMPLETED')),
            completion_percentage REAL NOT NULL DEFAULT 0
                CHECK (completion_percentage >= 0 AND completion_percentage <= 100),
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, topic_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_test_attempts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS test_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            test_id INTEGER NOT NULL REFERENCES tests(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('STARTED', 'IN_PROGRESS', 'COMPLETED', 'FAILED', 'EXPIRED')),
            started_at TEXT NOT NULL,
            expires_at TEXT,
            last_activity_at TEXT NOT NULL,
            auto_extend_count INTEGER NOT NULL DEFAULT 0,
            answers TEXT NOT NULL DEFAULT '{}',
            score REAL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_test_attempts_user_test ON test_attempts(user_id, test_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_test_attempts_status ON test_attempts(status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_activity_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activity_sessions (
            session_id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            subsection_id INTEGER NOT NULL REFERENCES subsections(id) ON DELETE CASCADE,
            started_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL,
            ended_at TEXT,
            end_reason TEXT CHECK (end_reason IN ('CLOSED', 'TIMED_OUT', 'ROLLED_OVER')),
            accumulated_seconds REAL NOT NULL DEFAULT 0,
            flagged_seconds REAL NOT NULL DEFAULT 0,
            heartbeat_count INTEGER NOT NULL DEFAULT 0,
            is_suspicious INTEGER NOT NULL DEFAULT 0,
            interval_stddev REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_activity_sessions_user_subsection \
         ON activity_sessions(user_id, subsection_id, started_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_activity_sessions_suspicious \
         ON activity_sessions(is_suspicious) WHERE is_suspicious = 1",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Seed a content weight row if absent; existing administrator values are kept
async fn ensure_content_weight(pool: &SqlitePool, content_type: &str, weight: f64) -> Result<()> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO content_weights (content_type, weight) VALUES (?, ?)",
    )
    .bind(content_type)
    .bind(weight)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        info!(
            "Initialized content weight '{}' with default value: {}",
            content_type, weight
        );
    }

    Ok(())
}
