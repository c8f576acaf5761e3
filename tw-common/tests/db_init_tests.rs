//! Database initialization and settings table tests

use tempfile::TempDir;
use tw_common::db::{get_setting, init_database, set_setting};

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nested").join("testwise.db");
    assert!(!db_path.exists());

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("testwise.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
}

#[tokio::test]
async fn test_content_weights_seeded_once() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("testwise.db");
    let pool = init_database(&db_path).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_weights")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 6);

    // Administrator change survives re-initialization
    sqlx::query("UPDATE content_weights SET weight = 3.0 WHERE content_type = 'SUBSECTION_VIDEO'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let pool = init_database(&db_path).await.unwrap();
    let weight: f64 = sqlx::query_scalar(
        "SELECT weight FROM content_weights WHERE content_type = 'SUBSECTION_VIDEO'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(weight, 3.0);
}

#[tokio::test]
async fn test_settings_round_trip_and_parse_errors() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("testwise.db")).await.unwrap();

    assert_eq!(get_setting::<f64>(&pool, "section_completion_threshold").await.unwrap(), None);

    set_setting(&pool, "section_completion_threshold", 75.5).await.unwrap();
    assert_eq!(
        get_setting::<f64>(&pool, "section_completion_threshold").await.unwrap(),
        Some(75.5)
    );

    set_setting(&pool, "section_completion_threshold", "eighty").await.unwrap();
    let err = get_setting::<f64>(&pool, "section_completion_threshold").await.unwrap_err();
    assert!(matches!(err, tw_common::Error::Config(_)));
}

#[tokio::test]
async fn test_activity_sessions_table_checks_end_reason() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("testwise.db")).await.unwrap();

    sqlx::query("INSERT INTO topics (title) VALUES ('Rust')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO sections (topic_id, title, position, weight) VALUES (1, 'S', 0, 1.0)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO subsections (section_id, title, kind, position) VALUES (1, 'P', 'TEXT', 0)")
        .execute(&pool)
        .await
        .unwrap();

    let insert = |reason: &'static str| {
        sqlx::query(
            "INSERT INTO activity_sessions (session_id, user_id, subsection_id, started_at, \
             last_activity_at, end_reason) VALUES (?, 1, 1, '2024-01-01T00:00:00Z', \
             '2024-01-01T00:00:00Z', ?)",
        )
        .bind(format!("session-{}", reason))
        .bind(reason)
    };

    assert!(insert("CLOSED").execute(&pool).await.is_ok());
    assert!(insert("VANISHED").execute(&pool).await.is_err());
}
