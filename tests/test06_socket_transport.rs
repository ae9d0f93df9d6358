use std::time::Duration;

use sqlite_sidecar::{Connector, RowValues, SidecarError, TransportMode};

fn socket_connector() -> Connector {
    Connector::builder()
        .worker_path(env!("CARGO_BIN_EXE_sqlite-sidecar-worker"))
        .transport(TransportMode::Socket)
        .finish()
}

#[tokio::test]
async fn socket_transport_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let conn = socket_connector().open(":memory:", None).await?;

    conn.exec("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v BLOB)")
        .await?;
    let inserted = conn
        .query(
            "INSERT INTO t (v) VALUES (?)",
            [RowValues::Blob(vec![0x00, 0xfe, 0xff])],
        )
        .await?;
    assert_eq!(inserted.insert_id, 1);

    let result = conn.query("SELECT v FROM t", ()).await?;
    assert_eq!(
        result.rows[0].get("v"),
        Some(&RowValues::Blob(vec![0x00, 0xfe, 0xff]))
    );
    conn.quit().await?;
    Ok(())
}

#[tokio::test]
async fn quit_over_socket_completes_cleanly() -> Result<(), Box<dyn std::error::Error>> {
    let conn = socket_connector().open(":memory:", None).await?;
    let result = conn.query("SELECT 1 AS v", ()).await?;
    assert_eq!(result.rows[0].get("v"), Some(&RowValues::Int(1)));

    conn.quit().await?;
    assert!(conn.closed().await.is_none());
    Ok(())
}

#[tokio::test]
async fn soft_errors_work_over_socket() -> Result<(), Box<dyn std::error::Error>> {
    let conn = socket_connector().open(":memory:", None).await?;

    assert!(matches!(
        conn.query("nope", ()).await,
        Err(SidecarError::Sqlite { .. })
    ));
    let result = conn.query("SELECT 2 AS v", ()).await?;
    assert_eq!(result.rows[0].get("v"), Some(&RowValues::Int(2)));

    conn.quit().await?;
    Ok(())
}

// A child that never connects back must fail the open within the
// handshake window and not hang it.
#[cfg(unix)]
#[tokio::test]
async fn handshake_timeout_fails_the_open() {
    let connector = Connector::builder()
        .worker_path("/bin/sleep")
        .transport(TransportMode::Socket)
        .handshake_timeout(Duration::from_millis(250))
        .finish();

    let started = std::time::Instant::now();
    let err = connector
        .open(":memory:", None)
        .await
        .expect_err("handshake cannot complete");
    assert!(matches!(err, SidecarError::HandshakeTimeout), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn missing_worker_binary_fails_the_spawn() {
    let connector = Connector::builder()
        .worker_path("/nonexistent/sqlite-sidecar-worker")
        .finish();

    let err = connector
        .open(":memory:", None)
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, SidecarError::Spawn(_)), "got {err:?}");
}
