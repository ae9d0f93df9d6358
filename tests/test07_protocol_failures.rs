#![cfg(unix)]

// Misbehaving workers, simulated with shell stand-ins, to pin down the
// terminal failure paths: malformed frames, unknown correlation ids,
// id-less stream errors, and plain worker death.

use std::path::PathBuf;

use sqlite_sidecar::{Connector, SidecarError};
use tempfile::TempDir;

fn fake_worker(script_body: &str) -> (TempDir, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fake-worker.sh");
    std::fs::write(&path, script_body).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    (dir, path)
}

fn connector_for(path: &PathBuf) -> Connector {
    Connector::builder().worker_path(path).finish()
}

#[tokio::test]
async fn malformed_frame_fails_the_open_with_a_protocol_error() {
    let (_dir, path) = fake_worker("#!/bin/sh\necho garbage\nsleep 5\n");
    let err = connector_for(&path)
        .open(":memory:", None)
        .await
        .expect_err("garbage output must fail the open");
    assert!(matches!(err, SidecarError::Protocol(_)), "got {err:?}");
}

#[tokio::test]
async fn unknown_correlation_id_is_invalid_message() {
    let (_dir, path) = fake_worker("#!/bin/sh\necho '{\"id\":999,\"result\":null}'\nsleep 5\n");
    let err = connector_for(&path)
        .open(":memory:", None)
        .await
        .expect_err("unknown id must be fatal");
    assert!(matches!(err, SidecarError::InvalidMessage), "got {err:?}");
    assert_eq!(err.to_string(), "Invalid message received");
}

#[tokio::test]
async fn idless_error_frame_is_invalid_message() {
    let (_dir, path) = fake_worker(
        "#!/bin/sh\nread line\necho '{\"error\":{\"code\":-32600,\"message\":\"bad envelope\"}}'\nsleep 5\n",
    );
    let err = connector_for(&path)
        .open(":memory:", None)
        .await
        .expect_err("terminal frame must be fatal");
    assert!(matches!(err, SidecarError::InvalidMessage), "got {err:?}");
}

#[tokio::test]
async fn garbage_after_open_surfaces_on_the_close_signal() {
    // Answers the open correctly (the dispatcher's first id is 1), then
    // corrupts the stream.
    let (_dir, path) = fake_worker(
        "#!/bin/sh\nread line\necho '{\"id\":1,\"result\":null}'\necho garbage\nsleep 5\n",
    );
    let conn = connector_for(&path)
        .open(":memory:", None)
        .await
        .expect("open must succeed before the stream corrupts");

    let fatal = conn.closed().await.expect("a fatal error must be attached");
    assert!(matches!(*fatal, SidecarError::Protocol(_)), "got {fatal:?}");

    // Class-3 failures reject everything afterwards.
    assert!(matches!(
        conn.query("SELECT 1", ()).await,
        Err(SidecarError::Closed)
    ));
}

#[tokio::test]
async fn instant_worker_death_closes_without_an_error() {
    let (_dir, path) = fake_worker("#!/bin/sh\nexit 0\n");
    let err = connector_for(&path)
        .open(":memory:", None)
        .await
        .expect_err("the open cannot complete");
    assert!(matches!(err, SidecarError::Closed), "got {err:?}");
}
