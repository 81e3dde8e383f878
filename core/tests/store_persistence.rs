#![expect(clippy::unwrap_used, clippy::expect_used)]

//! Exercises `Store` persistence the way a real process restart would:
//! snapshot to disk, drop the in-memory instance, build a fresh one against
//! the same state path, and check what comes back. Grounded on the
//! teacher's rollout persistence tests, which check the on-disk shape
//! survives a reload rather than just unit-testing the in-memory mutation.

use safeshell_core::store::{ShellDefaults, Store};

#[tokio::test]
async fn restore_recovers_completed_script_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let store = Store::new(Some(state_path.clone()));
    let shell = store.create(ShellDefaults::default()).await.unwrap();
    let script_id = store
        .begin_script(&shell.id, "console.log(1)".to_string(), None, false)
        .await
        .unwrap();
    store
        .append_output(&shell.id, &script_id, b"hello\n", b"")
        .await
        .unwrap();
    store
        .complete_script(
            &shell.id,
            &script_id,
            safeshell_core::store::ScriptStatus::Completed,
            Some(0),
        )
        .await
        .unwrap();
    store.snapshot().await.unwrap();

    let restored = Store::new(Some(state_path));
    restored.restore().await.unwrap();

    let view = restored.get(&shell.id).await.unwrap();
    assert_eq!(view.id, shell.id);

    let script = restored.get_script(&shell.id, &script_id).await.unwrap();
    assert_eq!(script.status, safeshell_core::store::ScriptStatus::Completed);
    assert_eq!(script.exit_code, Some(0));
    assert_eq!(script.stdout, "hello\n");
}

#[tokio::test]
async fn restore_marks_stale_running_script_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let store = Store::new(Some(state_path.clone()));
    let shell = store.create(ShellDefaults::default()).await.unwrap();
    // A pid this high is virtually guaranteed not to belong to a live
    // process on the machine running the test.
    store
        .begin_script(&shell.id, "sleep 100".to_string(), Some(u32::MAX - 1), true)
        .await
        .unwrap();
    store.snapshot().await.unwrap();

    let restored = Store::new(Some(state_path));
    restored.restore().await.unwrap();

    let scripts = restored.list_scripts(&shell.id, &Default::default()).await.unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].status, safeshell_core::store::ScriptStatus::Failed);
    assert_eq!(scripts[0].exit_code, Some(-1));
}

#[tokio::test]
async fn restore_ignores_state_from_a_newer_schema_version() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    tokio::fs::write(
        &state_path,
        r#"{"schema_version": 999999, "shells": []}"#,
    )
    .await
    .unwrap();

    let store = Store::new(Some(state_path));
    store.restore().await.unwrap();
    assert!(store.list().await.is_empty());
}

#[tokio::test]
async fn restore_with_no_state_file_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("does-not-exist.json");

    let store = Store::new(Some(state_path));
    store.restore().await.unwrap();
    assert!(store.list().await.is_empty());
}
