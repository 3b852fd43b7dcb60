//! End-to-end: event -> trigger -> task -> processor -> agent -> lifecycle
//! events, with the fake assistant standing in for the real program.

#![cfg(unix)]

mod common;

use std::time::Duration;

use foreman_core::Foreman;
use foreman_core::config::Settings;
use foreman_core::event_bus::EventStore;
use foreman_protocol::{EventKind, NewEvent, Task, TaskFilter, TaskStatus, task_metadata};
use serde_json::json;

fn settings(script: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.assistant = common::config(script);
    settings.processor.concurrency = 2;
    settings.processor.poll_interval_ms = 50;
    settings
}

async fn wait_for_terminal(foreman: &Foreman) -> Vec<Task> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let tasks = foreman.queue().list(&TaskFilter::default()).await;
        if !tasks.is_empty() && tasks.iter().all(|t| t.status.is_terminal()) {
            return tasks;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tasks did not finish: {:?}",
            tasks
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_code_event_runs_reviewer() {
    let dir = tempfile::tempdir().unwrap();
    let message_file = dir.path().join("message.txt");
    let body = format!(
        "for last in \"$@\"; do :; done\nprintf '%s' \"$last\" > '{}'\n{}",
        message_file.display(),
        common::SUCCESS_STREAM
    );
    let script = common::write_script(dir.path(), &body);

    let foreman = Foreman::from_settings(settings(&script)).await.unwrap();
    foreman
        .registry()
        .register_agent(common::definition("reviewer", &[("code.*", "review")]))
        .await
        .unwrap();
    foreman.start().await.unwrap();

    foreman
        .publish(
            NewEvent::new("code.file.changed", "watcher")
                .project("proj")
                .workspace("ws")
                .payload(json!({ "path": "src/main.rs", "cwd": dir.path() })),
        )
        .await;

    let tasks = wait_for_terminal(&foreman).await;
    foreman.shutdown().await;

    // Lifecycle events published while running must not spawn more tasks
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.agent_id.as_deref(), Some("reviewer"));
    assert_eq!(
        task.metadata_str(task_metadata::CWD),
        Some(dir.path().to_str().unwrap())
    );

    let message = std::fs::read_to_string(&message_file).unwrap();
    assert!(message.starts_with("Action: review"));
    assert!(message.contains("code.file.changed"));

    let kinds: Vec<_> = foreman
        .bus()
        .bus()
        .history(None)
        .into_iter()
        .map(|e| e.kind)
        .collect();
    for kind in [
        "code.file.changed",
        EventKind::TASK_CREATED,
        EventKind::TASK_STARTED,
        EventKind::AGENT_STARTED,
        EventKind::AGENT_PROGRESS,
        EventKind::AGENT_COMPLETED,
        EventKind::TASK_COMPLETED,
    ] {
        assert!(kinds.iter().any(|k| k == kind), "missing {} in {:?}", kind, kinds);
    }
    let started = kinds.iter().position(|k| k == EventKind::TASK_STARTED).unwrap();
    let completed = kinds.iter().position(|k| k == EventKind::TASK_COMPLETED).unwrap();
    assert!(started < completed);

    // Every event reached the store and the trigger acknowledged each one
    let stored = foreman.bus().recent_events(100).await.unwrap();
    assert_eq!(stored.len(), kinds.len());
    assert!(foreman.bus().store().find_unprocessed(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_agent_marks_task_failed() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(dir.path(), "echo 'boom' >&2\nexit 1");

    let foreman = Foreman::from_settings(settings(&script)).await.unwrap();
    foreman
        .registry()
        .register_agent(common::definition("builder", &[("build.*", "fix")]))
        .await
        .unwrap();
    foreman.start().await.unwrap();

    foreman
        .publish(NewEvent::new("build.failed", "ci").project("proj"))
        .await;

    let tasks = wait_for_terminal(&foreman).await;
    foreman.shutdown().await;

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert!(tasks[0].metadata_str(task_metadata::ERROR).unwrap().contains("boom"));

    let kinds: Vec<_> = foreman
        .bus()
        .bus()
        .history(None)
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.iter().any(|k| k == EventKind::TASK_FAILED));
    assert!(kinds.iter().any(|k| k == EventKind::AGENT_ERROR));
    assert!(!kinds.iter().any(|k| k == EventKind::TASK_COMPLETED));
}

#[tokio::test]
async fn test_cancel_running_task() {
    let dir = tempfile::tempdir().unwrap();
    let script = common::write_script(dir.path(), common::HANGING_STREAM);

    let foreman = Foreman::from_settings(settings(&script)).await.unwrap();
    foreman
        .registry()
        .register_agent(common::definition("slow", &[("code.*", "review")]))
        .await
        .unwrap();
    foreman.start().await.unwrap();

    foreman
        .publish(
            NewEvent::new("code.file.changed", "watcher")
                .project("proj")
                .payload(json!({ "cwd": dir.path() })),
        )
        .await;

    // Wait for the process to stream its first line
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let task_id = loop {
        let streaming = foreman
            .bus()
            .bus()
            .history(None)
            .iter()
            .any(|e| e.kind == EventKind::AGENT_PROGRESS);
        let running = foreman.handler().running_tasks();
        if streaming && running.len() == 1 {
            break running[0];
        }
        assert!(tokio::time::Instant::now() < deadline, "task never started streaming");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert!(foreman
        .handler()
        .cancel_task(task_id, Some("user requested".to_string())));

    let tasks = wait_for_terminal(&foreman).await;
    foreman.shutdown().await;

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task_id);
    assert_eq!(tasks[0].status, TaskStatus::Canceled);
    assert!(tasks[0]
        .metadata_str(task_metadata::ERROR)
        .unwrap()
        .contains("user requested"));
    assert!(!foreman.handler().is_task_running(task_id));

    let history = foreman.bus().bus().history(None);
    let count = |kind: &str| history.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::TASK_CANCELLED), 1);
    assert_eq!(count(EventKind::TASK_FAILED), 0);
    assert_eq!(count(EventKind::TASK_COMPLETED), 0);

    let cancelled = history
        .iter()
        .find(|e| e.kind == EventKind::TASK_CANCELLED)
        .unwrap();
    assert_eq!(cancelled.payload["taskId"], task_id.to_string());
    assert_eq!(cancelled.payload["reason"], "user requested");
}
