//! Conversation store and repo lock integration tests.

use serde_json::json;

use spritedock::convo::{ExecutionSessionStatus, MessageKind, NewMessage};
use spritedock::repo::LockError;
use spritedock::task::TaskStatus;

mod common;
use common::fixture;

// ========== Execution sessions ==========

#[tokio::test]
async fn started_session_has_no_end_and_is_unique_per_task() {
    let fx = fixture().await;
    let task = fx.task().await;

    let session = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap();
    assert_eq!(session.status, ExecutionSessionStatus::Started);
    assert!(session.ended_at.is_none());

    // No second started session for the same task.
    let err = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already has started"));
}

#[tokio::test]
async fn completing_a_session_sets_ended_at_once() {
    let fx = fixture().await;
    let task = fx.task().await;
    let session = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap();

    fx.store
        .complete_execution_session(session.id, ExecutionSessionStatus::Completed)
        .await
        .unwrap();

    let completed = fx
        .store
        .get_execution_session(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, ExecutionSessionStatus::Completed);
    assert!(completed.ended_at.is_some());

    // Idempotent: a second terminal transition keeps the original status.
    fx.store
        .complete_execution_session(session.id, ExecutionSessionStatus::Failed)
        .await
        .unwrap();
    let unchanged = fx
        .store
        .get_execution_session(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, ExecutionSessionStatus::Completed);
    assert_eq!(unchanged.ended_at, completed.ended_at);
}

#[tokio::test]
async fn new_session_allowed_after_previous_terminates() {
    let fx = fixture().await;
    let task = fx.task().await;

    let first = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap();
    fx.store
        .complete_execution_session(first.id, ExecutionSessionStatus::Interrupted)
        .await
        .unwrap();

    let second = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    let sessions = fx.store.list_execution_sessions(task.id, 10).await.unwrap();
    assert_eq!(sessions.len(), 2);
}

// ========== Messages ==========

#[tokio::test]
async fn assistant_messages_stream_appends_until_session_ends() {
    let fx = fixture().await;
    let task = fx.task().await;
    let session = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap();

    let id = fx
        .store
        .create_message(NewMessage {
            task_id: task.id,
            execution_session_id: Some(session.id),
            kind: MessageKind::Assistant,
            content: Some("Hel".to_string()),
            tool_data: None,
        })
        .await
        .unwrap();

    fx.store.append_to_message(id, "lo.").await.unwrap();
    let message = fx.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.content.as_deref(), Some("Hello."));

    fx.store
        .complete_execution_session(session.id, ExecutionSessionStatus::Completed)
        .await
        .unwrap();

    // Appending after the session ended is rejected.
    assert!(fx.store.append_to_message(id, "!").await.is_err());
}

#[tokio::test]
async fn tool_call_requires_tool_use_id() {
    let fx = fixture().await;
    let task = fx.task().await;

    let err = fx
        .store
        .create_message(NewMessage {
            task_id: task.id,
            execution_session_id: None,
            kind: MessageKind::ToolCall,
            content: None,
            tool_data: Some(json!({"tool_name": "Bash"})),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tool_use_id"));
}

#[tokio::test]
async fn tool_result_backpatch_merges_into_tool_data() {
    let fx = fixture().await;
    let task = fx.task().await;
    let session = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap();

    let id = fx
        .store
        .create_message(NewMessage {
            task_id: task.id,
            execution_session_id: Some(session.id),
            kind: MessageKind::ToolCall,
            content: None,
            tool_data: Some(json!({
                "tool_use_id": "u1",
                "tool_name": "Bash",
                "input": {"command": "ls"},
            })),
        })
        .await
        .unwrap();

    let found = fx
        .store
        .find_tool_message(task.id, "u1")
        .await
        .unwrap()
        .expect("tool message should be findable by tool_use_id");
    assert_eq!(found.id, id);

    fx.store.update_tool_result(id, "a\nb\n", false).await.unwrap();

    let patched = fx.store.get_message(id).await.unwrap().unwrap();
    let tool_data = patched.tool_data_value().unwrap();
    assert_eq!(tool_data["output"], "a\nb\n");
    assert_eq!(tool_data["is_error"], false);
    // Original call fields survive the merge.
    assert_eq!(tool_data["tool_use_id"], "u1");
    assert_eq!(tool_data["input"]["command"], "ls");
}

#[tokio::test]
async fn messages_list_in_insertion_order() {
    let fx = fixture().await;
    let task = fx.task().await;

    for text in ["one", "two", "three"] {
        fx.store
            .create_message(NewMessage {
                task_id: task.id,
                execution_session_id: None,
                kind: MessageKind::User,
                content: Some(text.to_string()),
                tool_data: None,
            })
            .await
            .unwrap();
    }

    let messages = fx.store.list_messages(task.id, 10).await.unwrap();
    let contents: Vec<_> = messages
        .iter()
        .map(|m| m.content.as_deref().unwrap())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);

    let bounded = fx.store.list_messages(task.id, 2).await.unwrap();
    assert_eq!(bounded.len(), 2);
}

// ========== Tasks ==========

#[tokio::test]
async fn task_status_and_title() {
    let fx = fixture().await;
    let task = fx.task().await;
    assert_eq!(task.status, TaskStatus::Idle);
    assert!(task.title.is_none());

    fx.tasks
        .update_status(task.id, TaskStatus::Active)
        .await
        .unwrap();
    fx.tasks
        .set_title_if_empty(task.id, "fix the login bug")
        .await
        .unwrap();
    // Second set is a no-op: the title is already there.
    fx.tasks
        .set_title_if_empty(task.id, "something else")
        .await
        .unwrap();

    let task = fx.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Active);
    assert_eq!(task.title.as_deref(), Some("fix the login bug"));
}

#[tokio::test]
async fn deleting_a_task_cascades_conversation_rows() {
    let fx = fixture().await;
    let task = fx.task().await;
    let session = fx
        .store
        .start_execution_session(task.id, "box-1", "agent")
        .await
        .unwrap();
    fx.store
        .create_message(NewMessage {
            task_id: task.id,
            execution_session_id: Some(session.id),
            kind: MessageKind::User,
            content: Some("hi".to_string()),
            tool_data: None,
        })
        .await
        .unwrap();

    fx.tasks.delete(task.id).await.unwrap();

    assert!(fx.store.list_messages(task.id, 10).await.unwrap().is_empty());
    assert!(
        fx.store
            .list_execution_sessions(task.id, 10)
            .await
            .unwrap()
            .is_empty()
    );
}

// ========== Repo locks ==========

#[tokio::test]
async fn repo_lock_is_exclusive_and_reentrant() {
    let fx = fixture().await;
    let repo = fx.repo().await;
    let t1 = fx.task().await;
    let t2 = fx.task().await;

    fx.repos.try_lock(repo.id, t1.id).await.unwrap();
    assert!(fx.repos.is_locked(repo.id).await.unwrap());

    // Reentrant for the holder.
    fx.repos.try_lock(repo.id, t1.id).await.unwrap();

    // Exclusive against others, reporting the holder.
    match fx.repos.try_lock(repo.id, t2.id).await {
        Err(LockError::LockedBy(holder)) => assert_eq!(holder, t1.id),
        other => panic!("expected LockedBy, got {other:?}"),
    }

    let row = fx.repos.get(repo.id).await.unwrap().unwrap();
    assert_eq!(row.locked_by_task_id, Some(t1.id));
    assert!(row.locked_at.is_some());
}

#[tokio::test]
async fn unlock_is_compare_and_clear() {
    let fx = fixture().await;
    let repo = fx.repo().await;
    let t1 = fx.task().await;
    let t2 = fx.task().await;

    fx.repos.try_lock(repo.id, t1.id).await.unwrap();

    // A non-holder cannot clear the lock.
    fx.repos.unlock(repo.id, t2.id).await.unwrap();
    assert!(fx.repos.is_locked(repo.id).await.unwrap());

    fx.repos.unlock(repo.id, t1.id).await.unwrap();
    assert!(!fx.repos.is_locked(repo.id).await.unwrap());

    // Idempotent.
    fx.repos.unlock(repo.id, t1.id).await.unwrap();

    // And the lock is acquirable again.
    fx.repos.try_lock(repo.id, t2.id).await.unwrap();
}

#[tokio::test]
async fn locking_a_missing_repo_fails() {
    let fx = fixture().await;
    let task = fx.task().await;

    match fx.repos.try_lock(9999, task.id).await {
        Err(LockError::RepoNotFound(9999)) => {}
        other => panic!("expected RepoNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_locks_released_for_dead_tasks() {
    let fx = fixture().await;
    let repo = fx.repo().await;
    let t1 = fx.task().await;

    fx.repos.try_lock(repo.id, t1.id).await.unwrap();

    // t1 has no live supervisor: its lock is stale.
    let released = fx.repos.release_stale_locks(&[]).await.unwrap();
    assert_eq!(released, 1);
    assert!(!fx.repos.is_locked(repo.id).await.unwrap());

    // A live holder keeps its lock.
    fx.repos.try_lock(repo.id, t1.id).await.unwrap();
    let released = fx.repos.release_stale_locks(&[t1.id]).await.unwrap();
    assert_eq!(released, 0);
    assert!(fx.repos.is_locked(repo.id).await.unwrap());
}

#[tokio::test]
async fn find_or_create_is_idempotent_by_remote_url() {
    let fx = fixture().await;
    let first = fx.repo().await;
    let second = fx.repo().await;
    assert_eq!(first.id, second.id);
}
