//! Allocator integration tests: locking, prewarm pipeline, setup commands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use spritedock::allocator::{AllocError, AllocRequest, Allocator, AllocatorConfig};
use spritedock::sprite::SpriteApi;

mod common;
use common::{Fixture, StubSprites, fixture};

fn test_config() -> AllocatorConfig {
    AllocatorConfig {
        sandbox_name: "test-sprite".to_string(),
        github_token: None,
        public_sandbox: false,
    }
}

fn spawn_allocator(
    fx: &Fixture,
    sprites: Arc<StubSprites>,
) -> (spritedock::allocator::AllocatorHandle, Arc<StubSprites>) {
    let api: Arc<dyn SpriteApi> = sprites.clone();
    let handle = Allocator::spawn(api, fx.repos.clone(), test_config());
    (handle, sprites)
}

fn request(task_id: i64, repo: Option<spritedock::repo::Repo>) -> AllocRequest {
    AllocRequest { task_id, repo }
}

#[tokio::test]
async fn allocates_home_dir_for_repoless_task() {
    let fx = fixture().await;
    let (allocator, sprites) = spawn_allocator(&fx, Arc::new(StubSprites::default()));
    let task = fx.task().await;

    let allocation = allocator.allocate(request(task.id, None)).await.unwrap();
    assert_eq!(allocation.sandbox_name, "test-sprite");
    assert_eq!(allocation.working_dir, "/home/sprite");
    assert_eq!(sprites.created(), 1);
}

#[tokio::test]
async fn clones_into_deterministic_working_dir() {
    let fx = fixture().await;
    let (allocator, sprites) = spawn_allocator(&fx, Arc::new(StubSprites::default()));
    let repo = fx.repo().await;
    let task = fx.task_with_repo(&repo).await;

    let allocation = allocator
        .allocate(request(task.id, Some(repo.clone())))
        .await
        .unwrap();
    assert_eq!(allocation.working_dir, "/home/sprite/repos/acme/widget");

    let execs = sprites.exec_log().await;
    assert!(
        execs.iter().any(|cmd| cmd.contains("git clone")
            && cmd.contains("https://github.com/acme/widget.git")
            && cmd.contains("'/home/sprite/repos/acme/widget'")),
        "expected a clone command, got: {execs:?}"
    );

    // The lock is held by the allocating task until release.
    let row = fx.repos.get(repo.id).await.unwrap().unwrap();
    assert_eq!(row.locked_by_task_id, Some(task.id));
}

#[tokio::test]
async fn matching_checkout_pulls_instead_of_cloning() {
    let fx = fixture().await;
    let sprites = Arc::new(StubSprites {
        has_checkout: true,
        origin_url: Some("https://GitHub.com/Acme/Widget".to_string()),
        ..StubSprites::default()
    });
    let (allocator, sprites) = spawn_allocator(&fx, sprites);
    let repo = fx.repo().await;
    let task = fx.task_with_repo(&repo).await;

    allocator
        .allocate(request(task.id, Some(repo)))
        .await
        .unwrap();

    let execs = sprites.exec_log().await;
    assert!(execs.iter().any(|cmd| cmd.contains("git -C") && cmd.contains("pull")));
    assert!(!execs.iter().any(|cmd| cmd.contains("git clone")));
}

#[tokio::test]
async fn mismatched_checkout_is_replaced() {
    let fx = fixture().await;
    let sprites = Arc::new(StubSprites {
        has_checkout: true,
        origin_url: Some("https://github.com/other/project.git".to_string()),
        ..StubSprites::default()
    });
    let (allocator, sprites) = spawn_allocator(&fx, sprites);
    let repo = fx.repo().await;
    let task = fx.task_with_repo(&repo).await;

    allocator
        .allocate(request(task.id, Some(repo)))
        .await
        .unwrap();

    let execs = sprites.exec_log().await;
    assert!(execs.iter().any(|cmd| cmd.contains("rm -rf")));
    assert!(execs.iter().any(|cmd| cmd.contains("git clone")));
}

#[tokio::test]
async fn repo_contention_surfaces_holder_without_setup() {
    let fx = fixture().await;
    let (allocator, sprites) = spawn_allocator(&fx, Arc::new(StubSprites::default()));
    let repo = fx.repo().await;
    let t1 = fx.task_with_repo(&repo).await;
    let t2 = fx.task_with_repo(&repo).await;

    allocator
        .allocate(request(t1.id, Some(repo.clone())))
        .await
        .unwrap();
    let creates_after_t1 = sprites.created();

    match allocator.allocate(request(t2.id, Some(repo.clone()))).await {
        Err(AllocError::RepoLocked(holder)) => assert_eq!(holder, t1.id),
        other => panic!("expected RepoLocked, got {other:?}"),
    }

    // The lock never moved, and no sandbox setup ran for t2.
    let row = fx.repos.get(repo.id).await.unwrap().unwrap();
    assert_eq!(row.locked_by_task_id, Some(t1.id));
    assert_eq!(sprites.created(), creates_after_t1);
}

#[tokio::test]
async fn allocate_release_allocate_cycles() {
    let fx = fixture().await;
    let (allocator, _sprites) = spawn_allocator(&fx, Arc::new(StubSprites::default()));
    let repo = fx.repo().await;
    let t1 = fx.task_with_repo(&repo).await;
    let t2 = fx.task_with_repo(&repo).await;

    allocator
        .allocate(request(t1.id, Some(repo.clone())))
        .await
        .unwrap();
    allocator.release(t1.id).await;
    assert!(!allocator.is_repo_locked(repo.id).await);

    // A different task can take the repo after release.
    allocator
        .allocate(request(t2.id, Some(repo.clone())))
        .await
        .unwrap();
    assert!(allocator.is_repo_locked(repo.id).await);

    allocator.release(t2.id).await;
    allocator
        .allocate(request(t2.id, Some(repo)))
        .await
        .unwrap();
}

#[tokio::test]
async fn prewarm_racing_synchronous_allocate_shares_one_setup() {
    let fx = fixture().await;
    let gate = Arc::new(Semaphore::new(0));
    let sprites = Arc::new(StubSprites {
        create_gate: Some(gate.clone()),
        ..StubSprites::default()
    });
    let (allocator, sprites) = spawn_allocator(&fx, sprites);
    let repo = fx.repo().await;
    let task = fx.task_with_repo(&repo).await;

    allocator.prewarm(request(task.id, Some(repo.clone()))).await;

    // The synchronous allocate arrives while the prewarm is gated.
    let racing = {
        let allocator = allocator.clone();
        let req = request(task.id, Some(repo.clone()));
        tokio::spawn(async move { allocator.allocate(req).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!racing.is_finished(), "allocate must suspend on the prewarm");

    gate.add_permits(1);
    let allocation = racing.await.unwrap().unwrap();
    assert_eq!(allocation.working_dir, "/home/sprite/repos/acme/widget");

    // One setup served both: the prewarm, and the suspended caller.
    assert_eq!(sprites.created(), 1);

    // The result was consumed, not cached: a fresh allocate after release
    // runs a fresh setup.
    allocator.release(task.id).await;
    gate.add_permits(1);
    allocator
        .allocate(request(task.id, Some(repo)))
        .await
        .unwrap();
    assert_eq!(sprites.created(), 2);
}

#[tokio::test]
async fn completed_prewarm_is_picked_up_from_cache() {
    let fx = fixture().await;
    let (allocator, sprites) = spawn_allocator(&fx, Arc::new(StubSprites::default()));
    let repo = fx.repo().await;
    let task = fx.task_with_repo(&repo).await;

    allocator.prewarm(request(task.id, Some(repo.clone()))).await;

    // Let the prewarm finish before the session opens.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let allocation = allocator
        .allocate(request(task.id, Some(repo)))
        .await
        .unwrap();
    assert_eq!(allocation.working_dir, "/home/sprite/repos/acme/widget");
    assert_eq!(sprites.created(), 1, "cached prewarm must not re-run setup");
}

#[tokio::test]
async fn prewarm_failure_reaches_waiters_and_releases_lock() {
    let fx = fixture().await;
    let gate = Arc::new(Semaphore::new(0));
    let sprites = Arc::new(StubSprites {
        fail_create: true,
        create_gate: Some(gate.clone()),
        ..StubSprites::default()
    });
    let (allocator, _sprites) = spawn_allocator(&fx, sprites);
    let repo = fx.repo().await;
    let task = fx.task_with_repo(&repo).await;

    allocator.prewarm(request(task.id, Some(repo.clone()))).await;

    let racing = {
        let allocator = allocator.clone();
        let req = request(task.id, Some(repo.clone()));
        tokio::spawn(async move { allocator.allocate(req).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(1);

    match racing.await.unwrap() {
        Err(AllocError::SandboxCreationFailed(_)) => {}
        other => panic!("expected SandboxCreationFailed, got {other:?}"),
    }

    // The lock did not leak.
    assert!(!fx.repos.is_locked(repo.id).await.unwrap());
}

#[tokio::test]
async fn orphan_sweep_releases_unconsumed_prewarms() {
    let fx = fixture().await;
    let (allocator, _sprites) = spawn_allocator(&fx, Arc::new(StubSprites::default()));
    let repo = fx.repo().await;
    let task = fx.task_with_repo(&repo).await;

    allocator.prewarm(request(task.id, Some(repo.clone()))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.repos.is_locked(repo.id).await.unwrap());

    // The task was deleted before pickup; the sweep reclaims its prewarm.
    allocator.sweep_orphans(vec![]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!fx.repos.is_locked(repo.id).await.unwrap());
}

#[tokio::test]
async fn sandbox_creation_is_idempotent_per_task_cycle() {
    let fx = fixture().await;
    let (allocator, sprites) = spawn_allocator(&fx, Arc::new(StubSprites::default()));
    let t1 = fx.task().await;
    let t2 = fx.task().await;

    allocator.allocate(request(t1.id, None)).await.unwrap();
    allocator.allocate(request(t2.id, None)).await.unwrap();

    // Both tasks route to the same shared sprite; create is called per
    // setup and the provider treats it as idempotent.
    assert_eq!(sprites.created(), 2);
    let first = sprites.exec_log().await;
    assert!(!first.iter().any(|cmd| cmd.contains("git clone")));
}
