//! The allocator actor: serialized owner of allocation state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::repo::RepoRepository;
use crate::sprite::SpriteApi;

use super::setup::setup_sprite_for_task;
use super::{AllocError, AllocRequest, Allocation, AllocatorConfig};

/// Mailbox depth for allocator commands.
const COMMAND_BUFFER_SIZE: usize = 64;

enum Command {
    Allocate {
        request: AllocRequest,
        reply: oneshot::Sender<Result<Allocation, AllocError>>,
    },
    Prewarm {
        request: AllocRequest,
    },
    Release {
        task_id: i64,
        reply: oneshot::Sender<()>,
    },
    IsRepoLocked {
        repo_id: i64,
        reply: oneshot::Sender<bool>,
    },
    SweepOrphans {
        live_task_ids: Vec<i64>,
    },
}

/// Completion message from a spawned setup task.
struct SetupOutcome {
    task_id: i64,
    repo_id: Option<i64>,
    result: Result<Allocation, AllocError>,
}

/// A recorded live allocation.
#[derive(Debug, Clone)]
struct AllocationRecord {
    #[allow(dead_code)]
    sandbox_name: String,
    repo_id: Option<i64>,
    #[allow(dead_code)]
    allocated_at: DateTime<Utc>,
}

/// A completed prewarm awaiting pickup.
#[derive(Debug, Clone)]
struct PrewarmEntry {
    allocation: Allocation,
    repo_id: Option<i64>,
}

/// Cloneable handle to the allocator actor.
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Command>,
}

impl AllocatorHandle {
    /// Synchronously allocate a sandbox and working directory for a task.
    ///
    /// If a prewarm for the task is in flight, this suspends until it
    /// completes and receives the same result.
    pub async fn allocate(&self, request: AllocRequest) -> Result<Allocation, AllocError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Allocate { request, reply })
            .await
            .map_err(|_| AllocError::Unavailable)?;
        rx.await.map_err(|_| AllocError::Unavailable)?
    }

    /// Begin allocation asynchronously; the result is picked up by a later
    /// synchronous `allocate` for the same task.
    pub async fn prewarm(&self, request: AllocRequest) {
        let _ = self.tx.send(Command::Prewarm { request }).await;
    }

    /// Drop the task's allocation and release its repo lock, if held.
    pub async fn release(&self, task_id: i64) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Release { task_id, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Observational query: does any task hold this repo's lock?
    pub async fn is_repo_locked(&self, repo_id: i64) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::IsRepoLocked { repo_id, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Drop prewarm results whose tasks no longer exist, releasing their
    /// locks.
    pub async fn sweep_orphans(&self, live_task_ids: Vec<i64>) {
        let _ = self.tx.send(Command::SweepOrphans { live_task_ids }).await;
    }
}

/// The allocator actor. One instance per process.
pub struct Allocator {
    sprites: Arc<dyn SpriteApi>,
    repos: RepoRepository,
    config: AllocatorConfig,

    allocations: HashMap<i64, AllocationRecord>,
    prewarm_cache: HashMap<i64, PrewarmEntry>,
    prewarming: HashSet<i64>,
    prewarm_waiters: HashMap<i64, Vec<oneshot::Sender<Result<Allocation, AllocError>>>>,
    /// Tasks released (or deleted) while their prewarm was still in flight;
    /// the eventual result is discarded and its lock freed.
    released_mid_flight: HashSet<i64>,

    done_tx: mpsc::Sender<SetupOutcome>,
}

impl Allocator {
    /// Spawn the allocator actor and return its handle.
    pub fn spawn(
        sprites: Arc<dyn SpriteApi>,
        repos: RepoRepository,
        config: AllocatorConfig,
    ) -> AllocatorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (done_tx, done_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);

        let actor = Self {
            sprites,
            repos,
            config,
            allocations: HashMap::new(),
            prewarm_cache: HashMap::new(),
            prewarming: HashSet::new(),
            prewarm_waiters: HashMap::new(),
            released_mid_flight: HashSet::new(),
            done_tx,
        };

        tokio::spawn(actor.run(cmd_rx, done_rx));

        AllocatorHandle { tx: cmd_tx }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::Receiver<SetupOutcome>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(outcome) = done_rx.recv() => {
                    self.handle_setup_done(outcome).await;
                }
            }
        }
        debug!("allocator actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Allocate { request, reply } => self.handle_allocate(request, reply),
            Command::Prewarm { request } => self.handle_prewarm(request),
            Command::Release { task_id, reply } => {
                self.handle_release(task_id).await;
                let _ = reply.send(());
            }
            Command::IsRepoLocked { repo_id, reply } => {
                let locked = self.repos.is_locked(repo_id).await.unwrap_or_else(|e| {
                    warn!("repo lock query failed: {:?}", e);
                    false
                });
                let _ = reply.send(locked);
            }
            Command::SweepOrphans { live_task_ids } => self.handle_sweep(live_task_ids).await,
        }
    }

    fn handle_allocate(
        &mut self,
        request: AllocRequest,
        reply: oneshot::Sender<Result<Allocation, AllocError>>,
    ) {
        let task_id = request.task_id;

        // A completed prewarm is consumed by exactly one caller.
        if let Some(entry) = self.prewarm_cache.remove(&task_id) {
            debug!("task {} consumes prewarmed allocation", task_id);
            self.record_allocation(task_id, &entry.allocation, entry.repo_id);
            let _ = reply.send(Ok(entry.allocation));
            return;
        }

        // A prewarm in flight: suspend the reply until it completes.
        if self.prewarming.contains(&task_id) {
            debug!("task {} waits on in-flight prewarm", task_id);
            self.prewarm_waiters.entry(task_id).or_default().push(reply);
            return;
        }

        // Fresh setup, with the caller as the sole waiter.
        self.prewarm_waiters.entry(task_id).or_default().push(reply);
        self.start_setup(request);
    }

    fn handle_prewarm(&mut self, request: AllocRequest) {
        let task_id = request.task_id;
        if self.prewarming.contains(&task_id)
            || self.prewarm_cache.contains_key(&task_id)
            || self.allocations.contains_key(&task_id)
        {
            debug!("ignoring duplicate prewarm for task {}", task_id);
            return;
        }
        info!("prewarming allocation for task {}", task_id);
        self.start_setup(request);
    }

    fn start_setup(&mut self, request: AllocRequest) {
        let task_id = request.task_id;
        self.prewarming.insert(task_id);
        self.released_mid_flight.remove(&task_id);

        let sprites = self.sprites.clone();
        let repos = self.repos.clone();
        let config = self.config.clone();
        let done_tx = self.done_tx.clone();

        tokio::spawn(async move {
            let repo_id = request.repo.as_ref().map(|r| r.id);
            let result = setup_sprite_for_task(&sprites, &repos, &config, &request).await;
            let _ = done_tx
                .send(SetupOutcome {
                    task_id,
                    repo_id,
                    result,
                })
                .await;
        });
    }

    async fn handle_setup_done(&mut self, outcome: SetupOutcome) {
        let task_id = outcome.task_id;
        self.prewarming.remove(&task_id);

        // The task was released (or deleted) while setup ran; discard the
        // result and free its lock.
        if self.released_mid_flight.remove(&task_id) {
            if outcome.result.is_ok() {
                if let Some(repo_id) = outcome.repo_id {
                    if let Err(e) = self.repos.unlock(repo_id, task_id).await {
                        warn!("failed to unlock repo {} for released task: {:?}", repo_id, e);
                    }
                }
            }
            debug!("discarded prewarm result for released task {}", task_id);
            return;
        }

        let waiters = self.prewarm_waiters.remove(&task_id).unwrap_or_default();

        match outcome.result {
            Ok(allocation) => {
                if waiters.is_empty() {
                    // No one asked yet; cache for the next synchronous call.
                    self.prewarm_cache.insert(
                        task_id,
                        PrewarmEntry {
                            allocation,
                            repo_id: outcome.repo_id,
                        },
                    );
                    debug!("prewarm for task {} cached", task_id);
                } else {
                    self.record_allocation(task_id, &allocation, outcome.repo_id);
                    for waiter in waiters {
                        let _ = waiter.send(Ok(allocation.clone()));
                    }
                }
            }
            Err(err) => {
                if waiters.is_empty() {
                    warn!("prewarm for task {} failed: {}", task_id, err);
                } else {
                    for waiter in waiters {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
            }
        }
    }

    async fn handle_release(&mut self, task_id: i64) {
        if let Some(record) = self.allocations.remove(&task_id) {
            if let Some(repo_id) = record.repo_id {
                if let Err(e) = self.repos.unlock(repo_id, task_id).await {
                    warn!("failed to unlock repo {}: {:?}", repo_id, e);
                }
            }
            info!("released allocation for task {}", task_id);
        }

        if let Some(entry) = self.prewarm_cache.remove(&task_id) {
            if let Some(repo_id) = entry.repo_id {
                if let Err(e) = self.repos.unlock(repo_id, task_id).await {
                    warn!("failed to unlock repo {}: {:?}", repo_id, e);
                }
            }
            debug!("dropped unconsumed prewarm for task {}", task_id);
        }

        if self.prewarming.contains(&task_id) {
            self.released_mid_flight.insert(task_id);
        }
    }

    async fn handle_sweep(&mut self, live_task_ids: Vec<i64>) {
        let orphaned: Vec<i64> = self
            .prewarm_cache
            .keys()
            .copied()
            .filter(|id| !live_task_ids.contains(id))
            .collect();

        for task_id in orphaned {
            warn!("sweeping orphaned prewarm entry for task {}", task_id);
            self.handle_release(task_id).await;
        }
    }

    fn record_allocation(&mut self, task_id: i64, allocation: &Allocation, repo_id: Option<i64>) {
        self.allocations.insert(
            task_id,
            AllocationRecord {
                sandbox_name: allocation.sandbox_name.clone(),
                repo_id,
                allocated_at: Utc::now(),
            },
        );
    }
}
