//! Test utilities and common setup.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use spritedock::convo::ConversationStore;
use spritedock::db::Database;
use spritedock::repo::{Repo, RepoRepository};
use spritedock::sprite::{
    ExecCommand, ExecOpts, ExecResult, Sprite, SpriteApi, SpriteError, SpriteResult, StreamOpts,
};
use spritedock::task::{Task, TaskRepository};

/// A stub sprite provider for tests: records calls, succeeds by default,
/// and can be gated or made to fail.
pub struct StubSprites {
    /// How many create calls arrived.
    pub create_calls: AtomicUsize,
    /// Fail creation with a 500.
    pub fail_create: bool,
    /// When set, create() consumes one permit before returning; lets tests
    /// hold a setup in flight.
    pub create_gate: Option<Arc<Semaphore>>,
    /// Whether `test -d <wd>/.git` succeeds.
    pub has_checkout: bool,
    /// What `git remote get-url origin` prints.
    pub origin_url: Option<String>,
    /// Joined argv of every exec call, in order.
    pub execs: Mutex<Vec<String>>,
}

impl Default for StubSprites {
    fn default() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            fail_create: false,
            create_gate: None,
            has_checkout: false,
            origin_url: None,
            execs: Mutex::new(Vec::new()),
        }
    }
}

impl StubSprites {
    pub fn created(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub async fn exec_log(&self) -> Vec<String> {
        self.execs.lock().await.clone()
    }
}

fn ok_exec(stdout: &str) -> ExecResult {
    ExecResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn failed_exec() -> ExecResult {
    ExecResult {
        stdout: String::new(),
        stderr: String::new(),
        exit_code: 1,
    }
}

#[async_trait]
impl SpriteApi for StubSprites {
    async fn create(&self, name: &str, _public: bool) -> SpriteResult<Sprite> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.create_gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        if self.fail_create {
            return Err(SpriteError::ApiError {
                status: 500,
                body: "boom".to_string(),
            });
        }

        Ok(Sprite {
            name: name.to_string(),
            status: Some("running".to_string()),
            extra: Default::default(),
        })
    }

    async fn get(&self, name: &str) -> SpriteResult<Sprite> {
        Ok(Sprite {
            name: name.to_string(),
            status: Some("running".to_string()),
            extra: Default::default(),
        })
    }

    async fn list(&self) -> SpriteResult<Vec<Sprite>> {
        Ok(Vec::new())
    }

    async fn suspend(&self, _name: &str) -> SpriteResult<()> {
        Ok(())
    }

    async fn delete(&self, _name: &str) -> SpriteResult<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _name: &str,
        command: ExecCommand,
        _opts: ExecOpts,
    ) -> SpriteResult<ExecResult> {
        let joined = match command {
            ExecCommand::Argv(argv) => argv.join(" "),
            ExecCommand::Shell(script) => script,
        };
        self.execs.lock().await.push(joined.clone());

        if joined.contains("test -d") {
            return Ok(if self.has_checkout {
                ok_exec("")
            } else {
                failed_exec()
            });
        }
        if joined.contains("remote get-url") {
            return Ok(match &self.origin_url {
                Some(url) => ok_exec(&format!("{url}\n")),
                None => failed_exec(),
            });
        }
        if joined.contains("credential.helper") && joined.starts_with("git config") {
            // Probe: credentials not configured yet.
            return Ok(failed_exec());
        }

        Ok(ok_exec(""))
    }

    fn open_stream_url(
        &self,
        name: &str,
        _argv: &[String],
        _opts: &StreamOpts,
    ) -> SpriteResult<String> {
        Ok(format!("ws://127.0.0.1:9/v1/sprites/{name}/exec"))
    }

    fn auth_token(&self) -> &str {
        "stub-token"
    }
}

/// In-memory database plus the repositories the tests touch.
pub struct Fixture {
    pub db: Database,
    pub tasks: TaskRepository,
    pub repos: RepoRepository,
    pub store: ConversationStore,
}

pub async fn fixture() -> Fixture {
    let db = Database::in_memory().await.unwrap();
    Fixture {
        tasks: TaskRepository::new(db.pool().clone()),
        repos: RepoRepository::new(db.pool().clone()),
        store: ConversationStore::new(db.pool().clone()),
        db,
    }
}

impl Fixture {
    pub async fn task(&self) -> Task {
        self.tasks.create(None, None).await.unwrap()
    }

    pub async fn task_with_repo(&self, repo: &Repo) -> Task {
        self.tasks.create(None, Some(repo.id)).await.unwrap()
    }

    pub async fn repo(&self) -> Repo {
        self.repos
            .find_or_create(
                "https://github.com/acme/widget.git",
                "acme/widget",
                "main",
            )
            .await
            .unwrap()
    }
}
