//! Sandbox setup pipeline: sprite creation, git credentials, working copy.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::repo::{Repo, RepoRepository, normalize_remote_url};
use crate::shell::sh_quote;
use crate::sprite::{ExecCommand, ExecOpts, SpriteApi};

use super::{AllocError, AllocRequest, Allocation, AllocatorConfig};

/// Working directory for tasks without a repo.
const HOME_DIR: &str = "/home/sprite";

const GIT_CONFIG_TIMEOUT: Duration = Duration::from_secs(30);
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const PULL_TIMEOUT: Duration = Duration::from_secs(120);

/// Backoff before re-probing a contended .gitconfig.
const GIT_CONFIG_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Run the full setup for a task: ensure the sprite exists, configure git
/// credentials once, and provision the working directory.
///
/// The repo lock is acquired first and released again on every failure path;
/// on success the caller owns it until release.
pub(super) async fn setup_sprite_for_task(
    sprites: &Arc<dyn SpriteApi>,
    repos: &RepoRepository,
    config: &AllocatorConfig,
    request: &AllocRequest,
) -> Result<Allocation, AllocError> {
    if let Some(repo) = &request.repo {
        repos
            .try_lock(repo.id, request.task_id)
            .await
            .map_err(AllocError::from_lock)?;
    }

    let result = provision(sprites, repos, config, request).await;

    if result.is_err() {
        if let Some(repo) = &request.repo {
            if let Err(e) = repos.unlock(repo.id, request.task_id).await {
                warn!(
                    "failed to release lock on repo {} after setup failure: {:?}",
                    repo.id, e
                );
            }
        }
    }

    result
}

impl AllocError {
    fn from_lock(err: crate::repo::LockError) -> Self {
        match err {
            crate::repo::LockError::LockedBy(task) => AllocError::RepoLocked(task),
            crate::repo::LockError::RepoNotFound(id) => AllocError::RepoNotFound(id),
            crate::repo::LockError::Database(e) => AllocError::Internal(e.to_string()),
        }
    }
}

async fn provision(
    sprites: &Arc<dyn SpriteApi>,
    repos: &RepoRepository,
    config: &AllocatorConfig,
    request: &AllocRequest,
) -> Result<Allocation, AllocError> {
    let sandbox_name = &config.sandbox_name;

    // Creation is idempotent: 409 from the provider means reuse.
    sprites
        .create(sandbox_name, config.public_sandbox)
        .await
        .map_err(|e| AllocError::SandboxCreationFailed(e.to_string()))?;

    if let Some(token) = &config.github_token {
        ensure_git_credentials(sprites, token, sandbox_name).await?;
    }

    let Some(repo) = &request.repo else {
        return Ok(Allocation {
            sandbox_name: sandbox_name.clone(),
            working_dir: HOME_DIR.to_string(),
        });
    };

    let working_dir = repo.working_dir();
    provision_working_copy(sprites, sandbox_name, repo, &working_dir).await?;

    if let Err(e) = repos.touch_last_used(repo.id).await {
        warn!("failed to touch repo {} last_used_at: {:?}", repo.id, e);
    }

    Ok(Allocation {
        sandbox_name: sandbox_name.clone(),
        working_dir,
    })
}

/// One-time global git credential configuration inside the sprite.
///
/// Probed before writing; concurrent writers contending on .gitconfig show
/// up as "could not lock config file", which resolves itself once the other
/// writer finishes, so sleep and re-probe.
async fn ensure_git_credentials(
    sprites: &Arc<dyn SpriteApi>,
    token: &str,
    sandbox_name: &str,
) -> Result<(), AllocError> {
    if git_credentials_configured(sprites, sandbox_name).await? {
        return Ok(());
    }

    let script = format!(
        "git config --global credential.helper store && \
         printf 'https://x-access-token:%s@github.com\\n' {} > ~/.git-credentials && \
         git config --global user.name 'Spritedock Agent' && \
         git config --global user.email 'agent@spritedock.local'",
        sh_quote(token)
    );

    let result = sprites
        .exec(
            sandbox_name,
            ExecCommand::Shell(script),
            ExecOpts::with_timeout(GIT_CONFIG_TIMEOUT),
        )
        .await
        .map_err(|e| AllocError::GitConfigFailed(e.to_string()))?;

    if result.success() {
        info!("configured git credentials in sprite {}", sandbox_name);
        return Ok(());
    }

    if result.output().contains("could not lock config file") {
        debug!("gitconfig contended in sprite {}, re-probing", sandbox_name);
        tokio::time::sleep(GIT_CONFIG_RETRY_DELAY).await;
        if git_credentials_configured(sprites, sandbox_name).await? {
            return Ok(());
        }
    }

    Err(AllocError::GitConfigFailed(result.output()))
}

async fn git_credentials_configured(
    sprites: &Arc<dyn SpriteApi>,
    sandbox_name: &str,
) -> Result<bool, AllocError> {
    let result = sprites
        .exec(
            sandbox_name,
            ExecCommand::Argv(vec![
                "git".to_string(),
                "config".to_string(),
                "--global".to_string(),
                "credential.helper".to_string(),
            ]),
            ExecOpts::with_timeout(GIT_CONFIG_TIMEOUT),
        )
        .await
        .map_err(|e| AllocError::GitConfigFailed(e.to_string()))?;

    Ok(result.success() && !result.stdout.trim().is_empty())
}

/// Make the working directory hold a checkout of the repo: reuse a matching
/// clone (pulling latest, best effort), replace a mismatched one, or clone
/// fresh.
async fn provision_working_copy(
    sprites: &Arc<dyn SpriteApi>,
    sandbox_name: &str,
    repo: &Repo,
    working_dir: &str,
) -> Result<(), AllocError> {
    let quoted_wd = sh_quote(working_dir);

    let probe = sprites
        .exec(
            sandbox_name,
            ExecCommand::Shell(format!("test -d {}/.git", quoted_wd)),
            ExecOpts::default(),
        )
        .await
        .map_err(|e| AllocError::CloneFailed(e.to_string()))?;

    if probe.success() {
        let remote = sprites
            .exec(
                sandbox_name,
                ExecCommand::Shell(format!("git -C {} remote get-url origin", quoted_wd)),
                ExecOpts::default(),
            )
            .await
            .map_err(|e| AllocError::CloneFailed(e.to_string()))?;

        if remote.success()
            && normalize_remote_url(remote.stdout.trim()) == normalize_remote_url(&repo.remote_url)
        {
            debug!(
                "existing checkout at {} matches {}, pulling",
                working_dir, repo.remote_url
            );
            let pull = sprites
                .exec(
                    sandbox_name,
                    ExecCommand::Shell(format!("git -C {} pull", quoted_wd)),
                    ExecOpts::with_timeout(PULL_TIMEOUT),
                )
                .await;
            // A failed pull is non-fatal: the stale checkout is still usable.
            match pull {
                Ok(result) if !result.success() => {
                    warn!("git pull in {} failed: {}", working_dir, result.output())
                }
                Err(e) => warn!("git pull in {} failed: {}", working_dir, e),
                Ok(_) => {}
            }
            return Ok(());
        }

        info!(
            "checkout at {} points at a different remote, replacing",
            working_dir
        );
    }

    let parent = working_dir
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or(HOME_DIR);
    let prepare = format!("mkdir -p {} && rm -rf {}", sh_quote(parent), quoted_wd);
    let prep = sprites
        .exec(sandbox_name, ExecCommand::Shell(prepare), ExecOpts::default())
        .await
        .map_err(|e| AllocError::CloneFailed(e.to_string()))?;
    if !prep.success() {
        return Err(AllocError::CloneFailed(prep.output()));
    }

    let clone = sprites
        .exec(
            sandbox_name,
            ExecCommand::Shell(format!(
                "git clone {} {}",
                sh_quote(&repo.remote_url),
                quoted_wd
            )),
            ExecOpts::with_timeout(CLONE_TIMEOUT),
        )
        .await
        .map_err(|e| AllocError::CloneFailed(e.to_string()))?;

    if !clone.success() {
        return Err(AllocError::CloneFailed(clone.output()));
    }

    info!("cloned {} into {}", repo.remote_url, working_dir);
    Ok(())
}
