use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};

mod agent;
mod allocator;
mod channel;
mod codec;
mod convo;
mod db;
mod repo;
mod session;
mod shell;
mod sprite;
mod task;
mod token;

const APP_NAME: &str = "spritedock";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_token(ctx: RuntimeContext, cmd: TokenCommand) -> Result<()> {
    handle_token(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Token { command } => async_token(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Spritedock - session orchestration for the AI agent task platform.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the orchestrator
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage the agent's OAuth token
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the shared sandbox name
    #[arg(long, value_name = "NAME")]
    sandbox: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    /// Seed (upsert) the agent OAuth token
    Seed(TokenSeedCommand),
    /// Show the stored token's expiry
    Show,
    /// Force a refresh against the provider
    Refresh,
}

#[derive(Debug, Clone, Args)]
struct TokenSeedCommand {
    /// Access token value
    #[arg(long)]
    access_token: String,
    /// Refresh token value
    #[arg(long)]
    refresh_token: String,
    /// Seconds until the access token expires
    #[arg(long, default_value = "3600")]
    expires_in: i64,
    /// Space-separated OAuth scopes
    #[arg(long)]
    scopes: Option<String>,
    /// Provider subscription tier
    #[arg(long)]
    tier: Option<String>,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        Ok(())
    }

    /// Resolved database path: DATABASE_URL wins over the data dir default.
    fn database_path(&self) -> PathBuf {
        match env::var("DATABASE_URL") {
            Ok(url) => {
                let path = url.strip_prefix("sqlite://").unwrap_or(&url);
                PathBuf::from(path)
            }
            Err(_) => self.paths.data_dir.join("spritedock.db"),
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded =
                    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string());
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("could not determine data directory"))?
            .join(APP_NAME);

        Ok(Self {
            config_file,
            data_dir,
        })
    }
}

fn default_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow!("could not determine config directory"))?
        .join(APP_NAME))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    sprite: SpriteConfig,
    oauth: OauthConfig,
    sessions: SessionsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            sprite: SpriteConfig::default(),
            oauth: OauthConfig::default(),
            sessions: SessionsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Sprite provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SpriteConfig {
    /// Base URL of the sprite API.
    base_url: String,
    /// Name of the shared sandbox all tasks route to.
    sandbox_name: String,
    /// Whether created sprites get public URLs.
    public: bool,
}

impl Default for SpriteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.sprites.dev".to_string(),
            sandbox_name: "spritedock-default".to_string(),
            public: false,
        }
    }
}

/// OAuth provider configuration for the agent token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct OauthConfig {
    /// Token endpoint for refresh requests.
    token_endpoint: String,
    /// OAuth client id.
    client_id: String,
    /// Refresh this many seconds before expiry.
    refresh_buffer_seconds: u64,
}

impl Default for OauthConfig {
    fn default() -> Self {
        Self {
            token_endpoint: "https://auth.example.com/v1/oauth/token".to_string(),
            client_id: APP_NAME.to_string(),
            refresh_buffer_seconds: 5 * 60,
        }
    }
}

/// Session supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionsConfig {
    /// Idle timeout in seconds before tearing down the agent channel.
    idle_timeout_seconds: u64,
    /// How often to sweep orphaned prewarm allocations, in seconds.
    orphan_sweep_interval_seconds: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 2 * 60,
            orphan_sweep_interval_seconds: 5 * 60,
        }
    }
}

fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let builder = Config::builder()
        .add_source(
            File::from(paths.config_file.clone())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("SPRITEDOCK").separator("__"));

    let config = builder.build().context("loading configuration")?;
    config
        .try_deserialize()
        .context("deserializing configuration")
}

const DEFAULT_CONFIG_TOML: &str = r#"# Spritedock configuration.

[logging]
level = "info"

[sprite]
# Base URL of the sprite (sandbox) provider API.
base_url = "https://api.sprites.dev"
# Name of the shared sandbox all tasks route to.
sandbox_name = "spritedock-default"
public = false

[oauth]
# Token endpoint used to refresh the agent's OAuth token.
token_endpoint = "https://auth.example.com/v1/oauth/token"
client_id = "spritedock"
refresh_buffer_seconds = 300

[sessions]
idle_timeout_seconds = 120
orphan_sweep_interval_seconds = 300
"#;

fn write_default_config(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    fs::write(path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    info!("wrote default config to {}", path.display());
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }
    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_token(ctx: &RuntimeContext, cmd: TokenCommand) -> Result<()> {
    let database = db::Database::new(&ctx.database_path()).await?;
    let manager = token::TokenManager::new(
        token::TokenRepository::new(database.pool().clone()),
        token_config(&ctx.config),
    );

    match cmd {
        TokenCommand::Seed(seed) => {
            let expires_at = chrono::Utc::now().timestamp_millis() + seed.expires_in * 1000;
            manager
                .seed(
                    &seed.access_token,
                    &seed.refresh_token,
                    expires_at,
                    seed.scopes.as_deref(),
                    seed.tier.as_deref(),
                )
                .await?;
            println!("Token seeded, expires at {expires_at} (unix ms)");
        }
        TokenCommand::Show => match manager.expires_at().await? {
            Some(expires_at) => {
                if ctx.common.json {
                    println!(r#"{{"expires_at": {expires_at}}}"#);
                } else {
                    println!("Token stored, expires at {expires_at} (unix ms)");
                }
            }
            None => println!("No token stored"),
        },
        TokenCommand::Refresh => {
            manager.force_refresh().await?;
            println!("Token refreshed");
        }
    }

    Ok(())
}

fn token_config(config: &AppConfig) -> token::TokenConfig {
    token::TokenConfig {
        token_endpoint: config.oauth.token_endpoint.clone(),
        client_id: config.oauth.client_id.clone(),
        refresh_buffer: Duration::from_secs(config.oauth.refresh_buffer_seconds),
        env_fallback: env::var("AGENT_OAUTH_TOKEN").ok(),
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting spritedock orchestrator...");

    let sandbox_token =
        env::var("SANDBOX_TOKEN").context("SANDBOX_TOKEN is required to reach the sprite API")?;
    let github_token = env::var("GITHUB_TOKEN").ok();
    if github_token.is_none() {
        warn!("GITHUB_TOKEN not set; private clones and gh will be unavailable");
    }

    let db_path = ctx.database_path();
    info!("Database path: {}", db_path.display());
    let database = db::Database::new(&db_path).await?;

    let tasks = task::TaskRepository::new(database.pool().clone());
    let repos = repo::RepoRepository::new(database.pool().clone());
    let store = convo::ConversationStore::new(database.pool().clone());
    let tokens = Arc::new(token::TokenManager::new(
        token::TokenRepository::new(database.pool().clone()),
        token_config(&ctx.config),
    ));

    let sprites: Arc<dyn sprite::SpriteApi> = Arc::new(sprite::SpriteClient::new(
        ctx.config.sprite.base_url.clone(),
        sandbox_token,
    ));

    let sandbox_name = cmd
        .sandbox
        .unwrap_or_else(|| ctx.config.sprite.sandbox_name.clone());
    let allocator = allocator::Allocator::spawn(
        sprites.clone(),
        repos.clone(),
        allocator::AllocatorConfig {
            sandbox_name,
            github_token: github_token.clone(),
            public_sandbox: ctx.config.sprite.public,
        },
    );

    let registry = Arc::new(session::SessionRegistry::new());

    // Recovery sweep: locks held by tasks with no running supervisor are
    // stale after a restart.
    let released = repos.release_stale_locks(&registry.live_task_ids()).await?;
    if released > 0 {
        info!("recovery sweep released {} stale repo locks", released);
    }

    // Tasks left active/awaiting_input by a crash have no supervisor now,
    // and neither do execution sessions still marked started.
    for task in tasks.list().await? {
        if task.status != task::TaskStatus::Idle {
            tasks.update_status(task.id, task::TaskStatus::Idle).await?;
        }
    }
    let interrupted = store.interrupt_all_started().await?;
    if interrupted > 0 {
        info!(
            "recovery sweep interrupted {} stale execution sessions",
            interrupted
        );
    }

    // The UI layer attaches sessions through these deps; hold them for the
    // lifetime of the process.
    let _session_deps = session::SessionDeps {
        allocator: allocator.clone(),
        sprites: sprites.clone(),
        tokens: tokens.clone(),
        store: store.clone(),
        tasks: tasks.clone(),
        repos: repos.clone(),
        config: session::SessionConfig {
            idle_timeout: Duration::from_secs(ctx.config.sessions.idle_timeout_seconds),
            github_token,
        },
    };

    // Periodic sweep for prewarm allocations whose tasks were deleted
    // before pickup.
    let sweep_interval =
        Duration::from_secs(ctx.config.sessions.orphan_sweep_interval_seconds.max(30));
    let sweep_allocator = allocator.clone();
    let sweep_tasks = tasks.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_tasks.list_ids().await {
                Ok(live) => sweep_allocator.sweep_orphans(live).await,
                Err(e) => warn!("orphan sweep skipped, task listing failed: {:?}", e),
            }
        }
    });

    info!("Orchestrator ready; waiting for sessions (ctrl-c to stop)");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutting down");
    Ok(())
}
