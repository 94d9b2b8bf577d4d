use crate::bridges::Catalog;
use crate::compose::runner::{CommandRunner, ProcessRunner};
use crate::compose::{ServiceStatus, SYNAPSE_SERVICE};
use crate::config::{ApiCredentials, Connectivity, HttpsConfig, Paths, Settings};
use crate::error::Error;
use crate::matrix::{self, BotConversations, MatrixBots};
use crate::orchestrator::{self, Orchestrator, Outcome, Plan, Progress};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Output line routing for stdout/stderr writer.
#[derive(Debug)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

type Output = mpsc::UnboundedSender<OutputLine>;

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
/// The streams are not held locked so terminal prompts can still be written.
fn spawn_output_writer() -> (Output, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let mut out = std::io::LineWriter::new(std::io::stdout());
        let mut err = std::io::LineWriter::new(std::io::stderr());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

fn say(out: &Output, line: impl Into<String>) {
    let _ = out.send(OutputLine::Stdout(line.into()));
}

fn note(out: &Output, line: impl Into<String>) {
    let _ = out.send(OutputLine::Stderr(line.into()));
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "muxbee",
    version,
    about = "Run a local Matrix homeserver with mautrix bridges through docker compose"
)]
pub struct Cli {
    /// Directory holding settings.yaml and generated configuration
    #[arg(long, global = true, env = "MUXBEE_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Directory holding service data (database, media, bridge state)
    #[arg(long, global = true, env = "MUXBEE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Write settings and generate configuration
    Init(InitArgs),
    /// Start the stack
    Up {
        /// Pull images before starting
        #[arg(long)]
        pull: bool,
    },
    /// Stop every service
    Down,
    /// Stop and start every service
    Restart,
    /// Show service status
    Status,
    /// Check the engine, services and HTTP endpoints
    Health,
    /// Show service logs
    Logs {
        /// Compose service name, e.g. synapse or mautrix-signal
        service: Option<String>,
        /// Keep streaming new lines
        #[arg(short, long)]
        follow: bool,
        /// Lines of history to show
        #[arg(long, default_value_t = 100)]
        tail: usize,
    },
    /// Pull new images and recreate containers
    Update,
    /// Manage bridges
    Bridge {
        #[command(subcommand)]
        action: BridgeCommand,
    },
    /// Inspect settings
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Open Element in the default browser
    Open,
    /// Open a conversation with every enabled bridge bot
    SetupBots,
    /// Stop everything and delete all configuration and data
    Nuke {
        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Interactive dashboard (default)
    Tui,
}

#[derive(Debug, Args, Clone)]
pub struct InitArgs {
    /// Matrix server name (the part after the colon in user IDs)
    #[arg(long, default_value = "localhost")]
    pub server_name: String,

    /// Who can reach the server: local, private or public
    #[arg(long, default_value = "local", value_parser = parse_connectivity)]
    pub connectivity: Connectivity,

    /// Serve through Caddy with automatic TLS (public connectivity only)
    #[arg(long, requires = "domain")]
    pub https: bool,

    /// Public domain for HTTPS
    #[arg(long)]
    pub domain: Option<String>,

    /// Contact address for the ACME account
    #[arg(long)]
    pub email: Option<String>,

    /// Do not run the Element web client
    #[arg(long)]
    pub no_element: bool,

    /// Replace existing settings
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum BridgeCommand {
    /// List known bridges
    List,
    /// Enable a bridge
    Enable { name: String },
    /// Disable a bridge
    Disable { name: String },
    /// Show how to log in to a bridge
    Login { name: String },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ConfigCommand {
    /// Print settings.yaml
    Show {
        /// Print passwords and tokens unmasked
        #[arg(long)]
        show_secrets: bool,
    },
    /// Print the configuration and data directories
    Path,
}

fn parse_connectivity(s: &str) -> std::result::Result<Connectivity, String> {
    match s.to_ascii_lowercase().as_str() {
        "local" => Ok(Connectivity::Local),
        "private" => Ok(Connectivity::Private),
        "public" => Ok(Connectivity::Public),
        other => Err(format!("unknown connectivity `{other}` (expected local, private or public)")),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let paths = Paths::resolve(args.config_dir.clone(), args.data_dir.clone())
        .context("resolve directories")?;
    let command = args.command.unwrap_or(Command::Tui);

    if matches!(command, Command::Tui) {
        crate::logging::init_file(&paths.log_dir())?;
    } else {
        crate::logging::init_stderr();
    }

    let catalog = Arc::new(Catalog::embedded().context("load bridge catalog")?);
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let bots: Arc<dyn BotConversations> = Arc::new(MatrixBots::new(catalog.clone()));
    let orch = Orchestrator::new(paths, catalog, runner, bots);

    if matches!(command, Command::Tui) {
        return run_tui(orch).await;
    }
    let (out, handle) = spawn_output_writer();
    let res = run_command(&orch, command, &out).await;
    drop(out);
    let _ = handle.await;
    res
}

#[cfg(feature = "tui")]
async fn run_tui(orch: Orchestrator) -> Result<()> {
    let settings = match orch.load_settings() {
        Ok(s) => Some(s),
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(e).context("load settings"),
    };
    crate::tui::run(orch, settings).await
}

#[cfg(not(feature = "tui"))]
async fn run_tui(_orch: Orchestrator) -> Result<()> {
    bail!("this build has no dashboard; see `muxbee --help` for commands")
}

async fn run_command(orch: &Orchestrator, command: Command, out: &Output) -> Result<()> {
    match command {
        Command::Tui => run_tui(orch.clone()).await,
        Command::Init(args) => run_init(orch, args, out).await,
        Command::Nuke { yes } => run_nuke(orch, yes, out).await,
        Command::Up { pull } => {
            let settings = orch.load_settings()?;
            let compose = orch.compose(&settings);
            if !compose.engine_available().await {
                bail!("docker is not available; is the daemon running?");
            }
            let plan = Plan::stack_up(pull, !settings.enabled_bridges.is_empty(), &settings.timings);
            let outcome = execute(orch, plan, settings, out).await?;
            say(out, format!("Homeserver: {}", outcome.settings.public_base_url()));
            if outcome.settings.element_enabled() {
                say(out, format!("Element:    {}", outcome.settings.element_url()));
            }
            Ok(())
        }
        Command::Down => {
            let settings = orch.load_settings()?;
            execute(orch, Plan::stop(), settings, out).await.map(drop)
        }
        Command::Restart => {
            let settings = orch.load_settings()?;
            execute(orch, Plan::restart(), settings, out).await.map(drop)
        }
        Command::Update => {
            let settings = orch.load_settings()?;
            execute(orch, Plan::update(), settings, out).await.map(drop)
        }
        Command::Status => {
            let settings = orch.load_settings()?;
            let statuses = orch.compose(&settings).status_with_versions().await;
            if statuses.is_empty() {
                say(out, "No containers (start them with `muxbee up`)");
            }
            for line in status_table(&statuses, orch.catalog()) {
                say(out, line);
            }
            Ok(())
        }
        Command::Health => run_health(orch, out).await,
        Command::Logs {
            service,
            follow,
            tail,
        } => {
            let settings = orch.load_settings()?;
            let compose = orch.compose(&settings);
            if !follow {
                let text = compose.logs(service.as_deref(), tail).await?;
                say(out, text.trim_end());
                return Ok(());
            }
            let mut stream = compose.follow_logs(service.as_deref(), tail).await?;
            loop {
                tokio::select! {
                    line = stream.next_line() => match line.context("read logs")? {
                        Some(line) => say(out, line),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            Ok(())
        }
        Command::Bridge { action } => run_bridge(orch, action, out).await,
        Command::Config { action } => match action {
            ConfigCommand::Show { show_secrets } => {
                let settings = orch.load_settings()?;
                let shown = if show_secrets { settings } else { settings.masked() };
                let yaml = serde_yaml::to_string(&shown).context("serialize settings")?;
                say(out, yaml.trim_end());
                Ok(())
            }
            ConfigCommand::Path => {
                let paths = orch.paths();
                say(out, format!("settings: {}", paths.settings_file().display()));
                say(out, format!("config:   {}", paths.config_dir().display()));
                say(out, format!("data:     {}", paths.data_dir().display()));
                say(out, format!("logs:     {}", paths.log_dir().display()));
                Ok(())
            }
        },
        Command::Open => {
            let settings = orch.load_settings()?;
            if !settings.element_enabled() {
                bail!("Element is disabled in settings");
            }
            let url = settings.element_url();
            orchestrator::open_url(orch.runner().as_ref(), &url).await?;
            say(out, format!("Opened {url}"));
            Ok(())
        }
        Command::SetupBots => {
            let settings = orch.load_settings()?;
            if settings.enabled_bridges.is_empty() {
                say(out, "No bridges enabled");
                return Ok(());
            }
            let bots = MatrixBots::new(orch.catalog().clone());
            let failures = bots.setup_bots(&settings, &settings.enabled_bridges).await;
            for f in &failures {
                note(out, format!("warning: {f}"));
            }
            say(out, format!(
                "Bot conversations ready for {} of {} bridges",
                settings.enabled_bridges.len().saturating_sub(failures.len()),
                settings.enabled_bridges.len()
            ));
            Ok(())
        }
    }
}

/// Run `plan`, printing each step as it starts.
async fn execute(orch: &Orchestrator, plan: Plan, settings: Settings, out: &Output) -> Result<Outcome> {
    let (tx, mut rx) = watch::channel(Progress::default());
    let printer_out = out.clone();
    let printer = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let p = rx.borrow_and_update().clone();
            note(&printer_out, format!("[{}/{}] {}", p.index + 1, p.total, p.label));
        }
    });

    let res = orch.execute(&plan, settings, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;

    let outcome = res?;
    for w in &outcome.warnings {
        note(out, format!("warning: {w}"));
    }
    for n in &outcome.notes {
        say(out, n.clone());
    }
    Ok(outcome)
}

/// Bridge rows carry the catalog description.
fn status_table(statuses: &[ServiceStatus], catalog: &Catalog) -> Vec<String> {
    if statuses.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![format!("{:<22} {:<20} {:<12} {}", "SERVICE", "STATE", "VERSION", "IMAGE")];
    for s in statuses {
        let mut row = format!(
            "{:<22} {:<20} {:<12} {}",
            s.name,
            s.display_state(),
            s.version.as_deref().unwrap_or("-"),
            s.image
        );
        if let Some(bridge) = catalog.for_service(&s.name) {
            row.push_str(&format!("  ({})", bridge.description));
        }
        lines.push(row);
    }
    lines
}

/// Services that should be running for `settings`.
fn expected_services(settings: &Settings) -> Vec<String> {
    let mut services = vec!["postgres".to_string(), SYNAPSE_SERVICE.to_string()];
    if settings.element_enabled() {
        services.push("element".into());
    }
    if settings.https_active() {
        services.push("caddy".into());
    }
    services.extend(settings.enabled_bridges.iter().map(|b| format!("mautrix-{b}")));
    services
}

async fn run_init(orch: &Orchestrator, args: InitArgs, out: &Output) -> Result<()> {
    if Settings::exists(orch.paths()) && !args.force {
        bail!(
            "settings already exist at {} (use --force to replace them)",
            orch.paths().settings_file().display()
        );
    }
    let settings = init_settings(&args)?;
    let outcome = execute(orch, Plan::initialize(), settings, out).await?;
    let s = &outcome.settings;
    say(out, format!("Initialized {} ({})", s.server_name, s.connectivity.label()));
    say(out, format!("Settings: {}", orch.paths().settings_file().display()));
    say(out, format!("Admin:    {} (created on first `muxbee up`)", s.admin_user_id()));
    Ok(())
}

fn init_settings(args: &InitArgs) -> Result<Settings> {
    let server_name = args.server_name.trim();
    if server_name.is_empty() {
        bail!("--server-name cannot be empty");
    }
    if args.https && args.connectivity != Connectivity::Public {
        bail!("--https needs --connectivity public");
    }
    let https = args.https.then(|| HttpsConfig {
        enabled: true,
        domain: args.domain.clone().unwrap_or_default(),
        email: args.email.clone().unwrap_or_default(),
    });
    let mut settings = Settings::defaults_for(args.connectivity, server_name, https);
    if args.no_element {
        settings.element_enabled = Some(false);
    }
    Ok(settings)
}

async fn run_bridge(orch: &Orchestrator, action: BridgeCommand, out: &Output) -> Result<()> {
    match action {
        BridgeCommand::List => {
            let settings = match orch.load_settings() {
                Ok(s) => Some(s),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
            let statuses = match &settings {
                Some(s) => orch.compose(s).status().await,
                None => Vec::new(),
            };
            for d in orch.catalog().iter() {
                let enabled = settings.as_ref().is_some_and(|s| s.is_enabled(&d.name));
                let running = statuses.iter().any(|s| s.name == d.service_name() && s.running);
                let state = match (enabled, running) {
                    (true, true) => "running",
                    (true, false) => "enabled",
                    (false, _) => "-",
                };
                let creds = if d.requires_credentials { "  [api credentials]" } else { "" };
                say(out, format!("{:<12} {:<9} {}{creds}", d.name, state, d.description));
            }
            Ok(())
        }
        BridgeCommand::Disable { name } => {
            orch.catalog().require(&name)?;
            let settings = orch.load_settings()?;
            if !settings.is_enabled(&name) {
                say(out, format!("{name} is not enabled"));
                return Ok(());
            }
            let running = orch.stack_running(&settings).await;
            execute(orch, Plan::disable_bridge(&name, running), settings, out).await?;
            say(out, format!("Disabled {name}"));
            Ok(())
        }
        BridgeCommand::Login { name } => {
            let desc = orch.catalog().require(&name)?;
            let server = match orch.load_settings() {
                Ok(s) => s.server_name,
                Err(Error::NotFound(_)) => "localhost".into(),
                Err(e) => return Err(e.into()),
            };
            say(out, format!("Open a chat with {} and follow these steps:", desc.bot_user_id(&server)));
            say(out, "");
            for line in desc.login_instructions_for(&server).lines() {
                say(out, format!("  {line}"));
            }
            if let Some(n) = &desc.note {
                say(out, "");
                say(out, format!("Note: {n}"));
            }
            Ok(())
        }
        BridgeCommand::Enable { name } => run_bridge_enable(orch, &name, out).await,
    }
}

async fn run_bridge_enable(orch: &Orchestrator, name: &str, out: &Output) -> Result<()> {
    let desc = orch.catalog().require(name)?.clone();
    let mut settings = orch.load_settings()?;
    if settings.is_enabled(name) {
        say(out, format!("{name} is already enabled"));
        return Ok(());
    }
    if desc.requires_credentials && settings.credentials_for(name).is_none() {
        let creds = prompt_credentials(name).await?;
        settings.set_credentials(name, creds);
    }

    let running = orch.stack_running(&settings).await;
    let plan = Plan::enable_bridge(name, &settings.timings, running);
    let outcome = execute(orch, plan, settings, out).await?;
    say(out, format!("Enabled {name}; chat with {}", desc.bot_user_id(&outcome.settings.server_name)));
    if !running {
        say(out, "The stack is not running; start it with `muxbee up`");
    }
    Ok(())
}

async fn prompt_credentials(bridge: &str) -> Result<ApiCredentials> {
    let bridge = bridge.to_string();
    tokio::task::spawn_blocking(move || -> Result<ApiCredentials> {
        eprintln!("{bridge} needs API credentials from https://my.telegram.org");
        let api_id = prompt_line("API ID: ")?;
        let api_hash = prompt_line("API Hash: ")?;
        let creds = ApiCredentials { api_id, api_hash };
        if !creds.is_complete() {
            bail!("both API ID and API Hash are required");
        }
        Ok(creds)
    })
    .await
    .context("credential prompt")?
}

fn prompt_line(label: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{label}").and_then(|_| stderr.flush()).context("write prompt")?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).context("read from stdin")?;
    Ok(line.trim().to_string())
}

async fn run_health(orch: &Orchestrator, out: &Output) -> Result<()> {
    let mut failed = 0usize;
    let mut check = |ok: bool, what: String| {
        if !ok {
            failed += 1;
        }
        say(out, format!("[{}] {what}", if ok { " ok " } else { "FAIL" }));
    };

    let settings = match orch.load_settings() {
        Ok(s) => {
            check(true, format!("settings at {}", orch.paths().settings_file().display()));
            s
        }
        Err(e) => {
            check(false, format!("settings: {e}"));
            bail!("health check failed");
        }
    };
    let compose = orch.compose(&settings);
    check(compose.engine_available().await, "docker engine reachable".into());

    let statuses = compose.status().await;
    for service in expected_services(&settings) {
        let running = statuses.iter().any(|s| s.name == service && s.running);
        check(running, format!("{service} running"));
    }

    let mut probes = vec![(
        "synapse /health",
        format!("{}/health", settings.local_homeserver_url()),
    )];
    if settings.element_enabled() {
        probes.push(("element", format!("http://localhost:{}/", settings.element_port())));
    }
    for (what, url) in probes {
        match matrix::probe(&url).await {
            Ok(status) => check(status.is_success(), format!("{what} responded {status}")),
            Err(e) => check(false, format!("{what}: {}", crate::error::chain(&e))),
        }
    }

    if failed > 0 {
        bail!("{failed} health check(s) failed");
    }
    Ok(())
}

async fn run_nuke(orch: &Orchestrator, yes: bool, out: &Output) -> Result<()> {
    if !yes {
        let paths = orch.paths().clone();
        let confirmed = tokio::task::spawn_blocking(move || -> Result<bool> {
            eprintln!("This stops every service and deletes:");
            eprintln!("  {}", paths.config_dir().display());
            eprintln!("  {}", paths.data_dir().display());
            Ok(prompt_line("Type 'yes' to continue: ")? == "yes")
        })
        .await
        .context("confirmation prompt")??;
        if !confirmed {
            bail!("aborted");
        }
    }

    match orch.load_settings() {
        Ok(settings) => {
            note(out, "Removing containers and volumes");
            if let Err(e) = orch.compose(&settings).down_volumes().await {
                note(out, format!("warning: {}", crate::error::chain(&e)));
            }
        }
        Err(e) => note(out, format!("warning: skipping compose teardown: {e}")),
    }
    for dir in [orch.paths().config_dir(), orch.paths().data_dir()] {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => note(out, format!("Removed {}", dir.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {}", dir.display())),
        }
    }
    Ok(())
}
