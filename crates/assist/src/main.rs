use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use assist::api::{AppState, create_router};
use assist::assistant::AssistantRegistry;
use assist::chat::ChatService;
use assist::config::{AppConfig, AppPaths, load_or_init_config, write_default_config};
use assist::db::Database;
use assist::export::ExportPipeline;
use assist::ingest::{AttachmentIngestor, SofficeConverter};
use assist::llm::OpenAiResponsesClient;
use assist::report::{PdfReportRenderer, ReportRenderer};
use assist::store::ConversationRepository;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => run_async(handle_serve(&ctx, cmd)),
        Command::Export(cmd) => run_async(handle_export(&ctx, cmd)),
        Command::Reconcile => run_async(handle_reconcile(&ctx)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

fn run_async<F: Future<Output = Result<()>>>(fut: F) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(fut)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Assist - streaming assistant chat backend with bulk export.",
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
    /// Output machine readable JSON (logs and command output)
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
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Run one export, archive upload and purge
    Export(ExportCommand),
    /// List user messages that never got an assistant reply
    Reconcile,
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides `server.host`)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides `server.port`)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct ExportCommand {
    /// Folder date as YYYY-MM-DD (defaults to today)
    #[arg(long, value_name = "DATE")]
    date: Option<NaiveDate>,
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

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, common.dry_run)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("assist={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
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
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> &str {
        if self.common.quiet {
            "error"
        } else if self.common.trace {
            "trace"
        } else if self.common.debug {
            "debug"
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.as_str(),
                1 => "debug",
                _ => "trace",
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            return Ok(());
        }

        for dir in [&self.paths.data_dir, &self.paths.state_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn renderer(&self) -> Arc<dyn ReportRenderer> {
        Arc::new(PdfReportRenderer::new(&self.config.export.footer))
    }

    async fn open_repository(&self) -> Result<ConversationRepository> {
        let db_path = self.paths.database_path();
        info!("Database path: {}", db_path.display());
        let database = Database::new(&db_path).await?;
        Ok(ConversationRepository::new(database.pool().clone()))
    }

    fn export_pipeline(
        &self,
        repo: &ConversationRepository,
        renderer: Arc<dyn ReportRenderer>,
    ) -> Result<ExportPipeline> {
        Ok(ExportPipeline::new(
            repo.clone(),
            renderer,
            self.config.build_uploader(&self.paths)?,
            self.config.export_settings(&self.paths)?,
        ))
    }

    async fn load_registry(&self, repo: &ConversationRepository) -> Result<AssistantRegistry> {
        let prompts_dir = self.config.prompts_dir(&self.paths)?;
        let registry = AssistantRegistry::from_configs(&self.config.assistants, &prompts_dir)
            .context("loading assistants")?;
        if registry.is_empty() {
            warn!("No assistants configured; every chat request will be rejected");
        }
        registry.sync_to_store(repo).await?;
        Ok(registry)
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting assist server...");

    let repo = ctx.open_repository().await?;
    let registry = ctx.load_registry(&repo).await?;

    let unanswered = repo.find_unanswered_messages().await?;
    if !unanswered.is_empty() {
        warn!(
            count = unanswered.len(),
            "Found user messages without a reply (run `assist reconcile` for details)"
        );
    }

    let client = OpenAiResponsesClient::new(
        &ctx.config.llm.base_url,
        Duration::from_secs(ctx.config.llm.request_timeout_secs),
    )?;
    let ingestor = AttachmentIngestor::new(
        Arc::new(SofficeConverter::new(&ctx.config.ingest.soffice_binary)),
        ctx.config.ingest.build_extractor()?,
    );
    let chat = ChatService::new(
        repo.clone(),
        registry,
        Arc::new(client),
        ingestor,
        ctx.config.chat_settings(),
    );

    let renderer = ctx.renderer();
    let export = ctx.export_pipeline(&repo, renderer.clone())?;
    let upload_dir = ctx.config.upload_dir(&ctx.paths)?;
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .with_context(|| format!("creating upload directory {}", upload_dir.display()))?;

    let state = AppState::new(chat, export, renderer, upload_dir)
        .with_allowed_origins(ctx.config.allowed_origins.clone());
    let app = create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

async fn handle_export(ctx: &RuntimeContext, cmd: ExportCommand) -> Result<()> {
    if ctx.common.dry_run {
        info!("dry-run: would export, upload and purge all conversations");
        return Ok(());
    }

    let repo = ctx.open_repository().await?;
    ctx.load_registry(&repo).await?;
    let pipeline = ctx.export_pipeline(&repo, ctx.renderer())?;

    let report = match cmd.date {
        Some(date) => pipeline.run_for_date(date).await,
        None => pipeline.run().await,
    }
    .context("export failed")?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing export report to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(&report).context("serializing export report to YAML")?
        );
    } else {
        println!(
            "Exported {} message(s) in {} report(s) to {} (uploaded: {}, purged: {})",
            report.message_count,
            report.report_count,
            report.archive_path.display(),
            report.uploaded,
            report.purged.is_some()
        );
    }
    Ok(())
}

async fn handle_reconcile(ctx: &RuntimeContext) -> Result<()> {
    let repo = ctx.open_repository().await?;
    let unanswered = repo.find_unanswered_messages().await?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&unanswered)
                .context("serializing unanswered messages to JSON")?
        );
        return Ok(());
    }

    if unanswered.is_empty() {
        println!("Every user message has a reply.");
        return Ok(());
    }
    for message in &unanswered {
        println!(
            "{}  chat={}  message={}",
            message.created_at, message.chat_id, message.id
        );
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)?;
    let prompts_dir = ctx.config.prompts_dir(&ctx.paths)?;
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("creating prompts directory {}", prompts_dir.display()))?;
    println!("Wrote {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = ctx.config.redacted();
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&config).context("serializing config to YAML")?
                );
            } else {
                println!("{config:#?}");
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}
