use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_factory::config::{AppConfig, ProcessEnv, load_from_path};
use agent_factory::console::{Console, list_configured_agents};
use agent_factory::settings::{self, LogCli, LogEnv, LogFormat};
use agent_factory::{AppContext, service};
use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use env_flags::env_flags;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "agent-factory", version, about = "Run configured MCP-enabled agents")]
struct Cli {
    /// Log at debug level regardless of other settings.
    #[arg(long, global = true)]
    verbose: bool,
    /// Also write logs to daily files in this directory.
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConfigArg {
    /// Agent factory YAML file.
    #[arg(short, long, env = "AGENT_FACTORY_CONFIG", value_name = "FILE")]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Chat with the configured agents on stdin/stdout.
    Chat(ConfigArg),
    /// Print the configured agent names.
    List(ConfigArg),
    /// Serve agents over the agent-interop HTTP protocol.
    Serve {
        #[command(flatten)]
        config: ConfigArg,
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: SocketAddr,
    },
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(writer);
    match format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Full => base.boxed(),
    }
}

fn init_tracing(cli: &Cli) {
    env_flags! {
        /// Tracing filter, e.g. "info" or "agent_factory=debug".
        AGENT_FACTORY_LOG: &str = "";
        /// JSON formatting for logs.
        TRACING_JSON: bool = false;
        /// Compact single-line formatting (ignored if TRACING_JSON=true).
        TRACING_COMPACT: bool = true;
        /// Multi-line formatting (ignored if JSON or compact is selected).
        TRACING_PRETTY: bool = false;
        /// Also log to daily files under <AGENT_FACTORY_HOME>/logs or LOG_DIR.
        LOG_TO_FILE: bool = false;
        /// Explicit log directory.
        LOG_DIR: &str = "";
        /// Home directory for settings and logs. Defaults to $HOME/.agent-factory
        AGENT_FACTORY_HOME: &str = "";
    }

    let set = |k: &str| std::env::var_os(k).is_some();
    let env = LogEnv {
        filter: set("AGENT_FACTORY_LOG").then(|| (*AGENT_FACTORY_LOG).to_string()),
        json: set("TRACING_JSON").then_some(*TRACING_JSON),
        compact: set("TRACING_COMPACT").then_some(*TRACING_COMPACT),
        pretty: set("TRACING_PRETTY").then_some(*TRACING_PRETTY),
        to_file: set("LOG_TO_FILE").then_some(*LOG_TO_FILE),
        dir: set("LOG_DIR").then(|| (*LOG_DIR).to_string()),
    };

    let home = settings::resolve_home(*AGENT_FACTORY_HOME, &ProcessEnv);
    // Messages produced before the subscriber exists are replayed after init.
    let mut deferred = Vec::new();
    let user = match settings::load_user_settings(&home) {
        Ok(s) => s,
        Err(e) => {
            deferred.push(format!("ignoring user settings: {e:#}"));
            None
        }
    };
    let options = settings::resolve_log_options(
        &home,
        &env,
        user.as_ref().and_then(|u| u.logging.as_ref()),
        &LogCli {
            verbose: cli.verbose,
            log_dir: cli.log_dir.clone(),
        },
    );

    let filter = EnvFilter::try_new(&options.filter).unwrap_or_else(|_| {
        deferred.push(format!("invalid log filter '{}'", options.filter));
        EnvFilter::new(settings::DEFAULT_LOG_FILTER)
    });

    static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
    let mut layers = vec![fmt_layer(options.format, std::io::stderr, true)];
    if let Some(dir) = options.file_dir {
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&dir, settings::LOG_FILE_NAME);
                let (nb, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                layers.push(fmt_layer(options.format, nb, false));
            }
            Err(e) => deferred.push(format!("failed to create log dir {}: {e}", dir.display())),
        }
    }

    if let Err(e) = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
    {
        debug!("tracing already set: {e:?}");
    }
    for msg in deferred {
        warn!("{msg}");
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    load_from_path(path, &ProcessEnv)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

async fn start(config: AppConfig) -> anyhow::Result<AppContext> {
    AppContext::start_default(config, Arc::new(ProcessEnv))
        .await
        .context("failed to start agents")
}

async fn chat(path: &Path) -> anyhow::Result<()> {
    let ctx = start(load_config(path)?).await?;
    let limits = ctx.config().chat_history.clone();
    let result = match Console::new(ctx.factory(), limits, std::io::stdout()) {
        Some(mut console) => console
            .run(tokio::io::BufReader::new(tokio::io::stdin()))
            .await
            .context("console I/O failed"),
        None => Err(anyhow!("no agents configured in {}", path.display())),
    };
    ctx.shutdown().await;
    result
}

async fn serve(path: &Path, addr: SocketAddr) -> anyhow::Result<()> {
    let config = load_config(path)?;
    if config.service_factory.is_none() {
        return Err(anyhow!("{} has no service_factory section", path.display()));
    }
    let ctx = Arc::new(start(config).await?);
    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
        }
    };
    let result = service::serve(ctx.clone(), addr, stop).await;
    ctx.shutdown().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match &cli.command {
        Command::Chat(c) => chat(&c.config).await,
        Command::List(c) => {
            print!("{}", list_configured_agents(&load_config(&c.config)?));
            Ok(())
        }
        Command::Serve { config, addr } => serve(&config.config, *addr).await,
    }
}
