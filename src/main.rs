//! Boxi agent
//!
//! Runs terminal sessions on the host or inside toolbox containers. `boxi run`
//! is the client: it spawns an agent worker, opens one session and mirrors the
//! session's terminal. `boxi agent` is the worker the client spawns.

mod agent;
mod channel;
mod config;
mod console;
mod process;
mod protocol;
mod worker;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use agent::{Agent, AgentTarget, SessionListener, HOST_LABEL};
use config::Settings;
use console::ConsoleListener;

/// Boxi agent
///
/// Terminal sessions on the host or in toolbox containers
#[derive(Parser, Debug)]
#[command(name = "boxi")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command, or a login shell, in a new session
    Run {
        /// Container to run in instead of the host
        #[arg(short, long)]
        container: Option<String>,

        /// Working directory for the command
        #[arg(long)]
        cwd: Option<String>,

        /// Command and arguments; empty starts a login shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Serve sessions on the control channel inherited at descriptor 3
    Agent {
        /// Name used in logs
        #[arg(long, default_value = HOST_LABEL)]
        label: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging. The client and its worker share the terminal with
    // the session, so both stay quiet unless asked.
    let default_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::load_default().context("Failed to load settings")?,
    };
    // The worker runs from another directory, possibly in a container.
    settings.agent.worker_config = args
        .config
        .as_deref()
        .map(std::path::absolute)
        .transpose()
        .context("Failed to resolve the settings path")?;
    settings.agent.worker_verbose = args.verbose;

    match args.command {
        Command::Agent { label } => run_agent(label, settings).await,
        Command::Run {
            container,
            cwd,
            command,
        } => {
            let code = run_client(container, cwd, command, settings).await?;
            std::process::exit(i32::from(code));
        }
    }
}

/// Worker side: serve the inherited channel until the client goes away
async fn run_agent(label: String, settings: Settings) -> anyhow::Result<()> {
    info!("Boxi agent v{} for {}", env!("CARGO_PKG_VERSION"), label);

    let channel = worker::inherited_channel()
        .context("The agent must be started with its control channel at descriptor 3")?;
    let settings = Arc::new(settings.worker);

    tokio::select! {
        result = worker::serve(channel, settings) => result?,
        _ = shutdown_signal() => {
            info!("Agent for {} stopping on signal", label);
        }
    }

    info!("Agent for {} shutdown complete", label);
    Ok(())
}

/// Client side: one session, mirrored on this terminal
async fn run_client(
    container: Option<String>,
    cwd: Option<String>,
    command: Vec<String>,
    settings: Settings,
) -> anyhow::Result<u8> {
    let target = AgentTarget::from_container(container);
    let agent = Agent::spawn(target, &settings).context("Failed to start the agent")?;

    let listener = Arc::new(ConsoleListener::new());
    let weak: Weak<dyn SessionListener> = Arc::downgrade(&listener) as Weak<dyn SessionListener>;
    let session = agent.create_session(weak)?;

    let cwd = cwd.or_else(|| {
        std::env::current_dir()
            .ok()
            .map(|dir| dir.display().to_string())
    });
    if command.is_empty() {
        session.start_shell(cwd)?;
    } else {
        session.start_command(command, cwd, Vec::new())?;
    }

    let code = tokio::select! {
        code = listener.wait() => code,
        _ = agent.closed() => {
            listener.restore_terminal();
            error!("Agent {} exited before the session finished", agent.id());
            console::NO_STATUS_EXIT_CODE
        }
    };
    Ok(code)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
