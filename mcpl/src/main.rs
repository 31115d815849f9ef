//! `mcpl` entry point.

use clap::{Parser, Subcommand};

use mcpl::cli::{AddArgs, DaemonArgs};
use mcpl::daemon::Daemon;
use mcpl::error::DaemonError;

/// mcpl: run each MCP server once, share it across editor sessions.
#[derive(Parser)]
#[command(name = "mcpl", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the multiplexing daemon in the foreground.
    Daemon(DaemonArgs),
    /// Stop a running daemon (SIGTERM via its PID file).
    Stop,
    /// Add an MCP server to the config.
    Add(AddArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Daemon(args) => match run_daemon(args).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "daemon failed");
                eprintln!("mcpl daemon: {e}");
                1
            }
        },
        Commands::Stop => match run_stop() {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("mcpl stop: {e}");
                1
            }
        },
        Commands::Add(args) => match run_add(args) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("mcpl add: {e}");
                1
            }
        },
    };

    std::process::exit(code);
}

fn run_stop() -> Result<(), DaemonError> {
    let pid_path = mcpl_core::config::pid_file_path()?;
    let pid = mcpl::admin::stop_daemon(&pid_path)?;
    println!("sent shutdown signal to daemon (pid {pid})");
    Ok(())
}

fn run_add(args: AddArgs) -> Result<(), DaemonError> {
    let config_path = match args.config {
        Some(path) => path,
        None => mcpl_core::config::config_file_path()?,
    };
    let server = mcpl_core::config::ServerConfig {
        command: args.command[0].clone(),
        args: args.command[1..].to_vec(),
        env: mcpl::admin::parse_env_pairs(&args.env)?,
        serialize: args.serialize,
        managed: !args.unmanaged,
    };
    mcpl::admin::add_server(&config_path, &args.name, server)?;
    println!("added {} to {}", args.name, config_path.display());
    Ok(())
}

async fn run_daemon(args: DaemonArgs) -> Result<(), DaemonError> {
    let config_path = match args.config {
        Some(path) => path,
        None => mcpl_core::config::config_file_path()?,
    };
    let cfg = mcpl_core::config::load(&config_path)?;

    init_tracing(args.verbose, cfg.log_level.as_deref());

    let socket_path = args.socket.unwrap_or_else(mcpl_core::config::socket_path);
    let pid_path = mcpl_core::config::pid_file_path()?;

    let daemon = Daemon::new(&cfg, config_path, socket_path, Some(pid_path));
    daemon.run().await
}

/// Stderr logging. Precedence: `--verbose`, then `RUST_LOG`, then the
/// config's `log_level`, then `info`.
fn init_tracing(verbose: bool, config_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config_level.unwrap_or("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
