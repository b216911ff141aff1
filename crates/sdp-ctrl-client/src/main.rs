//! `sdp-ctrl-client`
//!
//! Keeps a session with an SDP controller: rotates TLS and SPA credentials on
//! schedule and proves liveness with keep-alives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use sdp_ctrl_client::clock::SystemClock;
use sdp_ctrl_client::daemon::{self, Daemonized, PROCESS_SIGNALS};
use sdp_ctrl_client::transport::TlsTransportBuilder;
use sdp_ctrl_client::{Client, ClientError};
use sdp_ctrl_core::{ClientConfig, CliOverrides, ConfigPaths};

#[derive(Parser, Debug)]
#[command(name = "sdp-ctrl-client")]
#[command(version, about = "SDP control client - credential rotation and keep-alive")]
struct Args {
    /// Client configuration file (TOML).
    #[arg(
        long,
        short = 'c',
        env = "SDP_CTRL_CONFIG",
        default_value = "/etc/sdp/sdp_ctrl_client.toml"
    )]
    config: PathBuf,

    /// SPA helper configuration file; overrides `spa.fwknoprc_file`.
    #[arg(long, env = "SDP_CTRL_FWKNOPRC")]
    fwknoprc: Option<PathBuf>,

    /// Stay attached to the terminal instead of daemonizing.
    #[arg(long)]
    foreground: bool,

    /// Log level filter (e.g. "info", "debug"); overrides `log.level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, env = "SDP_CTRL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Connect and run, daemonizing unless configured for the foreground.
    Start,
    /// Terminate the running instance.
    Stop,
    /// Make the running instance reload its configuration.
    Restart,
    /// Report whether an instance is running.
    Status,
    /// Print the effective settings.
    Describe,
}

#[allow(clippy::print_stderr)]
fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "sdp-ctrl-client failed");
            eprintln!("sdp-ctrl-client: {e:#}");
            let code = e
                .downcast_ref::<ClientError>()
                .map_or(1, ClientError::exit_code);
            ExitCode::from(code)
        }
    }
}

#[allow(clippy::print_stdout)]
fn run(args: Args) -> anyhow::Result<()> {
    let paths = ConfigPaths::new(&args.config, args.fwknoprc.clone()).with_overrides(
        CliOverrides {
            foreground: args.foreground,
            log_level: args.log_level.clone(),
        },
    );
    let config = ClientConfig::load(&paths).map_err(ClientError::from)?;

    let log_filter = format!(
        "sdp_ctrl_client={0},sdp_ctrl_core={0}",
        config.log.level
    );
    sdp_ctrl_core::tracing_init::init_tracing(
        &log_filter,
        args.log_json || config.log.json,
        config.log.file.as_deref(),
    )
    .map_err(|e| {
        let path = config.log.file.clone().unwrap_or_default();
        ClientError::filesystem(path, e)
    })?;

    let pid_file = config.client.pid_file.clone();
    match args.command {
        Command::Stop => {
            let pid = daemon::stop(&pid_file)?;
            println!("Stopped sdp-ctrl-client (pid={pid})");
        }
        Command::Restart => {
            let pid = daemon::restart(&pid_file)?;
            println!("Sent restart signal to sdp-ctrl-client (pid={pid})");
        }
        Command::Status => match daemon::status(&pid_file)? {
            Some(pid) => println!("sdp-ctrl-client is running (pid={pid})"),
            None => {
                println!("sdp-ctrl-client is not running");
                return Err(ClientError::Other("no running instance detected".into()).into());
            }
        },
        Command::Describe => {
            let client = new_client(config)?;
            println!("{}", client.describe()?);
        }
        Command::Start => start(config)?,
    }
    Ok(())
}

fn new_client(config: ClientConfig) -> Result<Client, ClientError> {
    Client::from_config(
        config,
        Box::new(TlsTransportBuilder),
        Arc::new(SystemClock),
        &PROCESS_SIGNALS,
    )
}

#[allow(clippy::print_stdout)]
fn start(config: ClientConfig) -> Result<(), ClientError> {
    let foreground = config.client.foreground;
    let pid_file = config.client.pid_file.clone();
    let mut client = new_client(config)?;

    let lock = if foreground {
        daemon::install_handlers()?;
        daemon::acquire_foreground(&pid_file)?
    } else {
        match daemon::daemonize(&pid_file)? {
            Daemonized::Parent { child } => {
                println!("{child}");
                return Ok(());
            }
            Daemonized::Child(lock) => lock,
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = lock.pid(),
        foreground,
        "Starting SDP Control Client"
    );
    client.attach_pid_lock(lock);
    client.run()
}
