//! The `pgrelay` daemon binary: parses CLI flags, loads configuration, and
//! runs the supervisor until a shutdown signal arrives.
//!
//! Grounded in `sqlx-cli`'s `bin/sqlx.rs` entrypoint shape — parse an `Opt`,
//! hand it to a library-level `run`, print and exit nonzero on error — but
//! split into subcommands the way `sqlx-cli/src/opt.rs` splits `database`
//! from `migrate`, since pgrelay's binary also offers one-shot
//! `master-key`/`encrypt-password` administrative actions alongside the
//! long-running daemon.

mod config;
mod management;
mod master_key;
mod pidfile;
mod supervisor;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use config::Config;
use pidfile::PidFile;
use supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "pgrelay", version, about = "A high-performance PostgreSQL connection pool")]
struct Opt {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to `pgrelay.toml`. Required for every subcommand except
    /// `master-key`.
    #[arg(short, long, env = "PGRELAY_CONFIG", default_value = "pgrelay.toml")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pooler in the foreground (the default if no subcommand is given).
    Run,

    /// Generate a new master key at `~/.pgrelay/master.key` (or `--path`).
    MasterKey {
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Encrypt a password under the master key, for pasting into a
    /// credentials file.
    EncryptPassword {
        password: String,
    },
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();
    if let Err(err) = run(opt).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<()> {
    match opt.command.unwrap_or(Command::Run) {
        Command::MasterKey { path } => {
            let path = match path {
                Some(path) => path,
                None => master_key::default_path()?,
            };
            master_key::generate(&path)?;
            println!("master key written to {}", path.display());
            Ok(())
        }
        Command::EncryptPassword { password } => {
            let key = master_key::load(&master_key::default_path()?).context("loading master key")?;
            let encrypted = master_key::encrypt(&key, &password)?;
            println!("{encrypted}");
            Ok(())
        }
        Command::Run => run_daemon(&opt.config).await,
    }
}

async fn run_daemon(config_path: &std::path::Path) -> Result<()> {
    init_tracing();

    let config = Config::load(config_path).with_context(|| format!("loading {}", config_path.display()))?;
    let pidfile_path = config.pidfile.clone();
    let pidfile = PidFile::create(&pidfile_path).context("creating pid file")?;

    let supervisor = Supervisor::new(config).with_config_path(config_path.to_path_buf());
    let result = supervisor.run().await;

    drop(pidfile);
    result
}

/// `tracing-subscriber` init, `RUST_LOG`-driven, mirroring how `sqlx-cli`
/// leaves logging to its caller but matching what `sqlx_core`'s own
/// `tracing` instrumentation expects a host binary to set up.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
