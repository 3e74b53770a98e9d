//! basil CLI
//!
//! Starts the application server, or scaffolds a new site with `--init`.
//!
//! Exit codes: 0 success, 2 configuration error, 64 usage error,
//! 70 internal error.

mod init;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use basil::config::{Config, LogFormat};
use basil::error::BasilError;
use basil::server::Server;

const EXIT_CONFIG: u8 = 2;
const EXIT_USAGE: u8 = 64;
const EXIT_INTERNAL: u8 = 70;

#[derive(Parser)]
#[command(name = "basil")]
#[command(author, version, about = "HTTP application server for Parsley scripts", long_about = None)]
struct Cli {
    /// Development mode: live reload, cache staleness checks, and the
    /// in-browser error page.
    #[arg(long)]
    dev: bool,

    /// Configuration file (defaults to basil.yaml in the working
    /// directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scaffold a new site in the given directory and exit.
    #[arg(long, value_name = "DIR")]
    init: Option<PathBuf>,

    /// Apply a developers.<name> configuration overlay.
    #[arg(long, value_name = "NAME")]
    developer: Option<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap renders --help/--version through the error path too.
            let code = if e.use_stderr() {
                EXIT_USAGE
            } else {
                0
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    if let Some(dir) = cli.init {
        return match init::scaffold(&dir) {
            Ok(()) => {
                println!("Initialised a basil site in {}", dir.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("basil: init failed: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
        };
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("basil.yaml"));
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("basil: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(developer) = &cli.developer {
        if let Err(e) = config.apply_developer(developer) {
            eprintln!("basil: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    init_tracing(&config);

    let base_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("basil: runtime: {e}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    let result = runtime.block_on(async {
        let server = Server::from_config(config, base_dir, cli.dev).await?;
        server
            .serve(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ BasilError::Config(_)) => {
            eprintln!("basil: {e}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            eprintln!("basil: {e}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

fn init_tracing(config: &Config) {
    if config.logging.quiet {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
