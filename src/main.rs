use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use lfs_filter::config::resolve_git_dir;
use lfs_filter::server::{run_filter_process, FilterProcessArgs};

#[derive(Debug, Parser)]
#[command(name = "lfs-filter", version, about = "Git LFS filter process")]
struct Cli {
    /// Config file (default: <git-dir>/lfs-filter.toml)
    #[arg(long, global = true, env = "LFS_FILTER_CONFIG")]
    config: Option<PathBuf>,

    /// Repository's .git directory (default: discovered from the working directory)
    #[arg(long, global = true, env = "GIT_DIR")]
    git_dir: Option<PathBuf>,

    /// LFS storage directory to fetch missing objects from
    #[arg(long, global = true, env = "LFS_FILTER_REMOTE")]
    remote: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve Git's long-running filter protocol on stdin/stdout
    FilterProcess {
        /// Leave pointers in the working tree instead of downloading content
        #[arg(short, long)]
        skip: bool,
    },
}

fn init_tracing() {
    // stdout carries the protocol, so logs must go to stderr.
    let filter = EnvFilter::try_from_env("LFS_FILTER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let git_dir = match cli.git_dir {
        Some(dir) => dir,
        None => resolve_git_dir(&std::env::current_dir()?),
    };

    match cli.command {
        Commands::FilterProcess { skip } => {
            run_filter_process(FilterProcessArgs {
                git_dir,
                config: cli.config,
                remote: cli.remote,
                skip,
            })
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
