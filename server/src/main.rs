//! code-index binary — thin CLI shell over the [`code_index_server`] library.

use clap::{Parser, Subcommand};
use code_index_server::rpc;
use code_index_server::service::ProjectService;
use std::path::PathBuf;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Project indexer and search server — JSON-RPC backend for developer tools.
#[derive(Parser)]
#[command(name = "code-index", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Global config file (default: platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-RPC over stdio (default)
    Serve,
    /// Index a project once and print the outcome
    Index {
        /// Absolute project path
        path: PathBuf,
    },
    /// Search a project from the command line
    Search {
        /// Absolute project path
        path: PathBuf,
        /// Pattern to search for
        pattern: String,
        /// Case-insensitive matching
        #[arg(long)]
        ignore_case: bool,
        /// Word-boundary fuzzy matching
        #[arg(long)]
        fuzzy: bool,
        /// File glob filter (e.g. "*.rs")
        #[arg(long)]
        file_pattern: Option<String>,
        /// Result page (1-based)
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
}

fn exit_with(err: code_index_server::errors::ServerError) -> ! {
    eprintln!("error [{}]: {err}", err.kind());
    std::process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("code_index=info".parse().unwrap())
                .add_directive("code_index_server=info".parse().unwrap()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let service = ProjectService::new(cli.config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("Serving JSON-RPC on stdio");
            rpc::run_stdio(service);
        }
        Commands::Index { path } => {
            let result = service
                .set_project(&path.display().to_string())
                .unwrap_or_else(|e| exit_with(e));
            let outcome = service.refresh().unwrap_or_else(|e| exit_with(e));
            println!(
                "{}",
                serde_json::json!({ "project": result, "refresh": outcome })
            );
            service.shutdown();
        }
        Commands::Search {
            path,
            pattern,
            ignore_case,
            fuzzy,
            file_pattern,
            page,
        } => {
            service
                .set_project(&path.display().to_string())
                .unwrap_or_else(|e| exit_with(e));
            let result = service
                .search(&pattern, !ignore_case, 0, file_pattern, fuzzy, page, None)
                .unwrap_or_else(|e| exit_with(e));
            println!("{result}");
            service.shutdown();
        }
    }
}
