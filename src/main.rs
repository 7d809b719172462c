use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swiftls", version, about = "Swift language server over sourcekitd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the Language Server Protocol over stdio
    Serve(ServeArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Path to the sourcekitd dynamic library
    #[arg(long)]
    sourcekitd: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "swiftls", &mut std::io::stdout());
            ExitCode::SUCCESS
        }
    }
}

fn run_serve(args: ServeArgs) -> ExitCode {
    // stdout carries LSP frames; everything else goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SWIFTLS_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let mut stderr = std::io::stderr().lock();
            let report = miette::Report::msg(format!("failed to start async runtime: {e}"));
            let _ = writeln!(stderr, "{report:?}");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(swiftls::lsp::run_server(args.sourcekitd));
    ExitCode::SUCCESS
}
