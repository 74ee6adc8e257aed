//! Stratum CLI: provision the AGD data-pipeline stack.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "stratum",
    version,
    about = "Provision RDS PostgreSQL, S3, IAM and Modal secrets in dependency order, idempotently"
)]
struct Cli {
    /// Debug logging (overridden by STRATUM_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Stack(stratum::cli::Commands),

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("STRATUM_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("stratum=debug")
        } else {
            EnvFilter::new("stratum=info")
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();

    let command = match cli.command {
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "stratum", &mut std::io::stdout());
            return;
        }
        Command::Stack(command) => command,
    };

    if let Err(e) = stratum::cli::dispatch(command) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
