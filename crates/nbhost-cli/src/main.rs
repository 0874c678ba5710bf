mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "nbhost",
    about = "Launch a notebook engine server and drive notebook sessions on it"
)]
struct Cli {
    /// Preferred engine port (overrides config and NBHOST_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Workspace root handed to the engine
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Engine executable, optionally with arguments
    #[arg(long, global = true)]
    executable: Option<String>,

    /// Engine base URL; defaults to the local server on the configured port
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap, launch and supervise the engine server until Ctrl-C
    Serve,

    /// Check whether the engine answers
    Status,

    /// Print the engine base URL
    Url,

    /// Open a notebook session and print its id
    Open {
        /// Notebook file
        path: PathBuf,
    },

    /// Run code without adding a cell to the notebook
    Eval {
        /// Notebook file
        path: PathBuf,

        /// Code to run
        code: String,
    },

    /// Run code in an existing cell
    Exec {
        /// Notebook file
        path: PathBuf,

        /// Cell ID
        cell: String,

        /// Code to run
        code: String,
    },

    /// Insert a new cell and print its id
    Add {
        /// Notebook file
        path: PathBuf,

        /// Position of the new cell
        index: usize,

        /// Cell code
        code: String,
    },

    /// Delete a cell
    Delete {
        /// Notebook file
        path: PathBuf,

        /// Cell ID
        cell: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nbhost=info,libnbhost=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.port, cli.workspace, cli.executable)?;
    let target = commands::Target::new(config, cli.server);

    match cli.command {
        Commands::Serve => commands::serve(target).await,
        Commands::Status => commands::status(&target).await,
        Commands::Url => {
            println!("{}", target.url());
            Ok(())
        }
        Commands::Open { path } => commands::open(&target, path).await,
        Commands::Eval { path, code } => commands::eval(&target, path, code).await,
        Commands::Exec { path, cell, code } => commands::exec(&target, path, cell, code).await,
        Commands::Add { path, index, code } => commands::add(&target, path, index, code).await,
        Commands::Delete { path, cell } => commands::delete(&target, path, cell).await,
    }
}
