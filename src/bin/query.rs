use anyhow::Result;
use clap::{Parser, Subcommand};
use gas_tracker::config::Config;
use gas_tracker::query::commands::{RecentQuery, cmd_last_block, cmd_recent, cmd_stats};
use gas_tracker::query::formatters::OutputFormat;
use gas_tracker::repository::{Database, PointRepository};

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Query recorded gas fee points", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    /// SQLite store to read; defaults to STORAGE_URL
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Per-token point counts, block range and average fees
    Stats,
    /// Latest points, newest first
    Recent {
        #[arg(long)]
        token: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Highest block recorded
    LastBlock,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    let database_url = match cli.database {
        Some(database) => database,
        None => Config::from_env()?.storage_url,
    };
    if database_url.starts_with("http://") || database_url.starts_with("https://") {
        return Err(anyhow::anyhow!(
            "query reads the SQLite store; pass --database sqlite:<path>"
        ));
    }

    let db = Database::new(&database_url)?;
    let repo = PointRepository::new(&db.conn);

    match cli.command {
        Commands::Stats => cmd_stats(&repo, &format)?,
        Commands::Recent { token, limit } => {
            cmd_recent(&repo, RecentQuery { token, limit }, &format)?
        }
        Commands::LastBlock => cmd_last_block(&repo)?,
    }

    Ok(())
}
