//! # Policy Harvest CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and run schema migrations |
//! | `harvest scrape` | Scrape every monthly update on the listing page |
//! | `harvest scrape --month-url <url>` | Scrape one monthly update PDF |
//! | `harvest extract <pdf>` | Offline extraction of a local PDF |
//! | `harvest status <task_id>` | Progress of a task |
//! | `harvest tasks` | Active tasks |
//! | `harvest cleanup` | Delete old progress records |
//! | `harvest resources` | Current resource assessment and worker sizing |
//! | `harvest serve` | Start the HTTP task API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use policy_harvest::commands;
use policy_harvest::config::{self, Config};
use policy_harvest::logging;
use policy_harvest::pipeline::ScrapeRequest;
use policy_harvest::progress::ProgressMode;
use policy_harvest::server;

/// Policy Harvest: scrape insurance policy-update PDFs into structured
/// records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Policy Harvest: scrape insurance policy-update PDFs into structured records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the policy_updates,
    /// medical_codes, referenced_documents, document_changes, and
    /// scraping_logs tables. Running it again is safe.
    Init,

    /// Scrape policy updates.
    ///
    /// Without `--month-url`, crawls the configured listing page for
    /// monthly "Policy Updates" PDFs. Each policy linked from a monthly PDF
    /// is fetched, recognized, validated, and stored. URLs already stored
    /// are skipped. Ctrl-C stops after in-flight documents.
    Scrape {
        /// Scrape a single monthly update PDF instead of the listing page.
        #[arg(long)]
        month_url: Option<String>,

        /// Month label for `--month-url`, e.g. "January 2025".
        #[arg(long)]
        month_label: Option<String>,

        /// Maximum number of policy documents to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Progress on stderr. Defaults to human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Extract from a local PDF without touching the database.
    ///
    /// Prints the validated policy bundle as JSON, or with `--links` the
    /// titled policy links of a monthly update PDF.
    Extract {
        /// Path to the PDF.
        pdf: PathBuf,

        /// Treat the file as a monthly update and print its policy links.
        #[arg(long)]
        links: bool,

        /// Month label used as the date fallback.
        #[arg(long)]
        month_label: Option<String>,

        /// Source URL recorded on the bundle.
        #[arg(long)]
        source_url: Option<String>,
    },

    /// Show the progress of a task.
    Status {
        /// Task ID returned by `POST /api/scrape`.
        task_id: String,
    },

    /// List tasks that are started or processing.
    Tasks,

    /// Delete progress records older than the given age.
    Cleanup {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },

    /// Sample CPU and memory and print the throttle assessment.
    Resources,

    /// Start the HTTP task API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Offline commands work without a config file
    let cfg = match &cli.command {
        Commands::Extract { .. } | Commands::Resources => {
            config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal())
        }
        _ => config::load_config(&cli.config)?,
    };
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Scrape {
            month_url,
            month_label,
            limit,
            progress,
        } => {
            let request = ScrapeRequest {
                month_url,
                month_label,
                limit,
            };
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_scrape(&cfg, request, mode).await?;
        }
        Commands::Extract {
            pdf,
            links,
            month_label,
            source_url,
        } => commands::run_extract(&cfg, &pdf, links, month_label, source_url)?,
        Commands::Status { task_id } => commands::run_status(&cfg, &task_id).await?,
        Commands::Tasks => commands::run_tasks(&cfg).await?,
        Commands::Cleanup { max_age_hours } => {
            commands::run_cleanup(&cfg, max_age_hours).await?
        }
        Commands::Resources => commands::run_resources(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
