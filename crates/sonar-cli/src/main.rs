use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sonar_crm::{CrmClient, SalesforceClient};
use sonar_sync::{load_jurisdictions, registry_path, Orchestrator, SonarConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sonar")]
#[command(about = "Scrape public procurement portals into the CRM")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled jurisdiction once.
    Run {
        /// Only run these jurisdiction ids (disabled ones included).
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Print the summary as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Show the jurisdiction registry and credential readiness.
    List,
    /// Show CRM opportunity counts for one jurisdiction.
    Status { jurisdiction: String },
    /// Run on the configured cron schedule until Ctrl-C.
    Schedule,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("sonar=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("SONAR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        only: Vec::new(),
        json: false,
    }) {
        Commands::Run { only, json } => {
            let config = SonarConfig::from_env()?;
            let orchestrator = Orchestrator::from_config(&config)?;
            let summary = orchestrator.run_all(&only).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render_text());
            }
        }
        Commands::List => {
            let lookup = |key: &str| std::env::var(key).ok();
            let path = registry_path(&lookup);
            let jurisdictions = load_jurisdictions(&path, &lookup)?;
            println!("{} jurisdictions in {}", jurisdictions.len(), path.display());
            for j in &jurisdictions {
                println!(
                    "  {:<16} {:<4} {:<28} {:<9} {}  {}",
                    j.id(),
                    j.entry.account_code,
                    j.entry.portal.as_str(),
                    if j.entry.enabled { "enabled" } else { "disabled" },
                    j.credentials.describe(),
                    j.entry.display_name,
                );
            }
        }
        Commands::Status { jurisdiction } => {
            let config = SonarConfig::from_env()?;
            let settings = config
                .jurisdictions
                .iter()
                .find(|j| j.id() == jurisdiction)
                .with_context(|| format!("unknown jurisdiction `{jurisdiction}`"))?;
            let crm = SalesforceClient::new(config.crm.clone())?;
            let account = crm.find_account_id(&settings.entry.account_code).await?;
            let overview = crm.opportunity_overview(&account).await?;
            println!("{} (account {account})", settings.entry.display_name);
            println!("  opportunities: {}", overview.total);
            for listing in &overview.recent {
                println!(
                    "  {}  {}  {}",
                    listing.created_date.format("%Y-%m-%d"),
                    listing.solicitation_number.as_deref().unwrap_or("-"),
                    listing.name
                );
            }
        }
        Commands::Schedule => {
            let config = SonarConfig::from_env()?;
            let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
            info!(cron = %config.sync_cron, "starting scheduled sync");
            orchestrator.schedule(&config.sync_cron).await?;
        }
    }

    Ok(())
}
