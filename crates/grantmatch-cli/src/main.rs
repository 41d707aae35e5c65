use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use grantmatch_storage::GrantStore;
use grantmatch_sync::{run_etl_from_env, EtlOptions, EtlSettings, EtlStage};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "grantmatch")]
#[command(about = "GrantMatch grant discovery: Grants.gov ETL and search API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, filter, score and load Grants.gov opportunities.
    Etl(EtlArgs),
    /// Apply database migrations.
    Migrate,
    /// Run the JSON API (and the ETL scheduler when enabled).
    Serve,
    /// Print grant and embedding counts.
    Stats,
}

#[derive(Debug, Default, Args)]
struct EtlArgs {
    /// Keywords used for filtering and scoring (comma-separated).
    #[arg(long, value_delimiter = ',')]
    search_terms: Vec<String>,
    /// Page size for the Grants.gov search.
    #[arg(long)]
    rows: Option<usize>,
    /// Agency codes to keep (comma-separated).
    #[arg(long, value_delimiter = ',')]
    agencies: Vec<String>,
    /// CFDA program numbers to keep (comma-separated).
    #[arg(long, value_delimiter = ',')]
    cfda_codes: Vec<String>,
    /// Fetch, filter and score without writing to the database.
    #[arg(long)]
    dry_run: bool,
    /// Load grants without generating embeddings.
    #[arg(long)]
    skip_embeddings: bool,
    /// Small dry run: NSF/NIH/DOD, AI and research terms, 50 rows.
    #[arg(long)]
    quick_test: bool,
}

impl EtlArgs {
    fn into_options(self) -> EtlOptions {
        let list = |values: Vec<String>| (!values.is_empty()).then_some(values);
        let base = if self.quick_test {
            EtlOptions::quick_test()
        } else {
            EtlOptions::default()
        };
        EtlOptions {
            page_size: self.rows.or(base.page_size),
            agencies: list(self.agencies).or(base.agencies),
            keywords: list(self.search_terms).or(base.keywords),
            classification_codes: list(self.cfda_codes).or(base.classification_codes),
            dry_run: self.dry_run || base.dry_run,
            skip_embeddings: self.skip_embeddings || base.skip_embeddings,
            top_n: base.top_n,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,grantmatch=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn connect_store(settings: &EtlSettings) -> Result<GrantStore> {
    let url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;
    GrantStore::connect(url).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Etl(EtlArgs::default())) {
        Commands::Etl(args) => {
            let options = args.into_options();
            let summary = run_etl_from_env(&options).await.context("etl run failed")?;
            let outcome = match summary.final_stage {
                EtlStage::AbortedEmpty => "no matching opportunities",
                _ if summary.dry_run => "dry run complete",
                _ => "etl complete",
            };
            println!(
                "{outcome}: run_id={} fetched={} detail_failures={} filtered={} selected={} processed={}",
                summary.run_id,
                summary.fetched,
                summary.detail_failures,
                summary.filtered,
                summary.selected,
                summary.grants_processed,
            );
            if let Some(stats) = summary.stats {
                println!(
                    "store: grants={} embeddings={} added_last_24h={}",
                    stats.total_grants, stats.total_embeddings, stats.grants_last_24h
                );
            }
            if let Some(path) = summary.report_path {
                println!("report: {path}");
            }
        }
        Commands::Migrate => {
            let store = connect_store(&EtlSettings::from_env()).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            grantmatch_web::serve_from_env().await?;
        }
        Commands::Stats => {
            let store = connect_store(&EtlSettings::from_env()).await?;
            let stats = store.stats().await?;
            println!(
                "grants={} embeddings={} added_last_24h={}",
                stats.total_grants, stats.total_embeddings, stats.grants_last_24h
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn etl_options(args: &[&str]) -> EtlOptions {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Some(Commands::Etl(args)) => args.into_options(),
            other => panic!("expected etl command, got {other:?}"),
        }
    }

    #[test]
    fn etl_flags_split_lists() {
        let options = etl_options(&[
            "grantmatch",
            "etl",
            "--search-terms",
            "climate,water",
            "--agencies",
            "EPA",
            "--cfda-codes",
            "66.508,81.087",
            "--rows",
            "100",
            "--dry-run",
        ]);
        assert_eq!(options.keywords, Some(vec!["climate".to_string(), "water".to_string()]));
        assert_eq!(options.agencies, Some(vec!["EPA".to_string()]));
        assert_eq!(options.classification_codes.map(|c| c.len()), Some(2));
        assert_eq!(options.page_size, Some(100));
        assert!(options.dry_run);
        assert!(!options.skip_embeddings);
    }

    #[test]
    fn quick_test_uses_preset_unless_overridden() {
        let options = etl_options(&["grantmatch", "etl", "--quick-test"]);
        assert_eq!(options, EtlOptions::quick_test());

        let options = etl_options(&["grantmatch", "etl", "--quick-test", "--rows", "10"]);
        assert_eq!(options.page_size, Some(10));
        assert!(options.dry_run);
    }

    #[test]
    fn bare_etl_uses_rule_defaults() {
        assert_eq!(etl_options(&["grantmatch", "etl"]), EtlOptions::default());
    }
}
