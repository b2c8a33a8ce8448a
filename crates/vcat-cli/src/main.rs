use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vcat_catalog::{Catalog, CatalogConfig, CatalogQuery};
use vcat_core::EntityKind;

#[derive(Debug, Parser)]
#[command(name = "vcat")]
#[command(about = "Venture catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Firms,
    Companies,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load both stores once and print the refresh summary.
    Refresh,
    /// Serve the JSON API.
    Serve,
    /// Search the cross-entity index.
    Search {
        query: Option<String>,
        #[arg(long = "type")]
        entity_type: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        state: Option<String>,
    },
    /// Filtered, paginated listing of firms or companies.
    Query {
        #[arg(value_enum)]
        kind: Kind,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        round: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        end_market: Option<String>,
        #[arg(long)]
        q: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "vcat=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let catalog = load_catalog().await?;
            let summary = catalog.refresh_all().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.firms.error.is_some() && summary.companies.error.is_some() {
                bail!("refresh failed for both stores");
            }
        }
        Commands::Serve => {
            vcat_web::serve_from_env().await?;
        }
        Commands::Search {
            query,
            entity_type,
            city,
            state,
        } => {
            let kind = entity_type
                .as_deref()
                .map(|raw| EntityKind::parse(raw).with_context(|| format!("unknown entity type `{raw}`")))
                .transpose()?;
            let catalog = load_catalog().await?;
            catalog.refresh_all().await;
            let index = catalog.search_index().await;

            let items = index.search_where(query.as_deref(), kind, city.as_deref(), state.as_deref());
            for item in &items {
                println!(
                    "{}\t{}\t{}\t{}, {}",
                    item.entity_type.as_str(),
                    item.id,
                    item.name,
                    item.city,
                    item.state
                );
            }
            eprintln!("{} result(s)", items.len());
        }
        Commands::Query {
            kind,
            page,
            limit,
            location,
            round,
            status,
            end_market,
            q,
        } => {
            let query = CatalogQuery {
                page,
                limit,
                location,
                round,
                status,
                end_market,
                q,
            };
            let catalog = load_catalog().await?;
            catalog.refresh_all().await;
            let json = match kind {
                Kind::Firms => serde_json::to_string_pretty(&catalog.query_firms(&query).await)?,
                Kind::Companies => serde_json::to_string_pretty(&catalog.query_companies(&query).await)?,
            };
            println!("{json}");
        }
    }

    Ok(())
}

async fn load_catalog() -> Result<Catalog> {
    Catalog::from_config(&CatalogConfig::from_env())
        .await
        .context("building catalog from environment")
}
