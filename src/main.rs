use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use boorugate::api::{AppState, create_router};
use boorugate::config::Config;
use boorugate::prober::{PostCountProber, ProbeSettings, ProbeStrategy};
use boorugate::query::Query;
use boorugate::upstream::BooruClient;

#[derive(Parser)]
#[command(version, about = "HTTP gateway for a booru image board API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve {
        /// Address to listen on, overrides BIND_ADDR
        #[arg(long)]
        bind: Option<String>,
    },
    /// Count the posts matching a query and print the result as JSON
    Count {
        /// Tags in upstream syntax, e.g. "cat -dog"
        #[arg(long)]
        tags: String,
        #[arg(long, default_value = "id:desc")]
        sort: String,
        #[arg(long)]
        filter_ai: bool,
        /// linear or binary
        #[arg(long)]
        strategy: Option<ProbeStrategy>,
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long)]
        max_pages: Option<u32>,
    },
}

fn init_tracing(level: tracing::Level) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    // Bridge log crate -> tracing (so log::info! etc. work)
    tracing_log::LogTracer::init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(config.log_level)?;

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind_addr.clone());
            let state = Arc::new(AppState::from_config(&config)?);
            let app = create_router(state);
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Failed to bind {bind}"))?;
            log::info!(
                "listening on {bind} (page size {}, {} count strategy)",
                config.page_size,
                config.count_strategy
            );
            axum::serve(listener, app).await?;
        }
        Command::Count {
            tags,
            sort,
            filter_ai,
            strategy,
            page_size,
            max_pages,
        } => {
            let query = Query::parse(&tags, &sort, filter_ai)?;
            let settings = ProbeSettings {
                page_size: page_size.unwrap_or(config.page_size),
                max_pages: max_pages.unwrap_or(config.max_pages),
                strategy: strategy.unwrap_or(config.count_strategy),
            };
            let prober = PostCountProber::new(BooruClient::from_config(&config)?, settings);
            match prober.probe(&query).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => {
                    anyhow::bail!("failed to count posts: {e}");
                }
            }
        }
    }
    Ok(())
}
