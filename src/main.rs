use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skimmer::config::context::build_context;
use skimmer::config::schema::load_config;
use skimmer::frontend::http::run_server;

#[derive(Debug, Parser)]
#[clap(
    name = "skimmer",
    about = "A multi-tenant metadata catalog and query gateway for live relational databases."
)]
struct Args {
    #[clap(short, long, default_value = "skimmer.toml", value_parser)]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&args.config_path).expect("Error loading the configuration");
    let http = config.frontend.http.clone().unwrap_or_default();

    let context = build_context(config).await;

    info!(
        "Starting the HTTP frontend on {}:{}",
        http.bind_host, http.bind_port
    );
    run_server(context, http).await;
}
