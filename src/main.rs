//! linesearch: a TCP line lookup server
//!
//! Each connection carries one query. The server answers whether the query
//! occurs verbatim as a line of the configured dataset file, then closes:
//!
//! - `STRING EXISTS` / `STRING NOT FOUND` for lookups
//! - `QUERY TOO LARGE` for payloads over `max_payload`
//! - `INVALID ENCODING` for payloads that are not UTF-8
//!
//! Features:
//! - Cached (load once) or reread-per-query dataset lookups
//! - Optional TLS via rustls
//! - Configuration via CLI arguments, a key=value file, or a TOML file
//! - `linesearch query <TEXT>` sends one query to a running server

mod client;
mod config;
mod dataset;
mod error;
mod handler;
mod query;
mod server;
mod tls;

#[cfg(test)]
mod testutil;

use clap::Parser;
use client::ClientConfig;
use config::{CliArgs, Command, Config};
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut cli = CliArgs::parse();

    match cli.command.take() {
        Some(Command::Query { text }) => run_query(&cli, &text),
        None => run_server(Config::from_cli(cli)?),
    }
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&config.log_level);

    info!(
        address = %config.listen_address(),
        dataset = %config.dataset_path.display(),
        reread_on_query = config.reread_on_query,
        max_payload = config.max_payload,
        tls = config.tls.is_some(),
        "Starting linesearch server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::new(config).await?;
        server.run().await?;
        Ok::<_, error::ServerError>(())
    })?;

    Ok(())
}

fn run_query(cli: &CliArgs, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");
    let config = ClientConfig::from_cli(cli)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let reply = runtime.block_on(client::send_query(&config, text))?;

    println!("Server response: {reply}");
    Ok(())
}
