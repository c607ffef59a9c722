//! Startet den Callbridge-Medienserver
//!
//! Aufruf: `callbridge-server [config.toml]`. Ohne Argument gilt
//! `CALLBRIDGE_CONFIG`, sonst `config.toml` im Arbeitsverzeichnis.

use anyhow::Context;
use callbridge_server::{config::ServerConfig, logging, Server};

const STANDARD_CONFIG: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let pfad = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CALLBRIDGE_CONFIG").ok())
        .unwrap_or_else(|| STANDARD_CONFIG.to_string());

    let config = ServerConfig::laden(&pfad)?;
    logging::einrichten(&config.logging)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %pfad, "Callbridge startet");

    Server::neu(config)
        .context("Server konnte nicht initialisiert werden")?
        .starten()
        .await
}
