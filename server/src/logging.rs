//! Logging-Setup des Servers
//!
//! `RUST_LOG` hat Vorrang vor `[logging] level`. Die Media-Engine loggt
//! pro Session mit `call_id`-Feld, im JSON-Format landet es als eigenes
//! Feld im Objekt.

use crate::config::{LogFormat, LoggingEinstellungen};
use anyhow::{anyhow, Context};
use tracing_subscriber::EnvFilter;

/// Baut den Filter aus einer Direktive wie `"info"` oder
/// `"callbridge_media=debug,info"`
pub fn filter_erstellen(direktive: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(direktive).with_context(|| format!("Ungueltige Log-Direktive '{direktive}'"))
}

/// Installiert den globalen Subscriber (einmal pro Prozess)
pub fn einrichten(einstellungen: &LoggingEinstellungen) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(direktive) if !direktive.is_empty() => filter_erstellen(&direktive)?,
        _ => filter_erstellen(&einstellungen.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(einstellungen.dateipfade)
        .with_line_number(einstellungen.dateipfade);

    let ergebnis = match einstellungen.format {
        LogFormat::Json => builder.json().flatten_event(true).with_thread_ids(true).try_init(),
        LogFormat::Text => builder.try_init(),
    };
    ergebnis.map_err(|e| anyhow!("Logging konnte nicht initialisiert werden: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direktiven_werden_geprueft() {
        assert!(filter_erstellen("info").is_ok());
        assert!(filter_erstellen("callbridge_media=trace,warn").is_ok());
        assert!(filter_erstellen("callbridge_media=lautlos").is_err());
    }

    #[test]
    fn zweites_einrichten_ist_fehler() {
        let einstellungen = LoggingEinstellungen::default();
        // Der erste Aufruf kann scheitern, wenn ein anderer Test schon
        // einen Subscriber gesetzt hat; der zweite scheitert immer
        let _ = einrichten(&einstellungen);
        assert!(einrichten(&einstellungen).is_err());
    }
}
