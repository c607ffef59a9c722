//! callbridge-server – Bibliotheks-Root
//!
//! Verdrahtet Konfiguration und `RtpManager`. Die SIP-Signalisierung und
//! das KI-Backend binden sich ueber den Manager an (`angebot_beantworten`,
//! `session_beenden`, `bridge_kanal`).

pub mod config;
pub mod logging;

use anyhow::Result;
use callbridge_core::SessionEreignis;
use callbridge_media::RtpManager;
use config::ServerConfig;
use tokio::sync::broadcast;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
    manager: RtpManager,
    ereignisse: broadcast::Receiver<SessionEreignis>,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Result<Self> {
        config.validieren()?;
        let (manager, ereignisse) = RtpManager::neu(config.media_config())?;
        Ok(Self {
            config,
            manager,
            ereignisse,
        })
    }

    /// Zugriff fuer Signalisierung und Backend-Anbindung
    pub fn manager(&self) -> &RtpManager {
        &self.manager
    }

    /// Laeuft bis zum Shutdown-Signal und beendet dann alle Sessions
    pub async fn starten(self) -> Result<()> {
        tracing::info!(
            bind = %self.config.rtp.bind_adresse,
            sdp_adresse = %self.manager.config().sdp_adresse(),
            ports = %format!("{}-{}", self.config.rtp.port_min, self.config.rtp.port_max),
            audio = %self.config.audio.verzeichnis.display(),
            "Server startet"
        );

        let protokoll = tokio::spawn(ereignisse_protokollieren(self.ereignisse));

        tracing::info!("Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)...");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown-Signal empfangen, Server wird beendet");

        self.manager.alle_beenden().await;
        protokoll.abort();
        Ok(())
    }
}

/// Schreibt alle Session-Ereignisse ins Log
async fn ereignisse_protokollieren(mut rx: broadcast::Receiver<SessionEreignis>) {
    loop {
        match rx.recv().await {
            Ok(SessionEreignis::AuflegenAngefordert { call_id, grund }) => {
                tracing::info!(call_id = %call_id, grund = %grund, "Session fordert Auflegen an");
            }
            Ok(SessionEreignis::TempoFehler { call_id, fehler }) => {
                tracing::warn!(call_id = %call_id, fehler = %fehler, "Tempo-Anpassung deaktiviert");
            }
            Ok(SessionEreignis::Beendet {
                call_id,
                pakete_gesendet,
                pakete_empfangen,
            }) => {
                tracing::info!(call_id = %call_id, pakete_gesendet, pakete_empfangen, "Session beendet");
            }
            Ok(ereignis) => {
                tracing::debug!(call_id = %ereignis.call_id(), ereignis = ?ereignis, "Session-Ereignis");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(verpasst = n, "Ereignis-Protokoll hinkt hinterher");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_aus_standard_config() {
        let server = Server::neu(ServerConfig::default()).unwrap();
        assert_eq!(server.manager().anzahl(), 0);
    }

    #[tokio::test]
    async fn ungueltige_config_verhindert_start() {
        let mut config = ServerConfig::default();
        config.audio.tempo_bridge = Some(0.0);
        assert!(Server::neu(config).is_err());
    }
}
