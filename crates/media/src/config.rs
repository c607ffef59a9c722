//! Laufzeit-Konfiguration der Media-Engine
//!
//! Wird vom Server aus seiner TOML-Konfiguration erzeugt
//! (`ServerConfig::media_config()`), Tests bauen sie direkt.

use crate::rtcp::RTCP_INTERVALL;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Konfiguration fuer den `RtpManager` und alle seine Sessions
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Adresse an die RTP/RTCP-Sockets gebunden werden
    pub bind_adresse: IpAddr,
    /// Adresse fuer SDP-Antworten (hinter NAT), sonst `bind_adresse`
    pub oeffentliche_adresse: Option<IpAddr>,
    /// Erster RTP-Port (wird auf gerade Zahl aufgerundet).
    ///
    /// 0 = Ports vom Betriebssystem waehlen lassen (Tests, Entwicklung)
    pub port_min: u16,
    /// Letzter Port (RTCP-Port des letzten Paares)
    pub port_max: u16,
    /// Ziel-Fuellstand des Jitter Buffers
    pub jitter_ziel_ms: u32,
    /// Vorlauf des ausgehenden Schedulers
    pub sende_vorlauf_ms: u32,
    /// Anzahl Stille-Pakete zum Oeffnen des NAT-Pfads
    pub priming_pakete: u32,
    /// Abstand der Stille-Pakete
    pub priming_intervall_ms: u32,
    /// Wartezeit zwischen Draining und Schliessen
    pub nachlauf: Duration,
    /// Abstand der RTCP Sender Reports
    pub rtcp_intervall: Duration,
    /// Verzeichnis mit `welcome.<codec>` und `test_audio.<codec>`
    pub audio_verzeichnis: PathBuf,
    /// Tempo fuer Test-Audio (None = unveraendert)
    pub tempo_test_audio: Option<f32>,
    /// Tempo fuer KI-Antworten (None = unveraendert)
    pub tempo_bridge: Option<f32>,
    /// Ziel fuer Aufnahmen eingehenden Audios (None = keine Aufnahme)
    pub aufnahme_verzeichnis: Option<PathBuf>,
    /// Groesse der Sende-Queue zwischen Scheduler und Socket
    pub sende_queue_groesse: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind_adresse: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            oeffentliche_adresse: None,
            port_min: 10000,
            port_max: 20000,
            jitter_ziel_ms: 60,
            sende_vorlauf_ms: 60,
            priming_pakete: 5,
            priming_intervall_ms: 20,
            nachlauf: Duration::ZERO,
            rtcp_intervall: RTCP_INTERVALL,
            audio_verzeichnis: PathBuf::from("audio"),
            tempo_test_audio: None,
            tempo_bridge: None,
            aufnahme_verzeichnis: None,
            sende_queue_groesse: 64,
        }
    }
}

impl MediaConfig {
    /// Adresse die in SDP-Antworten eingetragen wird
    pub fn sdp_adresse(&self) -> IpAddr {
        self.oeffentliche_adresse.unwrap_or(self.bind_adresse)
    }
}
