//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist.
//!
//! ```toml
//! [rtp]
//! bind_adresse = "0.0.0.0"
//! oeffentliche_adresse = "203.0.113.10"
//! port_min = 10000
//! port_max = 20000
//! jitter_ziel_ms = 60
//! rtcp_intervall_ms = 5000
//!
//! [audio]
//! verzeichnis = "audio"
//! tempo_test_audio = 1.25
//!
//! [logging]
//! level = "info"
//! format = "json"
//! dateipfade = false
//! ```

use anyhow::{bail, Context};
use callbridge_audio::{TEMPO_MAX, TEMPO_MIN};
use callbridge_media::MediaConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Empfohlener Bereich fuer das Jitter-Ziel
const JITTER_EMPFOHLEN_MS: std::ops::RangeInclusive<u32> = 10..=200;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// RTP-Transport und Session-Verhalten
    pub rtp: RtpEinstellungen,
    /// Audio-Dateien, Tempo und Aufnahme
    pub audio: AudioEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// RTP-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpEinstellungen {
    /// Bind-Adresse fuer alle RTP/RTCP-Sockets
    pub bind_adresse: IpAddr,
    /// Adresse fuer SDP-Antworten (hinter NAT)
    pub oeffentliche_adresse: Option<IpAddr>,
    /// Port-Bereich fuer RTP/RTCP-Paare (0 = vom Betriebssystem)
    pub port_min: u16,
    pub port_max: u16,
    /// Ziel-Fuellstand des Jitter Buffers in ms
    pub jitter_ziel_ms: u32,
    /// Vorlauf des ausgehenden Schedulers in ms
    pub sende_vorlauf_ms: u32,
    /// Anzahl Stille-Pakete vor dem Streaming
    pub priming_pakete: u32,
    /// Abstand der Stille-Pakete in ms
    pub priming_intervall_ms: u32,
    /// Wartezeit zwischen Draining und Schliessen in ms
    pub nachlauf_ms: u64,
    /// Abstand der RTCP Sender Reports in ms
    pub rtcp_intervall_ms: u64,
}

impl Default for RtpEinstellungen {
    fn default() -> Self {
        let media = MediaConfig::default();
        Self {
            bind_adresse: media.bind_adresse,
            oeffentliche_adresse: None,
            port_min: media.port_min,
            port_max: media.port_max,
            jitter_ziel_ms: media.jitter_ziel_ms,
            sende_vorlauf_ms: media.sende_vorlauf_ms,
            priming_pakete: media.priming_pakete,
            priming_intervall_ms: media.priming_intervall_ms,
            nachlauf_ms: 0,
            rtcp_intervall_ms: media.rtcp_intervall.as_millis() as u64,
        }
    }
}

/// Audio-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEinstellungen {
    /// Verzeichnis mit `welcome.<codec>` und `test_audio.<codec>`
    pub verzeichnis: PathBuf,
    /// Tempo fuer Test-Audio (fehlt = unveraendert)
    pub tempo_test_audio: Option<f32>,
    /// Tempo fuer Antworten des KI-Backends
    pub tempo_bridge: Option<f32>,
    /// Verzeichnis fuer Aufnahmen eingehenden Audios
    pub aufnahme_verzeichnis: Option<PathBuf>,
}

impl Default for AudioEinstellungen {
    fn default() -> Self {
        Self {
            verzeichnis: PathBuf::from("audio"),
            tempo_test_audio: None,
            tempo_bridge: None,
            aufnahme_verzeichnis: None,
        }
    }
}

/// Ausgabeformat der Log-Zeilen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Menschenlesbar, eine Zeile pro Ereignis
    #[default]
    Text,
    /// Ein JSON-Objekt pro Zeile (Log-Sammler)
    Json,
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Filter-Direktive, z.B. "info" oder "callbridge_media=debug,info".
    /// `RUST_LOG` hat Vorrang.
    pub level: String,
    pub format: LogFormat,
    /// Quelldatei und Zeile in jeder Log-Zeile
    pub dateipfade: bool,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
            dateipfade: false,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .with_context(|| format!("Konfigurationsfehler in '{pfad}'"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Prueft Wertebereiche
    ///
    /// Ungueltige Port-Bereiche und Tempi sind Fehler, ein Jitter-Ziel
    /// ausserhalb von 10-200 ms nur eine Warnung.
    pub fn validieren(&self) -> anyhow::Result<()> {
        let rtp = &self.rtp;
        if rtp.port_min != 0 && rtp.port_min.saturating_add(1) >= rtp.port_max {
            bail!(
                "rtp.port_min ({}) muss kleiner als rtp.port_max ({}) sein",
                rtp.port_min,
                rtp.port_max
            );
        }
        if rtp.jitter_ziel_ms == 0 {
            bail!("rtp.jitter_ziel_ms darf nicht 0 sein");
        }
        if !JITTER_EMPFOHLEN_MS.contains(&rtp.jitter_ziel_ms) {
            tracing::warn!(
                jitter_ziel_ms = rtp.jitter_ziel_ms,
                "Jitter-Ziel ausserhalb des empfohlenen Bereichs (10-200 ms)"
            );
        }
        if rtp.priming_intervall_ms == 0 {
            bail!("rtp.priming_intervall_ms darf nicht 0 sein");
        }
        if rtp.rtcp_intervall_ms == 0 {
            bail!("rtp.rtcp_intervall_ms darf nicht 0 sein");
        }

        crate::logging::filter_erstellen(&self.logging.level).context("logging.level")?;

        for (name, tempo) in [
            ("audio.tempo_test_audio", self.audio.tempo_test_audio),
            ("audio.tempo_bridge", self.audio.tempo_bridge),
        ] {
            if let Some(t) = tempo {
                if !(TEMPO_MIN..=TEMPO_MAX).contains(&t) {
                    bail!("{name} = {t} liegt ausserhalb von {TEMPO_MIN}-{TEMPO_MAX}");
                }
            }
        }
        Ok(())
    }

    /// Laufzeit-Konfiguration fuer den `RtpManager`
    pub fn media_config(&self) -> MediaConfig {
        MediaConfig {
            bind_adresse: self.rtp.bind_adresse,
            oeffentliche_adresse: self.rtp.oeffentliche_adresse,
            port_min: self.rtp.port_min,
            port_max: self.rtp.port_max,
            jitter_ziel_ms: self.rtp.jitter_ziel_ms,
            sende_vorlauf_ms: self.rtp.sende_vorlauf_ms,
            priming_pakete: self.rtp.priming_pakete,
            priming_intervall_ms: self.rtp.priming_intervall_ms,
            nachlauf: Duration::from_millis(self.rtp.nachlauf_ms),
            rtcp_intervall: Duration::from_millis(self.rtp.rtcp_intervall_ms),
            audio_verzeichnis: self.audio.verzeichnis.clone(),
            tempo_test_audio: self.audio.tempo_test_audio,
            tempo_bridge: self.audio.tempo_bridge,
            aufnahme_verzeichnis: self.audio.aufnahme_verzeichnis.clone(),
            ..MediaConfig::default()
        }
    }
}
