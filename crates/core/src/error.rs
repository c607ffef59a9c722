//! Fehlertypen fuer Callbridge
//!
//! Zentraler Fehler-Enum der alle Fehlerzustaende der Media-Engine abdeckt.
//! Untermodule koennen eigene Fehler definieren und via `#[from]` konvertieren.

use thiserror::Error;

/// Globaler Result-Alias fuer Callbridge
pub type Result<T> = std::result::Result<T, CallbridgeError>;

/// Alle moeglichen Fehler im Callbridge-System
#[derive(Debug, Error)]
pub enum CallbridgeError {
    // --- Verhandlung (SDP) ---
    #[error("Angebot enthaelt keine Audio-Medien")]
    KeineAudioMedien,

    #[error("Kein unterstuetzter Codec im Angebot: {0}")]
    KeinPassenderCodec(String),

    #[error("Ungueltiges SDP: {0}")]
    Verhandlung(String),

    // --- Transport ---
    #[error("Port-Paar ab {port} konnte nicht gebunden werden: {grund}")]
    PortBindung { port: u16, grund: String },

    #[error("Keine freien RTP-Ports im konfigurierten Bereich")]
    PortsErschoepft,

    // --- Sessions ---
    #[error("Session existiert bereits: {0}")]
    SessionExistiert(String),

    #[error("Session nicht gefunden: {0}")]
    SessionNichtGefunden(String),

    // --- Pipeline ---
    #[error("Pipeline-Fehler: {0}")]
    Pipeline(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- IO ---
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl CallbridgeError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler aus der Codec-Verhandlung stammt.
    ///
    /// Solche Fehler werden an die Signalisierung zurueckgegeben (Anruf
    /// ablehnen) und nie wiederholt.
    pub fn ist_verhandlungsfehler(&self) -> bool {
        matches!(
            self,
            Self::KeineAudioMedien | Self::KeinPassenderCodec(_) | Self::Verhandlung(_)
        )
    }

    /// Gibt true zurueck wenn der Fehler beim Binden der Sockets entstand
    pub fn ist_transportfehler(&self) -> bool {
        matches!(self, Self::PortBindung { .. } | Self::PortsErschoepft)
    }
}
