//! Fehlertypen fuer die Audio-Bausteine

use thiserror::Error;

/// Alle moeglichen Fehler der Audio-Verarbeitung
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Codec kann nicht dekodiert werden: {0}")]
    CodecNichtDekodierbar(String),

    #[error("Tempo {0} ausserhalb des erlaubten Bereichs 0.1-5.0")]
    UngueltigesTempo(f32),

    #[error("Dekodierfehler: {0}")]
    Dekodierung(String),

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),
}

pub type AudioResult<T> = Result<T, AudioError>;
