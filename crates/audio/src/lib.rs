//! callbridge-audio – Audio-Bausteine der Media-Engine
//!
//! - G.711 μ-law/A-law Companding ([`g711`])
//! - Tonhoehen-erhaltende Zeitstreckung per WSOLA ([`stretch`])
//! - Tempo-Anpassung fuer ausgehendes Codec-Audio ([`tempo`])

pub mod error;
pub mod g711;
pub mod stretch;
pub mod tempo;

// Bequeme Re-Exporte der wichtigsten Typen
pub use error::{AudioError, AudioResult};
pub use stretch::TimeStretcher;
pub use tempo::{TempoAdjustTransform, TEMPO_MAX, TEMPO_MIN};
