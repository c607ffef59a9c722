//! callbridge-core – Gemeinsame Typen, Ereignisse und Fehlertypen
//!
//! Dieses Crate stellt die Bausteine bereit, die von Protokoll-, Audio- und
//! Media-Crate gemeinsam genutzt werden.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{CallbridgeError, Result};
pub use event::SessionEreignis;
pub use types::{CallId, SessionTyp, SessionZustand};
