//! Session-Ereignisse
//!
//! Die Media-Engine meldet Zustandswechsel und Auflege-Wuensche ueber einen
//! tokio-Broadcast-Kanal an die Signalisierung. Die Ereignisse sind
//! serde-kompatibel, damit sie unveraendert geloggt oder weitergereicht
//! werden koennen.

use crate::types::{CallId, SessionTyp, SessionZustand};
use serde::{Deserialize, Serialize};

/// Alle Ereignisse einer RTP-Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEreignis {
    /// Session wurde erstellt und hat ihr Port-Paar gebunden
    Erstellt {
        call_id: CallId,
        typ: SessionTyp,
        rtp_port: u16,
    },
    /// Die Session hat ihren Zustand gewechselt
    ZustandGeaendert {
        call_id: CallId,
        zustand: SessionZustand,
    },
    /// Die Session (Welcome-Ende, KI-Backend) moechte den Anruf beenden.
    ///
    /// Die Signalisierung sollte daraufhin ein BYE senden.
    AuflegenAngefordert { call_id: CallId, grund: String },
    /// Die Tempo-Stufe ist ausgefallen und laeuft als Pass-Through weiter
    TempoFehler { call_id: CallId, fehler: String },
    /// Session geschlossen, Ports freigegeben
    Beendet {
        call_id: CallId,
        pakete_gesendet: u64,
        pakete_empfangen: u64,
    },
}

impl SessionEreignis {
    /// Gibt die Call-ID des Ereignisses zurueck
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Erstellt { call_id, .. }
            | Self::ZustandGeaendert { call_id, .. }
            | Self::AuflegenAngefordert { call_id, .. }
            | Self::TempoFehler { call_id, .. }
            | Self::Beendet { call_id, .. } => call_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ereignis_ist_serde_kompatibel() {
        let event = SessionEreignis::AuflegenAngefordert {
            call_id: CallId::neu("x1"),
            grund: "Backend".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let zurueck: SessionEreignis = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck, event);
        assert_eq!(zurueck.call_id().as_str(), "x1");
    }
}
