//! Gemeinsame Identifikations- und Zustandstypen fuer Callbridge
//!
//! Die Call-ID stammt aus der SIP-Signalisierung und wird als Newtype
//! gefuehrt, damit sie nicht mit anderen Strings verwechselt wird.

use serde::{Deserialize, Serialize};

/// Eindeutige Anruf-ID (SIP Call-ID), gleichzeitig die Session-ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Erstellt eine CallId aus einem beliebigen String
    pub fn neu(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Gibt die ID als &str zurueck
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call:{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Art der Media-Session – bestimmt Audio-Quelle und -Senke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTyp {
    /// Eingehendes Audio wird zurueckgespielt
    Echo,
    /// Testansage aus Datei, Anruf bleibt danach offen
    TestAudio,
    /// Begruessung aus Datei, danach wird aufgelegt
    Welcome,
    /// Bruecke zu einem Konversations-Backend
    Bridge,
}

impl SessionTyp {
    /// Kurzname wie in Konfiguration und Logs verwendet
    pub fn name(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::TestAudio => "test_audio",
            Self::Welcome => "welcome",
            Self::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for SessionTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lebenszyklus einer RTP-Session
///
/// `Erstellt -> Priming -> Streaming -> Draining -> Geschlossen`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionZustand {
    /// Sockets gebunden, noch nichts gesendet
    Erstellt,
    /// Stille-Pakete oeffnen den NAT-Pfad
    Priming,
    /// Regulaerer Audio-Austausch
    Streaming,
    /// Auflegen laeuft, Rest-Audio wird ausgeliefert
    Draining,
    /// Sockets freigegeben
    Geschlossen,
}

impl SessionZustand {
    /// Prueft ob die Session noch Pakete verarbeitet
    pub fn ist_aktiv(&self) -> bool {
        matches!(self, Self::Priming | Self::Streaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_display() {
        let id = CallId::neu("abc@host");
        assert_eq!(id.to_string(), "call:abc@host");
        assert_eq!(id.as_str(), "abc@host");
    }

    #[test]
    fn session_typ_serde_snake_case() {
        let json = serde_json::to_string(&SessionTyp::TestAudio).unwrap();
        assert_eq!(json, "\"test_audio\"");
        let typ: SessionTyp = serde_json::from_str("\"bridge\"").unwrap();
        assert_eq!(typ, SessionTyp::Bridge);
    }

    #[test]
    fn zustand_reihenfolge() {
        assert!(SessionZustand::Erstellt < SessionZustand::Priming);
        assert!(SessionZustand::Draining < SessionZustand::Geschlossen);
        assert!(SessionZustand::Streaming.ist_aktiv());
        assert!(!SessionZustand::Draining.ist_aktiv());
    }
}
