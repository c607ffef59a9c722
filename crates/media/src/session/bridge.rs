//! Anbindung einer Session an das KI-Backend
//!
//! Das Backend-Protokoll selbst liegt ausserhalb der Engine. Die Session
//! sieht nur einen Byte-Strom in jede Richtung plus einen Auflege-Kanal:
//!
//! ```text
//! Anrufer --RTP--> JitterBuffer --> anrufer_audio --> Backend
//! Anrufer <--RTP-- Scheduler <-- Tempo-Stufe <-- antwort_audio <-- Backend
//!                                   auflegen(grund) <-- Backend
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

/// Session-Seite der Bridge (wird an `RtpManager::session_erstellen` uebergeben)
#[derive(Debug)]
pub struct BridgeAnschluss {
    pub(crate) anrufer_tx: mpsc::Sender<Bytes>,
    pub(crate) antwort_rx: mpsc::Receiver<Bytes>,
    pub(crate) auflegen_rx: mpsc::Receiver<String>,
}

/// Backend-Seite der Bridge
#[derive(Debug)]
pub struct BackendSeite {
    /// Anrufer-Audio nach dem Jitter Buffer, Frame fuer Frame
    pub anrufer_audio: mpsc::Receiver<Bytes>,
    /// Antwort-Audio im Codec der Session, beliebig gestueckelt
    pub antwort_audio: mpsc::Sender<Bytes>,
    /// Beendet den Anruf von Backend-Seite
    pub auflegen: AuflegeHandle,
}

/// Auflege-Callback fuer das Backend
///
/// Vor dem Auflegen wird der Jitter Buffer noch an das Backend geleert.
#[derive(Debug, Clone)]
pub struct AuflegeHandle {
    tx: mpsc::Sender<String>,
}

impl AuflegeHandle {
    /// Fordert das Auflegen an. Gibt `false` zurueck wenn die Session
    /// bereits beendet ist oder schon ein Auflegen anliegt.
    pub fn auflegen(&self, grund: impl Into<String>) -> bool {
        self.tx.try_send(grund.into()).is_ok()
    }
}

/// Erstellt beide Seiten einer Bridge mit gegebener Kanal-Kapazitaet
pub fn bridge_kanal(kapazitaet: usize) -> (BridgeAnschluss, BackendSeite) {
    let kapazitaet = kapazitaet.max(1);
    let (anrufer_tx, anrufer_rx) = mpsc::channel(kapazitaet);
    let (antwort_tx, antwort_rx) = mpsc::channel(kapazitaet);
    let (auflegen_tx, auflegen_rx) = mpsc::channel(1);

    (
        BridgeAnschluss {
            anrufer_tx,
            antwort_rx,
            auflegen_rx,
        },
        BackendSeite {
            anrufer_audio: anrufer_rx,
            antwort_audio: antwort_tx,
            auflegen: AuflegeHandle { tx: auflegen_tx },
        },
    )
}
