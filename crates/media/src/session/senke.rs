//! Senken fuer eingehendes Anrufer-Audio

use bytes::Bytes;
use callbridge_core::CallId;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Puffer zwischen Wiedergabe-Takt und Aufnahme-Datei (Frames)
const AUFNAHME_QUEUE: usize = 256;

/// Laengste Wartezeit auf Platz in der Senke beim Leeren (pro Frame)
const ZUSTELL_TIMEOUT: Duration = Duration::from_millis(500);

/// Ziel der Frames aus dem Jitter Buffer
#[derive(Debug, Clone)]
pub(crate) enum Senke {
    /// Nicht benoetigt (z.B. Ansage ohne Aufnahme)
    Verwerfen,
    /// An das KI-Backend
    Bridge(mpsc::Sender<Bytes>),
    /// In eine Aufnahme-Datei
    Aufnahme(mpsc::Sender<Bytes>),
}

impl Senke {
    /// Liefert einen Frame aus dem Wiedergabe-Takt aus; blockiert nie
    pub(crate) fn liefern(&self, frame: Bytes) {
        let tx = match self {
            Self::Verwerfen => return,
            Self::Bridge(tx) | Self::Aufnahme(tx) => tx,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame) {
            tracing::debug!("Senke ueberlastet, Frame verworfen");
        }
    }

    /// Stellt einen Frame zu und wartet dabei auf Platz in der Queue
    ///
    /// `false` wenn der Empfaenger geschlossen ist oder innerhalb von
    /// `ZUSTELL_TIMEOUT` keinen Platz schafft.
    pub(crate) async fn zustellen(&self, frame: Bytes) -> bool {
        let tx = match self {
            Self::Verwerfen => return true,
            Self::Bridge(tx) | Self::Aufnahme(tx) => tx,
        };
        match tokio::time::timeout(ZUSTELL_TIMEOUT, tx.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                tracing::debug!("Senke geschlossen, Frame verworfen");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = ZUSTELL_TIMEOUT.as_millis() as u64,
                    "Senke nimmt keine Frames mehr an"
                );
                false
            }
        }
    }
}

/// Startet den Aufnahme-Task und gibt die zugehoerige Senke zurueck
///
/// Nach dem Abbruch werden noch anstehende Frames geschrieben.
pub(crate) fn aufnahme_starten(
    call_id: CallId,
    pfad: PathBuf,
    abbruch: CancellationToken,
) -> (Senke, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(AUFNAHME_QUEUE);

    let task = tokio::spawn(async move {
        let mut datei = match tokio::fs::File::create(&pfad).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    call_id = %call_id,
                    pfad = %pfad.display(),
                    fehler = %e,
                    "Aufnahme-Datei konnte nicht erstellt werden"
                );
                return;
            }
        };
        tracing::info!(call_id = %call_id, pfad = %pfad.display(), "Aufnahme gestartet");

        let mut bytes_geschrieben = 0u64;
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => frame,
                _ = abbruch.cancelled() => break,
            };
            let Some(frame) = frame else { break };
            if let Err(e) = datei.write_all(&frame).await {
                tracing::warn!(call_id = %call_id, fehler = %e, "Aufnahme-Schreibfehler");
                return;
            }
            bytes_geschrieben += frame.len() as u64;
        }

        // Rest aus dem Draining
        while let Ok(frame) = rx.try_recv() {
            if datei.write_all(&frame).await.is_err() {
                break;
            }
            bytes_geschrieben += frame.len() as u64;
        }
        if let Err(e) = datei.flush().await {
            tracing::warn!(call_id = %call_id, fehler = %e, "Aufnahme konnte nicht abgeschlossen werden");
        }
        tracing::info!(call_id = %call_id, bytes = bytes_geschrieben, "Aufnahme beendet");
    });

    (Senke::Aufnahme(tx), task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aufnahme_schreibt_auch_nach_abbruch() {
        let dir = tempfile::tempdir().expect("Temp-Verzeichnis konnte nicht erstellt werden");
        let pfad = dir.path().join("aufnahme.pcmu");
        let abbruch = CancellationToken::new();
        let (senke, task) = aufnahme_starten(CallId::neu("aufnahme"), pfad.clone(), abbruch.clone());

        senke.liefern(Bytes::from_static(&[1; 160]));
        senke.liefern(Bytes::from_static(&[2; 40]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        senke.liefern(Bytes::from_static(&[3; 10]));
        abbruch.cancel();
        task.await.unwrap();

        let inhalt = tokio::fs::read(&pfad).await.unwrap();
        assert_eq!(inhalt.len(), 210);
        assert_eq!(inhalt[0], 1);
        assert_eq!(inhalt[209], 3);
    }

    #[tokio::test]
    async fn verwerfen_ist_still() {
        Senke::Verwerfen.liefern(Bytes::from_static(&[0; 4]));
        assert!(Senke::Verwerfen.zustellen(Bytes::from_static(&[0; 4])).await);
    }

    #[tokio::test]
    async fn zustellen_wartet_auf_platz() {
        let (tx, mut rx) = mpsc::channel(1);
        let senke = Senke::Bridge(tx);
        let leser = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame[0]);
            }
            frames
        });

        for i in 0..5u8 {
            assert!(senke.zustellen(Bytes::from(vec![i])).await);
        }
        drop(senke);
        assert_eq!(leser.await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn zustellen_gibt_bei_voller_queue_auf() {
        let (tx, mut rx) = mpsc::channel(1);
        let senke = Senke::Bridge(tx);
        assert!(senke.zustellen(Bytes::from_static(&[1])).await);
        // Niemand liest: Timeout statt ewigem Warten
        assert!(!senke.zustellen(Bytes::from_static(&[2])).await);
        assert_eq!(rx.recv().await.unwrap()[0], 1);

        drop(rx);
        assert!(!senke.zustellen(Bytes::from_static(&[3])).await);
    }
}
