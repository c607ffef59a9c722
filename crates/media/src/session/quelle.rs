//! Ausgehende Audio-Quellen aus Dateien
//!
//! Ansagen und Test-Audio liegen als rohe Codec-Bytes vor (keine
//! Container). Der Lese-Task wird durch die begrenzte Queue gebremst und
//! liest daher nur so schnell, wie der Scheduler verbraucht.

use bytes::Bytes;
use callbridge_core::CallId;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lesegroesse (10 Frames G.711)
const LESE_BLOCK: usize = 1600;

/// Liest eine Audiodatei sequentiell in die Queue
///
/// Dateiende (oder ein Lesefehler) schliesst die Queue und beendet damit
/// die Quelle, nicht den Anruf.
pub(crate) fn datei_lesen(
    call_id: CallId,
    pfad: PathBuf,
    tx: mpsc::Sender<Bytes>,
    abbruch: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut datei = match tokio::fs::File::open(&pfad).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    call_id = %call_id,
                    pfad = %pfad.display(),
                    fehler = %e,
                    "Audiodatei nicht lesbar"
                );
                return;
            }
        };

        let mut gesamt = 0usize;
        let mut buf = vec![0u8; LESE_BLOCK];
        loop {
            let gelesen = tokio::select! {
                _ = abbruch.cancelled() => return,
                r = datei.read(&mut buf) => r,
            };
            let n = match gelesen {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(call_id = %call_id, fehler = %e, "Lesefehler in Audiodatei");
                    break;
                }
            };
            gesamt += n;

            tokio::select! {
                _ = abbruch.cancelled() => return,
                r = tx.send(Bytes::copy_from_slice(&buf[..n])) => {
                    if r.is_err() {
                        return;
                    }
                }
            }
        }

        tracing::debug!(
            call_id = %call_id,
            pfad = %pfad.display(),
            bytes = gesamt,
            "Audiodatei vollstaendig gelesen"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liest_datei_und_schliesst_queue() {
        let dir = tempfile::tempdir().expect("Temp-Verzeichnis konnte nicht erstellt werden");
        let pfad = dir.path().join("test_audio.pcmu");
        tokio::fs::write(&pfad, vec![0x55u8; 4000]).await.unwrap();

        let (tx, mut rx) = mpsc::channel(2);
        let task = datei_lesen(CallId::neu("quelle"), pfad.clone(), tx, CancellationToken::new());

        let mut gesamt = 0;
        while let Some(block) = rx.recv().await {
            assert!(block.len() <= LESE_BLOCK);
            gesamt += block.len();
        }
        assert_eq!(gesamt, 4000);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn fehlende_datei_beendet_quelle() {
        let (tx, mut rx) = mpsc::channel(2);
        let task = datei_lesen(
            CallId::neu("fehlt"),
            PathBuf::from("/nicht/vorhanden.pcmu"),
            tx,
            CancellationToken::new(),
        );
        assert!(rx.recv().await.is_none());
        task.await.unwrap();
    }
}
