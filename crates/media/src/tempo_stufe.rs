//! Aufbereitungs-Stufe vor dem Scheduler
//!
//! Quellen (Dateien, KI-Backend) liefern Codec-Bytes in beliebig grossen
//! Stuecken. Die Stufe wendet optional die Tempo-Anpassung an und zerlegt
//! den Strom in Frames, die der Scheduler einzeln versendet.
//!
//! Faellt die Tempo-Anpassung aus (Codec ohne Dekoder, Dekodierfehler),
//! meldet die Stufe `SessionEreignis::TempoFehler` und reicht ab dann
//! unveraendert durch. Der Anruf laeuft weiter.

use bytes::{Bytes, BytesMut};
use callbridge_audio::TempoAdjustTransform;
use callbridge_core::{CallId, SessionEreignis};
use callbridge_protocol::codec::{CodecHandler, CodecInfo};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Frames zwischen Stufe und Scheduler (200 ms bei 20-ms-Frames)
pub const STUFEN_QUEUE: usize = 10;

// ---------------------------------------------------------------------------
// FrameZerleger
// ---------------------------------------------------------------------------

/// Zerlegt einen Byte-Strom in Frames fester Groesse
///
/// Bei variablen Codecs ist jedes Stueck bereits ein Frame.
#[derive(Debug)]
pub struct FrameZerleger {
    bytes_pro_frame: Option<usize>,
    stille: Vec<u8>,
    rest: BytesMut,
}

impl FrameZerleger {
    pub fn neu(codec: &CodecInfo) -> Self {
        Self {
            bytes_pro_frame: codec.bytes_pro_frame(),
            stille: CodecHandler::stille_muster(codec.codec).to_vec(),
            rest: BytesMut::new(),
        }
    }

    /// Haengt Daten an und gibt alle vollstaendigen Frames zurueck
    pub fn zerlegen(&mut self, daten: &[u8]) -> Vec<Bytes> {
        let Some(groesse) = self.bytes_pro_frame.filter(|g| *g > 0) else {
            if daten.is_empty() {
                return Vec::new();
            }
            return vec![Bytes::copy_from_slice(daten)];
        };

        self.rest.extend_from_slice(daten);
        let mut frames = Vec::with_capacity(self.rest.len() / groesse);
        while self.rest.len() >= groesse {
            frames.push(self.rest.split_to(groesse).freeze());
        }
        frames
    }

    /// Fuellt den Rest mit Stille zu einem vollen Frame auf
    pub fn abschliessen(&mut self) -> Option<Bytes> {
        let groesse = self.bytes_pro_frame?;
        if self.rest.is_empty() {
            return None;
        }
        let mut muster = self.stille.iter().copied().cycle();
        while self.rest.len() < groesse {
            let byte = muster.next().unwrap_or(0);
            self.rest.extend_from_slice(&[byte]);
        }
        Some(self.rest.split().freeze())
    }
}

// ---------------------------------------------------------------------------
// Stufen-Task
// ---------------------------------------------------------------------------

/// Kontext fuer Fehlermeldungen der Stufe
#[derive(Debug, Clone)]
pub struct StufenKontext {
    pub call_id: CallId,
    pub ereignisse: broadcast::Sender<SessionEreignis>,
}

impl StufenKontext {
    fn tempo_fehler(&self, fehler: String) {
        tracing::warn!(call_id = %self.call_id, fehler = %fehler, "Tempo-Anpassung ausgefallen, Pass-Through");
        let _ = self.ereignisse.send(SessionEreignis::TempoFehler {
            call_id: self.call_id.clone(),
            fehler,
        });
    }
}

/// Startet die Stufe und gibt die Frame-Queue fuer den Scheduler zurueck
///
/// Schliesst sich `eingang`, werden Tempo- und Frame-Reste ausgegeben und
/// die Ausgangs-Queue geschlossen.
pub fn stufe_starten(
    mut eingang: mpsc::Receiver<Bytes>,
    codec: CodecInfo,
    tempo: Option<f32>,
    kontext: StufenKontext,
    abbruch: CancellationToken,
) -> (mpsc::Receiver<Bytes>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Bytes>(STUFEN_QUEUE);

    let task = tokio::spawn(async move {
        let mut transform = match tempo {
            Some(t) => match TempoAdjustTransform::neu(&codec, t) {
                Ok(tf) if tf.ist_passthrough() => None,
                Ok(tf) => Some(tf),
                Err(e) => {
                    kontext.tempo_fehler(e.to_string());
                    None
                }
            },
            None => None,
        };
        let mut zerleger = FrameZerleger::neu(&codec);

        loop {
            let stueck = tokio::select! {
                _ = abbruch.cancelled() => return,
                stueck = eingang.recv() => stueck,
            };
            let Some(stueck) = stueck else { break };

            let daten = match transform.as_mut().map(|tf| tf.verarbeiten(&stueck)) {
                Some(Ok(gestreckt)) => Bytes::from(gestreckt),
                Some(Err(e)) => {
                    kontext.tempo_fehler(e.to_string());
                    transform = None;
                    stueck
                }
                None => stueck,
            };

            for frame in zerleger.zerlegen(&daten) {
                tokio::select! {
                    _ = abbruch.cancelled() => return,
                    r = tx.send(frame) => {
                        if r.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        // Quelle erschoepft: Reste ausgeben
        let mut letzte = Vec::new();
        if let Some(tf) = transform.as_mut() {
            match tf.abschliessen() {
                Ok(rest) => letzte.extend(zerleger.zerlegen(&rest)),
                Err(e) => kontext.tempo_fehler(e.to_string()),
            }
        }
        letzte.extend(zerleger.abschliessen());
        for frame in letzte {
            tokio::select! {
                _ = abbruch.cancelled() => return,
                r = tx.send(frame) => {
                    if r.is_err() {
                        return;
                    }
                }
            }
        }
        tracing::debug!(call_id = %kontext.call_id, "Quelle erschoepft");
    });

    (rx, task)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_protocol::Codec;

    fn kontext() -> (StufenKontext, broadcast::Receiver<SessionEreignis>) {
        let (tx, rx) = broadcast::channel(16);
        (
            StufenKontext {
                call_id: CallId::neu("stufe"),
                ereignisse: tx,
            },
            rx,
        )
    }

    async fn alle_frames(mut rx: mpsc::Receiver<Bytes>) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(f) = rx.recv().await {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn zerleger_fuellt_mit_stille_auf() {
        let mut z = FrameZerleger::neu(&CodecInfo::standard(Codec::Pcma));
        let frames = z.zerlegen(&[1; 400]);
        assert_eq!(frames.len(), 2);
        let letzter = z.abschliessen().unwrap();
        assert_eq!(letzter.len(), 160);
        assert_eq!(&letzter[..80], &[1; 80]);
        assert!(letzter[80..].iter().all(|&b| b == 0xD5));
        assert!(z.abschliessen().is_none());
    }

    #[tokio::test]
    async fn ohne_tempo_nur_zerlegen() {
        let (kontext, _ereignisse) = kontext();
        let (tx, rx_ein) = mpsc::channel(4);
        let (rx, task) = stufe_starten(
            rx_ein,
            CodecInfo::standard(Codec::Pcmu),
            None,
            kontext,
            CancellationToken::new(),
        );

        tx.send(Bytes::from(vec![0x10u8; 250])).await.unwrap();
        tx.send(Bytes::from(vec![0x20u8; 150])).await.unwrap();
        drop(tx);

        let frames = alle_frames(rx).await;
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 160));
        assert!(frames[2][80..].iter().all(|&b| b == 0xFF));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn schnelleres_tempo_weniger_frames() {
        let (kontext, _ereignisse) = kontext();
        let (tx, rx_ein) = mpsc::channel(4);
        let (rx, _task) = stufe_starten(
            rx_ein,
            CodecInfo::standard(Codec::Pcmu),
            Some(2.0),
            kontext,
            CancellationToken::new(),
        );

        let sammler = tokio::spawn(alle_frames(rx));
        for _ in 0..10 {
            tx.send(Bytes::from(vec![0xFFu8; 160])).await.unwrap();
        }
        drop(tx);

        let frames = sammler.await.unwrap();
        assert!(!frames.is_empty());
        assert!(frames.len() <= 6, "{} Frames", frames.len());
    }

    #[tokio::test]
    async fn nicht_dekodierbarer_codec_meldet_fehler() {
        let (kontext, mut ereignisse) = kontext();
        let (tx, rx_ein) = mpsc::channel(4);
        let (rx, _task) = stufe_starten(
            rx_ein,
            CodecInfo::standard(Codec::G722),
            Some(1.5),
            kontext,
            CancellationToken::new(),
        );

        tx.send(Bytes::from(vec![0x42u8; 320])).await.unwrap();
        drop(tx);

        // Pass-Through: Daten unveraendert
        let frames = alle_frames(rx).await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.iter().all(|&b| b == 0x42)));

        match ereignisse.recv().await.unwrap() {
            SessionEreignis::TempoFehler { call_id, .. } => assert_eq!(call_id.as_str(), "stufe"),
            anderes => panic!("unerwartetes Ereignis: {anderes:?}"),
        }
    }
}
