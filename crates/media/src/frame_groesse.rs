//! Frame-Groessen-Erkennung fuer Codecs mit variabler Frame-Laenge
//!
//! Bei Opus laesst sich die Frame-Dauer nicht aus der Nutzdatenlaenge
//! ablesen. Stattdessen wird das Zeitstempel-Delta zweier direkt
//! aufeinanderfolgender Pakete (Sequenz-Delta genau 1) ausgewertet.

use callbridge_protocol::codec::{CodecHandler, FRAME_DAUER_MS};
use callbridge_protocol::rtp::{seq_differenz, ts_differenz};

/// Kuerzeste plausible Frame-Dauer
pub const MIN_FRAME_MS: f64 = 5.0;
/// Laengste plausible Frame-Dauer
pub const MAX_FRAME_MS: f64 = 40.0;

/// Schaetzt die Frame-Dauer aus RTP-Zeitstempeln
#[derive(Debug, Clone)]
pub struct FrameSizeDetector {
    clock_rate: u32,
    letztes: Option<(u16, u32)>,
    frame_ms: f64,
}

impl FrameSizeDetector {
    pub fn neu(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            letztes: None,
            frame_ms: FRAME_DAUER_MS as f64,
        }
    }

    /// Verarbeitet Sequenznummer und Zeitstempel eines eingehenden Pakets
    ///
    /// Gibt die neue Frame-Dauer zurueck, wenn sie sich geaendert hat.
    /// Werte ausserhalb von 5–40 ms werden verworfen, der bisherige Wert
    /// bleibt dann bestehen.
    pub fn beobachten(&mut self, sequence: u16, timestamp: u32) -> Option<f64> {
        let vorher = self.letztes.replace((sequence, timestamp));
        let (alt_seq, alt_ts) = vorher?;

        if seq_differenz(alt_seq, sequence) != 1 {
            return None;
        }
        let delta = ts_differenz(alt_ts, timestamp);
        if delta <= 0 {
            return None;
        }

        let ms = CodecHandler::delta_in_ms(delta as u32, self.clock_rate);
        if !(MIN_FRAME_MS..=MAX_FRAME_MS).contains(&ms) {
            tracing::trace!(delta, ms, "Unplausible Frame-Dauer ignoriert");
            return None;
        }
        if (ms - self.frame_ms).abs() < f64::EPSILON {
            return None;
        }

        tracing::debug!(alt_ms = self.frame_ms, neu_ms = ms, "Frame-Dauer erkannt");
        self.frame_ms = ms;
        Some(ms)
    }

    /// Aktuelle Frame-Dauer in Millisekunden
    pub fn frame_dauer_ms(&self) -> f64 {
        self.frame_ms
    }

    /// Zeitstempel-Takte pro Frame bei der aktuellen Dauer
    pub fn samples_pro_frame(&self) -> u32 {
        (self.frame_ms * self.clock_rate as f64 / 1000.0).round() as u32
    }
}
