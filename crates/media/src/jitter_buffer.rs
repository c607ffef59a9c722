//! Jitter Buffer fuer eingehendes Anrufer-Audio
//!
//! Nimmt Nutzdaten beliebiger Groesse an, zerlegt sie in Frames und gibt
//! sie erst weiter, wenn `ziel_ms` Audio gepuffert sind. Danach liefert
//! jeder Abruf genau einen Frame.
//!
//! - **Feste Codecs** (PCMU/PCMA/G.722): Nutzdaten werden in Stuecke zu
//!   `bytes_pro_frame` geschnitten, ein unvollstaendiger Rest wartet auf
//!   das naechste Paket
//! - **Variable Codecs** (Opus): ein Paket = ein Frame
//!
//! Laeuft der Buffer waehrend der Wiedergabe leer, pausiert die Wiedergabe
//! bis das Ziel erneut erreicht ist (Underrun). Bei mehr als dem doppelten
//! Ziel werden die aeltesten Frames verworfen, frueheste Grenze ist aber
//! Ziel plus zwei Frames, damit kurze Bursts bei kleinem Ziel ueberleben.
//!
//! Der Buffer ist nicht thread-safe; die Session schuetzt ihn mit einem
//! `parking_lot::Mutex`.

use bytes::{Bytes, BytesMut};
use callbridge_protocol::codec::{CodecInfo, FRAME_DAUER_MS};
use std::collections::VecDeque;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration fuer den Jitter Buffer
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Ziel-Fuellstand bevor die Wiedergabe beginnt
    pub ziel_ms: u32,
    /// Audiodauer eines Frames
    pub frame_dauer_ms: u32,
    /// Bytes pro Frame bei festen Codecs, `None` bei variablen
    pub bytes_pro_frame: Option<usize>,
}

impl JitterBufferConfig {
    /// Konfiguration passend zum ausgehandelten Codec
    pub fn fuer_codec(codec: &CodecInfo, ziel_ms: u32) -> Self {
        Self {
            ziel_ms,
            frame_dauer_ms: FRAME_DAUER_MS,
            bytes_pro_frame: codec.bytes_pro_frame(),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistiken
// ---------------------------------------------------------------------------

/// Statistiken des Jitter Buffers (Snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterBufferStatistik {
    /// Eingereihte Frames gesamt
    pub eingereiht: u64,
    /// Per Abruf ausgelieferte Frames
    pub abgespielt: u64,
    /// Ausgelieferte Frames durch `leeren()`
    pub geleert: u64,
    /// Wegen Ueberlauf verworfene Frames
    pub verworfen: u64,
    /// Wiedergabe-Pausen wegen leerem Buffer
    pub underruns: u64,
    /// Aktueller Fuellstand in Frames
    pub fuellstand: usize,
}

/// Ein gepufferter Frame
#[derive(Debug, Clone)]
struct JitterBufferEintrag {
    daten: Bytes,
    ankunft: Instant,
}

// ---------------------------------------------------------------------------
// JitterBuffer
// ---------------------------------------------------------------------------

/// FIFO-Jitter-Buffer mit Ziel-Fuellstand
pub struct JitterBuffer {
    config: JitterBufferConfig,
    frames: VecDeque<JitterBufferEintrag>,
    /// Unvollstaendiger Frame (nur feste Codecs)
    teilframe: BytesMut,
    spielt: bool,
    max_frames: usize,
    statistik: JitterBufferStatistik,
}

impl JitterBuffer {
    pub fn neu(config: JitterBufferConfig) -> Self {
        let max_frames = max_frames_berechnen(&config);
        Self {
            frames: VecDeque::with_capacity(max_frames + 1),
            teilframe: BytesMut::new(),
            spielt: false,
            max_frames,
            statistik: JitterBufferStatistik::default(),
            config,
        }
    }

    /// Buffer fuer einen Codec mit gegebenem Ziel
    pub fn fuer_codec(codec: &CodecInfo, ziel_ms: u32) -> Self {
        Self::neu(JitterBufferConfig::fuer_codec(codec, ziel_ms))
    }

    /// Reiht eingehende Nutzdaten ein
    pub fn einfuegen(&mut self, daten: &[u8]) {
        if daten.is_empty() {
            return;
        }

        match self.config.bytes_pro_frame {
            Some(groesse) if groesse > 0 => {
                self.teilframe.extend_from_slice(daten);
                while self.teilframe.len() >= groesse {
                    let frame = self.teilframe.split_to(groesse).freeze();
                    self.frame_einreihen(frame);
                }
            }
            _ => self.frame_einreihen(Bytes::copy_from_slice(daten)),
        }
    }

    /// Entnimmt den naechsten Frame fuer die Wiedergabe
    ///
    /// Gibt `None` zurueck solange das Ziel nicht erreicht ist.
    pub fn entnehmen(&mut self) -> Option<Bytes> {
        if !self.spielt {
            if self.gepufferte_ms() < self.config.ziel_ms || self.frames.is_empty() {
                return None;
            }
            self.spielt = true;
            tracing::trace!(frames = self.frames.len(), "Jitter Buffer: Wiedergabe startet");
        }

        match self.frames.pop_front() {
            Some(eintrag) => {
                self.statistik.abgespielt += 1;
                self.statistik.fuellstand = self.frames.len();
                tracing::trace!(
                    wartezeit_ms = eintrag.ankunft.elapsed().as_millis() as u64,
                    "Frame ausgespielt"
                );
                Some(eintrag.daten)
            }
            None => {
                self.spielt = false;
                self.statistik.underruns += 1;
                tracing::trace!("Jitter Buffer leer, Wiedergabe pausiert");
                None
            }
        }
    }

    /// Gibt alle gepufferten Frames sofort an `konsument` und leert den Buffer
    ///
    /// Ein unvollstaendiger Rest-Frame wird als letztes Stueck mitgeliefert.
    /// Gibt die Anzahl ausgelieferter Stuecke zurueck.
    pub fn leeren<F>(&mut self, mut konsument: F) -> usize
    where
        F: FnMut(Bytes),
    {
        let mut anzahl = 0;
        for eintrag in self.frames.drain(..) {
            konsument(eintrag.daten);
            anzahl += 1;
        }
        if !self.teilframe.is_empty() {
            konsument(self.teilframe.split().freeze());
            anzahl += 1;
        }

        self.spielt = false;
        self.statistik.geleert += anzahl as u64;
        self.statistik.fuellstand = 0;
        anzahl
    }

    /// Passt die Frame-Dauer an (variable Codecs, nach Erkennung)
    pub fn frame_dauer_setzen(&mut self, frame_dauer_ms: u32) {
        if frame_dauer_ms == 0 || frame_dauer_ms == self.config.frame_dauer_ms {
            return;
        }
        self.config.frame_dauer_ms = frame_dauer_ms;
        self.max_frames = max_frames_berechnen(&self.config);
        self.ueberlauf_verwerfen();
    }

    /// Gepuffertes Audio in Millisekunden (nur vollstaendige Frames)
    pub fn gepufferte_ms(&self) -> u32 {
        self.frames.len() as u32 * self.config.frame_dauer_ms
    }

    /// Aktueller Fuellstand in Frames
    pub fn fuellstand(&self) -> usize {
        self.frames.len()
    }

    /// Ob die Wiedergabe gerade laeuft
    pub fn spielt(&self) -> bool {
        self.spielt
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn statistik(&self) -> &JitterBufferStatistik {
        &self.statistik
    }

    // -----------------------------------------------------------------------
    // Intern
    // -----------------------------------------------------------------------

    fn frame_einreihen(&mut self, daten: Bytes) {
        self.frames.push_back(JitterBufferEintrag {
            daten,
            ankunft: Instant::now(),
        });
        self.statistik.eingereiht += 1;
        self.ueberlauf_verwerfen();
        self.statistik.fuellstand = self.frames.len();
    }

    fn ueberlauf_verwerfen(&mut self) {
        while self.frames.len() > self.max_frames {
            self.frames.pop_front();
            self.statistik.verworfen += 1;
        }
    }
}

/// Doppeltes Ziel, mindestens aber Ziel plus zwei Frames
fn max_frames_berechnen(config: &JitterBufferConfig) -> usize {
    let dauer = config.frame_dauer_ms.max(1);
    let grenze_ms = (2 * config.ziel_ms).max(config.ziel_ms + 2 * dauer);
    grenze_ms.div_ceil(dauer) as usize
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_protocol::Codec;

    fn pcmu(ziel_ms: u32) -> JitterBuffer {
        JitterBuffer::fuer_codec(&CodecInfo::standard(Codec::Pcmu), ziel_ms)
    }

    #[test]
    fn wartet_bis_ziel_erreicht() {
        let mut buf = pcmu(60);
        buf.einfuegen(&[1; 160]);
        buf.einfuegen(&[2; 160]);
        assert_eq!(buf.entnehmen(), None);
        assert!(!buf.spielt());

        buf.einfuegen(&[3; 160]);
        assert_eq!(buf.gepufferte_ms(), 60);
        assert_eq!(buf.entnehmen().unwrap()[0], 1);
        assert!(buf.spielt());
        assert_eq!(buf.entnehmen().unwrap()[0], 2);
    }

    #[test]
    fn zerlegt_beliebige_stuecke() {
        let mut buf = pcmu(20);
        // 400 Bytes = 2 volle Frames + 80 Bytes Rest
        buf.einfuegen(&[7; 400]);
        assert_eq!(buf.fuellstand(), 2);
        buf.einfuegen(&[8; 80]);
        assert_eq!(buf.fuellstand(), 3);

        let dritter = {
            buf.entnehmen();
            buf.entnehmen();
            buf.entnehmen().unwrap()
        };
        assert_eq!(dritter.len(), 160);
        assert_eq!(&dritter[..80], &[7; 80]);
        assert_eq!(&dritter[80..], &[8; 80]);
    }

    #[test]
    fn underrun_pausiert_wiedergabe() {
        let mut buf = pcmu(40);
        buf.einfuegen(&[0; 320]);
        assert!(buf.entnehmen().is_some());
        assert!(buf.entnehmen().is_some());
        assert_eq!(buf.entnehmen(), None);
        assert_eq!(buf.statistik().underruns, 1);
        assert!(!buf.spielt());

        // Ein Frame reicht nicht zum Wiederanlauf
        buf.einfuegen(&[0; 160]);
        assert_eq!(buf.entnehmen(), None);
        assert_eq!(buf.statistik().underruns, 1);
    }

    #[test]
    fn leeren_liefert_alles_inklusive_rest() {
        let mut buf = pcmu(200);
        for _ in 0..4 {
            buf.einfuegen(&[5; 160]);
        }
        buf.einfuegen(&[6; 50]);

        let mut geliefert = Vec::new();
        let anzahl = buf.leeren(|f| geliefert.push(f));
        assert_eq!(anzahl, 5);
        assert_eq!(geliefert.len(), 5);
        assert_eq!(geliefert[4].len(), 50);
        assert_eq!(buf.fuellstand(), 0);
        assert_eq!(buf.leeren(|_| {}), 0);
        assert_eq!(buf.statistik().geleert, 5);
    }

    #[test]
    fn ueberlauf_verwirft_aelteste() {
        let mut buf = pcmu(60);
        assert_eq!(buf.max_frames(), 6);
        for i in 0..8u8 {
            buf.einfuegen(&[i; 160]);
        }
        assert_eq!(buf.fuellstand(), 6);
        assert_eq!(buf.statistik().verworfen, 2);
        assert_eq!(buf.entnehmen().unwrap()[0], 2);
    }

    #[test]
    fn variabler_codec_ein_paket_ein_frame() {
        let mut buf = JitterBuffer::fuer_codec(&CodecInfo::standard(Codec::Opus), 40);
        buf.einfuegen(&[0xF8, 0xFF, 0xFE]);
        buf.einfuegen(&[1; 77]);
        assert_eq!(buf.fuellstand(), 2);
        assert_eq!(buf.entnehmen().unwrap().len(), 3);

        // 40-ms-Frames: Ziel ist ein Frame, Grenze Ziel plus zwei
        buf.frame_dauer_setzen(40);
        assert_eq!(buf.max_frames(), 3);
    }

    #[test]
    fn kleines_ziel_uebersteht_burst() {
        let mut buf = pcmu(20);
        assert_eq!(buf.max_frames(), 3);
        for i in 1..=3u8 {
            buf.einfuegen(&[i; 160]);
        }
        assert_eq!(buf.fuellstand(), 3);
        assert_eq!(buf.statistik().verworfen, 0);
        assert_eq!(buf.entnehmen().unwrap()[0], 1);

        // Erst der vierte Frame ueber der Grenze verdraengt den aeltesten
        buf.einfuegen(&[4; 160]);
        buf.einfuegen(&[5; 160]);
        assert_eq!(buf.fuellstand(), 3);
        assert_eq!(buf.statistik().verworfen, 1);
        assert_eq!(buf.entnehmen().unwrap()[0], 3);
    }
}
