//! Codec-Tabelle fuer die RTP-Engine
//!
//! Statisches Wissen ueber die unterstuetzten Codecs: Payload-Typ,
//! Clock-Rate, Kanalanzahl, Frame-Groesse pro 20 ms und Stille-Muster.
//! Die Engine kodiert nie um – sie spiegelt den Codec des Anrufers.
//!
//! Zwei Familien:
//! - **Fest**: PCMU, PCMA, G.722 – 160 Bytes pro 20 ms, Frame-Groesse aus
//!   der Nutzdatenlaenge ableitbar
//! - **Variabel**: Opus – Frame-Groesse muss aus den Zeitstempel-Deltas
//!   aufeinanderfolgender Pakete geschaetzt werden

use callbridge_core::{CallbridgeError, Result};
use serde::{Deserialize, Serialize};

/// Nominale Frame-Dauer in Millisekunden
pub const FRAME_DAUER_MS: u32 = 20;

/// Stille-Frame fuer Opus (TOC 0xF8 + leerer CELT-Frame)
const OPUS_STILLE: &[u8] = &[0xF8, 0xFF, 0xFE];

/// Leerer CELT-Frame ohne TOC
const OPUS_LEERER_FRAME: &[u8] = &[0xFF, 0xFE];

// ---------------------------------------------------------------------------
// Codec-Enum
// ---------------------------------------------------------------------------

/// Unterstuetzte Codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// G.711 μ-law
    Pcmu,
    /// G.711 A-law
    Pcma,
    /// G.722 (16 kHz Audio, RTP-Clock 8 kHz laut RFC 3551)
    G722,
    /// Opus (variable Bitrate)
    Opus,
}

/// Art der Frame-Groessen-Bestimmung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFamilie {
    /// Feste Byte-Anzahl pro Frame
    Fest { bytes_pro_frame: usize },
    /// Aus Zeitstempel-Deltas zu schaetzen
    Variabel,
}

/// Eintrag der statischen Codec-Tabelle
struct CodecEintrag {
    codec: Codec,
    name: &'static str,
    payload_type: Option<u8>,
    clock_rate: u32,
    kanaele: u8,
    familie: FrameFamilie,
    stille: &'static [u8],
}

/// Die Tabelle – Reihenfolge ist gleichzeitig die Praeferenz bei der Auswahl
const CODEC_TABELLE: &[CodecEintrag] = &[
    CodecEintrag {
        codec: Codec::Pcmu,
        name: "PCMU",
        payload_type: Some(0),
        clock_rate: 8000,
        kanaele: 1,
        familie: FrameFamilie::Fest { bytes_pro_frame: 160 },
        stille: &[0xFF],
    },
    CodecEintrag {
        codec: Codec::Pcma,
        name: "PCMA",
        payload_type: Some(8),
        clock_rate: 8000,
        kanaele: 1,
        familie: FrameFamilie::Fest { bytes_pro_frame: 160 },
        stille: &[0xD5],
    },
    CodecEintrag {
        codec: Codec::G722,
        name: "G722",
        payload_type: Some(9),
        clock_rate: 8000,
        kanaele: 1,
        familie: FrameFamilie::Fest { bytes_pro_frame: 160 },
        stille: &[0x00],
    },
    CodecEintrag {
        codec: Codec::Opus,
        name: "opus",
        payload_type: None,
        clock_rate: 48000,
        kanaele: 2,
        familie: FrameFamilie::Variabel,
        stille: OPUS_STILLE,
    },
];

fn eintrag(codec: Codec) -> &'static CodecEintrag {
    CODEC_TABELLE
        .iter()
        .find(|e| e.codec == codec)
        .unwrap_or(&CODEC_TABELLE[0])
}

impl Codec {
    /// Sucht einen Codec anhand des SDP-Namens (Gross-/Kleinschreibung egal)
    pub fn aus_name(name: &str) -> Option<Self> {
        CODEC_TABELLE
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.codec)
    }

    /// Sucht einen Codec anhand eines statischen Payload-Typs
    pub fn aus_statischem_payload_type(pt: u8) -> Option<Self> {
        CODEC_TABELLE
            .iter()
            .find(|e| e.payload_type == Some(pt))
            .map(|e| e.codec)
    }

    /// SDP-Name des Codecs
    pub fn name(&self) -> &'static str {
        eintrag(*self).name
    }

    /// Statischer Payload-Typ (None bei dynamischen Codecs)
    pub fn statischer_payload_type(&self) -> Option<u8> {
        eintrag(*self).payload_type
    }

    /// RTP-Clock-Rate in Hz
    pub fn clock_rate(&self) -> u32 {
        eintrag(*self).clock_rate
    }

    /// Standard-Kanalanzahl im SDP
    pub fn kanaele(&self) -> u8 {
        eintrag(*self).kanaele
    }

    /// Frame-Familie (fest oder variabel)
    pub fn familie(&self) -> FrameFamilie {
        eintrag(*self).familie
    }

    /// Dateiendung fuer rohe Audiodateien dieses Codecs
    pub fn dateiendung(&self) -> &'static str {
        match self {
            Self::Pcmu => "pcmu",
            Self::Pcma => "pcma",
            Self::G722 => "g722",
            Self::Opus => "opus",
        }
    }
}

// ---------------------------------------------------------------------------
// CodecInfo
// ---------------------------------------------------------------------------

/// Ausgehandelter Codec einer Session – unveraenderlich fuer ihre Lebensdauer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecInfo {
    /// Codec aus der Tabelle
    pub codec: Codec,
    /// Payload-Typ wie im Angebot (0–127)
    pub payload_type: u8,
    /// RTP-Clock-Rate in Hz
    pub clock_rate: u32,
    /// Kanalanzahl wie im Angebot
    pub kanaele: u8,
}

impl CodecInfo {
    /// Erstellt CodecInfo aus den ausgehandelten Werten der Signalisierung
    ///
    /// # Fehler
    /// `KeinPassenderCodec` wenn der Name nicht in der Tabelle steht oder
    /// der Payload-Typ ausserhalb von 0–127 liegt.
    pub fn neu(name: &str, payload_type: u8, clock_rate: u32, kanaele: u8) -> Result<Self> {
        let codec = Codec::aus_name(name)
            .ok_or_else(|| CallbridgeError::KeinPassenderCodec(name.to_string()))?;
        if payload_type > 127 {
            return Err(CallbridgeError::KeinPassenderCodec(format!(
                "{name}: Payload-Typ {payload_type} ausserhalb 0-127"
            )));
        }
        Ok(Self {
            codec,
            payload_type,
            clock_rate: if clock_rate == 0 { codec.clock_rate() } else { clock_rate },
            kanaele: kanaele.max(1),
        })
    }

    /// CodecInfo mit den Standardwerten der Tabelle
    pub fn standard(codec: Codec) -> Self {
        Self {
            codec,
            payload_type: codec.statischer_payload_type().unwrap_or(111),
            clock_rate: codec.clock_rate(),
            kanaele: codec.kanaele(),
        }
    }

    /// SDP-Name
    pub fn name(&self) -> &'static str {
        self.codec.name()
    }

    /// Samples (Zeitstempel-Takte) pro 20-ms-Frame
    pub fn samples_pro_frame(&self) -> u32 {
        CodecHandler::samples_pro_frame(self.clock_rate)
    }

    /// Bytes pro Frame (nur fuer die feste Familie)
    pub fn bytes_pro_frame(&self) -> Option<usize> {
        match self.codec.familie() {
            FrameFamilie::Fest { bytes_pro_frame } => Some(bytes_pro_frame),
            FrameFamilie::Variabel => None,
        }
    }

    /// Ein kompletter Stille-Frame fuer diesen Codec
    pub fn stille_frame(&self) -> Vec<u8> {
        CodecHandler::stille_frame(self.codec)
    }
}

impl std::fmt::Display for CodecInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} (PT {})", self.name(), self.clock_rate, self.payload_type)
    }
}

// ---------------------------------------------------------------------------
// CodecHandler
// ---------------------------------------------------------------------------

/// Zustandslose Frame- und Stille-Arithmetik
pub struct CodecHandler;

impl CodecHandler {
    /// Samples pro 20-ms-Frame bei gegebener Clock-Rate
    pub fn samples_pro_frame(clock_rate: u32) -> u32 {
        clock_rate * FRAME_DAUER_MS / 1000
    }

    /// Stille-Byte-Muster des Codecs (ein Byte bei G.711/G.722)
    pub fn stille_muster(codec: Codec) -> &'static [u8] {
        eintrag(codec).stille
    }

    /// Kompletter Stille-Frame: bei fester Familie das Muster auf
    /// Frame-Laenge aufgefuellt, bei Opus der kurze Stille-Frame
    pub fn stille_frame(codec: Codec) -> Vec<u8> {
        let muster = Self::stille_muster(codec);
        match codec.familie() {
            FrameFamilie::Fest { bytes_pro_frame } => {
                muster.iter().copied().cycle().take(bytes_pro_frame).collect()
            }
            FrameFamilie::Variabel => muster.to_vec(),
        }
    }

    /// Stille-Frame fuer eine bestimmte Frame-Dauer
    ///
    /// Feste Codecs werden proportional verlaengert. Opus waehlt die
    /// CELT-Fullband-Konfiguration passend zur Dauer (5/10/20 ms), 40 ms
    /// werden als Paket mit zwei gleich grossen 20-ms-Frames kodiert (Code 1).
    /// Andere Dauern fallen auf den 20-ms-Frame zurueck.
    pub fn stille_frame_fuer_dauer(codec: Codec, dauer_ms: u32) -> Vec<u8> {
        match codec.familie() {
            FrameFamilie::Fest { bytes_pro_frame } => {
                let laenge = bytes_pro_frame * dauer_ms.max(1) as usize / FRAME_DAUER_MS as usize;
                Self::stille_muster(codec).iter().copied().cycle().take(laenge).collect()
            }
            FrameFamilie::Variabel => {
                let (toc, frames) = match dauer_ms {
                    5 => (0xE8, 1),
                    10 => (0xF0, 1),
                    40 => (0xF9, 2),
                    _ => return OPUS_STILLE.to_vec(),
                };
                let mut frame = vec![toc];
                for _ in 0..frames {
                    frame.extend_from_slice(OPUS_LEERER_FRAME);
                }
                frame
            }
        }
    }

    /// Dauer eines Zeitstempel-Deltas in Millisekunden
    pub fn delta_in_ms(delta: u32, clock_rate: u32) -> f64 {
        if clock_rate == 0 {
            return 0.0;
        }
        delta as f64 * 1000.0 / clock_rate as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feste_codecs_haben_160_bytes_pro_20ms() {
        for codec in [Codec::Pcmu, Codec::Pcma, Codec::G722] {
            let info = CodecInfo::standard(codec);
            assert_eq!(info.samples_pro_frame(), 160, "{codec:?}");
            assert_eq!(info.bytes_pro_frame(), Some(160), "{codec:?}");
            // 1 Byte pro Sample bei 8 kHz RTP-Clock
            assert_eq!(
                info.samples_pro_frame() as usize,
                info.stille_frame().len(),
                "{codec:?}"
            );
        }
    }

    #[test]
    fn opus_ist_variabel() {
        let info = CodecInfo::standard(Codec::Opus);
        assert_eq!(info.samples_pro_frame(), 960);
        assert_eq!(info.bytes_pro_frame(), None);
        assert_eq!(info.stille_frame(), vec![0xF8, 0xFF, 0xFE]);
    }

    #[test]
    fn opus_stille_passt_zur_frame_dauer() {
        assert_eq!(CodecHandler::stille_frame_fuer_dauer(Codec::Opus, 20), OPUS_STILLE);
        assert_eq!(
            CodecHandler::stille_frame_fuer_dauer(Codec::Opus, 40),
            vec![0xF9, 0xFF, 0xFE, 0xFF, 0xFE]
        );
        assert_eq!(CodecHandler::stille_frame_fuer_dauer(Codec::Opus, 10)[0], 0xF0);
        // Keine passende Konfiguration: 20-ms-Frame
        assert_eq!(CodecHandler::stille_frame_fuer_dauer(Codec::Opus, 30), OPUS_STILLE);

        let pcma = CodecHandler::stille_frame_fuer_dauer(Codec::Pcma, 40);
        assert_eq!(pcma.len(), 320);
        assert!(pcma.iter().all(|&b| b == 0xD5));
    }

    #[test]
    fn stille_muster() {
        assert!(CodecHandler::stille_frame(Codec::Pcmu).iter().all(|&b| b == 0xFF));
        assert!(CodecHandler::stille_frame(Codec::Pcma).iter().all(|&b| b == 0xD5));
        assert!(CodecHandler::stille_frame(Codec::G722).iter().all(|&b| b == 0x00));
    }

    #[test]
    fn codec_aus_name_und_payload_type() {
        assert_eq!(Codec::aus_name("pcma"), Some(Codec::Pcma));
        assert_eq!(Codec::aus_name("OPUS"), Some(Codec::Opus));
        assert_eq!(Codec::aus_name("GSM"), None);
        assert_eq!(Codec::aus_statischem_payload_type(9), Some(Codec::G722));
        assert_eq!(Codec::aus_statischem_payload_type(96), None);
    }

    #[test]
    fn codec_info_validierung() {
        let info = CodecInfo::neu("PCMA", 8, 8000, 1).unwrap();
        assert_eq!(info.codec, Codec::Pcma);
        assert!(CodecInfo::neu("GSM", 3, 8000, 1).is_err());
        assert!(CodecInfo::neu("PCMU", 200, 8000, 1).is_err());
    }

    #[test]
    fn delta_in_ms() {
        assert_eq!(CodecHandler::delta_in_ms(160, 8000), 20.0);
        assert_eq!(CodecHandler::delta_in_ms(960, 48000), 20.0);
    }

    #[test]
    fn codec_serde_kleinbuchstaben() {
        assert_eq!(serde_json::to_string(&Codec::Pcmu).unwrap(), "\"pcmu\"");
    }
}
