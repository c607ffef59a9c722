//! RTP-Protokoll (RFC 3550)
//!
//! Binaere Paketstruktur fuer die Audio-Uebertragung via UDP. Die Engine
//! spiegelt den angebotenen Codec, die Nutzdaten werden also nie
//! umkodiert.
//!
//! ## Header (12 Bytes + optionale CSRC-Liste / Extension)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       SequenzNummer           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Zeitstempel                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! ```
//!
//! Sequenznummern (16 Bit) und Zeitstempel (32 Bit) laufen ueber und
//! duerfen nur mit den Wrap-Around-Hilfsfunktionen verglichen werden.

use bytes::Bytes;
use std::io;

/// RTP-Version laut RFC 3550
pub const RTP_VERSION: u8 = 2;

/// Groesse des festen RTP-Headers
pub const HEADER_GROESSE: usize = 12;

/// Maximale Paketgroesse die die Engine annimmt
pub const MAX_PAKET_GROESSE: usize = 1500;

// ---------------------------------------------------------------------------
// Wrap-Around-Arithmetik
// ---------------------------------------------------------------------------

/// Vorzeichenbehaftete Differenz `neu - alt` zweier Sequenznummern.
///
/// 65535 gefolgt von 0 ergibt 1, nicht -65535.
pub fn seq_differenz(alt: u16, neu: u16) -> i16 {
    neu.wrapping_sub(alt) as i16
}

/// Vorzeichenbehaftete Differenz `neu - alt` zweier RTP-Zeitstempel
pub fn ts_differenz(alt: u32, neu: u32) -> i32 {
    neu.wrapping_sub(alt) as i32
}

/// Prueft ob `seq` nach `referenz` liegt (halber Zahlenraum als Fenster)
pub fn seq_ist_neuer(seq: u16, referenz: u16) -> bool {
    seq_differenz(referenz, seq) > 0
}

/// Unterscheidet RTP von RTCP auf einem gemeinsamen Port (RFC 5761).
///
/// RTCP-Pakettypen liegen im Bereich 192–223 des zweiten Bytes.
pub fn ist_rtcp(daten: &[u8]) -> bool {
    daten.len() >= 2 && daten[0] >> 6 == RTP_VERSION && (192..=223).contains(&daten[1])
}

// ---------------------------------------------------------------------------
// RtpPacket
// ---------------------------------------------------------------------------

/// Vollstaendiges RTP-Paket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Marker-Bit (erstes Paket eines Talkspurts)
    pub marker: bool,
    /// Payload-Typ (0–127)
    pub payload_type: u8,
    /// Sequenznummer (laeuft bei 65535 ueber)
    pub sequence: u16,
    /// Zeitstempel in Takten der Codec-Clock-Rate
    pub timestamp: u32,
    /// Synchronisation Source
    pub ssrc: u32,
    /// Codec-Nutzdaten
    pub payload: Bytes,
}

impl RtpPacket {
    /// Erstellt ein Paket ohne Marker-Bit
    pub fn neu(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    /// Setzt das Marker-Bit
    pub fn mit_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Serialisiert das Paket (ohne CSRC, Extension oder Padding)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_GROESSE + self.payload.len());
        buf.push(RTP_VERSION << 6);
        buf.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialisiert ein Paket aus einem Byte-Slice
    ///
    /// CSRC-Liste und Header-Extension werden uebersprungen, Padding wird
    /// von den Nutzdaten abgeschnitten.
    ///
    /// # Fehler
    /// - `InvalidData` bei zu kurzem Paket, falscher Version oder
    ///   inkonsistenten Laengenangaben
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_GROESSE {
            return Err(ungueltig(format!(
                "RTP-Paket zu kurz: {} Bytes (mindestens {})",
                buf.len(),
                HEADER_GROESSE
            )));
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(ungueltig(format!("Ungueltige RTP-Version: {version}")));
        }

        let padding = buf[0] & 0x20 != 0;
        let extension = buf[0] & 0x10 != 0;
        let csrc_anzahl = (buf[0] & 0x0F) as usize;
        let marker = buf[1] & 0x80 != 0;
        let payload_type = buf[1] & 0x7F;
        let sequence = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut offset = HEADER_GROESSE + csrc_anzahl * 4;
        if buf.len() < offset {
            return Err(ungueltig("CSRC-Liste unvollstaendig".into()));
        }

        if extension {
            if buf.len() < offset + 4 {
                return Err(ungueltig("Extension-Header unvollstaendig".into()));
            }
            let ext_woerter = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + ext_woerter * 4;
            if buf.len() < offset {
                return Err(ungueltig("Extension-Daten unvollstaendig".into()));
            }
        }

        let mut ende = buf.len();
        if padding {
            let padding_laenge = buf[buf.len() - 1] as usize;
            if padding_laenge == 0 || offset + padding_laenge > ende {
                return Err(ungueltig(format!("Ungueltige Padding-Laenge: {padding_laenge}")));
            }
            ende -= padding_laenge;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(&buf[offset..ende]),
        })
    }
}

fn ungueltig(nachricht: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, nachricht)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
