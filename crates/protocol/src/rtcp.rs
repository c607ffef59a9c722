//! RTCP-Protokoll (RFC 3550, Abschnitt 6)
//!
//! Die Engine sendet nur Sender Reports ohne Report-Bloecke. Eingehende
//! RTCP-Pakete werden lediglich klassifiziert (fuer Latching und Logging),
//! nicht ausgewertet.
//!
//! ## Sender Report (28 Bytes)
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       1   V=2, P=0, RC=0
//!  1       1   PT = 200
//!  2       2   Laenge in 32-Bit-Woertern minus 1 (= 6)
//!  4       4   SSRC des Senders
//!  8       8   NTP-Zeitstempel (Sekunden seit 1900 + Bruchteil)
//! 16       4   RTP-Zeitstempel
//! 20       4   Paketanzahl
//! 24       4   Oktettanzahl
//! ```

use crate::rtp::RTP_VERSION;
use chrono::{DateTime, Utc};
use std::io;

/// Differenz zwischen NTP-Epoche (1900) und Unix-Epoche (1970) in Sekunden
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Groesse eines Sender Reports ohne Report-Bloecke
pub const SR_GROESSE: usize = 28;

/// Bekannte RTCP-Pakettypen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPaketTyp {
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Bye = 203,
    App = 204,
}

impl RtcpPaketTyp {
    /// Konvertiert ein Byte in einen `RtcpPaketTyp`
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            200 => Some(Self::SenderReport),
            201 => Some(Self::ReceiverReport),
            202 => Some(Self::SourceDescription),
            203 => Some(Self::Bye),
            204 => Some(Self::App),
            _ => None,
        }
    }
}

/// Zerlegt ein (ggf. zusammengesetztes) RTCP-Paket in seine Pakettypen
///
/// # Fehler
/// `InvalidData` wenn Version oder Laengenfelder nicht passen.
pub fn pakettypen(daten: &[u8]) -> io::Result<Vec<RtcpPaketTyp>> {
    let mut typen = Vec::new();
    let mut offset = 0usize;

    while offset < daten.len() {
        if daten.len() - offset < 4 {
            return Err(ungueltig("RTCP-Header unvollstaendig"));
        }
        if daten[offset] >> 6 != RTP_VERSION {
            return Err(ungueltig("Ungueltige RTCP-Version"));
        }
        let laenge = (u16::from_be_bytes([daten[offset + 2], daten[offset + 3]]) as usize + 1) * 4;
        if offset + laenge > daten.len() {
            return Err(ungueltig("RTCP-Laengenfeld zu gross"));
        }
        if let Some(typ) = RtcpPaketTyp::from_u8(daten[offset + 1]) {
            typen.push(typ);
        }
        offset += laenge;
    }

    if typen.is_empty() {
        return Err(ungueltig("Kein bekannter RTCP-Pakettyp"));
    }
    Ok(typen)
}

// ---------------------------------------------------------------------------
// NTP-Zeit
// ---------------------------------------------------------------------------

/// 64-Bit NTP-Zeitstempel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpZeit {
    /// Sekunden seit 1.1.1900
    pub sekunden: u32,
    /// Bruchteil einer Sekunde (2^-32)
    pub bruchteil: u32,
}

impl NtpZeit {
    /// Aktuelle Wanduhrzeit als NTP-Zeitstempel
    pub fn jetzt() -> Self {
        Self::aus_datum(Utc::now())
    }

    /// Konvertiert einen UTC-Zeitpunkt
    pub fn aus_datum(zeit: DateTime<Utc>) -> Self {
        let sekunden = (zeit.timestamp() as u64).wrapping_add(NTP_UNIX_OFFSET);
        let nanos = zeit.timestamp_subsec_nanos() as u64;
        Self {
            sekunden: sekunden as u32,
            bruchteil: ((nanos << 32) / 1_000_000_000) as u32,
        }
    }

    /// Mittlere 32 Bit (fuer LSR-Felder in Report-Bloecken)
    pub fn kompakt(&self) -> u32 {
        (self.sekunden << 16) | (self.bruchteil >> 16)
    }
}

// ---------------------------------------------------------------------------
// SenderReport
// ---------------------------------------------------------------------------

/// RTCP Sender Report ohne Report-Bloecke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    /// SSRC des Senders
    pub ssrc: u32,
    /// Wanduhrzeit beim Erstellen
    pub ntp: NtpZeit,
    /// RTP-Zeitstempel der zum NTP-Zeitpunkt passt
    pub rtp_timestamp: u32,
    /// Gesendete RTP-Pakete seit Session-Beginn
    pub paket_anzahl: u32,
    /// Gesendete Nutzdaten-Oktette seit Session-Beginn
    pub oktett_anzahl: u32,
}

impl SenderReport {
    /// Serialisiert den Report (28 Bytes, big-endian)
    pub fn encode(&self) -> [u8; SR_GROESSE] {
        let mut buf = [0u8; SR_GROESSE];
        buf[0] = RTP_VERSION << 6;
        buf[1] = RtcpPaketTyp::SenderReport as u8;
        buf[2..4].copy_from_slice(&((SR_GROESSE / 4 - 1) as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ntp.sekunden.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ntp.bruchteil.to_be_bytes());
        buf[16..20].copy_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&self.paket_anzahl.to_be_bytes());
        buf[24..28].copy_from_slice(&self.oktett_anzahl.to_be_bytes());
        buf
    }

    /// Deserialisiert den Sender-Info-Teil eines Sender Reports
    ///
    /// Report-Bloecke hinter der Sender-Info werden ignoriert.
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < SR_GROESSE {
            return Err(ungueltig("Sender Report zu kurz"));
        }
        if buf[0] >> 6 != RTP_VERSION {
            return Err(ungueltig("Ungueltige RTCP-Version"));
        }
        if buf[1] != RtcpPaketTyp::SenderReport as u8 {
            return Err(ungueltig("Kein Sender Report"));
        }
        let u32_bei = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            ssrc: u32_bei(4),
            ntp: NtpZeit {
                sekunden: u32_bei(8),
                bruchteil: u32_bei(12),
            },
            rtp_timestamp: u32_bei(16),
            paket_anzahl: u32_bei(20),
            oktett_anzahl: u32_bei(24),
        })
    }
}

fn ungueltig(nachricht: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, nachricht.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sender_report_layout() {
        let sr = SenderReport {
            ssrc: 0xDEAD_BEEF,
            ntp: NtpZeit {
                sekunden: 1,
                bruchteil: 2,
            },
            rtp_timestamp: 160,
            paket_anzahl: 50,
            oktett_anzahl: 8000,
        };
        let daten = sr.encode();
        assert_eq!(daten[0], 0x80);
        assert_eq!(daten[1], 200);
        assert_eq!(u16::from_be_bytes([daten[2], daten[3]]), 6);

        let zurueck = SenderReport::decode(&daten).unwrap();
        assert_eq!(zurueck, sr);
        assert_eq!(pakettypen(&daten).unwrap(), vec![RtcpPaketTyp::SenderReport]);
    }

    #[test]
    fn ntp_aus_unix_epoche() {
        let zeit = Utc.timestamp_opt(0, 500_000_000).unwrap();
        let ntp = NtpZeit::aus_datum(zeit);
        assert_eq!(ntp.sekunden as u64, NTP_UNIX_OFFSET);
        // Halbe Sekunde = 2^31
        assert_eq!(ntp.bruchteil, 1 << 31);
    }

    #[test]
    fn zusammengesetztes_paket() {
        // RR ohne Bloecke (8 Bytes) + BYE mit einer SSRC (8 Bytes)
        let daten = [
            0x80, 201, 0, 1, 0, 0, 0, 1, //
            0x81, 203, 0, 1, 0, 0, 0, 1,
        ];
        let typen = pakettypen(&daten).unwrap();
        assert_eq!(typen, vec![RtcpPaketTyp::ReceiverReport, RtcpPaketTyp::Bye]);
    }

    #[test]
    fn kaputtes_laengenfeld() {
        let daten = [0x80, 201, 0, 9, 0, 0, 0, 1];
        assert!(pakettypen(&daten).is_err());
    }
}
