//! Minimale SDP-Verarbeitung (RFC 4566) fuer die Codec-Auswahl
//!
//! Die Signalisierung uebergibt das Angebot des Anrufers; hier werden nur
//! Verbindungsadresse, Audio-Medienzeile und `a=rtpmap`-Attribute
//! ausgewertet. Alles andere wird ignoriert.

use crate::codec::{Codec, CodecInfo};
use callbridge_core::{CallbridgeError, Result};
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};

/// Eine `a=rtpmap`-Zeile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub kanaele: u8,
}

/// Die Audio-Medienbeschreibung eines Angebots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioMedium {
    /// Port aus der `m=audio`-Zeile
    pub port: u16,
    /// Angebotene Payload-Typen in Praeferenzreihenfolge
    pub payload_types: Vec<u8>,
    /// Zugehoerige rtpmap-Eintraege
    pub rtpmaps: Vec<RtpMap>,
    /// Verbindungsadresse auf Medienebene (ueberschreibt Session-Ebene)
    pub adresse: Option<IpAddr>,
}

/// Geparstes SDP-Angebot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAngebot {
    /// Verbindungsadresse auf Session-Ebene
    pub adresse: Option<IpAddr>,
    /// Erste Audio-Medienzeile (None wenn nicht vorhanden)
    pub audio: Option<AudioMedium>,
}

impl SdpAngebot {
    /// Parst einen SDP-Text
    ///
    /// # Fehler
    /// `Verhandlung` bei unlesbaren `c=`/`m=`-Zeilen.
    pub fn parsen(text: &str) -> Result<Self> {
        let mut adresse = None;
        let mut audio: Option<AudioMedium> = None;
        // Nur die erste Audio-Zeile zaehlt; Attribute anderer Medien ignorieren
        let mut in_audio = false;

        for zeile in text.lines().map(str::trim).filter(|z| !z.is_empty()) {
            let Some((typ, wert)) = zeile.split_once('=') else {
                continue;
            };
            match typ {
                "m" => {
                    in_audio = false;
                    if audio.is_none() && wert.starts_with("audio ") {
                        audio = Some(medienzeile_parsen(wert)?);
                        in_audio = true;
                    }
                }
                "c" => {
                    let ip = verbindung_parsen(wert)?;
                    match audio.as_mut() {
                        Some(medium) if in_audio => medium.adresse = Some(ip),
                        None => adresse = Some(ip),
                        _ => {}
                    }
                }
                "a" if in_audio => {
                    if let Some(map) = wert.strip_prefix("rtpmap:") {
                        if let (Some(medium), Some(map)) = (audio.as_mut(), rtpmap_parsen(map)) {
                            medium.rtpmaps.push(map);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(Self { adresse, audio })
    }

    /// Waehlt den ersten angebotenen Codec, den die Engine spiegeln kann
    ///
    /// # Fehler
    /// - `KeineAudioMedien` ohne (aktive) Audio-Medienzeile
    /// - `KeinPassenderCodec` wenn kein Codec unterstuetzt wird
    pub fn codec_waehlen(&self) -> Result<CodecInfo> {
        let medium = self.aktives_audio()?;

        for &pt in &medium.payload_types {
            if let Some(map) = medium.rtpmaps.iter().find(|m| m.payload_type == pt) {
                if Codec::aus_name(&map.name).is_some() {
                    return CodecInfo::neu(&map.name, pt, map.clock_rate, map.kanaele);
                }
                continue;
            }
            if let Some(codec) = Codec::aus_statischem_payload_type(pt) {
                return Ok(CodecInfo::standard(codec));
            }
        }

        let angeboten = medium
            .payload_types
            .iter()
            .map(|pt| pt.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Err(CallbridgeError::KeinPassenderCodec(angeboten))
    }

    /// Angebotener RTP-Endpunkt des Anrufers (vor jedem Latching)
    pub fn remote_endpunkt(&self) -> Result<SocketAddr> {
        let medium = self.aktives_audio()?;
        let ip = medium
            .adresse
            .or(self.adresse)
            .ok_or_else(|| CallbridgeError::Verhandlung("keine c=-Zeile".into()))?;
        Ok(SocketAddr::new(ip, medium.port))
    }

    /// Prueft ob das Angebot den gegebenen Codec mit gleichem Payload-Typ enthaelt
    pub fn enthaelt_codec(&self, codec: &CodecInfo) -> bool {
        let Some(medium) = self.audio.as_ref() else {
            return false;
        };
        medium.payload_types.iter().any(|&pt| {
            pt == codec.payload_type
                && medium
                    .rtpmaps
                    .iter()
                    .find(|m| m.payload_type == pt)
                    .map(|m| m.name.eq_ignore_ascii_case(codec.name()))
                    .unwrap_or_else(|| Codec::aus_statischem_payload_type(pt) == Some(codec.codec))
        })
    }

    fn aktives_audio(&self) -> Result<&AudioMedium> {
        match self.audio.as_ref() {
            // Port 0 = abgelehnter Stream
            Some(medium) if medium.port != 0 => Ok(medium),
            _ => Err(CallbridgeError::KeineAudioMedien),
        }
    }
}

/// Erstellt die SDP-Antwort mit genau einem Codec
pub fn antwort_erstellen(
    lokale_adresse: IpAddr,
    rtp_port: u16,
    codec: &CodecInfo,
    session_id: u64,
) -> String {
    let ip_typ = if lokale_adresse.is_ipv4() { "IP4" } else { "IP6" };
    let mut sdp = String::with_capacity(256);
    // write! auf String ist infallibel
    let _ = write!(
        sdp,
        "v=0\r\n\
         o=callbridge {session_id} {session_id} IN {ip_typ} {lokale_adresse}\r\n\
         s=callbridge\r\n\
         c=IN {ip_typ} {lokale_adresse}\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP {pt}\r\n",
        pt = codec.payload_type,
    );
    if codec.kanaele > 1 {
        let _ = write!(
            sdp,
            "a=rtpmap:{} {}/{}/{}\r\n",
            codec.payload_type,
            codec.name(),
            codec.clock_rate,
            codec.kanaele
        );
    } else {
        let _ = write!(
            sdp,
            "a=rtpmap:{} {}/{}\r\n",
            codec.payload_type,
            codec.name(),
            codec.clock_rate
        );
    }
    sdp.push_str("a=ptime:20\r\na=sendrecv\r\n");
    sdp
}

fn medienzeile_parsen(wert: &str) -> Result<AudioMedium> {
    // audio <port>[/<anzahl>] <proto> <fmt> ...
    let mut teile = wert.split_whitespace();
    teile.next();
    let port = teile
        .next()
        .and_then(|p| p.split('/').next())
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| CallbridgeError::Verhandlung(format!("ungueltige m=-Zeile: {wert}")))?;
    teile.next();
    let payload_types = teile.filter_map(|pt| pt.parse::<u8>().ok()).collect();
    Ok(AudioMedium {
        port,
        payload_types,
        rtpmaps: Vec::new(),
        adresse: None,
    })
}

fn verbindung_parsen(wert: &str) -> Result<IpAddr> {
    // IN IP4 <adresse>[/ttl]
    wert.split_whitespace()
        .nth(2)
        .and_then(|a| a.split('/').next())
        .and_then(|a| a.parse::<IpAddr>().ok())
        .ok_or_else(|| CallbridgeError::Verhandlung(format!("ungueltige c=-Zeile: {wert}")))
}

fn rtpmap_parsen(wert: &str) -> Option<RtpMap> {
    // <pt> <name>/<clock>[/<kanaele>]
    let (pt, rest) = wert.split_once(' ')?;
    let mut teile = rest.trim().split('/');
    let name = teile.next()?.to_string();
    let clock_rate = teile.next()?.parse().ok()?;
    let kanaele = teile.next().and_then(|k| k.parse().ok()).unwrap_or(1);
    Some(RtpMap {
        payload_type: pt.parse().ok()?,
        name,
        clock_rate,
        kanaele,
    })
}
