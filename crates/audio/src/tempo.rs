//! Tempo-Anpassung fuer ausgehendes Codec-Audio
//!
//! Dekodiert G.711, streckt das Signal tonhoehen-erhaltend und kodiert es
//! im selben Codec zurueck. Tempo 1.0 ist ein reiner Durchreicher. Codecs
//! ohne Dekoder (G.722, Opus) werden beim Erstellen abgelehnt; der Aufrufer
//! reicht das Audio dann unveraendert weiter.

use crate::error::{AudioError, AudioResult};
use crate::g711;
use crate::stretch::TimeStretcher;
use callbridge_protocol::{Codec, CodecInfo};

/// Kleinstes erlaubtes Tempo
pub const TEMPO_MIN: f32 = 0.1;
/// Groesstes erlaubtes Tempo
pub const TEMPO_MAX: f32 = 5.0;

/// Tempo-Transformation fuer einen Codec-Datenstrom
#[derive(Debug)]
pub struct TempoAdjustTransform {
    codec: Codec,
    tempo: f32,
    /// `None` bei Tempo 1.0
    strecker: Option<TimeStretcher>,
}

impl TempoAdjustTransform {
    /// Erstellt die Transformation fuer den ausgehandelten Codec
    ///
    /// # Fehler
    /// - `UngueltigesTempo` ausserhalb von 0.1–5.0
    /// - `CodecNichtDekodierbar` fuer G.722 und Opus (ausser bei Tempo 1.0)
    pub fn neu(codec: &CodecInfo, tempo: f32) -> AudioResult<Self> {
        if !(TEMPO_MIN..=TEMPO_MAX).contains(&tempo) || !tempo.is_finite() {
            return Err(AudioError::UngueltigesTempo(tempo));
        }

        if (tempo - 1.0).abs() < f32::EPSILON {
            return Ok(Self {
                codec: codec.codec,
                tempo,
                strecker: None,
            });
        }

        match codec.codec {
            Codec::Pcmu | Codec::Pcma => {}
            andere => return Err(AudioError::CodecNichtDekodierbar(andere.name().to_string())),
        }

        let strecker = TimeStretcher::neu(codec.clock_rate, tempo)?;
        tracing::debug!(codec = %codec, tempo, "Tempo-Anpassung aktiv");
        Ok(Self {
            codec: codec.codec,
            tempo,
            strecker: Some(strecker),
        })
    }

    /// Gibt true zurueck wenn die Daten unveraendert durchgereicht werden
    pub fn ist_passthrough(&self) -> bool {
        self.strecker.is_none()
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    /// Transformiert einen Block Codec-Bytes
    ///
    /// Die Ausgabe ist nicht an Frame-Grenzen ausgerichtet.
    pub fn verarbeiten(&mut self, daten: &[u8]) -> AudioResult<Vec<u8>> {
        let codec = self.codec;
        let Some(strecker) = self.strecker.as_mut() else {
            return Ok(daten.to_vec());
        };

        let samples = dekodieren(codec, daten)?;
        let gestreckt = strecker.verarbeiten(&samples);
        kodieren(codec, &gestreckt)
    }

    /// Liefert die noch zurueckgehaltenen Samples am Ende des Datenstroms
    pub fn abschliessen(&mut self) -> AudioResult<Vec<u8>> {
        let codec = self.codec;
        match self.strecker.as_mut() {
            Some(strecker) => kodieren(codec, &strecker.abschliessen()),
            None => Ok(Vec::new()),
        }
    }
}

fn dekodieren(codec: Codec, daten: &[u8]) -> AudioResult<Vec<i16>> {
    match codec {
        Codec::Pcmu => Ok(daten.iter().map(|&b| g711::ulaw_dekodieren(b)).collect()),
        Codec::Pcma => Ok(daten.iter().map(|&b| g711::alaw_dekodieren(b)).collect()),
        andere => Err(AudioError::Dekodierung(format!(
            "Kein Dekoder fuer {}",
            andere.name()
        ))),
    }
}

fn kodieren(codec: Codec, samples: &[i16]) -> AudioResult<Vec<u8>> {
    match codec {
        Codec::Pcmu => Ok(samples.iter().map(|&s| g711::ulaw_kodieren(s)).collect()),
        Codec::Pcma => Ok(samples.iter().map(|&s| g711::alaw_kodieren(s)).collect()),
        andere => Err(AudioError::Dekodierung(format!(
            "Kein Kodierer fuer {}",
            andere.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempo_eins_reicht_durch() {
        let mut t = TempoAdjustTransform::neu(&CodecInfo::standard(Codec::Opus), 1.0).unwrap();
        assert!(t.ist_passthrough());
        let daten = [0xF8, 0xFF, 0xFE];
        assert_eq!(t.verarbeiten(&daten).unwrap(), daten.to_vec());
        assert!(t.abschliessen().unwrap().is_empty());
    }

    #[test]
    fn schnelleres_tempo_kuerzt_stille() {
        let mut t = TempoAdjustTransform::neu(&CodecInfo::standard(Codec::Pcmu), 1.5).unwrap();
        assert!(!t.ist_passthrough());

        let mut ausgabe = t.verarbeiten(&[0xFF; 160]).unwrap();
        ausgabe.extend(t.abschliessen().unwrap());
        assert!(!ausgabe.is_empty());
        assert!(ausgabe.len() < 160);
        // Stille bleibt Stille
        assert!(ausgabe.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn alaw_stille_bleibt_stille() {
        let mut t = TempoAdjustTransform::neu(&CodecInfo::standard(Codec::Pcma), 0.8).unwrap();
        let ausgabe = t.verarbeiten(&[0xD5; 1600]).unwrap();
        assert!(!ausgabe.is_empty());
        assert!(ausgabe.iter().all(|&b| b == 0xD5));
    }

    #[test]
    fn nicht_dekodierbare_codecs() {
        let fehler = TempoAdjustTransform::neu(&CodecInfo::standard(Codec::G722), 1.2).unwrap_err();
        assert!(matches!(fehler, AudioError::CodecNichtDekodierbar(_)));
        assert!(TempoAdjustTransform::neu(&CodecInfo::standard(Codec::Opus), 0.7).is_err());
    }

    #[test]
    fn tempo_grenzen() {
        let codec = CodecInfo::standard(Codec::Pcmu);
        assert!(TempoAdjustTransform::neu(&codec, 0.1).is_ok());
        assert!(TempoAdjustTransform::neu(&codec, 5.0).is_ok());
        assert!(TempoAdjustTransform::neu(&codec, 0.0).is_err());
        assert!(TempoAdjustTransform::neu(&codec, f32::NAN).is_err());
    }
}
