//! Tonhoehen-erhaltende Zeitstreckung (WSOLA)
//!
//! Waveform Similarity Overlap-Add: Das Signal wird in Segmente von 10 ms
//! zerlegt. Die Analyse-Position rueckt pro Segment um `segment * tempo`
//! vor, die Ausgabe immer um `segment`. Damit an den Nahtstellen keine
//! Phasenspruenge entstehen, wird der naechste Segmentanfang innerhalb
//! eines Suchfensters so gewaehlt, dass er moeglichst gut an das Ende des
//! vorherigen Segments anschliesst, und anschliessend ueberblendet.
//!
//! ```text
//! Eingang:  |--seg--|     |--seg--|     |--seg--|      (Abstand seg*tempo)
//! Ausgang:  |--seg--|--seg--|--seg--|                   (Abstand seg)
//!                  ^^ Ueberblendung (overlap)
//! ```

use crate::error::{AudioError, AudioResult};
use crate::tempo::{TEMPO_MAX, TEMPO_MIN};

/// Segmentdauer in Millisekunden
const SEGMENT_MS: u32 = 10;

/// Zeitstrecker fuer lineare 16-Bit-Samples (mono)
#[derive(Debug)]
pub struct TimeStretcher {
    tempo: f64,
    segment: usize,
    overlap: usize,
    suche: usize,
    /// Noch nicht vollstaendig verarbeitete Eingangs-Samples
    eingang: Vec<f32>,
    /// Analyse-Position relativ zum Anfang von `eingang`
    basis: f64,
    /// Natuerliche Fortsetzung des letzten Segments (fuer die Ueberblendung)
    rest: Vec<f32>,
}

impl TimeStretcher {
    /// Erstellt einen Zeitstrecker
    ///
    /// # Fehler
    /// `UngueltigesTempo` ausserhalb von 0.1–5.0, `Konfiguration` bei
    /// einer Abtastrate unter 1 kHz.
    pub fn neu(abtastrate: u32, tempo: f32) -> AudioResult<Self> {
        if !(TEMPO_MIN..=TEMPO_MAX).contains(&tempo) {
            return Err(AudioError::UngueltigesTempo(tempo));
        }
        if abtastrate < 1000 {
            return Err(AudioError::Konfiguration(format!(
                "Abtastrate {abtastrate} Hz zu klein fuer Zeitstreckung"
            )));
        }

        let segment = (abtastrate * SEGMENT_MS / 1000) as usize;
        let overlap = segment / 4;
        Ok(Self {
            tempo: tempo as f64,
            segment,
            overlap,
            suche: overlap,
            eingang: Vec::new(),
            basis: 0.0,
            rest: Vec::new(),
        })
    }

    /// Aktuelles Tempo
    pub fn tempo(&self) -> f32 {
        self.tempo as f32
    }

    /// Verarbeitet neue Samples und gibt alle fertig gestreckten zurueck
    ///
    /// Die Ausgabe haengt um bis zu ein Segment plus Suchfenster hinter dem
    /// Eingang zurueck; [`abschliessen`](Self::abschliessen) holt den Rest.
    pub fn verarbeiten(&mut self, samples: &[i16]) -> Vec<i16> {
        self.eingang.extend(samples.iter().map(|&s| s as f32));
        let mut ausgabe = Vec::new();

        loop {
            let position = self.basis.round() as usize;
            if position + self.suche + self.segment + self.overlap > self.eingang.len() {
                break;
            }

            let start = if self.rest.is_empty() {
                position
            } else {
                self.beste_position(position)
            };

            if self.rest.is_empty() {
                ausgabe.extend(self.eingang[start..start + self.segment].iter().map(|&s| runden(s)));
            } else {
                for i in 0..self.overlap {
                    let gewicht = (i as f32 + 0.5) / self.overlap as f32;
                    let wert = self.rest[i] * (1.0 - gewicht) + self.eingang[start + i] * gewicht;
                    ausgabe.push(runden(wert));
                }
                ausgabe.extend(
                    self.eingang[start + self.overlap..start + self.segment]
                        .iter()
                        .map(|&s| runden(s)),
                );
            }

            self.rest.clear();
            self.rest
                .extend_from_slice(&self.eingang[start + self.segment..start + self.segment + self.overlap]);
            self.basis += self.segment as f64 * self.tempo;
        }

        // Alles vor dem naechsten Suchfenster wird nie wieder gebraucht
        let verwerfbar = (self.basis.floor() as usize)
            .saturating_sub(self.suche)
            .min(self.eingang.len());
        if verwerfbar > 0 {
            self.eingang.drain(..verwerfbar);
            self.basis -= verwerfbar as f64;
        }

        ausgabe
    }

    /// Gibt den Ueberblendungs-Rest aus und setzt den Zustand zurueck
    pub fn abschliessen(&mut self) -> Vec<i16> {
        let ausgabe = self.rest.iter().map(|&s| runden(s)).collect();
        self.zuruecksetzen();
        ausgabe
    }

    /// Verwirft allen internen Zustand
    pub fn zuruecksetzen(&mut self) {
        self.eingang.clear();
        self.rest.clear();
        self.basis = 0.0;
    }

    /// Sucht im Fenster um `position` den Segmentanfang, der am besten zum
    /// Ueberblendungs-Rest passt (normierte Kreuzkorrelation)
    fn beste_position(&self, position: usize) -> usize {
        let von = position.saturating_sub(self.suche);
        let bis = position + self.suche;

        let mut beste = position;
        let mut bester_wert = f32::MIN;
        for kandidat in von..=bis {
            let fenster = &self.eingang[kandidat..kandidat + self.overlap];
            let mut korrelation = 0.0f32;
            let mut energie = 0.0f32;
            for (a, b) in self.rest.iter().zip(fenster) {
                korrelation += a * b;
                energie += b * b;
            }
            let wert = korrelation / (energie.sqrt() + 1e-6);
            if wert > bester_wert {
                bester_wert = wert;
                beste = kandidat;
            }
        }
        beste
    }
}

fn runden(wert: f32) -> i16 {
    wert.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sinus(frequenz: f32, anzahl: usize) -> Vec<i16> {
        (0..anzahl)
            .map(|i| {
                let t = i as f32 / 8000.0;
                (8000.0 * (2.0 * std::f32::consts::PI * frequenz * t).sin()) as i16
            })
            .collect()
    }

    fn nulldurchgaenge(samples: &[i16]) -> usize {
        samples
            .windows(2)
            .filter(|w| (w[0] < 0) != (w[1] < 0))
            .count()
    }

    #[test]
    fn ungueltiges_tempo() {
        assert!(TimeStretcher::neu(8000, 0.05).is_err());
        assert!(TimeStretcher::neu(8000, 5.5).is_err());
        assert!(TimeStretcher::neu(8000, 1.5).is_ok());
    }

    #[test]
    fn schneller_wird_kuerzer() {
        let mut s = TimeStretcher::neu(8000, 2.0).unwrap();
        let mut ausgabe = s.verarbeiten(&sinus(300.0, 8000));
        ausgabe.extend(s.abschliessen());
        assert!((3800..=4200).contains(&ausgabe.len()), "Laenge {}", ausgabe.len());
    }

    #[test]
    fn langsamer_wird_laenger() {
        let mut s = TimeStretcher::neu(8000, 0.5).unwrap();
        let mut ausgabe = s.verarbeiten(&sinus(300.0, 8000));
        ausgabe.extend(s.abschliessen());
        assert!((15500..=16200).contains(&ausgabe.len()), "Laenge {}", ausgabe.len());
    }

    #[test]
    fn blockweise_gleich_wie_am_stueck() {
        let signal = sinus(440.0, 4000);

        let mut am_stueck = TimeStretcher::neu(8000, 2.0).unwrap();
        let erwartet = am_stueck.verarbeiten(&signal);

        let mut blockweise = TimeStretcher::neu(8000, 2.0).unwrap();
        let mut ergebnis = Vec::new();
        for block in signal.chunks(160) {
            ergebnis.extend(blockweise.verarbeiten(block));
        }
        assert_eq!(ergebnis, erwartet);
    }

    #[test]
    fn tonhoehe_bleibt_erhalten() {
        let signal = sinus(400.0, 8000);
        let mut s = TimeStretcher::neu(8000, 1.5).unwrap();
        let ausgabe = s.verarbeiten(&signal);

        let rate_ein = nulldurchgaenge(&signal) as f32 / signal.len() as f32;
        let rate_aus = nulldurchgaenge(&ausgabe) as f32 / ausgabe.len() as f32;
        assert!(
            (rate_aus / rate_ein - 1.0).abs() < 0.15,
            "Nulldurchgaenge {rate_ein} -> {rate_aus}"
        );
    }
}
