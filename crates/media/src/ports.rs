//! Vergabe von RTP/RTCP-Port-Paaren
//!
//! RTP liegt immer auf einer geraden Portnummer, RTCP direkt darueber.
//! Paare werden reihum vergeben, damit ein gerade freigegebener Port nicht
//! sofort wieder verwendet wird (verspaetete Pakete des alten Anrufs).

use callbridge_core::{CallbridgeError, Result};
use std::collections::HashSet;

/// Verwaltet die Port-Paare eines Bereichs
#[derive(Debug)]
pub struct PortAllocator {
    erster: u16,
    letzter: u16,
    naechster: u16,
    belegt: HashSet<u16>,
}

impl PortAllocator {
    /// Erstellt einen Allocator fuer `[port_min, port_max]`
    ///
    /// `port_min` wird auf die naechste gerade Zahl aufgerundet, das letzte
    /// Paar muss mit seinem RTCP-Port noch in den Bereich passen.
    ///
    /// # Fehler
    /// `Konfiguration` wenn der Bereich kein einziges Paar enthaelt.
    pub fn neu(port_min: u16, port_max: u16) -> Result<Self> {
        let erster = port_min.checked_add(port_min % 2).ok_or_else(|| {
            CallbridgeError::Konfiguration(format!("ungueltiger Port-Bereich {port_min}-{port_max}"))
        })?;
        if erster == 0 || erster >= port_max {
            return Err(CallbridgeError::Konfiguration(format!(
                "Port-Bereich {port_min}-{port_max} enthaelt kein RTP/RTCP-Paar"
            )));
        }
        // Letzter gerader Port, dessen RTCP-Port noch <= port_max ist
        let letzter = (port_max - 1) & !1;

        Ok(Self {
            erster,
            letzter,
            naechster: erster,
            belegt: HashSet::new(),
        })
    }

    /// Reserviert das naechste freie Paar und gibt den RTP-Port zurueck
    pub fn reservieren(&mut self) -> Result<u16> {
        for _ in 0..self.kapazitaet() {
            let port = self.naechster;
            self.naechster = if port >= self.letzter { self.erster } else { port + 2 };
            if self.belegt.insert(port) {
                return Ok(port);
            }
        }
        Err(CallbridgeError::PortsErschoepft)
    }

    /// Gibt ein Paar wieder frei; unbekannte Ports werden ignoriert
    pub fn freigeben(&mut self, rtp_port: u16) -> bool {
        self.belegt.remove(&rtp_port)
    }

    pub fn belegt(&self) -> usize {
        self.belegt.len()
    }

    /// Anzahl Paare im Bereich
    pub fn kapazitaet(&self) -> usize {
        usize::from((self.letzter - self.erster) / 2) + 1
    }
}
