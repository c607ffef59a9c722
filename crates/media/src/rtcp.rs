//! RTCP-Handler und symmetrisches Latching
//!
//! Telefone hinter NAT senden von einer anderen Adresse als im SDP
//! angegeben. Deshalb wird die Quelle des ersten eingehenden Pakets pro
//! Kanal (RTP und RTCP getrennt) zum Sendeziel ("Latching"). Spaetere
//! Pakete werden nur aus demselben Netz akzeptiert (/24 bei IPv4, /64 bei
//! IPv6); alles andere wird verworfen und gezaehlt.
//!
//! Zusaetzlich fuehrt der Handler die Sende-Zaehler fuer Sender Reports,
//! die periodisch (Standard alle 5 Sekunden) an das RTCP-Ziel gehen.

use callbridge_core::CallId;
use callbridge_protocol::rtcp::{NtpZeit, SenderReport};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Standard-Abstand zwischen zwei Sender Reports
pub const RTCP_INTERVALL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// SymmetricLatch
// ---------------------------------------------------------------------------

/// Latching-Zustand eines einzelnen Kanals
#[derive(Debug, Clone)]
pub struct SymmetricLatch {
    ziel: Option<SocketAddr>,
    gelatcht: bool,
    verworfen: u64,
}

impl SymmetricLatch {
    /// Erstellt einen Latch mit optionalem Vorgabe-Ziel (aus dem SDP)
    pub fn neu(vorgabe: Option<SocketAddr>) -> Self {
        Self {
            ziel: vorgabe,
            gelatcht: false,
            verworfen: 0,
        }
    }

    /// Prueft die Quelle eines eingehenden Pakets
    ///
    /// Das erste Paket wird immer akzeptiert und legt das Ziel fest.
    /// Danach bleibt das Ziel fest; Pakete aus fremden Netzen liefern
    /// `false`.
    pub fn pruefen(&mut self, quelle: SocketAddr) -> bool {
        match self.ziel {
            Some(ziel) if self.gelatcht => {
                if gleiches_netz(ziel.ip(), quelle.ip()) {
                    true
                } else {
                    self.verworfen += 1;
                    tracing::debug!(
                        quelle = %quelle,
                        ziel = %ziel,
                        verworfen = self.verworfen,
                        "Paket aus fremdem Netz verworfen"
                    );
                    false
                }
            }
            vorher => {
                if vorher != Some(quelle) {
                    tracing::info!(quelle = %quelle, vorgabe = ?vorher, "Ziel gelatcht");
                }
                self.ziel = Some(quelle);
                self.gelatcht = true;
                true
            }
        }
    }

    /// Aktuelles Sendeziel (Vorgabe oder gelatchte Adresse)
    pub fn ziel(&self) -> Option<SocketAddr> {
        self.ziel
    }

    pub fn ist_gelatcht(&self) -> bool {
        self.gelatcht
    }

    /// Anzahl verworfener Pakete
    pub fn verworfen(&self) -> u64 {
        self.verworfen
    }
}

/// Gleiches /24 (IPv4) bzw. /64 (IPv6)
pub fn gleiches_netz(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..4] == b.segments()[..4],
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// RtcpHandler
// ---------------------------------------------------------------------------

/// RTCP-Zustand einer Session: SSRC, Sende-Zaehler und beide Latches
#[derive(Debug)]
pub struct RtcpHandler {
    ssrc: u32,
    rtp_latch: SymmetricLatch,
    rtcp_latch: SymmetricLatch,
    pakete_gesendet: u64,
    oktette_gesendet: u64,
    letzter_rtp_timestamp: u32,
}

impl RtcpHandler {
    /// Erstellt einen Handler mit zufaelliger SSRC
    pub fn neu(remote: Option<SocketAddr>) -> Self {
        Self::mit_ssrc(rand::random(), remote)
    }

    pub fn mit_ssrc(ssrc: u32, remote: Option<SocketAddr>) -> Self {
        Self {
            ssrc,
            rtp_latch: SymmetricLatch::neu(remote),
            rtcp_latch: SymmetricLatch::neu(None),
            pakete_gesendet: 0,
            oktette_gesendet: 0,
            letzter_rtp_timestamp: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Meldet ein eingehendes RTP-Paket; `false` = verwerfen
    pub fn rtp_paket_empfangen(&mut self, quelle: SocketAddr) -> bool {
        self.rtp_latch.pruefen(quelle)
    }

    /// Meldet ein eingehendes RTCP-Paket; `false` = verwerfen
    pub fn rtcp_paket_empfangen(&mut self, quelle: SocketAddr) -> bool {
        self.rtcp_latch.pruefen(quelle)
    }

    /// Zaehlt ein gesendetes RTP-Paket
    pub fn rtp_gesendet(&mut self, timestamp: u32, nutzdaten_bytes: usize) {
        self.pakete_gesendet += 1;
        self.oktette_gesendet += nutzdaten_bytes as u64;
        self.letzter_rtp_timestamp = timestamp;
    }

    /// Sendeziel fuer RTP
    pub fn rtp_ziel(&self) -> Option<SocketAddr> {
        self.rtp_latch.ziel()
    }

    /// Sendeziel fuer RTCP: gelatcht, sonst RTP-Ziel mit Port + 1
    pub fn rtcp_ziel(&self) -> Option<SocketAddr> {
        self.rtcp_latch.ziel().or_else(|| {
            self.rtp_ziel()
                .map(|ziel| SocketAddr::new(ziel.ip(), ziel.port().wrapping_add(1)))
        })
    }

    pub fn rtp_gelatcht(&self) -> bool {
        self.rtp_latch.ist_gelatcht()
    }

    pub fn rtcp_gelatcht(&self) -> bool {
        self.rtcp_latch.ist_gelatcht()
    }

    /// Verworfene Pakete beider Kanaele
    pub fn verworfen(&self) -> u64 {
        self.rtp_latch.verworfen() + self.rtcp_latch.verworfen()
    }

    pub fn pakete_gesendet(&self) -> u64 {
        self.pakete_gesendet
    }

    pub fn oktette_gesendet(&self) -> u64 {
        self.oktette_gesendet
    }

    /// Erstellt einen Sender Report mit der aktuellen Wanduhrzeit
    ///
    /// Die Zaehler laufen im Report modulo 2^32 ueber (RFC 3550).
    pub fn sender_report_erstellen(&self) -> SenderReport {
        SenderReport {
            ssrc: self.ssrc,
            ntp: NtpZeit::jetzt(),
            rtp_timestamp: self.letzter_rtp_timestamp,
            paket_anzahl: self.pakete_gesendet as u32,
            oktett_anzahl: self.oktette_gesendet as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// Sender-Report-Task
// ---------------------------------------------------------------------------

/// Startet den periodischen Sender-Report-Task einer Session
///
/// Der erste Report geht nach einem vollen Intervall raus.
pub(crate) fn berichte_starten(
    call_id: CallId,
    handler: Arc<Mutex<RtcpHandler>>,
    socket: Arc<UdpSocket>,
    intervall: Duration,
    abbruch: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + intervall, intervall);

        loop {
            tokio::select! {
                _ = abbruch.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (bericht, ziel) = {
                let h = handler.lock();
                (h.sender_report_erstellen(), h.rtcp_ziel())
            };
            let Some(ziel) = ziel else {
                continue;
            };

            match socket.send_to(&bericht.encode(), ziel).await {
                Ok(_) => tracing::trace!(
                    call_id = %call_id,
                    ziel = %ziel,
                    pakete = bericht.paket_anzahl,
                    "Sender Report gesendet"
                ),
                Err(e) => tracing::warn!(
                    call_id = %call_id,
                    fehler = %e,
                    ziel = %ziel,
                    "Sender Report konnte nicht gesendet werden"
                ),
            }
        }

        tracing::debug!(call_id = %call_id, "RTCP-Task beendet");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
