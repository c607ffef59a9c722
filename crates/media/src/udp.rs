//! UDP-Transport einer Session – Socket-Paar, Paketierer und Sende-Task
//!
//! ## Architektur
//!
//! ```text
//! Scheduler-Callback
//!     |
//!     v
//! RtpPaketierer::paket()      <- Sequenznummer, Zeitstempel, SSRC
//!     |
//!     v
//! RtpSender (mpsc) --> Sende-Task --> UdpSocket::send_to(gelatchtes Ziel)
//!                                         |
//!                                         +--> RtcpHandler::rtp_gesendet()
//! ```
//!
//! Das Ziel wird erst beim Senden aufgeloest, damit ein spaeteres Latching
//! sofort wirkt. Der Scheduler blockiert nie auf dem Socket.

use bytes::Bytes;
use callbridge_core::{CallId, CallbridgeError, Result};
use callbridge_protocol::rtp::{RtpPacket, MAX_PAKET_GROESSE};
use crate::rtcp::RtcpHandler;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Empfangspuffer (max. Paketgroesse plus Reserve)
pub const UDP_BUFFER_SIZE: usize = MAX_PAKET_GROESSE + 100;

/// Poll-Intervall der Empfangs-Loops fuer kooperativen Abbruch
pub const EMPFANGS_TIMEOUT: Duration = Duration::from_millis(100);

/// Versuche wenn das Betriebssystem den RTP-Port waehlt (Port 0)
const EPHEMERE_VERSUCHE: usize = 16;

// ---------------------------------------------------------------------------
// Socket-Paar
// ---------------------------------------------------------------------------

/// RTP- und RTCP-Socket einer Session (RTCP = RTP + 1)
#[derive(Debug, Clone)]
pub struct SocketPaar {
    pub rtp: Arc<UdpSocket>,
    pub rtcp: Arc<UdpSocket>,
}

impl SocketPaar {
    /// Bindet beide Sockets
    ///
    /// Bei `rtp_port == 0` waehlt das Betriebssystem den RTP-Port; ist der
    /// Folgeport belegt, wird ein neues Paar versucht.
    ///
    /// # Fehler
    /// `PortBindung` wenn einer der beiden Ports nicht gebunden werden kann.
    /// Muss innerhalb einer tokio-Runtime aufgerufen werden.
    pub fn binden(adresse: IpAddr, rtp_port: u16) -> Result<Self> {
        if rtp_port != 0 {
            return Self::paar_binden(adresse, rtp_port);
        }

        let mut letzter_fehler = None;
        for _ in 0..EPHEMERE_VERSUCHE {
            let rtp = std::net::UdpSocket::bind(SocketAddr::new(adresse, 0))
                .map_err(|e| bindungsfehler(0, e))?;
            let port = rtp.local_addr().map_err(|e| bindungsfehler(0, e))?.port();
            if port == u16::MAX {
                continue;
            }
            match std::net::UdpSocket::bind(SocketAddr::new(adresse, port + 1)) {
                Ok(rtcp) => return Self::aus_std(rtp, rtcp, port),
                Err(e) => letzter_fehler = Some(bindungsfehler(port, e)),
            }
        }
        Err(letzter_fehler.unwrap_or(CallbridgeError::PortsErschoepft))
    }

    fn paar_binden(adresse: IpAddr, rtp_port: u16) -> Result<Self> {
        let rtcp_port = rtp_port
            .checked_add(1)
            .ok_or_else(|| bindungsfehler(rtp_port, io::Error::other("kein RTCP-Port")))?;
        let rtp = std::net::UdpSocket::bind(SocketAddr::new(adresse, rtp_port))
            .map_err(|e| bindungsfehler(rtp_port, e))?;
        let rtcp = std::net::UdpSocket::bind(SocketAddr::new(adresse, rtcp_port))
            .map_err(|e| bindungsfehler(rtp_port, e))?;
        Self::aus_std(rtp, rtcp, rtp_port)
    }

    fn aus_std(rtp: std::net::UdpSocket, rtcp: std::net::UdpSocket, port: u16) -> Result<Self> {
        let umwandeln = |s: std::net::UdpSocket| -> Result<Arc<UdpSocket>> {
            s.set_nonblocking(true).map_err(|e| bindungsfehler(port, e))?;
            Ok(Arc::new(UdpSocket::from_std(s).map_err(|e| bindungsfehler(port, e))?))
        };
        Ok(Self {
            rtp: umwandeln(rtp)?,
            rtcp: umwandeln(rtcp)?,
        })
    }

    /// Lokaler RTP-Port
    pub fn rtp_port(&self) -> u16 {
        self.rtp.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

fn bindungsfehler(port: u16, e: io::Error) -> CallbridgeError {
    CallbridgeError::PortBindung {
        port,
        grund: e.to_string(),
    }
}

/// Empfaengt mit Timeout; `None` bei Ablauf
pub async fn empfangen(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Option<io::Result<(usize, SocketAddr)>> {
    tokio::time::timeout(EMPFANGS_TIMEOUT, socket.recv_from(buf)).await.ok()
}

// ---------------------------------------------------------------------------
// RtpPaketierer
// ---------------------------------------------------------------------------

/// Vergibt Sequenznummern und Zeitstempel fuer ausgehende Pakete
///
/// Startwerte sind zufaellig (RFC 3550, 5.1). Priming und Streaming teilen
/// sich einen Paketierer, damit die Sequenz lueckenlos bleibt.
#[derive(Debug)]
pub struct RtpPaketierer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    samples_pro_frame: u32,
}

impl RtpPaketierer {
    pub fn neu(payload_type: u8, ssrc: u32, samples_pro_frame: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence: rand::random(),
            timestamp: rand::random(),
            samples_pro_frame,
        }
    }

    /// Baut das naechste Paket und schaltet Sequenz und Zeitstempel weiter
    pub fn paket(&mut self, payload: Bytes, marker: bool) -> RtpPacket {
        let paket = RtpPacket::neu(self.payload_type, self.sequence, self.timestamp, self.ssrc, payload)
            .mit_marker(marker);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_pro_frame);
        paket
    }

    /// Aendert die Zeitstempel-Schrittweite (erkannte Opus-Frame-Dauer)
    pub fn samples_setzen(&mut self, samples_pro_frame: u32) {
        self.samples_pro_frame = samples_pro_frame;
    }
}

// ---------------------------------------------------------------------------
// RtpSender – Sende-Task pro Session
// ---------------------------------------------------------------------------

/// Handle fuer den Sende-Task einer Session
///
/// Der Task endet wenn alle Handles gedroppt sind oder das Token abbricht.
#[derive(Clone)]
pub struct RtpSender {
    tx: mpsc::Sender<RtpPacket>,
}

impl RtpSender {
    /// Startet den Sende-Task
    ///
    /// Liest aus der mpsc-Queue, loest das aktuelle RTP-Ziel im
    /// `RtcpHandler` auf und sendet via UDP.
    pub fn starten(
        call_id: CallId,
        socket: Arc<UdpSocket>,
        rtcp: Arc<Mutex<RtcpHandler>>,
        queue_groesse: usize,
        abbruch: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RtpPacket>(queue_groesse.max(1));

        let task = tokio::spawn(async move {
            loop {
                let paket = tokio::select! {
                    _ = abbruch.cancelled() => break,
                    paket = rx.recv() => match paket {
                        Some(p) => p,
                        None => break,
                    },
                };
                paket_senden(&call_id, &socket, &rtcp, paket).await;
            }

            // Bereits geplante Pakete (Ansage-Ende, Draining) noch ausliefern
            rx.close();
            while let Ok(paket) = rx.try_recv() {
                paket_senden(&call_id, &socket, &rtcp, paket).await;
            }
            tracing::debug!(call_id = %call_id, "Sende-Task beendet");
        });

        (Self { tx }, task)
    }

    /// Legt ein Paket in die Sende-Queue (verwirft bei voller Queue)
    pub fn senden(&self, paket: RtpPacket) -> bool {
        match self.tx.try_send(paket) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(p)) => {
                tracing::debug!(sequence = p.sequence, "Sende-Queue voll, Paket verworfen");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

async fn paket_senden(
    call_id: &CallId,
    socket: &UdpSocket,
    rtcp: &Mutex<RtcpHandler>,
    paket: RtpPacket,
) {
    let ziel = rtcp.lock().rtp_ziel();
    let Some(ziel) = ziel else {
        tracing::trace!(call_id = %call_id, "Kein RTP-Ziel, Paket verworfen");
        return;
    };

    match socket.send_to(&paket.encode(), ziel).await {
        Ok(_) => {
            rtcp.lock().rtp_gesendet(paket.timestamp, paket.payload.len());
            tracing::trace!(
                call_id = %call_id,
                sequence = paket.sequence,
                bytes = paket.payload.len(),
                ziel = %ziel,
                "RTP-Paket gesendet"
            );
        }
        Err(e) => {
            tracing::warn!(
                call_id = %call_id,
                fehler = %e,
                ziel = %ziel,
                "UDP-Sendefehler"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn socket_paar_folgeport() {
        let paar = SocketPaar::binden(localhost(), 0).expect("Paar muss binden");
        let rtp = paar.rtp.local_addr().unwrap().port();
        let rtcp = paar.rtcp.local_addr().unwrap().port();
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(paar.rtp_port(), rtp);
    }

    #[tokio::test]
    async fn belegter_port_ist_bindungsfehler() {
        let paar = SocketPaar::binden(localhost(), 0).unwrap();
        let fehler = SocketPaar::binden(localhost(), paar.rtp_port()).unwrap_err();
        assert!(fehler.ist_transportfehler());
    }

    #[test]
    fn paketierer_zaehlt_weiter() {
        let mut p = RtpPaketierer::neu(8, 1, 160);
        let erstes = p.paket(Bytes::from_static(&[0xD5]), true);
        let zweites = p.paket(Bytes::from_static(&[0xD5]), false);
        assert!(erstes.marker);
        assert!(!zweites.marker);
        assert_eq!(zweites.sequence, erstes.sequence.wrapping_add(1));
        assert_eq!(zweites.timestamp, erstes.timestamp.wrapping_add(160));
        assert_eq!(zweites.payload_type, 8);
    }

    #[tokio::test]
    async fn sender_nutzt_gelatchtes_ziel() {
        let empfaenger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ziel = empfaenger.local_addr().unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let rtcp = Arc::new(Mutex::new(RtcpHandler::mit_ssrc(9, None)));
        let abbruch = CancellationToken::new();
        let (sender, task) = RtpSender::starten(
            CallId::neu("sender-test"),
            socket,
            Arc::clone(&rtcp),
            8,
            abbruch.clone(),
        );

        // Ohne Ziel wird verworfen
        let mut p = RtpPaketierer::neu(0, 9, 160);
        assert!(sender.senden(p.paket(Bytes::from_static(&[0xFF; 160]), false)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rtcp.lock().pakete_gesendet(), 0);

        rtcp.lock().rtp_paket_empfangen(ziel);
        assert!(sender.senden(p.paket(Bytes::from_static(&[0xFF; 160]), false)));

        let mut buf = [0u8; UDP_BUFFER_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), empfaenger.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let paket = RtpPacket::decode(&buf[..len]).unwrap();
        assert_eq!(paket.ssrc, 9);
        assert_eq!(paket.payload.len(), 160);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rtcp.lock().pakete_gesendet(), 1);
        assert_eq!(rtcp.lock().oktette_gesendet(), 160);

        abbruch.cancel();
        task.await.unwrap();
    }
}
