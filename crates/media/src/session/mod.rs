//! RTP-Session – Zustandsmaschine und Varianten
//!
//! Eine Session besitzt genau ein Socket-Paar, einen Jitter Buffer, einen
//! RTCP-Handler und ihre eigenen tokio-Tasks:
//!
//! ```text
//! RTP-Empfang --> Latching --> Echo-Queue | Jitter Buffer --> Wiedergabe-Takt --> Senke
//! RTCP-Empfang --> Latching
//! Sender-Report-Timer (Standard 5 s)
//! Quelle --> Tempo-Stufe --> Scheduler --> Sende-Task --> RTP-Socket
//! ```
//!
//! ## Zustaende
//!
//! `Erstellt -> Priming -> Streaming -> Draining -> Geschlossen`
//!
//! Priming sendet immer alle konfigurierten Stille-Pakete (Marker auf dem
//! ersten). Eingehendes Audio wird waehrenddessen gelatcht und gepuffert,
//! Streaming beginnt erst nach dem letzten Priming-Paket.
//!
//! Bei Opus bestimmt die erkannte Frame-Dauer Sende-Takt, Zeitstempel,
//! Stille-Frames und Wiedergabe-Takt gemeinsam.

mod bridge;
mod quelle;
mod senke;

pub use bridge::{bridge_kanal, AuflegeHandle, BackendSeite, BridgeAnschluss};

use crate::frame_groesse::FrameSizeDetector;
use crate::jitter_buffer::{JitterBuffer, JitterBufferStatistik};
use crate::rtcp::{self, RtcpHandler, RTCP_INTERVALL};
use crate::scheduler::{AdaptiveRtpScheduler, SchedulerConfig, SchedulerStatistik};
use crate::tempo_stufe::{self, StufenKontext};
use crate::udp::{self, RtpPaketierer, RtpSender, SocketPaar, UDP_BUFFER_SIZE};
use bytes::Bytes;
use callbridge_core::{CallId, CallbridgeError, Result, SessionEreignis, SessionTyp, SessionZustand};
use callbridge_protocol::codec::{CodecHandler, CodecInfo, FrameFamilie, FRAME_DAUER_MS};
use callbridge_protocol::rtcp::pakettypen;
use callbridge_protocol::rtp::{ist_rtcp, RtpPacket};
use parking_lot::Mutex;
use senke::Senke;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Kapazitaet der Echo-Queue (Frames)
const ECHO_QUEUE: usize = 50;

/// Kapazitaet der Datei-Queue vor der Tempo-Stufe (Lese-Bloecke)
const DATEI_QUEUE: usize = 4;

/// Callback fuer interne Auflege-Wuensche (Welcome-Ende, KI-Backend)
pub type AuflegeCallback = Arc<dyn Fn(&CallId, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Konfiguration und Varianten
// ---------------------------------------------------------------------------

/// Konfiguration einer einzelnen Session
#[derive(Debug, Clone)]
pub struct RtpSessionConfig {
    /// Call-ID, gleichzeitig Session-ID
    pub call_id: CallId,
    /// Ausgehandelter Codec (fest fuer die Lebensdauer)
    pub codec: CodecInfo,
    pub bind_adresse: IpAddr,
    /// Lokaler RTP-Port (0 = vom Betriebssystem gewaehlt)
    pub rtp_port: u16,
    /// Adresse aus dem SDP-Angebot; wird durch Latching ersetzt
    pub remote_adresse: Option<SocketAddr>,
    pub jitter_ziel_ms: u32,
    /// Vorlauf des ausgehenden Schedulers
    pub sende_vorlauf_ms: u32,
    /// Tempo fuer ausgehendes Datei-/KI-Audio
    pub tempo: Option<f32>,
    pub priming_pakete: u32,
    pub priming_intervall_ms: u32,
    /// Wartezeit zwischen Draining und Schliessen
    pub nachlauf: Duration,
    /// Abstand der Sender Reports
    pub rtcp_intervall: Duration,
    /// Aufnahme eingehenden Audios (TestAudio/Welcome)
    pub aufnahme: Option<PathBuf>,
    pub sende_queue_groesse: usize,
}

impl RtpSessionConfig {
    /// Konfiguration mit Standardwerten
    pub fn neu(call_id: CallId, codec: CodecInfo, bind_adresse: IpAddr) -> Self {
        Self {
            call_id,
            codec,
            bind_adresse,
            rtp_port: 0,
            remote_adresse: None,
            jitter_ziel_ms: 60,
            sende_vorlauf_ms: 60,
            tempo: None,
            priming_pakete: 5,
            priming_intervall_ms: FRAME_DAUER_MS,
            nachlauf: Duration::ZERO,
            rtcp_intervall: RTCP_INTERVALL,
            aufnahme: None,
            sende_queue_groesse: 64,
        }
    }
}

/// Art der Session mit ihrer variantenspezifischen Verdrahtung
#[derive(Debug)]
pub enum SessionVariante {
    /// Eingehendes Audio geht unveraendert an die Quelle zurueck
    Echo,
    /// Datei abspielen, nach dem Dateiende Stille bis zum Auflegen
    TestAudio { datei: PathBuf },
    /// Ansage abspielen, danach auflegen
    Welcome { datei: PathBuf },
    /// Gespraech mit dem KI-Backend
    Bridge(BridgeAnschluss),
}

impl SessionVariante {
    pub fn typ(&self) -> SessionTyp {
        match self {
            Self::Echo => SessionTyp::Echo,
            Self::TestAudio { .. } => SessionTyp::TestAudio,
            Self::Welcome { .. } => SessionTyp::Welcome,
            Self::Bridge(_) => SessionTyp::Bridge,
        }
    }
}

// ---------------------------------------------------------------------------
// RtpSession
// ---------------------------------------------------------------------------

/// Eine RTP-Session pro Anruf
pub struct RtpSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: RtpSessionConfig,
    typ: SessionTyp,
    lokaler_port: u16,
    zustand: Mutex<SessionZustand>,
    /// Wird beim Schliessen geleert, damit die Ports sofort frei sind
    sockets: Mutex<Option<SocketPaar>>,
    rtcp: Arc<Mutex<RtcpHandler>>,
    jitter: Mutex<JitterBuffer>,
    frame_erkennung: Mutex<FrameSizeDetector>,
    paketierer: Mutex<RtpPaketierer>,
    /// Aktuelle Frame-Dauer, geteilt mit dem Streaming-Scheduler
    frame_dauer: Arc<AtomicU32>,
    /// Stille-Frame passend zur aktuellen Frame-Dauer
    stille: Mutex<Bytes>,
    senke: Mutex<Senke>,
    /// Variantenteile, die erst beim Start verbraucht werden
    variante: Mutex<Option<SessionVariante>>,
    /// Frame-Queue fuer den Streaming-Scheduler
    quelle: Mutex<Option<mpsc::Receiver<Bytes>>>,
    echo_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    sender: Mutex<Option<RtpSender>>,
    priming: Mutex<Option<AdaptiveRtpScheduler>>,
    streaming: Mutex<Option<AdaptiveRtpScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pakete_empfangen: AtomicU64,
    abbruch: CancellationToken,
    ereignisse: broadcast::Sender<SessionEreignis>,
    auflegen: Option<AuflegeCallback>,
}

impl RtpSession {
    /// Bindet das Socket-Paar und bereitet die Session vor
    ///
    /// Es wird noch nichts gesendet (Zustand `Erstellt`). Muss innerhalb
    /// einer tokio-Runtime aufgerufen werden.
    ///
    /// # Fehler
    /// `PortBindung` wenn RTP- oder RTCP-Port nicht gebunden werden kann.
    pub fn binden(
        config: RtpSessionConfig,
        variante: SessionVariante,
        ereignisse: broadcast::Sender<SessionEreignis>,
        auflegen: Option<AuflegeCallback>,
    ) -> Result<Self> {
        let sockets = SocketPaar::binden(config.bind_adresse, config.rtp_port)?;
        let lokaler_port = sockets.rtp_port();

        let rtcp = RtcpHandler::neu(config.remote_adresse);
        let paketierer = RtpPaketierer::neu(
            config.codec.payload_type,
            rtcp.ssrc(),
            config.codec.samples_pro_frame(),
        );

        tracing::info!(
            call_id = %config.call_id,
            typ = %variante.typ(),
            codec = %config.codec,
            rtp_port = lokaler_port,
            remote = ?config.remote_adresse,
            "RTP-Session gebunden"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                typ: variante.typ(),
                lokaler_port,
                zustand: Mutex::new(SessionZustand::Erstellt),
                sockets: Mutex::new(Some(sockets)),
                rtcp: Arc::new(Mutex::new(rtcp)),
                jitter: Mutex::new(JitterBuffer::fuer_codec(&config.codec, config.jitter_ziel_ms)),
                frame_erkennung: Mutex::new(FrameSizeDetector::neu(config.codec.clock_rate)),
                paketierer: Mutex::new(paketierer),
                frame_dauer: Arc::new(AtomicU32::new(FRAME_DAUER_MS)),
                stille: Mutex::new(Bytes::from(config.codec.stille_frame())),
                senke: Mutex::new(Senke::Verwerfen),
                variante: Mutex::new(Some(variante)),
                quelle: Mutex::new(None),
                echo_tx: Mutex::new(None),
                sender: Mutex::new(None),
                priming: Mutex::new(None),
                streaming: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                pakete_empfangen: AtomicU64::new(0),
                abbruch: CancellationToken::new(),
                ereignisse,
                auflegen,
                config,
            }),
        })
    }

    /// Startet alle Tasks und das Priming
    ///
    /// # Fehler
    /// `Intern` wenn die Session bereits gestartet oder geschlossen ist.
    pub fn starten(&self) -> Result<()> {
        let inner = &self.inner;
        let variante = inner.variante.lock().take().ok_or_else(|| {
            CallbridgeError::intern(format!("Session {} bereits gestartet", inner.config.call_id))
        })?;
        let sockets = inner
            .sockets
            .lock()
            .clone()
            .ok_or_else(|| CallbridgeError::intern("Session bereits geschlossen"))?;

        let mut tasks = Vec::new();

        // Sende-Task
        let (sender, task) = RtpSender::starten(
            inner.config.call_id.clone(),
            Arc::clone(&sockets.rtp),
            Arc::clone(&inner.rtcp),
            inner.config.sende_queue_groesse,
            inner.abbruch.child_token(),
        );
        *inner.sender.lock() = Some(sender);
        tasks.push(task);

        // Variante verdrahten: Quelle und Senke
        let quelle = inner.variante_verdrahten(variante, &mut tasks);
        *inner.quelle.lock() = Some(quelle);

        tasks.push(inner.rtp_empfang_starten(Arc::clone(&sockets.rtp)));
        tasks.push(inner.rtcp_empfang_starten(Arc::clone(&sockets.rtcp)));
        tasks.push(rtcp::berichte_starten(
            inner.config.call_id.clone(),
            Arc::clone(&inner.rtcp),
            Arc::clone(&sockets.rtcp),
            inner.config.rtcp_intervall,
            inner.abbruch.child_token(),
        ));
        if inner.typ != SessionTyp::Echo {
            tasks.push(inner.wiedergabe_starten());
        }
        inner.tasks.lock().extend(tasks);

        SessionInner::priming_starten(inner);
        Ok(())
    }

    /// Beendet die Session (idempotent)
    ///
    /// Draining: Jitter Buffer an die Senke leeren, Nachlauf abwarten, dann
    /// alle Tasks abbrechen und abwarten. Danach sind die Ports frei.
    pub async fn stoppen(&self) {
        let inner = &self.inner;
        {
            let mut zustand = inner.zustand.lock();
            if *zustand >= SessionZustand::Draining {
                return;
            }
            *zustand = SessionZustand::Draining;
        }
        inner.zustand_melden(SessionZustand::Draining);

        let geleert = inner.jitter_leeren().await;
        tracing::debug!(call_id = %inner.config.call_id, frames = geleert, "Draining");

        if !inner.config.nachlauf.is_zero() {
            tokio::time::sleep(inner.config.nachlauf).await;
        }

        inner.abbruch.cancel();
        let scheduler: Vec<_> = [inner.priming.lock().take(), inner.streaming.lock().take()]
            .into_iter()
            .flatten()
            .collect();
        for s in scheduler {
            s.abbrechen();
            s.warten().await;
        }
        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(call_id = %inner.config.call_id, fehler = %e, "Session-Task fehlerhaft beendet");
            }
        }

        inner.sender.lock().take();
        inner.echo_tx.lock().take();
        inner.sockets.lock().take();
        *inner.zustand.lock() = SessionZustand::Geschlossen;
        inner.zustand_melden(SessionZustand::Geschlossen);

        tracing::info!(
            call_id = %inner.config.call_id,
            gesendet = self.pakete_gesendet(),
            empfangen = self.pakete_empfangen(),
            verworfen = inner.rtcp.lock().verworfen(),
            "RTP-Session geschlossen"
        );
    }

    /// Leert den Jitter Buffer an die Senke
    ///
    /// Wartet auf Platz in der Senke und gibt die Anzahl tatsaechlich
    /// zugestellter Frames zurueck.
    pub async fn jitter_buffer_leeren(&self) -> usize {
        self.inner.jitter_leeren().await
    }

    pub fn config(&self) -> &RtpSessionConfig {
        &self.inner.config
    }

    pub fn call_id(&self) -> &CallId {
        &self.inner.config.call_id
    }

    pub fn typ(&self) -> SessionTyp {
        self.inner.typ
    }

    pub fn zustand(&self) -> SessionZustand {
        *self.inner.zustand.lock()
    }

    /// Lokaler RTP-Port (RTCP = +1)
    pub fn lokaler_port(&self) -> u16 {
        self.inner.lokaler_port
    }

    /// Aktuelles RTP-Sendeziel
    pub fn rtp_ziel(&self) -> Option<SocketAddr> {
        self.inner.rtcp.lock().rtp_ziel()
    }

    pub fn rtcp_ziel(&self) -> Option<SocketAddr> {
        self.inner.rtcp.lock().rtcp_ziel()
    }

    pub fn pakete_gesendet(&self) -> u64 {
        self.inner.rtcp.lock().pakete_gesendet()
    }

    pub fn pakete_empfangen(&self) -> u64 {
        self.inner.pakete_empfangen.load(Ordering::Relaxed)
    }

    /// Wegen fremder Quelle verworfene Pakete (RTP + RTCP)
    pub fn pakete_verworfen(&self) -> u64 {
        self.inner.rtcp.lock().verworfen()
    }

    /// Aktuelle Frame-Dauer (bei Opus aus den Zeitstempeln erkannt)
    pub fn frame_dauer_ms(&self) -> u32 {
        self.inner.frame_dauer.load(Ordering::Relaxed)
    }

    pub fn jitter_statistik(&self) -> JitterBufferStatistik {
        self.inner.jitter.lock().statistik().clone()
    }

    /// Statistik des ausgehenden Schedulers (sobald Streaming laeuft)
    pub fn scheduler_statistik(&self) -> Option<SchedulerStatistik> {
        self.inner.streaming.lock().as_ref().map(|s| s.statistik())
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        // Tasks ohne geordnetes stoppen() nicht weiterlaufen lassen
        self.inner.abbruch.cancel();
    }
}

// ---------------------------------------------------------------------------
// Interne Ablaeufe
// ---------------------------------------------------------------------------

impl SessionInner {
    fn zustand_melden(&self, zustand: SessionZustand) {
        tracing::debug!(call_id = %self.config.call_id, zustand = ?zustand, "Zustandswechsel");
        let _ = self.ereignisse.send(SessionEreignis::ZustandGeaendert {
            call_id: self.config.call_id.clone(),
            zustand,
        });
    }

    /// Entnimmt alle gepufferten Frames und stellt sie der Reihe nach zu
    async fn jitter_leeren(&self) -> usize {
        let senke = self.senke.lock().clone();
        let mut frames = Vec::new();
        self.jitter.lock().leeren(|frame| frames.push(frame));

        let gepuffert = frames.len();
        let mut zugestellt = 0;
        for frame in frames {
            if !senke.zustellen(frame).await {
                break;
            }
            zugestellt += 1;
        }
        if zugestellt < gepuffert {
            tracing::warn!(
                call_id = %self.config.call_id,
                gepuffert,
                zugestellt,
                "Jitter Buffer nicht vollstaendig zugestellt"
            );
        }
        zugestellt
    }

    fn stille_frame(&self) -> Bytes {
        self.stille.lock().clone()
    }

    fn auflegen_anfordern(&self, grund: &str) {
        tracing::info!(call_id = %self.config.call_id, grund, "Auflegen angefordert");
        if let Some(callback) = &self.auflegen {
            callback(&self.config.call_id, grund);
        }
    }

    /// Baut Quelle und Senke der Variante auf und startet deren Tasks
    fn variante_verdrahten(
        self: &Arc<Self>,
        variante: SessionVariante,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> mpsc::Receiver<Bytes> {
        let kontext = StufenKontext {
            call_id: self.config.call_id.clone(),
            ereignisse: self.ereignisse.clone(),
        };

        match variante {
            SessionVariante::Echo => {
                let (tx, rx) = mpsc::channel(ECHO_QUEUE);
                *self.echo_tx.lock() = Some(tx);
                rx
            }
            SessionVariante::TestAudio { datei } | SessionVariante::Welcome { datei } => {
                if let Some(pfad) = &self.config.aufnahme {
                    let (senke, task) = senke::aufnahme_starten(
                        self.config.call_id.clone(),
                        pfad.clone(),
                        self.abbruch.child_token(),
                    );
                    *self.senke.lock() = senke;
                    tasks.push(task);
                }

                let (roh_tx, roh_rx) = mpsc::channel(DATEI_QUEUE);
                tasks.push(quelle::datei_lesen(
                    self.config.call_id.clone(),
                    datei,
                    roh_tx,
                    self.abbruch.child_token(),
                ));
                let (rx, task) = tempo_stufe::stufe_starten(
                    roh_rx,
                    self.config.codec.clone(),
                    self.config.tempo,
                    kontext,
                    self.abbruch.child_token(),
                );
                tasks.push(task);
                rx
            }
            SessionVariante::Bridge(anschluss) => {
                *self.senke.lock() = Senke::Bridge(anschluss.anrufer_tx);
                tasks.push(self.auflege_wunsch_starten(anschluss.auflegen_rx));
                let (rx, task) = tempo_stufe::stufe_starten(
                    anschluss.antwort_rx,
                    self.config.codec.clone(),
                    self.config.tempo,
                    kontext,
                    self.abbruch.child_token(),
                );
                tasks.push(task);
                rx
            }
        }
    }

    // -----------------------------------------------------------------------
    // Priming und Streaming
    // -----------------------------------------------------------------------

    fn priming_starten(inner: &Arc<Self>) {
        {
            let mut zustand = inner.zustand.lock();
            if *zustand != SessionZustand::Erstellt {
                return;
            }
            *zustand = SessionZustand::Priming;
        }
        inner.zustand_melden(SessionZustand::Priming);

        let anzahl = u64::from(inner.config.priming_pakete);
        if anzahl == 0 {
            Self::streaming_starten(inner);
            return;
        }

        let stille = inner.stille_frame();
        let sender = inner.sender.lock().clone();
        let cb_inner = Arc::clone(inner);
        let ende_inner = Arc::clone(inner);

        let scheduler = AdaptiveRtpScheduler::starten(
            SchedulerConfig::takt(inner.config.priming_intervall_ms.max(1)),
            inner.abbruch.child_token(),
            move |nr, _| {
                let paket = cb_inner.paketierer.lock().paket(stille.clone(), nr == 0);
                if let Some(sender) = &sender {
                    sender.senden(paket);
                }
                nr + 1 < anzahl
            },
            move |stat| {
                tracing::debug!(
                    call_id = %ende_inner.config.call_id,
                    pakete = stat.pakete_geplant,
                    "Priming abgeschlossen"
                );
                Self::streaming_starten(&ende_inner);
            },
        );
        *inner.priming.lock() = Some(scheduler);
    }

    /// Wechselt nach dem Priming (einmalig) nach Streaming und startet den
    /// Audio-Scheduler
    fn streaming_starten(inner: &Arc<Self>) {
        {
            let mut zustand = inner.zustand.lock();
            if *zustand != SessionZustand::Priming {
                return;
            }
            *zustand = SessionZustand::Streaming;
        }
        inner.zustand_melden(SessionZustand::Streaming);

        let Some(mut quelle) = inner.quelle.lock().take() else {
            return;
        };
        let sender = inner.sender.lock().clone();
        let cb_inner = Arc::clone(inner);
        let ende_inner = Arc::clone(inner);
        let mut quelle_offen = true;

        let scheduler = AdaptiveRtpScheduler::mit_frame_dauer(
            inner.config.sende_vorlauf_ms,
            Arc::clone(&inner.frame_dauer),
            inner.abbruch.child_token(),
            move |_, _| {
                let payload = match quelle.try_recv() {
                    Ok(frame) => frame,
                    // Luecke in der Quelle: Stille senden
                    Err(mpsc::error::TryRecvError::Empty) => cb_inner.stille_frame(),
                    // Nur die Ansage endet mit ihrer Quelle
                    Err(mpsc::error::TryRecvError::Disconnected) if cb_inner.typ == SessionTyp::Welcome => {
                        return false;
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        if quelle_offen {
                            quelle_offen = false;
                            tracing::info!(
                                call_id = %cb_inner.config.call_id,
                                "Ausgehende Quelle beendet, sende Stille bis zum Auflegen"
                            );
                        }
                        cb_inner.stille_frame()
                    }
                };
                let paket = cb_inner.paketierer.lock().paket(payload, false);
                if let Some(sender) = &sender {
                    sender.senden(paket);
                }
                true
            },
            move |stat| {
                tracing::info!(
                    call_id = %ende_inner.config.call_id,
                    pakete = stat.pakete_geplant,
                    underruns = stat.underruns,
                    "Ansage vollstaendig gesendet"
                );
                ende_inner.auflegen_anfordern("Ansage beendet");
            },
        );
        *inner.streaming.lock() = Some(scheduler);
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    fn rtp_empfang_starten(self: &Arc<Self>, socket: Arc<tokio::net::UdpSocket>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let abbruch = self.abbruch.child_token();

        tokio::spawn(async move {
            // Empfangspuffer wird wiederverwendet (kein Heap pro Paket)
            let mut buf = [0u8; UDP_BUFFER_SIZE];
            loop {
                let ergebnis = tokio::select! {
                    _ = abbruch.cancelled() => break,
                    e = udp::empfangen(&socket, &mut buf) => e,
                };
                match ergebnis {
                    // Timeout: Abbruch pruefen
                    None => continue,
                    Some(Ok((len, quelle))) => inner.rtp_verarbeiten(&buf[..len], quelle),
                    Some(Err(e)) => {
                        tracing::debug!(call_id = %inner.config.call_id, fehler = %e, "RTP-Empfangsfehler");
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }
            tracing::debug!(call_id = %inner.config.call_id, "RTP-Empfang beendet");
        })
    }

    /// Verarbeitet ein eingehendes RTP-Paket (Hot Path)
    fn rtp_verarbeiten(self: &Arc<Self>, daten: &[u8], quelle: SocketAddr) {
        if ist_rtcp(daten) {
            tracing::trace!(call_id = %self.config.call_id, "RTCP auf RTP-Port ignoriert");
            return;
        }
        let paket = match RtpPacket::decode(daten) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(call_id = %self.config.call_id, fehler = %e, quelle = %quelle, "Ungueltiges RTP-Paket");
                return;
            }
        };

        if !self.rtcp.lock().rtp_paket_empfangen(quelle) {
            return;
        }
        self.pakete_empfangen.fetch_add(1, Ordering::Relaxed);

        if self.config.codec.codec.familie() == FrameFamilie::Variabel {
            let neu = self.frame_erkennung.lock().beobachten(paket.sequence, paket.timestamp);
            if let Some(ms) = neu {
                self.frame_dauer_uebernehmen(ms.round() as u32);
            }
        }

        if self.typ == SessionTyp::Echo {
            let tx = self.echo_tx.lock().clone();
            if let Some(tx) = tx {
                if tx.try_send(paket.payload).is_err() {
                    tracing::trace!(call_id = %self.config.call_id, "Echo-Queue voll");
                }
            }
        } else {
            self.jitter.lock().einfuegen(&paket.payload);
        }

        tracing::trace!(
            call_id = %self.config.call_id,
            sequence = paket.sequence,
            bytes = daten.len(),
            "RTP-Paket empfangen"
        );
    }

    /// Stellt Jitter Buffer, Paketierer, Stille und Takt auf eine neue
    /// Frame-Dauer um
    fn frame_dauer_uebernehmen(&self, dauer_ms: u32) {
        let samples = self.frame_erkennung.lock().samples_pro_frame();
        self.jitter.lock().frame_dauer_setzen(dauer_ms);
        self.paketierer.lock().samples_setzen(samples);
        *self.stille.lock() = Bytes::from(CodecHandler::stille_frame_fuer_dauer(self.config.codec.codec, dauer_ms));
        self.frame_dauer.store(dauer_ms, Ordering::Relaxed);
        tracing::debug!(call_id = %self.config.call_id, dauer_ms, samples, "Frame-Dauer uebernommen");
    }

    fn rtcp_empfang_starten(self: &Arc<Self>, socket: Arc<tokio::net::UdpSocket>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let abbruch = self.abbruch.child_token();

        tokio::spawn(async move {
            let mut buf = [0u8; UDP_BUFFER_SIZE];
            loop {
                let ergebnis = tokio::select! {
                    _ = abbruch.cancelled() => break,
                    e = udp::empfangen(&socket, &mut buf) => e,
                };
                let (len, quelle) = match ergebnis {
                    None => continue,
                    Some(Ok(x)) => x,
                    Some(Err(e)) => {
                        tracing::debug!(call_id = %inner.config.call_id, fehler = %e, "RTCP-Empfangsfehler");
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        continue;
                    }
                };

                match pakettypen(&buf[..len]) {
                    Ok(typen) => {
                        if inner.rtcp.lock().rtcp_paket_empfangen(quelle) {
                            tracing::trace!(call_id = %inner.config.call_id, typen = ?typen, "RTCP empfangen");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(call_id = %inner.config.call_id, fehler = %e, quelle = %quelle, "Ungueltiges RTCP-Paket");
                    }
                }
            }
            tracing::debug!(call_id = %inner.config.call_id, "RTCP-Empfang beendet");
        })
    }

    /// Wiedergabe-Takt: ein Frame pro Frame-Dauer aus dem Jitter Buffer an
    /// die Senke
    fn wiedergabe_starten(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let abbruch = self.abbruch.child_token();

        tokio::spawn(async move {
            let mut dauer_ms = inner.frame_dauer.load(Ordering::Relaxed);
            let mut takt = wiedergabe_takt(dauer_ms);
            loop {
                tokio::select! {
                    _ = abbruch.cancelled() => break,
                    _ = takt.tick() => {}
                }
                let aktuell = inner.frame_dauer.load(Ordering::Relaxed);
                if aktuell != dauer_ms {
                    dauer_ms = aktuell;
                    takt = wiedergabe_takt(dauer_ms);
                    tracing::debug!(call_id = %inner.config.call_id, dauer_ms, "Wiedergabe-Takt angepasst");
                }
                let frame = inner.jitter.lock().entnehmen();
                if let Some(frame) = frame {
                    let senke = inner.senke.lock().clone();
                    senke.liefern(frame);
                }
            }
        })
    }

    /// Wartet auf einen Auflege-Wunsch des KI-Backends
    fn auflege_wunsch_starten(self: &Arc<Self>, mut rx: mpsc::Receiver<String>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let abbruch = self.abbruch.child_token();

        tokio::spawn(async move {
            let grund = tokio::select! {
                _ = abbruch.cancelled() => return,
                grund = rx.recv() => grund,
            };
            let Some(grund) = grund else { return };

            // Restliches Anrufer-Audio noch an das Backend
            let geleert = inner.jitter_leeren().await;
            tracing::debug!(call_id = %inner.config.call_id, frames = geleert, "Jitter Buffer vor Auflegen geleert");
            inner.auflegen_anfordern(&grund);
        })
    }
}

fn wiedergabe_takt(dauer_ms: u32) -> tokio::time::Interval {
    let dauer = Duration::from_millis(u64::from(dauer_ms.max(1)));
    // Erster Tick nach einer vollen Periode
    let mut takt = tokio::time::interval_at(tokio::time::Instant::now() + dauer, dauer);
    takt.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    takt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_protocol::Codec;
    use std::net::Ipv4Addr;

    fn config(call_id: &str) -> RtpSessionConfig {
        RtpSessionConfig::neu(
            CallId::neu(call_id),
            CodecInfo::standard(Codec::Pcmu),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }

    #[tokio::test]
    async fn variante_bestimmt_typ() {
        let (anschluss, _backend) = bridge_kanal(1);
        assert_eq!(SessionVariante::Echo.typ(), SessionTyp::Echo);
        assert_eq!(
            SessionVariante::Welcome { datei: "w".into() }.typ(),
            SessionTyp::Welcome
        );
        assert_eq!(SessionVariante::Bridge(anschluss).typ(), SessionTyp::Bridge);
    }

    #[tokio::test]
    async fn lebenszyklus_ohne_gegenstelle() {
        let (tx, mut rx) = broadcast::channel(32);
        let session = RtpSession::binden(config("zyklus"), SessionVariante::Echo, tx, None).unwrap();
        assert_eq!(session.zustand(), SessionZustand::Erstellt);
        assert_ne!(session.lokaler_port(), 0);

        session.starten().unwrap();
        assert!(session.starten().is_err(), "zweiter Start muss scheitern");

        // Kein Ziel bekannt: Priming laeuft durch, nichts wird gesendet
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.zustand(), SessionZustand::Streaming);
        assert_eq!(session.pakete_gesendet(), 0);

        session.stoppen().await;
        assert_eq!(session.zustand(), SessionZustand::Geschlossen);
        session.stoppen().await;

        let mut zustaende = Vec::new();
        while let Ok(SessionEreignis::ZustandGeaendert { zustand, .. }) = rx.try_recv() {
            zustaende.push(zustand);
        }
        assert_eq!(
            zustaende,
            vec![
                SessionZustand::Priming,
                SessionZustand::Streaming,
                SessionZustand::Draining,
                SessionZustand::Geschlossen
            ]
        );
    }

    #[tokio::test]
    async fn ports_nach_stoppen_frei() {
        let (tx, _rx) = broadcast::channel(32);
        let session = RtpSession::binden(config("ports"), SessionVariante::Echo, tx.clone(), None).unwrap();
        let port = session.lokaler_port();
        session.starten().unwrap();
        session.stoppen().await;

        let mut cfg = config("ports-2");
        cfg.rtp_port = port;
        let zweite = RtpSession::binden(cfg, SessionVariante::Echo, tx, None);
        assert!(zweite.is_ok(), "Port-Paar muss wieder frei sein");
    }
}
