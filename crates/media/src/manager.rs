//! RtpManager – Registry aller aktiven Sessions
//!
//! Der Manager ist die Schnittstelle zur SIP-Signalisierung: er legt pro
//! Anruf eine `RtpSession` an, vergibt deren Port-Paar und raeumt sie beim
//! Auflegen wieder ab.
//!
//! ## Design-Entscheidungen
//! - Eine `parking_lot::Mutex` schuetzt Sessions und Port-Vergabe gemeinsam,
//!   Erstellen und Beenden sind die einzigen schreibenden Operationen
//! - Ereignisse gehen ueber einen Broadcast-Kanal an beliebig viele Abonnenten
//! - Interne Auflege-Wuensche halten nur eine `Weak`-Referenz auf den Manager

use crate::config::MediaConfig;
use crate::ports::PortAllocator;
use crate::session::{AuflegeCallback, BridgeAnschluss, RtpSession, RtpSessionConfig, SessionVariante};
use callbridge_core::{CallId, CallbridgeError, Result, SessionEreignis, SessionTyp};
use callbridge_protocol::codec::CodecInfo;
use callbridge_protocol::sdp::{antwort_erstellen, SdpAngebot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Kapazitaet des Ereignis-Kanals
const EREIGNIS_KANAL_GROESSE: usize = 256;

// ---------------------------------------------------------------------------
// SessionAnfrage
// ---------------------------------------------------------------------------

/// Parameter fuer eine neue Session (aus SIP-Dialog und SDP)
#[derive(Debug, Clone)]
pub struct SessionAnfrage {
    pub call_id: CallId,
    /// Ausgehandelter Codec
    pub codec: CodecInfo,
    /// RTP-Endpunkt aus dem SDP-Angebot
    pub remote_adresse: SocketAddr,
    pub session_typ: SessionTyp,
    /// Ueberschreibt das konfigurierte Jitter-Ziel
    pub jitter_ziel_ms: Option<u32>,
    /// Ueberschreibt das konfigurierte Tempo
    pub tempo: Option<f32>,
}

impl SessionAnfrage {
    pub fn neu(
        call_id: impl Into<CallId>,
        codec: CodecInfo,
        remote_adresse: SocketAddr,
        session_typ: SessionTyp,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            codec,
            remote_adresse,
            session_typ,
            jitter_ziel_ms: None,
            tempo: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RtpManager
// ---------------------------------------------------------------------------

/// Verwaltet alle RTP-Sessions eines Prozesses
///
/// Klonbar; alle Klone teilen dieselbe Registry.
#[derive(Clone)]
pub struct RtpManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: MediaConfig,
    registry: Mutex<Registry>,
    ereignisse: broadcast::Sender<SessionEreignis>,
}

struct Registry {
    sessions: HashMap<CallId, Arc<RtpSession>>,
    /// `None` = Ports waehlt das Betriebssystem
    ports: Option<PortAllocator>,
}

impl RtpManager {
    /// Erstellt einen Manager und gibt einen ersten Ereignis-Empfaenger zurueck
    ///
    /// # Fehler
    /// `Konfiguration` bei ungueltigem Port-Bereich.
    pub fn neu(config: MediaConfig) -> Result<(Self, broadcast::Receiver<SessionEreignis>)> {
        let ports = if config.port_min == 0 {
            None
        } else {
            Some(PortAllocator::neu(config.port_min, config.port_max)?)
        };
        let (ereignisse, rx) = broadcast::channel(EREIGNIS_KANAL_GROESSE);

        tracing::info!(
            bind = %config.bind_adresse,
            port_min = config.port_min,
            port_max = config.port_max,
            jitter_ziel_ms = config.jitter_ziel_ms,
            "RTP-Manager gestartet"
        );

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: Mutex::new(Registry {
                    sessions: HashMap::new(),
                    ports,
                }),
                ereignisse,
            }),
        };
        Ok((manager, rx))
    }

    /// Legt die Session eines Anrufs an und startet sie
    ///
    /// Gibt den lokalen RTP-Port fuer die SDP-Antwort zurueck. `bridge` wird
    /// nur fuer `SessionTyp::Bridge` benoetigt.
    ///
    /// # Fehler
    /// - `SessionExistiert` wenn die Call-ID bereits eine Session hat
    /// - `PortsErschoepft` / `PortBindung` (Ports werden wieder freigegeben)
    /// - `Konfiguration` bei Bridge-Session ohne Anschluss
    pub fn session_erstellen(
        &self,
        anfrage: SessionAnfrage,
        bridge: Option<BridgeAnschluss>,
    ) -> Result<u16> {
        let config = &self.inner.config;
        let mut registry = self.inner.registry.lock();

        if registry.sessions.contains_key(&anfrage.call_id) {
            return Err(CallbridgeError::SessionExistiert(anfrage.call_id.to_string()));
        }

        let endung = anfrage.codec.codec.dateiendung();
        let variante = match anfrage.session_typ {
            SessionTyp::Echo => SessionVariante::Echo,
            SessionTyp::TestAudio => SessionVariante::TestAudio {
                datei: config.audio_verzeichnis.join(format!("test_audio.{endung}")),
            },
            SessionTyp::Welcome => SessionVariante::Welcome {
                datei: config.audio_verzeichnis.join(format!("welcome.{endung}")),
            },
            SessionTyp::Bridge => SessionVariante::Bridge(bridge.ok_or_else(|| {
                CallbridgeError::Konfiguration("Bridge-Session ohne Backend-Anschluss".into())
            })?),
        };

        let tempo = anfrage.tempo.or(match anfrage.session_typ {
            SessionTyp::TestAudio => config.tempo_test_audio,
            SessionTyp::Bridge => config.tempo_bridge,
            SessionTyp::Echo | SessionTyp::Welcome => None,
        });

        let aufnahme = match (anfrage.session_typ, &config.aufnahme_verzeichnis) {
            (SessionTyp::TestAudio | SessionTyp::Welcome, Some(verzeichnis)) => Some(
                verzeichnis.join(format!("{}.{endung}", dateiname(&anfrage.call_id))),
            ),
            _ => None,
        };

        let rtp_port = match registry.ports.as_mut() {
            Some(ports) => ports.reservieren()?,
            None => 0,
        };

        let session_config = RtpSessionConfig {
            call_id: anfrage.call_id.clone(),
            codec: anfrage.codec,
            bind_adresse: config.bind_adresse,
            rtp_port,
            remote_adresse: Some(anfrage.remote_adresse),
            jitter_ziel_ms: anfrage.jitter_ziel_ms.unwrap_or(config.jitter_ziel_ms),
            sende_vorlauf_ms: config.sende_vorlauf_ms,
            tempo,
            priming_pakete: config.priming_pakete,
            priming_intervall_ms: config.priming_intervall_ms,
            nachlauf: config.nachlauf,
            rtcp_intervall: config.rtcp_intervall,
            aufnahme,
            sende_queue_groesse: config.sende_queue_groesse,
        };

        let gestartet = RtpSession::binden(
            session_config,
            variante,
            self.inner.ereignisse.clone(),
            Some(self.auflege_callback()),
        )
        .and_then(|session| session.starten().map(|()| session));

        let session = match gestartet {
            Ok(s) => s,
            Err(e) => {
                if let Some(ports) = registry.ports.as_mut() {
                    ports.freigeben(rtp_port);
                }
                tracing::warn!(call_id = %anfrage.call_id, fehler = %e, "Session konnte nicht erstellt werden");
                return Err(e);
            }
        };

        let lokaler_port = session.lokaler_port();
        registry
            .sessions
            .insert(anfrage.call_id.clone(), Arc::new(session));
        drop(registry);

        let _ = self.inner.ereignisse.send(SessionEreignis::Erstellt {
            call_id: anfrage.call_id.clone(),
            typ: anfrage.session_typ,
            rtp_port: lokaler_port,
        });
        tracing::info!(
            call_id = %anfrage.call_id,
            typ = %anfrage.session_typ,
            rtp_port = lokaler_port,
            "Session erstellt"
        );
        Ok(lokaler_port)
    }

    /// Beantwortet ein SDP-Angebot: Codec waehlen, Session anlegen, Antwort bauen
    pub fn angebot_beantworten(
        &self,
        call_id: impl Into<CallId>,
        angebot: &str,
        session_typ: SessionTyp,
        bridge: Option<BridgeAnschluss>,
    ) -> Result<String> {
        let angebot = SdpAngebot::parsen(angebot)?;
        let codec = angebot.codec_waehlen()?;
        let remote = angebot.remote_endpunkt()?;

        let anfrage = SessionAnfrage::neu(call_id, codec.clone(), remote, session_typ);
        let port = self.session_erstellen(anfrage, bridge)?;
        Ok(antwort_erstellen(
            self.inner.config.sdp_adresse(),
            port,
            &codec,
            rand::random::<u32>().into(),
        ))
    }

    /// Beendet die Session eines Anrufs (idempotent)
    ///
    /// Gibt `false` zurueck wenn keine Session (mehr) existiert.
    pub async fn session_beenden(&self, call_id: &CallId) -> bool {
        let Some(session) = self.inner.registry.lock().sessions.remove(call_id) else {
            tracing::debug!(call_id = %call_id, "Session bereits beendet");
            return false;
        };

        session.stoppen().await;

        // Ports erst nach vollstaendigem Schliessen zurueckgeben
        if let Some(ports) = self.inner.registry.lock().ports.as_mut() {
            ports.freigeben(session.config().rtp_port);
        }

        let _ = self.inner.ereignisse.send(SessionEreignis::Beendet {
            call_id: call_id.clone(),
            pakete_gesendet: session.pakete_gesendet(),
            pakete_empfangen: session.pakete_empfangen(),
        });
        tracing::info!(call_id = %call_id, "Session beendet");
        true
    }

    /// Leert den Jitter Buffer einer Session an ihre Senke
    ///
    /// Kehrt erst zurueck, wenn alle gepufferten Frames zugestellt sind (oder
    /// die Senke haengt). Ergebnis ist die Anzahl zugestellter Frames.
    pub async fn jitter_buffer_leeren(&self, call_id: &CallId) -> Result<usize> {
        let session = self
            .session(call_id)
            .ok_or_else(|| CallbridgeError::SessionNichtGefunden(call_id.to_string()))?;
        Ok(session.jitter_buffer_leeren().await)
    }

    /// SDP-Antwort auf ein Re-INVITE
    ///
    /// Der laufende Codec bleibt bestehen; das Angebot muss ihn enthalten.
    /// Das Sendeziel bleibt das gelatchte.
    ///
    /// # Fehler
    /// `SessionNichtGefunden`, `KeineAudioMedien`, `KeinPassenderCodec`
    pub fn session_neu_verhandeln(&self, call_id: &CallId, angebot: &SdpAngebot) -> Result<String> {
        let session = self
            .session(call_id)
            .ok_or_else(|| CallbridgeError::SessionNichtGefunden(call_id.to_string()))?;
        let codec = &session.config().codec;

        let remote = angebot.remote_endpunkt()?;
        if !angebot.enthaelt_codec(codec) {
            return Err(CallbridgeError::KeinPassenderCodec(codec.name().to_string()));
        }

        tracing::info!(
            call_id = %call_id,
            codec = %codec,
            angebot_remote = %remote,
            ziel = ?session.rtp_ziel(),
            "Re-INVITE beantwortet"
        );
        Ok(antwort_erstellen(
            self.inner.config.sdp_adresse(),
            session.lokaler_port(),
            codec,
            rand::random::<u32>().into(),
        ))
    }

    /// Neuer Empfaenger fuer Session-Ereignisse
    pub fn abonnieren(&self) -> broadcast::Receiver<SessionEreignis> {
        self.inner.ereignisse.subscribe()
    }

    /// Beendet alle Sessions (Shutdown)
    pub async fn alle_beenden(&self) {
        let ids: Vec<CallId> = self.inner.registry.lock().sessions.keys().cloned().collect();
        tracing::info!(anzahl = ids.len(), "Beende alle Sessions");
        for call_id in ids {
            self.session_beenden(&call_id).await;
        }
    }

    pub fn session(&self, call_id: &CallId) -> Option<Arc<RtpSession>> {
        self.inner.registry.lock().sessions.get(call_id).cloned()
    }

    /// Anzahl aktiver Sessions
    pub fn anzahl(&self) -> usize {
        self.inner.registry.lock().sessions.len()
    }

    /// Belegte Port-Paare (0 bei OS-gewaehlten Ports)
    pub fn belegte_ports(&self) -> usize {
        self.inner
            .registry
            .lock()
            .ports
            .as_ref()
            .map(PortAllocator::belegt)
            .unwrap_or(0)
    }

    pub fn config(&self) -> &MediaConfig {
        &self.inner.config
    }

    fn auflege_callback(&self) -> AuflegeCallback {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        Arc::new(move |call_id: &CallId, grund: &str| {
            let Some(inner) = weak.upgrade() else { return };
            let _ = inner.ereignisse.send(SessionEreignis::AuflegenAngefordert {
                call_id: call_id.clone(),
                grund: grund.to_string(),
            });

            // Aus einem Session-Task heraus: Abbau in eigenem Task
            let manager = RtpManager { inner };
            let call_id = call_id.clone();
            tokio::spawn(async move {
                manager.session_beenden(&call_id).await;
            });
        })
    }
}

/// Call-ID als Dateiname (nur `[A-Za-z0-9._-]`)
fn dateiname(call_id: &CallId) -> String {
    call_id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}
