//! callbridge-media – RTP-Media-Engine
//!
//! Besitzt den Audio-Transport eines Anrufs fuer dessen gesamte Dauer:
//!
//! - Sende-Taktung unter ungenauen Timern ([`scheduler`])
//! - Jitter-Ausgleich fuer eingehendes Audio ([`jitter_buffer`])
//! - Frame-Groessen-Erkennung fuer Opus ([`frame_groesse`])
//! - RTCP Sender Reports und symmetrisches Latching ([`rtcp`])
//! - Session-Zustandsmaschine mit ihren Varianten ([`session`])
//! - Port-Vergabe und Session-Registry ([`ports`], [`manager`])

pub mod config;
pub mod frame_groesse;
pub mod jitter_buffer;
pub mod manager;
pub mod ports;
pub mod rtcp;
pub mod scheduler;
pub mod session;
pub mod tempo_stufe;
pub mod udp;

pub use config::MediaConfig;
pub use frame_groesse::FrameSizeDetector;
pub use jitter_buffer::{JitterBuffer, JitterBufferStatistik};
pub use manager::{RtpManager, SessionAnfrage};
pub use ports::PortAllocator;
pub use rtcp::{RtcpHandler, SymmetricLatch};
pub use scheduler::{AdaptiveRtpScheduler, SchedulerConfig, SchedulerStatistik};
pub use session::{
    bridge_kanal, AuflegeHandle, BackendSeite, BridgeAnschluss, RtpSession, RtpSessionConfig,
    SessionVariante,
};
