//! callbridge-protocol – Netzwerkprotokoll-Definitionen
//!
//! Dieses Crate definiert die Wire-Formate der Media-Engine (RTP, RTCP),
//! die statische Codec-Tabelle und die minimale SDP-Verarbeitung fuer die
//! Codec-Auswahl.

pub mod codec;
pub mod rtcp;
pub mod rtp;
pub mod sdp;

pub use codec::{Codec, CodecHandler, CodecInfo, FrameFamilie};
pub use rtcp::SenderReport;
pub use rtp::RtpPacket;
pub use sdp::SdpAngebot;
