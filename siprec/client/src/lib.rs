//! # SIP recording client
//!
//! Mirrors the media of live calls to SIP recording servers (SRS) using
//! the SIPREC profile (RFC 7866): one long lived [`RecorderAgent`] per
//! SRS opens a recording dialog per call, offers every original media
//! stream as a labelled pair of send-only legs, ships the RFC 7865
//! metadata document alongside the SDP, and forwards packet copies of the
//! original call's media onto the matching legs.
//!
//! The [`Manager`] fans call events out to every enabled recorder. The
//! original call's signalling and media engine stay outside of this
//! crate: media is consumed through the [`RtpChannel`] /
//! [`MsrpConnection`] / [`MediaSessionFactory`] traits, and lifecycle
//! events are shipped through the [`EventLogClient`].

#![warn(unreachable_pub)]

mod agent;
mod bridge;
mod config;
mod event;
mod label;
mod manager;
mod media;
pub mod sdp;

#[cfg(feature = "tls-native-tls")]
pub use agent::NativeTlsContext;
#[cfg(feature = "tls-rustls")]
pub use agent::RustlsContext;
pub use agent::{CallParameters, RecorderAgent, RecorderServices, StartError};
pub use bridge::MediaBridge;
pub use config::{
    ConfigError, MsrpEncryption, RecorderConfig, RtpEncryption, SipTransport, SrcSettings,
};
pub use event::{
    CallEventContext, EventLogClient, LogEvent, LogEventKind, LogIdentity, SignalingDirection,
    SrsStatus,
};
pub use label::{MediaKind, MediaLabel};
pub use manager::Manager;
pub use media::{
    CertificateStore, MediaPacket, MediaPortManager, MediaSessionFactory, MsrpConnection,
    RecordingSink, RtpChannel, SinkError,
};
