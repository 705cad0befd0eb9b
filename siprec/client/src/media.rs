//! Interfaces towards the media plane.
//!
//! The original call's RTP channels and MSRP connection, the outbound legs
//! towards the SRS, port allocation and certificate material are all owned
//! by the surrounding application. The recorder only subscribes to packet
//! events and enqueues copies onto the legs it is handed, so everything
//! here is a trait implemented outside of this crate (and by fakes in
//! tests).

use crate::label::MediaKind;
use bytes::Bytes;
use sdp_types::{Fingerprint, MediaDescription};
use tokio::sync::broadcast;

use crate::sdp::MsrpDescription;

/// A copy of one media packet of the recorded call. Opaque to the
/// recorder; it is forwarded as-is.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub payload: Bytes,
}

/// Handle to one RTP stream of the original call.
///
/// The channel stays owned by the original call's media engine; the
/// recorder only subscribes to the packet events. Handles are compared by
/// identity (`Arc::ptr_eq`) to detect channel replacement during
/// re-negotiation of the original call.
pub trait RtpChannel: Send + Sync + 'static {
    /// Packets received from the remote party.
    fn received_packets(&self) -> broadcast::Receiver<MediaPacket>;

    /// Packets sent to the remote party.
    fn sent_packets(&self) -> broadcast::Receiver<MediaPacket>;
}

/// Handle to the original call's MSRP connection.
pub trait MsrpConnection: Send + Sync + 'static {
    /// Messages received from the remote party.
    fn received_messages(&self) -> broadcast::Receiver<MediaPacket>;

    /// Messages sent to the remote party.
    fn sent_messages(&self) -> broadcast::Receiver<MediaPacket>;
}

/// One send-only media leg towards the SRS.
///
/// `send` enqueues a packet copy and must not block; the transport behind
/// it runs on its own tasks.
pub trait RecordingSink: Send + Sync + 'static {
    fn send(&self, packet: MediaPacket);

    /// Tear the leg down. Must be idempotent.
    fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
#[error("failed to create media leg: {reason}")]
pub struct SinkError {
    pub reason: String,
}

impl SinkError {
    pub fn new(reason: impl Into<String>) -> Self {
        SinkError {
            reason: reason.into(),
        }
    }
}

/// Creates the outbound media legs from the SRS's answered media
/// descriptions. Backed by the application's RTP/MSRP stacks.
pub trait MediaSessionFactory: Send + Sync + 'static {
    /// Create an RTP leg bound to `local_port`, sending towards the
    /// endpoint described by the SRS's answer.
    fn create_rtp_sink(
        &self,
        local_port: u16,
        answer: &MediaDescription,
    ) -> Result<std::sync::Arc<dyn RecordingSink>, SinkError>;

    /// Create an MSRP leg bound to `local_port`.
    fn create_msrp_sink(
        &self,
        local_port: u16,
        answer: &MsrpDescription,
    ) -> Result<std::sync::Arc<dyn RecordingSink>, SinkError>;
}

/// Allocator for the local media ports placed into offers.
pub trait MediaPortManager: Send + Sync + 'static {
    fn allocate(&self, kind: MediaKind) -> u16;

    fn release(&self, port: u16);
}

/// Source of the local certificate material referenced by DTLS-SRTP
/// offers. X.509 provisioning happens outside of this crate.
pub trait CertificateStore: Send + Sync + 'static {
    /// Fingerprint of the local certificate, emitted as the SDP
    /// `a=fingerprint` attribute.
    fn fingerprint(&self) -> Fingerprint;
}
