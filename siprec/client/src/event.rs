use bytesstr::BytesStr;
use std::time::SystemTime;

/// Identity of the deployment element emitting log events, stamped onto
/// every event shipped through the [`EventLogClient`].
#[derive(Debug, Clone, Default)]
pub struct LogIdentity {
    pub element_id: String,
    pub agency_id: String,
    pub agent_id: String,
}

/// Call scoped fields carried by every log event of a recorded call.
#[derive(Debug, Clone)]
pub struct CallEventContext {
    pub identity: LogIdentity,

    /// NG9-1-1 emergency call identifier of the recorded call, if any.
    pub emergency_call_id: Option<BytesStr>,

    /// NG9-1-1 emergency incident identifier of the recorded call, if any.
    pub emergency_incident_id: Option<BytesStr>,

    /// SIP Call-ID shared by the original call and the recording dialog.
    pub sip_call_id: BytesStr,

    /// Endpoint of the SRS this event relates to.
    pub srs_endpoint: String,
}

/// Direction of a signalling message relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEventKind {
    /// The recording dialog for a call was established.
    RecCallStart,
    /// The recording of a call ended.
    RecCallEnd,
    /// First packet was forwarded on a media leg.
    RecMediaStart { media_label: u16 },
    /// A media leg was torn down.
    RecMediaEnd { media_label: u16 },
    /// A non-OPTIONS SIP message traversed this recorder.
    CallSignalingMessage {
        direction: SignalingDirection,
        summary: String,
    },
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: SystemTime,
    pub kind: LogEventKind,
    pub context: CallEventContext,
}

impl LogEvent {
    pub(crate) fn new(kind: LogEventKind, context: &CallEventContext) -> Self {
        LogEvent {
            timestamp: SystemTime::now(),
            kind,
            context: context.clone(),
        }
    }
}

/// Sink for the structured log events emitted by the recorders.
///
/// The shipping layer behind this is outside of this crate; events are
/// handed over synchronously and must not block.
pub trait EventLogClient: Send + Sync + 'static {
    fn log(&self, event: LogEvent);
}

/// Liveness of one SRS as observed by its recorder's OPTIONS probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrsStatus {
    /// Name of the recorder observing the SRS.
    pub name: String,

    pub responding: bool,

    /// Status code of the last OPTIONS response while responding.
    pub last_response: Option<u16>,
}
