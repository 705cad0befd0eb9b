//! Recording metadata for SIP recording sessions (RFC 7865).
//!
//! A [`RecordingMetadata`] document describes one recorded communication
//! session: the session itself, the two participants taken from the
//! original call's From/To URIs, and one metadata stream per media leg
//! mirrored towards the recording server. The document is created when the
//! recording dialog is established and only ever grows afterwards; media
//! added by a re-negotiation appends new streams without renumbering or
//! removing existing ones.

use bytesstr::BytesStr;
use sip_types::print::AppendCtx;
use sip_types::uri::{SipUri, SipUriUserPart};
use std::fmt;

mod xml;

pub use xml::XmlError;

/// `datamode` attribute carried by every serialised document.
pub const DATAMODE: &str = "complete";

/// Opaque identifier of an element inside a metadata document.
///
/// Unique within the document and stable for the document's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId(String);

impl EntityId {
    fn random() -> Self {
        EntityId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of the recorded call a participant entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    /// Taken from the original call's From URI.
    Caller,
    /// Taken from the original call's To URI.
    Callee,
}

/// One participant of the recorded session.
#[derive(Debug, Clone)]
pub struct Participant {
    id: EntityId,
    role: ParticipantRole,
    aor: String,
    name: String,

    /// Stream ids this participant contributes media to.
    send: Vec<EntityId>,
    /// Stream ids carrying media towards this participant.
    recv: Vec<EntityId>,
}

impl Participant {
    fn from_uri(role: ParticipantRole, uri: &SipUri) -> Self {
        Participant {
            id: EntityId::random(),
            role,
            aor: uri.default_print_ctx().to_string(),
            name: display_name(uri),
            send: Vec::new(),
            recv: Vec::new(),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self) -> &[EntityId] {
        &self.send
    }

    pub fn recv(&self) -> &[EntityId] {
        &self.recv
    }
}

/// One metadata stream, labelled like the matching SDP media description.
#[derive(Debug, Clone)]
pub struct Stream {
    id: EntityId,
    label: u16,
}

impl Stream {
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn label(&self) -> u16 {
        self.label
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssociationError {
    #[error("document has no {0:?} participant")]
    MissingParticipant(ParticipantRole),
    #[error("document already contains a stream with label {0}")]
    DuplicateLabel(u16),
}

/// The metadata document of one recorded call.
#[derive(Debug, Clone)]
pub struct RecordingMetadata {
    group_id: EntityId,
    session_id: EntityId,
    sip_session_id: BytesStr,
    participants: Vec<Participant>,
    streams: Vec<Stream>,
}

impl RecordingMetadata {
    /// Create the document for a recorded call.
    ///
    /// `sip_session_id` is the original call's Call-ID, `from`/`to` the
    /// original call's identities.
    pub fn new(sip_session_id: BytesStr, from: &SipUri, to: &SipUri) -> Self {
        RecordingMetadata {
            group_id: EntityId::random(),
            session_id: EntityId::random(),
            sip_session_id,
            participants: vec![
                Participant::from_uri(ParticipantRole::Caller, from),
                Participant::from_uri(ParticipantRole::Callee, to),
            ],
            streams: Vec::new(),
        }
    }

    /// Append the metadata streams of one (received, sent) media leg pair.
    ///
    /// The caller participant sends the media the recorder receives from
    /// the remote and vice versa, so the received (odd labelled) stream is
    /// listed under the caller's `send` and the callee's `recv`, the sent
    /// (even labelled) stream under the caller's `recv` and the callee's
    /// `send`.
    pub fn add_stream_pair(
        &mut self,
        received_label: u16,
        sent_label: u16,
    ) -> Result<(EntityId, EntityId), AssociationError> {
        for label in [received_label, sent_label] {
            if self.streams.iter().any(|stream| stream.label == label) {
                return Err(AssociationError::DuplicateLabel(label));
            }
        }

        // Look the participants up before mutating anything, so a
        // malformed document is left untouched.
        if !self.has_participant(ParticipantRole::Caller) {
            return Err(AssociationError::MissingParticipant(
                ParticipantRole::Caller,
            ));
        }

        if !self.has_participant(ParticipantRole::Callee) {
            return Err(AssociationError::MissingParticipant(
                ParticipantRole::Callee,
            ));
        }

        let received = Stream {
            id: EntityId::random(),
            label: received_label,
        };
        let sent = Stream {
            id: EntityId::random(),
            label: sent_label,
        };

        let ids = (received.id.clone(), sent.id.clone());

        for participant in &mut self.participants {
            match participant.role {
                ParticipantRole::Caller => {
                    participant.send.push(received.id.clone());
                    participant.recv.push(sent.id.clone());
                }
                ParticipantRole::Callee => {
                    participant.send.push(sent.id.clone());
                    participant.recv.push(received.id.clone());
                }
            }
        }

        self.streams.push(received);
        self.streams.push(sent);

        Ok(ids)
    }

    fn has_participant(&self, role: ParticipantRole) -> bool {
        self.participants.iter().any(|p| p.role == role)
    }

    pub fn group_id(&self) -> &EntityId {
        &self.group_id
    }

    pub fn session_id(&self) -> &EntityId {
        &self.session_id
    }

    pub fn sip_session_id(&self) -> &BytesStr {
        &self.sip_session_id
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }
}

/// Participant display name: the URI's user part when non-empty, the host
/// part otherwise.
fn display_name(uri: &SipUri) -> String {
    match &uri.user_part {
        SipUriUserPart::User(user) => user.to_string(),
        SipUriUserPart::UserPw(user_pw) => user_pw.user.to_string(),
        SipUriUserPart::Empty => uri.host_port.host.to_string(),
    }
}
