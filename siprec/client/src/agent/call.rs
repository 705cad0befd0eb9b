//! Per-call dialog state towards one SRS.

use crate::bridge::MediaBridge;
use crate::event::CallEventContext;
use crate::label::MediaKind;
use crate::media::{MsrpConnection, RtpChannel};
use crate::sdp::{RecordedMedia, RecordingSdp};
use bytes::Bytes;
use bytesstr::BytesStr;
use rand::{Rng, distr::Alphanumeric, rng};
use sip_core::transaction::TsxResponse;
use sip_core::transport::{OutgoingParts, OutgoingRequest, TargetTransportInfo};
use sip_core::Request;
use sip_types::header::HeaderError;
use sip_types::header::typed::{CSeq, CallID, Contact, ContentType, FromTo, MaxForwards};
use sip_types::msg::RequestLine;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::uri::params::Param;
use sip_types::{Headers, Method, Name};
use siprec_metadata::RecordingMetadata;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Everything the recorder needs to know about one original call.
#[derive(Clone)]
pub struct CallParameters {
    /// Call-ID of the original call, reused towards the SRS.
    pub call_id: BytesStr,

    pub from: SipUri,
    pub to: SipUri,

    /// NG9-1-1 emergency identifiers, propagated as Call-Info headers.
    pub emergency_call_id: Option<BytesStr>,
    pub emergency_incident_id: Option<BytesStr>,

    /// The answered SDP of the original call.
    pub answered_sdp: RecordingSdp,

    /// One handle per RTP media section of the answered SDP whose port is
    /// non-zero, in SDP order.
    pub rtp_channels: Vec<Arc<dyn RtpChannel>>,

    pub msrp_connection: Option<Arc<dyn MsrpConnection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    /// INVITE sent, awaiting the final response.
    Offering,
    /// 200 received, media attached.
    Established,
    /// Re-INVITE sent.
    ReOffering,
}

pub(crate) struct Call {
    pub params: CallParameters,
    pub state: CallState,

    /// CSeq of the last request constructed for this dialog.
    pub last_cseq: u32,

    pub from: FromTo,

    /// To header towards the SRS; carries the peer tag once the 200 to the
    /// initial INVITE was stored.
    pub to: FromTo,

    pub contact: Contact,
    pub request_uri: SipUri,

    /// The SDP last offered to the SRS.
    pub offered: RecordingSdp,

    /// The SRS's answer, once received.
    pub answered: Option<RecordingSdp>,

    pub metadata: RecordingMetadata,
    pub bridge: MediaBridge,

    pub target: TargetTransportInfo,

    /// Every media port drawn for this call, released on removal.
    pub allocated_ports: Vec<u16>,

    /// Media kinds being added by the in-flight re-INVITE.
    pub pending_media: Vec<MediaKind>,

    /// Cancellation handle of the outstanding INVITE transaction; `Some`
    /// iff an INVITE or re-INVITE is in flight.
    pub invite_cancel: Option<oneshot::Sender<()>>,

    pub context: CallEventContext,
}

impl Call {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        params: CallParameters,
        request_uri: SipUri,
        local_uri: SipUri,
        offered: RecordingSdp,
        allocated_ports: Vec<u16>,
        metadata: RecordingMetadata,
        bridge: MediaBridge,
        target: TargetTransportInfo,
        context: CallEventContext,
    ) -> Self {
        let mut contact = Contact::new(NameAddr::uri(local_uri.clone()));
        contact.params.push(Param::name("+sip.src"));

        Call {
            from: FromTo::new(NameAddr::uri(local_uri), Some(random_tag())),
            to: FromTo::new(NameAddr::uri(request_uri.clone()), None),
            contact,
            request_uri,
            state: CallState::Offering,
            last_cseq: 1,
            offered,
            answered: None,
            metadata,
            bridge,
            target,
            allocated_ports,
            pending_media: Vec::new(),
            invite_cancel: None,
            context,
            params,
        }
    }

    /// The INVITE (or re-INVITE) request carrying `body` with the current
    /// CSeq and dialog identifiers.
    pub(crate) fn create_invite(&self, body: Bytes) -> Request {
        let mut headers = Headers::new();

        headers.insert_named(&MaxForwards(70));
        headers.insert_type(Name::FROM, &self.from);
        headers.insert_type(Name::TO, &self.to);
        headers.insert_named(&CallID::new(self.params.call_id.clone()));
        headers.insert_named(&CSeq::new(self.last_cseq, Method::INVITE));
        headers.insert_named(&self.contact);
        headers.insert(Name::REQUIRE, "siprec");
        headers.insert(
            Name::ACCEPT,
            "application/sdp, application/rs-metadata, application/rs-metadata-request",
        );

        if let Some(id) = &self.params.emergency_call_id {
            headers.insert(
                Name::CALL_INFO,
                format!("<urn:emergency:uid:callid:{id}>;purpose=emergency-CallId"),
            );
        }

        if let Some(id) = &self.params.emergency_incident_id {
            headers.insert(
                Name::CALL_INFO,
                format!("<urn:emergency:uid:incidentid:{id}>;purpose=emergency-IncidentId"),
            );
        }

        headers.insert(
            Name::CONTENT_TYPE,
            format!("multipart/mixed;boundary={MULTIPART_BOUNDARY}"),
        );

        Request {
            line: RequestLine {
                method: Method::INVITE,
                uri: self.request_uri.clone(),
            },
            headers,
            body,
        }
    }

    /// The multipart INVITE body built from the current offer and metadata
    /// document.
    pub(crate) fn invite_body(&self) -> Result<Bytes, siprec_metadata::XmlError> {
        let metadata = self.metadata.to_xml()?;

        Ok(multipart_body(&self.offered.to_string(), &metadata))
    }

    /// The BYE terminating the recording dialog. Requires the stored 200's
    /// To tag; bumps the dialog CSeq.
    pub(crate) fn create_bye(&mut self) -> Request {
        self.last_cseq += 1;

        let mut headers = Headers::new();

        headers.insert_named(&MaxForwards(70));
        headers.insert_type(Name::FROM, &self.from);
        headers.insert_type(Name::TO, &self.to);
        headers.insert_named(&CallID::new(self.params.call_id.clone()));
        headers.insert_named(&CSeq::new(self.last_cseq, Method::BYE));

        Request {
            line: RequestLine {
                method: Method::BYE,
                uri: self.request_uri.clone(),
            },
            headers,
            body: Bytes::new(),
        }
    }

    /// Store the peer identity of the established dialog from the 200
    /// response.
    pub(crate) fn store_ok(&mut self, response: &TsxResponse) {
        self.to = response.base_headers.to.clone();
    }
}

fn random_tag() -> BytesStr {
    rng()
        .sample_iter(Alphanumeric)
        .take(16)
        .map(char::from)
        .collect::<String>()
        .into()
}

pub(crate) const MULTIPART_BOUNDARY: &str = "siprec-content-boundary";

/// `multipart/mixed` body with the SDP and recording metadata parts.
pub(crate) fn multipart_body(sdp: &str, metadata: &str) -> Bytes {
    let mut body = String::new();

    body.push_str(&format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Type: application/sdp\r\n\r\n{sdp}\r\n"
    ));
    body.push_str(&format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Type: application/rs-metadata+xml\r\n\
         Content-Disposition: recording-session\r\n\r\n{metadata}\r\n"
    ));
    body.push_str(&format!("--{MULTIPART_BOUNDARY}--\r\n"));

    Bytes::from(body)
}

/// Extract the SDP of a response body, which may be plain `application/sdp`
/// or a multipart body containing an SDP part.
pub(crate) fn extract_answer_sdp(response: &TsxResponse) -> Option<BytesStr> {
    let content_type = response.headers.get_named::<ContentType>().ok()?;
    let body = BytesStr::from_utf8_bytes(response.body.clone()).ok()?;

    extract_sdp_text(content_type.0.as_str(), body.as_str()).map(BytesStr::from)
}

fn extract_sdp_text(content_type: &str, body: &str) -> Option<String> {
    if content_type.starts_with("application/sdp") {
        return Some(body.to_string());
    }

    if content_type.starts_with("multipart/") {
        let boundary = content_type
            .split("boundary=")
            .nth(1)?
            .split(';')
            .next()?
            .trim()
            .trim_matches('"');

        let delimiter = format!("--{boundary}");

        for part in body.split(delimiter.as_str()) {
            let Some((head, content)) = part.split_once("\r\n\r\n") else {
                continue;
            };

            if head.to_ascii_lowercase().contains("application/sdp") {
                return Some(content.trim_end_matches(['\r', '\n']).to_string());
            }
        }
    }

    None
}

/// The ACK acknowledging a 2xx response, sent over the INVITE's transport.
pub(crate) fn create_ack(
    invite: &OutgoingRequest,
    response: &TsxResponse,
) -> Result<OutgoingRequest, HeaderError> {
    let mut headers = Headers::with_capacity(5);

    invite.msg.headers.clone_into(&mut headers, Name::VIA)?;
    invite.msg.headers.clone_into(&mut headers, Name::FROM)?;
    response.headers.clone_into(&mut headers, Name::TO)?;
    invite.msg.headers.clone_into(&mut headers, Name::CALL_ID)?;

    let cseq = invite.msg.headers.get_named::<CSeq>()?;
    headers.insert_named(&CSeq::new(cseq.cseq, Method::ACK));

    Ok(OutgoingRequest {
        msg: Request {
            line: RequestLine {
                method: Method::ACK,
                uri: invite.msg.line.uri.clone(),
            },
            headers,
            body: Bytes::new(),
        },
        parts: OutgoingParts {
            transport: invite.parts.transport.clone(),
            destination: invite.parts.destination,
            buffer: Default::default(),
        },
    })
}

/// The CANCEL matching an in-flight INVITE, sharing its top Via branch and
/// transport so the SRS can associate it with the INVITE transaction.
pub(crate) fn create_cancel(invite: &OutgoingRequest) -> Result<OutgoingRequest, HeaderError> {
    let mut headers = Headers::with_capacity(6);

    invite.msg.headers.clone_into(&mut headers, Name::VIA)?;
    headers.insert_named(&MaxForwards(70));
    invite.msg.headers.clone_into(&mut headers, Name::FROM)?;
    invite.msg.headers.clone_into(&mut headers, Name::TO)?;
    invite.msg.headers.clone_into(&mut headers, Name::CALL_ID)?;

    let cseq = invite.msg.headers.get_named::<CSeq>()?;
    headers.insert_named(&CSeq::new(cseq.cseq, Method::CANCEL));

    Ok(OutgoingRequest {
        msg: Request {
            line: RequestLine {
                method: Method::CANCEL,
                uri: invite.msg.line.uri.clone(),
            },
            headers,
            body: Bytes::new(),
        },
        parts: OutgoingParts {
            transport: invite.parts.transport.clone(),
            destination: invite.parts.destination,
            buffer: Default::default(),
        },
    })
}

/// Kind of the RTP media section backing channel index `rtp_index`.
///
/// Inverse of [`rtp_channel_index`]: counts the non-rejected RTP media
/// sections of the answered SDP in order.
pub(crate) fn rtp_kind_at(answered: &RecordingSdp, rtp_index: usize) -> Option<MediaKind> {
    let mut index = 0;

    for media in &answered.media {
        if media.port() == 0 {
            continue;
        }

        if let RecordedMedia::Rtp(_) = media {
            if index == rtp_index {
                return media.kind();
            }

            index += 1;
        }
    }

    None
}

/// Index into [`CallParameters::rtp_channels`] of the first non-rejected
/// RTP media section of `kind`.
pub(crate) fn rtp_channel_index(answered: &RecordingSdp, kind: MediaKind) -> Option<usize> {
    let mut rtp_index = 0;

    for media in &answered.media {
        if media.port() == 0 {
            continue;
        }

        if let RecordedMedia::Rtp(_) = media {
            if media.kind() == Some(kind) {
                return Some(rtp_index);
            }

            rtp_index += 1;
        }
    }

    None
}
