//! SDP handling for recording sessions.
//!
//! RTP based media (audio, video, real-time text) is parsed and printed
//! with `sdp-types`. MSRP media cannot be expressed by its types (`m=message`
//! with a non-numeric format list), so [`RecordingSdp`] wraps a session
//! description and carries MSRP sections as [`MsrpDescription`], printed in
//! the same textual conventions.

use crate::label::{MediaKind, MediaLabel};
use bytes::Bytes;
use bytesstr::BytesStr;
use sdp_types::{
    Connection, Direction, MediaDescription, MediaType, Origin, ParseSessionDescriptionError,
    SessionDescription, Setup, TaggedAddress, Time, UnknownAttribute,
};
use std::fmt;

mod offer;

pub use offer::OfferBuilder;

/// A session description of either side of a recording dialog: the
/// original call's answered SDP, the offer generated towards the SRS or
/// the SRS's answer.
#[derive(Debug, Clone)]
pub struct RecordingSdp {
    pub origin: Origin,
    pub name: BytesStr,
    pub connection: Option<Connection>,
    pub time: Time,
    pub media: Vec<RecordedMedia>,
}

/// One media section of a [`RecordingSdp`].
#[derive(Debug, Clone)]
pub enum RecordedMedia {
    Rtp(MediaDescription),
    Msrp(MsrpDescription),
}

/// An MSRP media section (`m=message`, RFC 4975).
#[derive(Debug, Clone)]
pub struct MsrpDescription {
    pub port: u16,

    /// `TCP/TLS/MSRP` instead of `TCP/MSRP`.
    pub secure: bool,

    pub connection: Option<Connection>,

    pub direction: Direction,

    pub setup: Option<Setup>,

    /// Value of the `a=path` attribute.
    pub path: BytesStr,

    /// Value of the `a=accept-types` attribute.
    pub accept_types: Option<BytesStr>,

    /// Remaining attributes, including the `a=label`.
    pub attributes: Vec<UnknownAttribute>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseRecordingSdpError {
    #[error(transparent)]
    Sdp(#[from] ParseSessionDescriptionError),
    #[error("invalid MSRP media section, {0}")]
    InvalidMsrp(&'static str),
    #[error("media sections changed during parsing")]
    SectionMismatch,
}

impl RecordingSdp {
    pub fn parse(src: &BytesStr) -> Result<Self, ParseRecordingSdpError> {
        let mut session_lines: Vec<&str> = Vec::new();
        let mut sections: Vec<(bool, Vec<&str>)> = Vec::new();

        for line in src.split(['\r', '\n']).filter(|line| !line.is_empty()) {
            if line.starts_with("m=") {
                sections.push((line.starts_with("m=message"), vec![line]));
            } else if let Some((_, section)) = sections.last_mut() {
                section.push(line);
            } else {
                session_lines.push(line);
            }
        }

        // Everything sdp-types can represent is routed through its parser
        // in one piece, MSRP sections are parsed separately and merged
        // back in their original positions.
        let mut text = String::new();

        for line in &session_lines {
            text.push_str(line);
            text.push_str("\r\n");
        }

        for (is_msrp, lines) in &sections {
            if !*is_msrp {
                for line in lines {
                    text.push_str(line);
                    text.push_str("\r\n");
                }
            }
        }

        let parsed = SessionDescription::parse(&BytesStr::from(text))?;
        let mut rtp_media = parsed.media_descriptions.into_iter();

        let mut media = Vec::with_capacity(sections.len());

        for (is_msrp, lines) in &sections {
            if *is_msrp {
                media.push(RecordedMedia::Msrp(MsrpDescription::parse_section(lines)?));
            } else {
                let desc = rtp_media
                    .next()
                    .ok_or(ParseRecordingSdpError::SectionMismatch)?;
                media.push(RecordedMedia::Rtp(desc));
            }
        }

        Ok(RecordingSdp {
            origin: parsed.origin,
            name: parsed.name,
            connection: parsed.connection,
            time: parsed.time,
            media,
        })
    }

    /// Media sections that are recordable: not rejected (port 0) and of a
    /// kind this client knows how to mirror.
    pub fn recordable_media(&self) -> impl Iterator<Item = &RecordedMedia> + '_ {
        self.media
            .iter()
            .filter(|media| media.port() != 0 && media.kind().is_some())
    }

    /// Find a media section by its media kind and label.
    pub fn find_by_label(&self, kind: MediaKind, label: MediaLabel) -> Option<&RecordedMedia> {
        self.media
            .iter()
            .find(|media| media.kind() == Some(kind) && media.label() == Some(label))
    }
}

impl fmt::Display for RecordingSdp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.name)?;

        if let Some(conn) = &self.connection {
            write!(f, "c={}\r\n", conn.address)?;
        }

        write!(f, "t={} {}\r\n", self.time.start, self.time.stop)?;

        for media in &self.media {
            match media {
                RecordedMedia::Rtp(desc) => write!(f, "{desc}")?,
                RecordedMedia::Msrp(desc) => write!(f, "{desc}")?,
            }
        }

        Ok(())
    }
}

impl RecordedMedia {
    pub fn port(&self) -> u16 {
        match self {
            RecordedMedia::Rtp(desc) => desc.media.port,
            RecordedMedia::Msrp(desc) => desc.port,
        }
    }

    /// The kind of media this section describes, `None` for media this
    /// client does not mirror (e.g. unknown application media).
    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            RecordedMedia::Rtp(desc) => match desc.media.media_type {
                MediaType::Audio => Some(MediaKind::Audio),
                MediaType::Video => Some(MediaKind::Video),
                MediaType::Text => Some(MediaKind::Text),
                _ => None,
            },
            RecordedMedia::Msrp(_) => Some(MediaKind::Msrp),
        }
    }

    /// The `a=label` attribute value, if present and within the known
    /// label range.
    pub fn label(&self) -> Option<MediaLabel> {
        let attributes = match self {
            RecordedMedia::Rtp(desc) => &desc.attributes,
            RecordedMedia::Msrp(desc) => &desc.attributes,
        };

        attributes
            .iter()
            .find(|attr| attr.name == "label")
            .and_then(|attr| attr.value.as_ref())
            .and_then(|value| value.parse().ok())
            .and_then(MediaLabel::from_value)
    }

    pub fn direction(&self) -> Direction {
        match self {
            RecordedMedia::Rtp(desc) => desc.direction,
            RecordedMedia::Msrp(desc) => desc.direction,
        }
    }
}

/// The `a=label` attribute for a media description.
pub(crate) fn label_attribute(label: MediaLabel) -> UnknownAttribute {
    UnknownAttribute {
        name: BytesStr::from_static("label"),
        value: Some(label.to_string().into()),
    }
}

impl MsrpDescription {
    fn parse_section(lines: &[&str]) -> Result<Self, ParseRecordingSdpError> {
        use ParseRecordingSdpError::InvalidMsrp;

        let src = Bytes::from(lines.join("\r\n"));
        let text = std::str::from_utf8(&src).expect("joined from str input");

        let mut port = None;
        let mut secure = false;
        let mut connection = None;
        let mut direction = Direction::SendRecv;
        let mut setup = None;
        let mut path = None;
        let mut accept_types = None;
        let mut attributes = Vec::new();

        for line in text.split("\r\n") {
            if let Some(media) = line.strip_prefix("m=") {
                let mut fields = media.split_ascii_whitespace();

                if fields.next() != Some("message") {
                    return Err(InvalidMsrp("media type is not message"));
                }

                port = Some(
                    fields
                        .next()
                        .and_then(|port| port.parse().ok())
                        .ok_or(InvalidMsrp("invalid port"))?,
                );

                secure = match fields.next() {
                    Some("TCP/MSRP") => false,
                    Some("TCP/TLS/MSRP") => true,
                    _ => return Err(InvalidMsrp("unknown transport protocol")),
                };
            } else if let Some(value) = line.strip_prefix("c=") {
                let (_, address) = TaggedAddress::parse(&src)(value)
                    .map_err(|_| InvalidMsrp("invalid connection line"))?;

                connection = Some(Connection {
                    address,
                    ttl: None,
                    num: None,
                });
            } else if let Some(value) = line.strip_prefix("a=") {
                let attr = UnknownAttribute::parse(&src, value);

                match attr.name.as_str() {
                    "sendrecv" => direction = Direction::SendRecv,
                    "sendonly" => direction = Direction::SendOnly,
                    "recvonly" => direction = Direction::RecvOnly,
                    "inactive" => direction = Direction::Inactive,
                    "setup" => {
                        setup = match attr.value.as_deref() {
                            Some("active") => Some(Setup::Active),
                            Some("passive") => Some(Setup::Passive),
                            Some("actpass") => Some(Setup::ActPass),
                            Some("holdconn") => Some(Setup::HoldConn),
                            _ => return Err(InvalidMsrp("invalid setup attribute")),
                        }
                    }
                    "path" => path = attr.value,
                    "accept-types" => accept_types = attr.value,
                    _ => attributes.push(attr),
                }
            }
        }

        Ok(MsrpDescription {
            port: port.ok_or(InvalidMsrp("missing media line"))?,
            secure,
            connection,
            direction,
            setup,
            path: path.ok_or(InvalidMsrp("missing path attribute"))?,
            accept_types,
            attributes,
        })
    }

    /// The MSRP URI scheme matching the transport.
    pub fn scheme(&self) -> &'static str {
        if self.secure { "msrps" } else { "msrp" }
    }
}

impl fmt::Display for MsrpDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = if self.secure { "TCP/TLS/MSRP" } else { "TCP/MSRP" };

        write!(f, "m=message {} {} *\r\n", self.port, proto)?;

        if let Some(conn) = &self.connection {
            write!(f, "c={}\r\n", conn.address)?;
        }

        write!(f, "a={}\r\n", self.direction)?;

        if let Some(setup) = self.setup {
            write!(f, "a=setup:{setup}\r\n")?;
        }

        if let Some(accept_types) = &self.accept_types {
            write!(f, "a=accept-types:{accept_types}\r\n")?;
        }

        write!(f, "a=path:{}\r\n", self.path)?;

        for attr in &self.attributes {
            write!(f, "{attr}\r\n")?;
        }

        Ok(())
    }
}
