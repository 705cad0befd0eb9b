use std::fmt;

/// Label of one media leg towards the recording server.
///
/// The numbering is fixed: odd labels carry media received from the remote
/// party of the recorded call, even labels media sent to it. The numeric
/// value appears verbatim as the SDP `a=label` attribute and as the stream
/// label inside the recording metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaLabel {
    ReceivedAudio = 1,
    SentAudio = 2,
    ReceivedVideo = 3,
    SentVideo = 4,
    ReceivedText = 5,
    SentText = 6,
    ReceivedMsrp = 7,
    SentMsrp = 8,
}

impl MediaLabel {
    pub fn value(self) -> u16 {
        self as u16
    }

    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            1 => Some(MediaLabel::ReceivedAudio),
            2 => Some(MediaLabel::SentAudio),
            3 => Some(MediaLabel::ReceivedVideo),
            4 => Some(MediaLabel::SentVideo),
            5 => Some(MediaLabel::ReceivedText),
            6 => Some(MediaLabel::SentText),
            7 => Some(MediaLabel::ReceivedMsrp),
            8 => Some(MediaLabel::SentMsrp),
            _ => None,
        }
    }

    /// Does this leg carry media received from the remote party?
    pub fn is_received(self) -> bool {
        self.value() % 2 == 1
    }

    pub fn kind(self) -> MediaKind {
        match self {
            MediaLabel::ReceivedAudio | MediaLabel::SentAudio => MediaKind::Audio,
            MediaLabel::ReceivedVideo | MediaLabel::SentVideo => MediaKind::Video,
            MediaLabel::ReceivedText | MediaLabel::SentText => MediaKind::Text,
            MediaLabel::ReceivedMsrp | MediaLabel::SentMsrp => MediaKind::Msrp,
        }
    }
}

impl fmt::Display for MediaLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// The kind of media a recorded stream carries.
///
/// Text is real-time text (RFC 4103) transported over RTP; MSRP sessions
/// are message streams with their own transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Text,
    Msrp,
}

impl MediaKind {
    /// Label pair of this kind, `(received, sent)`.
    pub fn labels(self) -> (MediaLabel, MediaLabel) {
        match self {
            MediaKind::Audio => (MediaLabel::ReceivedAudio, MediaLabel::SentAudio),
            MediaKind::Video => (MediaLabel::ReceivedVideo, MediaLabel::SentVideo),
            MediaKind::Text => (MediaLabel::ReceivedText, MediaLabel::SentText),
            MediaKind::Msrp => (MediaLabel::ReceivedMsrp, MediaLabel::SentMsrp),
        }
    }

    pub fn received_label(self) -> MediaLabel {
        self.labels().0
    }

    pub fn sent_label(self) -> MediaLabel {
        self.labels().1
    }
}
