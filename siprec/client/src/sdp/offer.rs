//! Derives the SDP offered to an SRS from the original call's answered SDP.

use crate::config::{MsrpEncryption, RecorderConfig, RtpEncryption};
use crate::label::{MediaKind, MediaLabel};
use crate::media::{CertificateStore, MediaPortManager};
use crate::sdp::{MsrpDescription, RecordedMedia, RecordingSdp, label_attribute};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use rand::{Rng, RngCore, distr::Alphanumeric, rng};
use sdp_types::{
    Connection, Direction, Media, MediaDescription, Origin, Setup, SrtpCrypto, SrtpKeyingMaterial,
    SrtpSuite, Time, TransportProtocol,
};
use std::net::IpAddr;

const SDES_SUITES: [SrtpSuite; 4] = [
    SrtpSuite::AES_256_CM_HMAC_SHA1_80,
    SrtpSuite::AES_256_CM_HMAC_SHA1_32,
    SrtpSuite::AES_CM_128_HMAC_SHA1_80,
    SrtpSuite::AES_CM_128_HMAC_SHA1_32,
];

/// Builds the send-only offers of one recorder.
///
/// Every recordable media section of the original call is doubled into a
/// (received, sent) pair whose `a=label` values identify the legs towards
/// the SRS, with encryption attributes matching the recorder's policies.
pub struct OfferBuilder<'a> {
    config: &'a RecorderConfig,
    ports: &'a dyn MediaPortManager,
    certificates: &'a dyn CertificateStore,
}

impl<'a> OfferBuilder<'a> {
    pub fn new(
        config: &'a RecorderConfig,
        ports: &'a dyn MediaPortManager,
        certificates: &'a dyn CertificateStore,
    ) -> Self {
        Self {
            config,
            ports,
            certificates,
        }
    }

    /// Build the initial offer. Ports drawn from the port manager are
    /// recorded in `allocated` so the call can release them on teardown.
    pub fn build(&self, answered: &RecordingSdp, allocated: &mut Vec<u16>) -> RecordingSdp {
        let local_ip = self.config.local_addr.ip();

        let mut offer = RecordingSdp {
            origin: Origin {
                username: "-".into(),
                session_id: rng().random_range(0..u32::MAX >> 1).to_string().into(),
                session_version: "1".into(),
                address: local_ip.into(),
            },
            name: "-".into(),
            connection: Some(Connection {
                address: local_ip.into(),
                ttl: None,
                num: None,
            }),
            time: Time { start: 0, stop: 0 },
            media: Vec::new(),
        };

        let mut offered_kinds: Vec<MediaKind> = Vec::new();

        for media in &answered.media {
            if media.port() == 0 {
                continue;
            }

            // one leg pair per media kind, the labels leave no room for more
            if let Some(kind) = media.kind() {
                if offered_kinds.contains(&kind) {
                    log::warn!("original call has more than one {kind:?} stream, not mirrored");
                    continue;
                }
            }

            if let Some(kind) = self.append_pair(&mut offer, media, allocated) {
                offered_kinds.push(kind);
            }
        }

        offer
    }

    /// Append the (received, sent) description pair mirroring one original
    /// media section. Returns the media kind, or `None` if the section is
    /// of a kind this client does not mirror.
    pub fn append_pair(
        &self,
        offer: &mut RecordingSdp,
        original: &RecordedMedia,
        allocated: &mut Vec<u16>,
    ) -> Option<MediaKind> {
        let kind = original.kind()?;
        let (received, sent) = kind.labels();

        match original {
            RecordedMedia::Rtp(desc) => {
                for label in [received, sent] {
                    offer
                        .media
                        .push(RecordedMedia::Rtp(self.rtp_media(desc, kind, label, allocated)));
                }
            }
            RecordedMedia::Msrp(desc) => {
                for label in [received, sent] {
                    offer
                        .media
                        .push(RecordedMedia::Msrp(self.msrp_media(desc, label, allocated)));
                }
            }
        }

        Some(kind)
    }

    fn rtp_media(
        &self,
        original: &MediaDescription,
        kind: MediaKind,
        label: MediaLabel,
        allocated: &mut Vec<u16>,
    ) -> MediaDescription {
        let port = self.ports.allocate(kind);
        allocated.push(port);

        let (proto, crypto, setup, fingerprint) = match self.config.rtp_encryption {
            RtpEncryption::None => (TransportProtocol::RtpAvp, vec![], None, vec![]),
            RtpEncryption::SdesSrtp => (TransportProtocol::RtpSavp, sdes_crypto(), None, vec![]),
            RtpEncryption::DtlsSrtp => (
                TransportProtocol::UdpTlsRtpSavp,
                vec![],
                Some(Setup::ActPass),
                vec![self.certificates.fingerprint()],
            ),
        };

        MediaDescription {
            media: Media {
                media_type: original.media.media_type,
                port,
                ports_num: None,
                proto,
                fmts: original.media.fmts.clone(),
            },
            connection: None,
            bandwidth: vec![],
            direction: Direction::SendOnly,
            rtcp: None,
            rtcp_mux: false,
            mid: None,
            rtpmap: original.rtpmap.clone(),
            fmtp: original.fmtp.clone(),
            ice_ufrag: None,
            ice_pwd: None,
            ice_candidates: vec![],
            ice_end_of_candidates: false,
            crypto,
            extmap: vec![],
            extmap_allow_mixed: false,
            ssrc: vec![],
            setup,
            fingerprint,
            attributes: vec![label_attribute(label)],
        }
    }

    fn msrp_media(
        &self,
        original: &MsrpDescription,
        label: MediaLabel,
        allocated: &mut Vec<u16>,
    ) -> MsrpDescription {
        let port = self.ports.allocate(MediaKind::Msrp);
        allocated.push(port);

        let secure = self.config.msrp_encryption == MsrpEncryption::Msrps;
        let scheme = if secure { "msrps" } else { "msrp" };

        let session_id: String = rng()
            .sample_iter(Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        let local_ip = self.config.local_addr.ip();
        let host = match local_ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };

        MsrpDescription {
            port,
            secure,
            connection: Some(Connection {
                address: local_ip.into(),
                ttl: None,
                num: None,
            }),
            direction: Direction::SendOnly,
            setup: Some(Setup::Active),
            path: format!("{scheme}://{host}:{port}/{session_id};tcp").into(),
            accept_types: original.accept_types.clone(),
            attributes: vec![label_attribute(label)],
        }
    }
}

/// SDES-SRTP crypto offer: one freshly keyed `a=crypto` line per supported
/// suite, strongest first.
fn sdes_crypto() -> Vec<SrtpCrypto> {
    SDES_SUITES
        .iter()
        .enumerate()
        .map(|(tag, suite)| {
            let (key_len, salt_len) = suite
                .key_and_salt_len()
                .expect("only offering known suites");

            let mut key = vec![0u8; key_len + salt_len];
            rng().fill_bytes(&mut key);

            SrtpCrypto {
                tag: (tag + 1) as u32,
                suite: suite.clone(),
                keys: vec![SrtpKeyingMaterial {
                    key_and_salt: BASE64_STANDARD.encode(&key).into(),
                    lifetime: None,
                    mki: None,
                }],
                params: vec![],
            }
        })
        .collect()
}
