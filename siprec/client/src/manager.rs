//! Fans recording requests out to every enabled recorder.

use crate::agent::{CallParameters, RecorderAgent, RecorderServices};
use crate::config::{ConfigError, SrcSettings};
use bytesstr::BytesStr;

/// Owns the recorders of all enabled SRS configurations and forwards every
/// call event to each of them. One failing recorder never affects the
/// others.
pub struct Manager {
    agents: Vec<RecorderAgent>,
}

impl Manager {
    pub fn new(settings: SrcSettings, services: RecorderServices) -> Result<Self, ConfigError> {
        settings.validate()?;

        let agents = if settings.enabled {
            settings
                .recorders
                .into_iter()
                .filter(|recorder| recorder.enabled)
                .map(|config| RecorderAgent::new(config, services.clone()))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Manager { agents })
    }

    pub fn agents(&self) -> &[RecorderAgent] {
        &self.agents
    }

    /// Start every recorder. A recorder that fails to bind its transport
    /// is logged and excluded; the remaining recorders keep working.
    pub async fn start(&self) {
        for agent in &self.agents {
            if let Err(e) = agent.start().await {
                log::error!("recorder `{}` failed to start, {e}", agent.name());
            }
        }
    }

    pub fn start_recording(&self, params: &CallParameters) {
        for agent in &self.agents {
            agent.start_recording(params.clone());
        }
    }

    pub fn handle_reinvite(&self, params: &CallParameters) {
        for agent in &self.agents {
            agent.handle_reinvite(params.clone());
        }
    }

    pub fn stop_recording(&self, call_id: &BytesStr) {
        for agent in &self.agents {
            agent.stop_recording(call_id.clone());
        }
    }

    /// Shut every recorder down, awaiting each shutdown sequence.
    pub async fn shutdown(&self) {
        for agent in &self.agents {
            agent.shutdown().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{MsrpEncryption, RecorderConfig, RtpEncryption, SipTransport};
    use crate::event::{EventLogClient, LogEvent, LogIdentity};
    use crate::label::MediaKind;
    use crate::media::{
        CertificateStore, MediaPortManager, MediaSessionFactory, RecordingSink, SinkError,
    };
    use crate::sdp::MsrpDescription;
    use sdp_types::{Fingerprint, FingerprintAlgorithm, MediaDescription};
    use std::sync::Arc;

    struct NullLog;

    impl EventLogClient for NullLog {
        fn log(&self, _event: LogEvent) {}
    }

    struct NullMedia;

    impl MediaSessionFactory for NullMedia {
        fn create_rtp_sink(
            &self,
            _local_port: u16,
            _answer: &MediaDescription,
        ) -> Result<Arc<dyn RecordingSink>, SinkError> {
            Err(SinkError::new("unused"))
        }

        fn create_msrp_sink(
            &self,
            _local_port: u16,
            _answer: &MsrpDescription,
        ) -> Result<Arc<dyn RecordingSink>, SinkError> {
            Err(SinkError::new("unused"))
        }
    }

    struct NullPorts;

    impl MediaPortManager for NullPorts {
        fn allocate(&self, _kind: MediaKind) -> u16 {
            0
        }

        fn release(&self, _port: u16) {}
    }

    struct NullCertificates;

    impl CertificateStore for NullCertificates {
        fn fingerprint(&self) -> Fingerprint {
            Fingerprint {
                algorithm: FingerprintAlgorithm::SHA256,
                fingerprint: Vec::new(),
            }
        }
    }

    fn services() -> RecorderServices {
        RecorderServices {
            media: Arc::new(NullMedia),
            ports: Arc::new(NullPorts),
            certificates: Arc::new(NullCertificates),
            event_log: Arc::new(NullLog),
            identity: LogIdentity::default(),
        }
    }

    fn recorder(name: &str, enabled: bool) -> RecorderConfig {
        RecorderConfig {
            name: name.into(),
            enabled,
            transport: SipTransport::Udp,
            local_addr: "127.0.0.1:0".parse().unwrap(),
            srs_addr: "127.0.0.1:6060".parse().unwrap(),
            rtp_encryption: RtpEncryption::None,
            msrp_encryption: MsrpEncryption::None,
            enable_options: false,
            options_interval_secs: 5,
        }
    }

    #[test]
    fn disabled_settings_start_no_recorder() {
        let settings = SrcSettings {
            enabled: false,
            recorders: vec![recorder("rec1", true)],
        };

        let manager = Manager::new(settings, services()).unwrap();
        assert!(manager.agents().is_empty());
    }

    #[test]
    fn disabled_recorders_are_filtered() {
        let settings = SrcSettings {
            enabled: true,
            recorders: vec![recorder("rec1", true), recorder("rec2", false)],
        };

        let manager = Manager::new(settings, services()).unwrap();

        assert_eq!(manager.agents().len(), 1);
        assert_eq!(manager.agents()[0].name(), "rec1");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut duplicate = recorder("rec1", true);
        duplicate.srs_addr = "127.0.0.1:6061".parse().unwrap();

        let settings = SrcSettings {
            enabled: true,
            recorders: vec![recorder("rec1", true), duplicate],
        };

        assert!(Manager::new(settings, services()).is_err());
    }
}
