use serde::{Deserialize, Serialize};
use sip_types::host::HostPort;
use sip_types::uri::SipUri;
use std::net::SocketAddr;
use std::time::Duration;

/// Transport protocol used for the signalling dialogs towards one SRS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SipTransport {
    Udp,
    Tcp,
    Tls,
}

/// Encryption applied to the RTP legs offered to the SRS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtpEncryption {
    #[default]
    None,
    SdesSrtp,
    DtlsSrtp,
}

/// Encryption applied to the MSRP leg offered to the SRS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MsrpEncryption {
    #[default]
    None,
    Msrps,
}

/// Configuration of one recorder, i.e. one SRS this client mirrors calls to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecorderConfig {
    /// Unique name of the recorder, also used as the user part of the
    /// request URI towards the SRS.
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub transport: SipTransport,

    /// Local endpoint the SIP channel binds to.
    pub local_addr: SocketAddr,

    /// Endpoint of the SRS.
    pub srs_addr: SocketAddr,

    #[serde(default)]
    pub rtp_encryption: RtpEncryption,

    #[serde(default)]
    pub msrp_encryption: MsrpEncryption,

    /// Probe SRS liveness with periodic OPTIONS requests.
    #[serde(default = "default_true")]
    pub enable_options: bool,

    #[serde(default = "default_options_interval")]
    pub options_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_options_interval() -> u64 {
    5
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        if self.local_addr.is_ipv4() != self.srs_addr.is_ipv4() {
            return Err(ConfigError::AddressFamilyMismatch {
                name: self.name.clone(),
            });
        }

        if self.enable_options && self.options_interval_secs == 0 {
            return Err(ConfigError::ZeroOptionsInterval {
                name: self.name.clone(),
            });
        }

        Ok(())
    }

    pub fn options_interval(&self) -> Duration {
        Duration::from_secs(self.options_interval_secs)
    }

    /// URI of the SRS, carrying the transport parameter for non-UDP
    /// transports.
    pub fn srs_uri(&self) -> SipUri {
        let uri = SipUri::new(HostPort::from(self.srs_addr));

        match self.transport {
            SipTransport::Udp => uri,
            SipTransport::Tcp => uri.uri_param_value("transport", "tcp"),
            SipTransport::Tls => uri.uri_param_value("transport", "tls"),
        }
    }
}

/// Top level recording settings of the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SrcSettings {
    /// Master switch; when false no recorder is started at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub recorders: Vec<RecorderConfig>,
}

impl SrcSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, recorder) in self.recorders.iter().enumerate() {
            recorder.validate()?;

            if self.recorders[..i].iter().any(|r| r.name == recorder.name) {
                return Err(ConfigError::DuplicateName {
                    name: recorder.name.clone(),
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("recorder name must not be empty")]
    EmptyName,
    #[error("recorder `{name}`: local and SRS endpoints must share an address family")]
    AddressFamilyMismatch { name: String },
    #[error("recorder `{name}`: options interval must be greater than zero")]
    ZeroOptionsInterval { name: String },
    #[error("recorder name `{name}` is used more than once")]
    DuplicateName { name: String },
}
