//! The per-SRS recorder: a long lived signalling endpoint multiplexing all
//! recorded calls towards one SRS over a single local transport.
//!
//! All call state is owned by a single task and mutated only there; the
//! public methods and the transport callbacks post commands onto its queue
//! and return immediately.

use crate::config::{RecorderConfig, SipTransport};
use crate::event::{
    CallEventContext, EventLogClient, LogEvent, LogEventKind, LogIdentity, SignalingDirection,
    SrsStatus,
};
use crate::media::{CertificateStore, MediaPortManager, MediaSessionFactory};
use crate::sdp::{OfferBuilder, RecordedMedia, RecordingSdp};
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_core::transaction::{ClientInvTsx, TsxResponse};
use sip_core::transport::streaming::StreamingListenerBuilder;
use sip_core::transport::tcp::{TcpConnector, TcpListener};
use sip_core::transport::udp::Udp;
use sip_core::transport::TargetTransportInfo;
use sip_core::{Endpoint, EndpointBuilder, IncomingRequest, Layer, MayTake, Request};
use sip_types::header::typed::{Accept, CSeq, CallID, FromTo, MaxForwards};
use sip_types::host::HostPort;
use sip_types::msg::RequestLine;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{CodeKind, Headers, Method, Name, StatusCode};
use siprec_metadata::RecordingMetadata;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

mod call;

pub use call::CallParameters;

use crate::bridge::MediaBridge;
use call::{Call, CallState};

/// Bound on fire-and-forget transactions (OPTIONS probes, BYEs).
const NON_INVITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// External collaborators of a recorder, injected so tests can substitute
/// fakes.
#[derive(Clone)]
pub struct RecorderServices {
    pub media: Arc<dyn MediaSessionFactory>,
    pub ports: Arc<dyn MediaPortManager>,
    pub certificates: Arc<dyn CertificateStore>,
    pub event_log: Arc<dyn EventLogClient>,
    pub identity: LogIdentity,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to bind SIP transport, {0}")]
    Bind(#[from] std::io::Error),
    #[error("TLS transport requested but no TLS context is available")]
    TlsUnavailable,
}

/// TLS material for a recorder using the `tls` transport.
#[cfg(feature = "tls-rustls")]
pub struct RustlsContext {
    pub acceptor: tokio_rustls::TlsAcceptor,
    pub connector: tokio_rustls::TlsConnector,
}

#[cfg(feature = "tls-native-tls")]
pub struct NativeTlsContext {
    pub acceptor: tokio_native_tls::TlsAcceptor,
    pub connector: tokio_native_tls::TlsConnector,
}

enum AgentState {
    Idle,
    Starting,
    Running {
        commands: mpsc::UnboundedSender<Command>,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// One recording client endpoint towards one SRS.
pub struct RecorderAgent {
    config: Arc<RecorderConfig>,
    services: RecorderServices,
    status_tx: broadcast::Sender<SrsStatus>,
    state: parking_lot::Mutex<AgentState>,

    #[cfg(feature = "tls-rustls")]
    rustls: parking_lot::Mutex<Option<RustlsContext>>,

    #[cfg(feature = "tls-native-tls")]
    native_tls: parking_lot::Mutex<Option<NativeTlsContext>>,
}

impl RecorderAgent {
    pub fn new(config: RecorderConfig, services: RecorderServices) -> Self {
        RecorderAgent {
            config: Arc::new(config),
            services,
            status_tx: broadcast::channel(16).0,
            state: parking_lot::Mutex::new(AgentState::Idle),

            #[cfg(feature = "tls-rustls")]
            rustls: parking_lot::Mutex::new(None),

            #[cfg(feature = "tls-native-tls")]
            native_tls: parking_lot::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Subscribe to [`SrsStatus`] transitions observed by the OPTIONS
    /// probes.
    pub fn status_events(&self) -> broadcast::Receiver<SrsStatus> {
        self.status_tx.subscribe()
    }

    #[cfg(feature = "tls-rustls")]
    pub fn set_rustls_context(&self, context: RustlsContext) {
        *self.rustls.lock() = Some(context);
    }

    #[cfg(feature = "tls-native-tls")]
    pub fn set_native_tls_context(&self, context: NativeTlsContext) {
        *self.native_tls.lock() = Some(context);
    }

    /// Bind the SIP channel and start the recorder. Idempotent; a second
    /// call (also after shutdown) does nothing.
    pub async fn start(&self) -> Result<(), StartError> {
        {
            let mut state = self.state.lock();

            match &*state {
                AgentState::Idle => *state = AgentState::Starting,
                _ => return Ok(()),
            }
        }

        match self.bind().await {
            Ok(running) => {
                *self.state.lock() = running;
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = AgentState::Idle;
                Err(e)
            }
        }
    }

    /// Terminate every recorded call and stop the recorder. Returns once
    /// all outstanding work has completed. Idempotent.
    pub async fn shutdown(&self) {
        let (commands, task) = loop {
            let mut state = self.state.lock();

            match std::mem::replace(&mut *state, AgentState::Stopped) {
                AgentState::Idle | AgentState::Stopped => return,
                AgentState::Starting => {
                    *state = AgentState::Starting;
                    drop(state);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                AgentState::Running { commands, task } => break (commands, task),
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();

        if commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }

        let _ = task.await;

        log::info!("recorder `{}` shut down", self.config.name);
    }

    /// Start mirroring a call to this recorder's SRS.
    pub fn start_recording(&self, params: CallParameters) {
        self.send_command(Command::Start(Box::new(params)));
    }

    /// The original call was re-negotiated; reconcile with the recording
    /// dialog.
    pub fn handle_reinvite(&self, params: CallParameters) {
        self.send_command(Command::ReInvite(Box::new(params)));
    }

    /// Stop mirroring the call with the given Call-ID.
    pub fn stop_recording(&self, call_id: BytesStr) {
        self.send_command(Command::Stop(call_id));
    }

    fn send_command(&self, command: Command) {
        let state = self.state.lock();

        if let AgentState::Running { commands, .. } = &*state {
            if commands.send(command).is_err() {
                log::warn!("recorder `{}` task is gone", self.config.name);
            }
        } else {
            log::debug!(
                "recorder `{}` is not running, dropping command",
                self.config.name
            );
        }
    }

    async fn bind(&self) -> Result<AgentState, StartError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut builder = Endpoint::builder();

        for method in [
            Method::INVITE,
            Method::ACK,
            Method::CANCEL,
            Method::BYE,
            Method::OPTIONS,
        ] {
            builder.add_allow(method);
        }

        builder.add_accept(Accept(BytesStr::from_static("application/sdp")));
        builder.add_accept(Accept(BytesStr::from_static("application/rs-metadata")));

        builder.add_layer(RecorderLayer {
            commands: commands_tx.clone(),
        });

        let mut target = TargetTransportInfo::default();

        match self.config.transport {
            SipTransport::Udp => {
                let transport = Udp::spawn(&mut builder, self.config.local_addr).await?;

                // every call shares the one local transport
                target.transport = Some((transport, self.config.srs_addr));
            }
            SipTransport::Tcp => {
                if self.config.local_addr.ip().is_unspecified() {
                    builder.add_transport_factory(Arc::new(TcpConnector::new()));
                } else {
                    builder.add_transport_factory(Arc::new(TcpConnector::new_with_bind(
                        self.config.local_addr,
                    )));
                }

                TcpListener::new()
                    .spawn(&mut builder, self.config.local_addr)
                    .await?;
            }
            SipTransport::Tls => {
                self.spawn_tls(&mut builder).await?;
            }
        }

        let endpoint = builder.build();

        log::info!(
            "recorder `{}` bound to {}, mirroring to {}",
            self.config.name,
            self.config.local_addr,
            self.config.srs_addr
        );

        let srs_uri = self.config.srs_uri();
        let name: BytesStr = self.config.name.clone().into();

        let task = AgentTask {
            endpoint,
            config: self.config.clone(),
            services: self.services.clone(),
            commands_tx: commands_tx.clone(),
            calls: HashMap::new(),
            request_uri: srs_uri.clone().user(name.clone()),
            local_uri: SipUri::new(HostPort::from(self.config.local_addr)).user(name),
            srs_uri,
            target,
            options_call_id: CallID::new(random_token()),
            options_from_tag: random_token(),
            options_cseq: 0,
            srs_status: None,
            status_tx: self.status_tx.clone(),
        };

        let task = tokio::spawn(task.run(commands_rx));

        Ok(AgentState::Running {
            commands: commands_tx,
            task,
        })
    }

    async fn spawn_tls(&self, builder: &mut EndpointBuilder) -> Result<(), StartError> {
        let _ = &builder;

        #[cfg(feature = "tls-rustls")]
        {
            let tls = self.rustls.lock().take();

            if let Some(tls) = tls {
                builder.add_transport_factory(Arc::new(tls.connector));

                tls.acceptor
                    .spawn(builder, self.config.local_addr)
                    .await
                    .map_err(StartError::Bind)?;

                return Ok(());
            }
        }

        #[cfg(feature = "tls-native-tls")]
        {
            let tls = self.native_tls.lock().take();

            if let Some(tls) = tls {
                builder.add_transport_factory(Arc::new(tls.connector));

                tls.acceptor
                    .spawn(builder, self.config.local_addr)
                    .await
                    .map_err(StartError::Bind)?;

                return Ok(());
            }
        }

        Err(StartError::TlsUnavailable)
    }
}

fn random_token() -> BytesStr {
    use rand::{Rng, distr::Alphanumeric, rng};

    rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect::<String>()
        .into()
}

enum Command {
    Start(Box<CallParameters>),
    ReInvite(Box<CallParameters>),
    Stop(BytesStr),
    InviteOutcome {
        call_id: BytesStr,
        outcome: InviteOutcome,
    },
    OptionsOutcome {
        status: Option<u16>,
    },
    Request(Box<IncomingRequest>),
    Shutdown(oneshot::Sender<()>),
}

enum InviteOutcome {
    Answered(Box<TsxResponse>),
    Rejected(Box<TsxResponse>),
    TimedOut,
    Failed(String),
}

/// Takes every non-ACK request off the endpoint and posts it onto the
/// agent's queue; transaction state must only be touched there.
struct RecorderLayer {
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait::async_trait]
impl Layer for RecorderLayer {
    fn name(&self) -> &'static str {
        "siprec-recorder"
    }

    async fn receive(&self, _endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        if request.line.method == Method::ACK {
            // already matched to its transaction by the transport layer
            request.take();
            return;
        }

        let request = request.take();

        if self.commands.send(Command::Request(Box::new(request))).is_err() {
            log::debug!("recorder task is gone, dropping incoming request");
        }
    }
}

struct AgentTask {
    endpoint: Endpoint,
    config: Arc<RecorderConfig>,
    services: RecorderServices,
    commands_tx: mpsc::UnboundedSender<Command>,

    calls: HashMap<BytesStr, Call>,

    /// SRS URI with the recorder name as user part, used as request URI.
    request_uri: SipUri,

    /// Local URI used for From/Contact.
    local_uri: SipUri,

    /// Plain SRS URI, used for OPTIONS From/To.
    srs_uri: SipUri,

    target: TargetTransportInfo,

    options_call_id: CallID,
    options_from_tag: BytesStr,
    options_cseq: u32,

    /// `(responding, last status)` of the most recent probe; `None` until
    /// the first probe completed.
    srs_status: Option<(bool, Option<u16>)>,
    status_tx: broadcast::Sender<SrsStatus>,
}

impl AgentTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut options_interval = self
            .config
            .enable_options
            .then(|| tokio::time::interval(self.config.options_interval()));

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown(&mut commands).await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => return,
                },
                _ = options_tick(&mut options_interval) => self.dispatch_options(),
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(params) => self.start_recording(*params).await,
            Command::ReInvite(params) => self.handle_reinvite(*params).await,
            Command::Stop(call_id) => self.stop_recording(call_id),
            Command::InviteOutcome { call_id, outcome } => {
                self.on_invite_outcome(call_id, outcome)
            }
            Command::OptionsOutcome { status } => self.on_options_outcome(status),
            Command::Request(request) => self.on_request(*request).await,
            Command::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    async fn start_recording(&mut self, params: CallParameters) {
        if self.calls.contains_key(&params.call_id) {
            log::warn!(
                "recorder `{}` is already recording call {}",
                self.config.name,
                params.call_id
            );
            return;
        }

        let context = self.call_context(&params);

        let offer_builder = OfferBuilder::new(
            &self.config,
            &*self.services.ports,
            &*self.services.certificates,
        );

        let mut allocated_ports = Vec::new();
        let offered = offer_builder.build(&params.answered_sdp, &mut allocated_ports);

        let mut metadata = RecordingMetadata::new(params.call_id.clone(), &params.from, &params.to);

        for media in &offered.media {
            let Some(label) = media.label() else { continue };

            if label.is_received() {
                if let Err(e) = metadata.add_stream_pair(label.value(), label.value() + 1) {
                    log::error!("failed to add metadata streams for label {label}, {e}");
                }
            }
        }

        let bridge = MediaBridge::new(self.services.event_log.clone(), context.clone());

        let mut call = Call::new(
            params,
            self.request_uri.clone(),
            self.local_uri.clone(),
            offered,
            allocated_ports,
            metadata,
            bridge,
            self.target.clone(),
            context,
        );

        let body = match call.invite_body() {
            Ok(body) => body,
            Err(e) => {
                log::error!("failed to serialise recording metadata, {e}");
                teardown_call(&self.services, &mut call, false);
                return;
            }
        };

        let request = call.create_invite(body);

        emit_signaling(
            &self.services.event_log,
            &call.context,
            SignalingDirection::Sent,
            format!("INVITE cseq={}", call.last_cseq),
        );

        let mut target = call.target.clone();

        match self.endpoint.send_invite(request, &mut target).await {
            Ok(transaction) => {
                call.target = target;

                let (cancel_tx, cancel_rx) = oneshot::channel();
                call.invite_cancel = Some(cancel_tx);

                spawn_invite_driver(
                    self.endpoint.clone(),
                    call.params.call_id.clone(),
                    transaction,
                    cancel_rx,
                    self.commands_tx.clone(),
                    self.services.event_log.clone(),
                    call.context.clone(),
                );

                self.calls.insert(call.params.call_id.clone(), call);
            }
            Err(e) => {
                log::error!(
                    "recorder `{}` failed to send INVITE for call {}, {e}",
                    self.config.name,
                    call.params.call_id
                );
                teardown_call(&self.services, &mut call, false);
            }
        }
    }

    async fn handle_reinvite(&mut self, new_params: CallParameters) {
        let Some(call) = self.calls.get_mut(&new_params.call_id) else {
            log::error!(
                "recorder `{}` got re-INVITE for unknown call {}",
                self.config.name,
                new_params.call_id
            );
            return;
        };

        if new_params.rtp_channels.len() < call.params.rtp_channels.len()
            || new_params.answered_sdp.media.len() < call.params.answered_sdp.media.len()
        {
            log::error!(
                "re-INVITE for call {} removes media, ignoring",
                new_params.call_id
            );
            return;
        }

        if call.state != CallState::Established || call.invite_cancel.is_some() {
            log::error!(
                "re-INVITE for call {} while signalling is in flight, ignoring",
                new_params.call_id
            );
            return;
        }

        // Re-target replaced channels; each leg keeps its own label.
        for (index, new_channel) in new_params.rtp_channels.iter().enumerate() {
            if let Some(old_channel) = call.params.rtp_channels.get(index) {
                if !Arc::ptr_eq(old_channel, new_channel) {
                    if let Some(kind) = call::rtp_kind_at(&call.params.answered_sdp, index) {
                        call.bridge.rehook_rtp(kind, new_channel);
                    }
                }
            }
        }

        if let (Some(old), Some(new)) = (&call.params.msrp_connection, &new_params.msrp_connection)
        {
            if !Arc::ptr_eq(old, new) {
                call.bridge.rehook_msrp(new);
            }
        }

        let old_count = call.params.answered_sdp.media.len();

        // Same media count: nothing to signal towards the SRS.
        if new_params.answered_sdp.media.len() == old_count {
            call.params = new_params;
            return;
        }

        let offer_builder = OfferBuilder::new(
            &self.config,
            &*self.services.ports,
            &*self.services.certificates,
        );

        let mut added = Vec::new();

        for media in &new_params.answered_sdp.media[old_count..] {
            if media.port() == 0 {
                continue;
            }

            let Some(kind) = media.kind() else { continue };

            let (received, sent) = kind.labels();

            // Metadata first: a failed association skips the whole
            // addition instead of leaving offer and metadata out of sync.
            match call.metadata.add_stream_pair(received.value(), sent.value()) {
                Ok(_) => {
                    offer_builder.append_pair(&mut call.offered, media, &mut call.allocated_ports);
                    added.push(kind);
                }
                Err(e) => {
                    log::error!(
                        "failed to extend metadata of call {} with {kind:?} streams, {e}",
                        new_params.call_id
                    );
                }
            }
        }

        call.params = new_params;

        if added.is_empty() {
            return;
        }

        call.pending_media = added;
        call.last_cseq += 1;

        let body = match call.invite_body() {
            Ok(body) => body,
            Err(e) => {
                log::error!("failed to serialise recording metadata, {e}");
                call.pending_media.clear();
                return;
            }
        };

        let request = call.create_invite(body);

        emit_signaling(
            &self.services.event_log,
            &call.context,
            SignalingDirection::Sent,
            format!("INVITE cseq={}", call.last_cseq),
        );

        let mut target = call.target.clone();

        match self.endpoint.send_invite(request, &mut target).await {
            Ok(transaction) => {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                call.invite_cancel = Some(cancel_tx);
                call.state = CallState::ReOffering;

                spawn_invite_driver(
                    self.endpoint.clone(),
                    call.params.call_id.clone(),
                    transaction,
                    cancel_rx,
                    self.commands_tx.clone(),
                    self.services.event_log.clone(),
                    call.context.clone(),
                );
            }
            Err(e) => {
                log::error!(
                    "recorder `{}` failed to send re-INVITE for call {}, {e}; \
                     existing recording is retained",
                    self.config.name,
                    call.params.call_id
                );
                call.pending_media.clear();
            }
        }
    }

    fn stop_recording(&mut self, call_id: BytesStr) {
        let Some(mut call) = self.calls.remove(&call_id) else {
            log::warn!(
                "recorder `{}` got stop for unknown call {call_id}",
                self.config.name
            );
            return;
        };

        if let Some(cancel) = call.invite_cancel.take() {
            let _ = cancel.send(());
        }

        match call.state {
            // Never established: the cancelled INVITE's final response is
            // absorbed by the driver, no BYE is sent.
            CallState::Offering => teardown_call(&self.services, &mut call, false),
            CallState::Established | CallState::ReOffering => {
                self.send_bye(&mut call);
                teardown_call(&self.services, &mut call, true);
            }
        }
    }

    /// Fire-and-forget BYE, bounded at [`NON_INVITE_TIMEOUT`].
    fn send_bye(&self, call: &mut Call) {
        let bye = call.create_bye();

        emit_signaling(
            &self.services.event_log,
            &call.context,
            SignalingDirection::Sent,
            format!("BYE cseq={}", call.last_cseq),
        );

        let endpoint = self.endpoint.clone();
        let mut target = call.target.clone();
        let call_id = call.params.call_id.clone();

        tokio::spawn(async move {
            match endpoint.send_request(bye, &mut target).await {
                Ok(mut transaction) => {
                    let _ =
                        tokio::time::timeout(NON_INVITE_TIMEOUT, transaction.receive_final()).await;
                }
                Err(e) => log::warn!("failed to send BYE for call {call_id}, {e}"),
            }
        });
    }

    fn on_invite_outcome(&mut self, call_id: BytesStr, outcome: InviteOutcome) {
        let Some(mut call) = self.calls.remove(&call_id) else {
            // stop during offering removed the call, absorb the response
            log::debug!("absorbing INVITE outcome for removed call {call_id}");
            return;
        };

        call.invite_cancel = None;

        match call.state {
            CallState::Offering => match outcome {
                InviteOutcome::Answered(response) => {
                    match self.accept_initial_answer(&mut call, &response) {
                        Ok(()) => {
                            call.state = CallState::Established;

                            self.services.event_log.log(LogEvent::new(
                                LogEventKind::RecCallStart,
                                &call.context,
                            ));

                            self.calls.insert(call_id, call);
                        }
                        Err(reason) => {
                            log::error!("call {call_id} not recordable, {reason}; sending BYE");

                            // clean the dialog up on the SRS side
                            self.send_bye(&mut call);
                            teardown_call(&self.services, &mut call, false);
                        }
                    }
                }
                InviteOutcome::Rejected(response) => {
                    emit_signaling(
                        &self.services.event_log,
                        &call.context,
                        SignalingDirection::Received,
                        response_summary(&response),
                    );
                    log::warn!(
                        "SRS rejected recording INVITE for call {call_id} with {}",
                        response.line.code.into_u16()
                    );
                    teardown_call(&self.services, &mut call, false);
                }
                InviteOutcome::TimedOut => {
                    log::warn!("recording INVITE for call {call_id} timed out");
                    teardown_call(&self.services, &mut call, false);
                }
                InviteOutcome::Failed(e) => {
                    log::error!("recording INVITE for call {call_id} failed, {e}");
                    teardown_call(&self.services, &mut call, false);
                }
            },
            CallState::ReOffering => {
                match outcome {
                    InviteOutcome::Answered(response) => {
                        if let Err(reason) = self.accept_reinvite_answer(&mut call, &response) {
                            log::error!(
                                "re-INVITE answer for call {call_id} not usable, {reason}; \
                                 existing recording is retained"
                            );
                        }
                    }
                    InviteOutcome::Rejected(response) => {
                        emit_signaling(
                            &self.services.event_log,
                            &call.context,
                            SignalingDirection::Received,
                            response_summary(&response),
                        );
                        log::error!(
                            "SRS rejected re-INVITE for call {call_id} with {}; \
                             existing recording is retained",
                            response.line.code.into_u16()
                        );
                    }
                    InviteOutcome::TimedOut | InviteOutcome::Failed(_) => {
                        log::error!(
                            "re-INVITE for call {call_id} got no answer; \
                             existing recording is retained"
                        );
                    }
                }

                call.state = CallState::Established;
                call.pending_media.clear();
                self.calls.insert(call_id, call);
            }
            CallState::Established => {
                log::warn!("unexpected INVITE outcome for established call {call_id}");
                self.calls.insert(call_id, call);
            }
        }
    }

    fn accept_initial_answer(
        &self,
        call: &mut Call,
        response: &TsxResponse,
    ) -> Result<(), String> {
        emit_signaling(
            &self.services.event_log,
            &call.context,
            SignalingDirection::Received,
            response_summary(response),
        );

        call.store_ok(response);

        let sdp = call::extract_answer_sdp(response).ok_or("200 OK carries no SDP answer")?;

        let answered =
            RecordingSdp::parse(&sdp).map_err(|e| format!("invalid SDP answer, {e}"))?;

        if answered.media.len() != call.offered.media.len() {
            return Err(format!(
                "answer has {} media descriptions, offer had {}",
                answered.media.len(),
                call.offered.media.len()
            ));
        }

        for media in &answered.media {
            if media.port() == 0 {
                continue;
            }

            let Some(label) = media.label() else {
                log::warn!("answer media without label, leg not attached");
                continue;
            };

            self.attach_leg(call, label, media);
        }

        call.answered = Some(answered);

        Ok(())
    }

    fn accept_reinvite_answer(
        &self,
        call: &mut Call,
        response: &TsxResponse,
    ) -> Result<(), String> {
        emit_signaling(
            &self.services.event_log,
            &call.context,
            SignalingDirection::Received,
            response_summary(response),
        );

        let sdp = call::extract_answer_sdp(response).ok_or("200 OK carries no SDP answer")?;

        let answered =
            RecordingSdp::parse(&sdp).map_err(|e| format!("invalid SDP answer, {e}"))?;

        if answered.media.len() != call.offered.media.len() {
            return Err(format!(
                "answer has {} media descriptions, offer had {}",
                answered.media.len(),
                call.offered.media.len()
            ));
        }

        // The SRS may reorder the media lines, so added legs are matched
        // by (kind, label), never by position.
        for media in &answered.media {
            if media.port() == 0 {
                continue;
            }

            let Some(label) = media.label() else { continue };

            if !call.pending_media.contains(&label.kind()) || call.bridge.has_leg(label) {
                continue;
            }

            self.attach_leg(call, label, media);
        }

        call.answered = Some(answered);

        Ok(())
    }

    /// Create the leg for one answered media description and subscribe it
    /// to the matching original-call channel.
    fn attach_leg(&self, call: &mut Call, label: crate::label::MediaLabel, answer: &RecordedMedia) {
        let kind = label.kind();

        let Some(offered) = call.offered.find_by_label(kind, label) else {
            log::error!("answer media with label {label} has no offered counterpart");
            return;
        };

        let local_port = offered.port();

        match answer {
            RecordedMedia::Rtp(answer) => {
                let Some(index) = call::rtp_channel_index(&call.params.answered_sdp, kind) else {
                    log::error!("no original media of kind {kind:?} for label {label}");
                    return;
                };

                let Some(channel) = call.params.rtp_channels.get(index) else {
                    log::error!("original call has no RTP channel at index {index}");
                    return;
                };

                match self.services.media.create_rtp_sink(local_port, answer) {
                    Ok(sink) => call.bridge.attach_rtp_leg(label, channel, sink),
                    Err(e) => log::error!("leg {label} absent, {e}"),
                }
            }
            RecordedMedia::Msrp(answer) => {
                let Some(connection) = &call.params.msrp_connection else {
                    log::error!("original call has no MSRP connection for label {label}");
                    return;
                };

                match self.services.media.create_msrp_sink(local_port, answer) {
                    Ok(sink) => call.bridge.attach_msrp_leg(label, connection, sink),
                    Err(e) => log::error!("leg {label} absent, {e}"),
                }
            }
        }
    }

    async fn on_request(&mut self, mut request: IncomingRequest) {
        if request.line.method == Method::BYE {
            let call_id = request.base_headers.call_id.0.clone();

            if let Some(mut call) = self.calls.remove(&call_id) {
                emit_signaling(
                    &self.services.event_log,
                    &call.context,
                    SignalingDirection::Received,
                    "BYE".into(),
                );

                if let Some(cancel) = call.invite_cancel.take() {
                    let _ = cancel.send(());
                }

                self.respond(&mut request, StatusCode::OK).await;

                emit_signaling(
                    &self.services.event_log,
                    &call.context,
                    SignalingDirection::Sent,
                    "200 OK".into(),
                );

                teardown_call(&self.services, &mut call, true);
            } else {
                self.respond(&mut request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST)
                    .await;
            }
        } else {
            self.respond(&mut request, StatusCode::METHOD_NOT_ALLOWED)
                .await;
        }
    }

    async fn respond(&self, request: &mut IncomingRequest, code: StatusCode) {
        let response = self.endpoint.create_response(request, code, None);
        let transaction = self.endpoint.create_server_tsx(request);

        if let Err(e) = transaction.respond(response).await {
            log::warn!(
                "recorder `{}` failed to respond to {}, {e}",
                self.config.name,
                request.line.method
            );
        }
    }

    /// One OPTIONS probe: fresh branch and CSeq, bounded wait, outcome
    /// posted back onto the queue.
    fn dispatch_options(&mut self) {
        self.options_cseq += 1;

        let mut headers = Headers::new();

        headers.insert_named(&MaxForwards(70));
        headers.insert_type(
            Name::FROM,
            &FromTo::new(
                NameAddr::uri(self.srs_uri.clone()),
                Some(self.options_from_tag.clone()),
            ),
        );
        headers.insert_type(Name::TO, &FromTo::new(NameAddr::uri(self.srs_uri.clone()), None));
        headers.insert_named(&self.options_call_id);
        headers.insert_named(&CSeq::new(self.options_cseq, Method::OPTIONS));

        let request = Request {
            line: RequestLine {
                method: Method::OPTIONS,
                uri: self.srs_uri.clone(),
            },
            headers,
            body: Bytes::new(),
        };

        let endpoint = self.endpoint.clone();
        let mut target = self.target.clone();
        let commands = self.commands_tx.clone();

        tokio::spawn(async move {
            let status = match endpoint.send_request(request, &mut target).await {
                Ok(mut transaction) => {
                    match tokio::time::timeout(NON_INVITE_TIMEOUT, transaction.receive_final())
                        .await
                    {
                        Ok(Ok(response)) => Some(response.line.code.into_u16()),
                        _ => None,
                    }
                }
                Err(e) => {
                    log::debug!("failed to send OPTIONS, {e}");
                    None
                }
            };

            let _ = commands.send(Command::OptionsOutcome { status });
        });
    }

    fn on_options_outcome(&mut self, status: Option<u16>) {
        let responding = status.is_some();

        if self.srs_status == Some((responding, status)) {
            return;
        }

        self.srs_status = Some((responding, status));

        if responding {
            log::info!(
                "SRS of recorder `{}` is responding ({})",
                self.config.name,
                status.unwrap_or_default()
            );
        } else {
            log::warn!("SRS of recorder `{}` is not responding", self.config.name);
        }

        let _ = self.status_tx.send(SrsStatus {
            name: self.config.name.clone(),
            responding,
            last_response: status,
        });
    }

    async fn shutdown(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        // cancel every in-flight INVITE before any BYE is sent
        for call in self.calls.values_mut() {
            if let Some(cancel) = call.invite_cancel.take() {
                let _ = cancel.send(());
            }
        }

        let call_ids: Vec<BytesStr> = self.calls.keys().cloned().collect();

        for call_id in call_ids {
            let mut call = self.calls.remove(&call_id).expect("key was just collected");

            match call.state {
                CallState::Offering => teardown_call(&self.services, &mut call, false),
                CallState::Established | CallState::ReOffering => {
                    let bye = call.create_bye();

                    emit_signaling(
                        &self.services.event_log,
                        &call.context,
                        SignalingDirection::Sent,
                        format!("BYE cseq={}", call.last_cseq),
                    );

                    let mut target = call.target.clone();

                    // bounded wait per BYE; no new work can arrive anymore
                    match self.endpoint.send_request(bye, &mut target).await {
                        Ok(mut transaction) => {
                            let _ = tokio::time::timeout(
                                NON_INVITE_TIMEOUT,
                                transaction.receive_final(),
                            )
                            .await;
                        }
                        Err(e) => log::warn!("failed to send BYE for call {call_id}, {e}"),
                    }

                    teardown_call(&self.services, &mut call, true);
                }
            }
        }

        // drain whatever was enqueued while shutting down
        while let Ok(command) = commands.try_recv() {
            if let Command::Shutdown(ack) = command {
                let _ = ack.send(());
            }
        }
    }

    fn call_context(&self, params: &CallParameters) -> CallEventContext {
        CallEventContext {
            identity: self.services.identity.clone(),
            emergency_call_id: params.emergency_call_id.clone(),
            emergency_incident_id: params.emergency_incident_id.clone(),
            sip_call_id: params.call_id.clone(),
            srs_endpoint: self.config.srs_addr.to_string(),
        }
    }
}

fn teardown_call(services: &RecorderServices, call: &mut Call, ended: bool) {
    call.bridge.shutdown();

    for port in call.allocated_ports.drain(..) {
        services.ports.release(port);
    }

    if ended {
        services
            .event_log
            .log(LogEvent::new(LogEventKind::RecCallEnd, &call.context));
    }
}

fn emit_signaling(
    event_log: &Arc<dyn EventLogClient>,
    context: &CallEventContext,
    direction: SignalingDirection,
    summary: String,
) {
    event_log.log(LogEvent::new(
        LogEventKind::CallSignalingMessage { direction, summary },
        context,
    ));
}

fn response_summary(response: &TsxResponse) -> String {
    match &response.line.reason {
        Some(reason) => format!("{} {}", response.line.code.into_u16(), reason),
        None => response.line.code.into_u16().to_string(),
    }
}

async fn options_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drives one client INVITE transaction to completion and posts the
/// outcome back onto the agent queue. Cancellation sends a CANCEL through
/// the same transaction and keeps absorbing responses until the final one.
#[allow(clippy::too_many_arguments)]
fn spawn_invite_driver(
    endpoint: Endpoint,
    call_id: BytesStr,
    mut transaction: ClientInvTsx,
    mut cancel: oneshot::Receiver<()>,
    commands: mpsc::UnboundedSender<Command>,
    event_log: Arc<dyn EventLogClient>,
    context: CallEventContext,
) {
    tokio::spawn(async move {
        let mut cancelled = false;

        // prepared up front, carrying the INVITE's Via branch and transport
        let mut pending_cancel = match call::create_cancel(transaction.request()) {
            Ok(request) => Some(request),
            Err(e) => {
                log::warn!("failed to construct CANCEL, {e}");
                None
            }
        };

        let outcome = loop {
            tokio::select! {
                result = &mut cancel, if !cancelled => {
                    cancelled = true;

                    if result.is_ok() {
                        if let Some(mut request) = pending_cancel.take() {
                            emit_signaling(
                                &event_log,
                                &context,
                                SignalingDirection::Sent,
                                "CANCEL".into(),
                            );

                            if let Err(e) = endpoint.send_outgoing_request(&mut request).await {
                                log::warn!("failed to send CANCEL, {e}");
                            }
                        }
                    }
                }
                received = transaction.receive() => match received {
                    Ok(Some(response)) => {
                        match response.line.code.kind() {
                            CodeKind::Provisional => {
                                emit_signaling(
                                    &event_log,
                                    &context,
                                    SignalingDirection::Received,
                                    response_summary(&response),
                                );
                            }
                            CodeKind::Success => {
                                match call::create_ack(transaction.request(), &response) {
                                    Ok(mut ack) => {
                                        emit_signaling(
                                            &event_log,
                                            &context,
                                            SignalingDirection::Sent,
                                            "ACK".into(),
                                        );

                                        if let Err(e) =
                                            endpoint.send_outgoing_request(&mut ack).await
                                        {
                                            log::warn!("failed to send ACK, {e}");
                                        }
                                    }
                                    Err(e) => log::warn!("failed to construct ACK, {e}"),
                                }

                                break InviteOutcome::Answered(Box::new(response));
                            }
                            _ => break InviteOutcome::Rejected(Box::new(response)),
                        }
                    }
                    Ok(None) => break InviteOutcome::TimedOut,
                    Err(sip_core::Error::RequestTimedOut) => break InviteOutcome::TimedOut,
                    Err(e) => break InviteOutcome::Failed(e.to_string()),
                }
            }
        };

        let _ = commands.send(Command::InviteOutcome { call_id, outcome });
    });
}
