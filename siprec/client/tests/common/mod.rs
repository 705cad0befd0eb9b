//! Test doubles: a scripted SRS speaking SIP over a raw UDP socket, plus
//! fakes for the media plane, port allocation and the event log.

use bytesstr::BytesStr;
use sdp_types::{Direction, MediaDescription};
use siprec_client::sdp::{MsrpDescription, RecordedMedia, RecordingSdp};
use siprec_client::{
    CallParameters, CertificateStore, EventLogClient, LogEvent, LogEventKind, LogIdentity,
    MediaKind, MediaPacket, MediaPortManager, MediaSessionFactory, MsrpEncryption, RecorderAgent,
    RecorderConfig, RecorderServices, RecordingSink, RtpChannel, RtpEncryption, SinkError,
    SipTransport,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub const AUDIO_SDP: &str = "v=0\r\n\
    o=- 1 1 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    c=IN IP4 127.0.0.1\r\n\
    t=0 0\r\n\
    m=audio 40000 RTP/AVP 0\r\n\
    a=rtpmap:0 PCMU/8000\r\n\
    a=sendrecv\r\n";

pub const AUDIO_TEXT_SDP: &str = "v=0\r\n\
    o=- 1 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    c=IN IP4 127.0.0.1\r\n\
    t=0 0\r\n\
    m=audio 40000 RTP/AVP 0\r\n\
    a=rtpmap:0 PCMU/8000\r\n\
    a=sendrecv\r\n\
    m=text 42000 RTP/AVP 98\r\n\
    a=rtpmap:98 t140/1000\r\n\
    a=sendrecv\r\n";

/// One SIP request as seen by the fake SRS.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub via: Vec<String>,
    pub from: String,
    pub to: String,
    pub call_id: String,
    pub cseq: String,
    pub body: String,
    pub raw: String,
}

fn parse_message(text: &str) -> Option<ParsedRequest> {
    let (head, body) = text.split_once("\r\n\r\n")?;

    let mut lines = head.split("\r\n");
    let start = lines.next()?;

    if start.starts_with("SIP/2.0") {
        return None;
    }

    let mut request = ParsedRequest {
        method: start.split_whitespace().next()?.to_string(),
        via: Vec::new(),
        from: String::new(),
        to: String::new(),
        call_id: String::new(),
        cseq: String::new(),
        body: body.to_string(),
        raw: text.to_string(),
    };

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };

        let value = value.trim().to_string();

        match name.trim().to_ascii_lowercase().as_str() {
            "via" | "v" => request.via.push(value),
            "from" | "f" => request.from = value,
            "to" | "t" => request.to = value,
            "call-id" | "i" => request.call_id = value,
            "cseq" => request.cseq = value,
            _ => {}
        }
    }

    Some(request)
}

fn build_response(code: u16, reason: &str, request: &ParsedRequest, body: Option<&str>) -> String {
    let mut message = format!("SIP/2.0 {code} {reason}\r\n");

    for via in &request.via {
        message.push_str(&format!("Via: {via}\r\n"));
    }

    message.push_str(&format!("From: {}\r\n", request.from));

    if request.to.contains("tag=") {
        message.push_str(&format!("To: {}\r\n", request.to));
    } else {
        message.push_str(&format!("To: {};tag=srs-tag\r\n", request.to));
    }

    message.push_str(&format!("Call-ID: {}\r\n", request.call_id));
    message.push_str(&format!("CSeq: {}\r\n", request.cseq));

    match body {
        Some(body) => {
            message.push_str(&format!(
                "Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            ));
        }
        None => message.push_str("Content-Length: 0\r\n\r\n"),
    }

    message
}

/// Answer an offer: accept every media description with a local port and
/// `recvonly` direction, echoing the labels.
pub fn answer_for_offer(offer: &str) -> String {
    let offer = RecordingSdp::parse(&BytesStr::from(offer.to_string())).expect("offer must parse");

    let mut answer = offer;

    for (i, media) in answer.media.iter_mut().enumerate() {
        let port = 20000 + (i as u16) * 2;

        match media {
            RecordedMedia::Rtp(desc) => {
                desc.media.port = port;
                desc.direction = Direction::RecvOnly;
                desc.crypto.clear();
                desc.fingerprint.clear();
                desc.setup = None;
            }
            RecordedMedia::Msrp(desc) => {
                desc.port = port;
                desc.direction = Direction::RecvOnly;
            }
        }
    }

    answer.to_string()
}

/// Extract the SDP part of a multipart INVITE body.
pub fn sdp_part(body: &str) -> Option<String> {
    let marker = "Content-Type: application/sdp\r\n\r\n";
    let start = body.find(marker)? + marker.len();
    let rest = &body[start..];
    let end = rest.find("\r\n--").unwrap_or(rest.len());

    Some(rest[..end].to_string())
}

pub struct FakeSrs {
    pub addr: SocketAddr,
    socket: Arc<UdpSocket>,
    requests: Arc<Mutex<Vec<ParsedRequest>>>,
    responses: Arc<Mutex<Vec<String>>>,
    request_rx: mpsc::UnboundedReceiver<ParsedRequest>,
    answer_options: Arc<AtomicBool>,
    answer_invites: Arc<AtomicBool>,
    invites: Arc<Mutex<HashMap<String, ParsedRequest>>>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
}

impl FakeSrs {
    pub async fn spawn() -> FakeSrs {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();

        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let srs = FakeSrs {
            addr,
            socket: socket.clone(),
            requests: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(Vec::new())),
            request_rx,
            answer_options: Arc::new(AtomicBool::new(true)),
            answer_invites: Arc::new(AtomicBool::new(true)),
            invites: Arc::new(Mutex::new(HashMap::new())),
            peer: Arc::new(Mutex::new(None)),
        };

        let requests = srs.requests.clone();
        let responses = srs.responses.clone();
        let answer_options = srs.answer_options.clone();
        let answer_invites = srs.answer_invites.clone();
        let invites = srs.invites.clone();
        let peer = srs.peer.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            loop {
                let Ok((len, source)) = socket.recv_from(&mut buf).await else {
                    return;
                };

                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    continue;
                };

                *peer.lock().unwrap() = Some(source);

                let Some(request) = parse_message(text) else {
                    responses.lock().unwrap().push(text.to_string());
                    continue;
                };

                requests.lock().unwrap().push(request.clone());

                let reply = match request.method.as_str() {
                    "OPTIONS" => answer_options
                        .load(Ordering::SeqCst)
                        .then(|| build_response(200, "OK", &request, None)),
                    "INVITE" => {
                        invites
                            .lock()
                            .unwrap()
                            .insert(request.call_id.clone(), request.clone());

                        answer_invites.load(Ordering::SeqCst).then(|| {
                            let offer = sdp_part(&request.body).expect("INVITE without SDP part");
                            build_response(200, "OK", &request, Some(&answer_for_offer(&offer)))
                        })
                    }
                    "CANCEL" => {
                        // answer the CANCEL, then reject the INVITE
                        let cancel_ok = build_response(200, "OK", &request, None);
                        let _ = socket.send_to(cancel_ok.as_bytes(), source).await;

                        let invite = invites.lock().unwrap().get(&request.call_id).cloned();

                        invite.map(|invite| {
                            build_response(487, "Request Terminated", &invite, None)
                        })
                    }
                    "BYE" => Some(build_response(200, "OK", &request, None)),
                    _ => None,
                };

                if let Some(reply) = reply {
                    let _ = socket.send_to(reply.as_bytes(), source).await;
                }

                let _ = request_tx.send(request);
            }
        });

        srs
    }

    pub fn set_answer_options(&self, answer: bool) {
        self.answer_options.store(answer, Ordering::SeqCst);
    }

    pub fn set_answer_invites(&self, answer: bool) {
        self.answer_invites.store(answer, Ordering::SeqCst);
    }

    /// Wait for the next request of the given method, skipping others.
    pub async fn expect_request(&mut self, method: &str) -> ParsedRequest {
        timeout(TIMEOUT, async {
            loop {
                let request = self.request_rx.recv().await.expect("fake SRS is gone");

                if request.method == method {
                    return request;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {method} received"))
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.method == method)
            .count()
    }

    pub fn responses(&self) -> Vec<String> {
        self.responses.lock().unwrap().clone()
    }

    /// Terminate a recorded call from the SRS side.
    pub async fn send_bye(&self, call_id: &str) {
        let invite = self
            .invites
            .lock()
            .unwrap()
            .get(call_id)
            .cloned()
            .expect("no INVITE for this call");

        let peer = self.peer.lock().unwrap().expect("no peer yet");

        let to = if invite.to.contains("tag=") {
            invite.to.clone()
        } else {
            format!("{};tag=srs-tag", invite.to)
        };

        let message = format!(
            "BYE sip:rec@{peer} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKsrsbye{call_id}\r\n\
             Max-Forwards: 70\r\n\
             From: {to}\r\n\
             To: {}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 BYE\r\n\
             Content-Length: 0\r\n\r\n",
            self.addr.port(),
            invite.from,
        );

        self.socket.send_to(message.as_bytes(), peer).await.unwrap();
    }
}

impl FakeSrs {
    /// A BYE for a Call-ID this client never recorded.
    pub async fn send_stray_bye(&self) {
        let peer = self.peer.lock().unwrap().expect("no peer yet");

        let message = format!(
            "BYE sip:rec@{peer} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKstray\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:srs@127.0.0.1>;tag=stray\r\n\
             To: <sip:rec@127.0.0.1>\r\n\
             Call-ID: not-a-recorded-call\r\n\
             CSeq: 1 BYE\r\n\
             Content-Length: 0\r\n\r\n",
            self.addr.port(),
        );

        self.socket.send_to(message.as_bytes(), peer).await.unwrap();
    }
}

pub struct FakeRtpChannel {
    pub received: broadcast::Sender<MediaPacket>,
    pub sent: broadcast::Sender<MediaPacket>,
}

impl FakeRtpChannel {
    pub fn new() -> Arc<FakeRtpChannel> {
        Arc::new(FakeRtpChannel {
            received: broadcast::channel(64).0,
            sent: broadcast::channel(64).0,
        })
    }
}

impl RtpChannel for FakeRtpChannel {
    fn received_packets(&self) -> broadcast::Receiver<MediaPacket> {
        self.received.subscribe()
    }

    fn sent_packets(&self) -> broadcast::Receiver<MediaPacket> {
        self.sent.subscribe()
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub packets: Mutex<Vec<MediaPacket>>,
    pub shutdowns: AtomicUsize,
}

impl RecordingSink for FakeSink {
    fn send(&self, packet: MediaPacket) {
        self.packets.lock().unwrap().push(packet);
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates [`FakeSink`]s, indexed by the label of the answered media.
#[derive(Default)]
pub struct FakeMedia {
    sinks: Mutex<HashMap<u16, Arc<FakeSink>>>,
}

impl FakeMedia {
    pub fn sink(&self, label: u16) -> Option<Arc<FakeSink>> {
        self.sinks.lock().unwrap().get(&label).cloned()
    }

    fn register(&self, label: u16) -> Arc<FakeSink> {
        let sink = Arc::new(FakeSink::default());
        self.sinks.lock().unwrap().insert(label, sink.clone());
        sink
    }
}

fn attribute_label(attributes: &[sdp_types::UnknownAttribute]) -> u16 {
    attributes
        .iter()
        .find(|attr| attr.name == "label")
        .and_then(|attr| attr.value.as_ref())
        .and_then(|value| value.as_str().parse().ok())
        .unwrap_or(0)
}

impl MediaSessionFactory for FakeMedia {
    fn create_rtp_sink(
        &self,
        _local_port: u16,
        answer: &MediaDescription,
    ) -> Result<Arc<dyn RecordingSink>, SinkError> {
        Ok(self.register(attribute_label(&answer.attributes)))
    }

    fn create_msrp_sink(
        &self,
        _local_port: u16,
        answer: &MsrpDescription,
    ) -> Result<Arc<dyn RecordingSink>, SinkError> {
        Ok(self.register(attribute_label(&answer.attributes)))
    }
}

pub struct CountingPorts {
    next: AtomicU16,
    pub allocated: Mutex<Vec<u16>>,
    pub released: Mutex<Vec<u16>>,
}

impl CountingPorts {
    pub fn new() -> CountingPorts {
        CountingPorts {
            next: AtomicU16::new(50000),
            allocated: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Ports allocated but not yet released.
    pub fn outstanding(&self) -> usize {
        self.allocated.lock().unwrap().len() - self.released.lock().unwrap().len()
    }
}

impl MediaPortManager for CountingPorts {
    fn allocate(&self, _kind: MediaKind) -> u16 {
        let port = self.next.fetch_add(2, Ordering::SeqCst);
        self.allocated.lock().unwrap().push(port);
        port
    }

    fn release(&self, port: u16) {
        self.released.lock().unwrap().push(port);
    }
}

pub struct FixedCertificate;

impl CertificateStore for FixedCertificate {
    fn fingerprint(&self) -> sdp_types::Fingerprint {
        sdp_types::Fingerprint {
            algorithm: sdp_types::FingerprintAlgorithm::SHA256,
            fingerprint: vec![0xab; 32],
        }
    }
}

pub struct ForwardingLog {
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl EventLogClient for ForwardingLog {
    fn log(&self, event: LogEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct TestEnv {
    pub agent: RecorderAgent,
    pub srs: FakeSrs,
    pub events: mpsc::UnboundedReceiver<LogEvent>,
    pub media: Arc<FakeMedia>,
    pub ports: Arc<CountingPorts>,
}

pub async fn start_agent(
    enable_options: bool,
    options_interval_secs: u64,
    srs_answers_options: bool,
) -> TestEnv {
    let _ = env_logger::builder().is_test(true).try_init();

    let srs = FakeSrs::spawn().await;
    srs.set_answer_options(srs_answers_options);

    let (tx, events) = mpsc::unbounded_channel();

    let media = Arc::new(FakeMedia::default());
    let ports = Arc::new(CountingPorts::new());

    let services = RecorderServices {
        media: media.clone(),
        ports: ports.clone(),
        certificates: Arc::new(FixedCertificate),
        event_log: Arc::new(ForwardingLog { tx }),
        identity: LogIdentity {
            element_id: "psap.example".into(),
            agency_id: "agency.example".into(),
            agent_id: "agent42".into(),
        },
    };

    let config = RecorderConfig {
        name: "rec1".into(),
        enabled: true,
        transport: SipTransport::Udp,
        local_addr: "127.0.0.1:0".parse().unwrap(),
        srs_addr: srs.addr,
        rtp_encryption: RtpEncryption::None,
        msrp_encryption: MsrpEncryption::None,
        enable_options,
        options_interval_secs,
    };

    let agent = RecorderAgent::new(config, services);
    agent.start().await.expect("failed to start recorder");

    TestEnv {
        agent,
        srs,
        events,
        media,
        ports,
    }
}

pub fn call_params(
    call_id: &str,
    sdp: &str,
    rtp_channels: Vec<Arc<dyn RtpChannel>>,
) -> CallParameters {
    CallParameters {
        call_id: BytesStr::from(call_id.to_string()),
        from: "sip:alice@example.com".parse().unwrap(),
        to: "sip:bob@example.com".parse().unwrap(),
        emergency_call_id: None,
        emergency_incident_id: None,
        answered_sdp: RecordingSdp::parse(&BytesStr::from(sdp.to_string())).unwrap(),
        rtp_channels,
        msrp_connection: None,
    }
}

pub fn packet() -> MediaPacket {
    MediaPacket {
        payload: bytes::Bytes::from_static(b"media"),
    }
}

/// Keep sending packets until the leg with `label` reports its first
/// forwarded packet. Bridges subscribe on the agent task, so a packet sent
/// right after renegotiation may precede the subscription.
pub async fn media_start_after_send(
    sender: &broadcast::Sender<MediaPacket>,
    events: &mut mpsc::UnboundedReceiver<LogEvent>,
    label: u16,
) {
    timeout(TIMEOUT, async {
        loop {
            let _ = sender.send(packet());

            match timeout(Duration::from_millis(100), events.recv()).await {
                Ok(Some(event)) => {
                    if matches!(
                        event.kind,
                        LogEventKind::RecMediaStart { media_label } if media_label == label
                    ) {
                        return;
                    }
                }
                Ok(None) => panic!("event log is gone"),
                Err(_) => {}
            }
        }
    })
    .await
    .expect("media start was not observed");
}

/// Wait for the next log event matching the predicate, skipping others.
pub async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<LogEvent>,
    pred: impl Fn(&LogEventKind) -> bool,
) -> LogEvent {
    timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event log is gone");

            if pred(&event.kind) {
                return event;
            }
        }
    })
    .await
    .expect("expected log event was not emitted")
}
