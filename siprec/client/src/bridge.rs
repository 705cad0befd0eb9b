//! Forwards media of the recorded call onto the legs towards one SRS.

use crate::event::{CallEventContext, EventLogClient, LogEvent, LogEventKind};
use crate::label::{MediaKind, MediaLabel};
use crate::media::{MediaPacket, MsrpConnection, RecordingSink, RtpChannel};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// The media legs of one recorded call towards one SRS.
///
/// Holds at most one leg per media label. Each leg subscribes to the
/// matching packet event of the original call's channel and forwards a
/// copy of every packet onto its sink; the original channels stay owned by
/// the call's media engine and are never shut down from here.
pub struct MediaBridge {
    event_log: Arc<dyn EventLogClient>,
    context: CallEventContext,
    legs: HashMap<MediaLabel, Leg>,
    shut_down: bool,
}

struct Leg {
    sink: Arc<dyn RecordingSink>,

    /// Set once the first packet was forwarded; survives re-hooking.
    started: Arc<AtomicBool>,

    forward: JoinHandle<()>,
}

impl MediaBridge {
    pub fn new(event_log: Arc<dyn EventLogClient>, context: CallEventContext) -> Self {
        MediaBridge {
            event_log,
            context,
            legs: HashMap::new(),
            shut_down: false,
        }
    }

    /// Attach the leg for `label`, fed from the matching packet event of
    /// `channel`.
    pub fn attach_rtp_leg(
        &mut self,
        label: MediaLabel,
        channel: &Arc<dyn RtpChannel>,
        sink: Arc<dyn RecordingSink>,
    ) {
        self.attach(label, rtp_packets(label, channel), sink);
    }

    pub fn attach_msrp_leg(
        &mut self,
        label: MediaLabel,
        connection: &Arc<dyn MsrpConnection>,
        sink: Arc<dyn RecordingSink>,
    ) {
        self.attach(label, msrp_packets(label, connection), sink);
    }

    fn attach(
        &mut self,
        label: MediaLabel,
        packets: broadcast::Receiver<MediaPacket>,
        sink: Arc<dyn RecordingSink>,
    ) {
        if self.legs.contains_key(&label) {
            log::warn!("media leg {label} is already attached, ignoring");
            return;
        }

        let started = Arc::new(AtomicBool::new(false));

        let forward = spawn_forward(
            label,
            packets,
            sink.clone(),
            started.clone(),
            self.event_log.clone(),
            self.context.clone(),
        );

        self.legs.insert(
            label,
            Leg {
                sink,
                started,
                forward,
            },
        );
    }

    /// Re-subscribe the RTP legs of `kind` to a replacement channel.
    ///
    /// Every leg keeps its own label, so the received leg is always fed
    /// from the channel's received-packet event and the sent leg from the
    /// sent-packet event.
    pub fn rehook_rtp(&mut self, kind: MediaKind, channel: &Arc<dyn RtpChannel>) {
        for label in [kind.received_label(), kind.sent_label()] {
            self.rehook(label, rtp_packets(label, channel));
        }
    }

    pub fn rehook_msrp(&mut self, connection: &Arc<dyn MsrpConnection>) {
        let (received, sent) = MediaKind::Msrp.labels();

        for label in [received, sent] {
            self.rehook(label, msrp_packets(label, connection));
        }
    }

    fn rehook(&mut self, label: MediaLabel, packets: broadcast::Receiver<MediaPacket>) {
        let Some(leg) = self.legs.get_mut(&label) else {
            return;
        };

        leg.forward.abort();
        leg.forward = spawn_forward(
            label,
            packets,
            leg.sink.clone(),
            leg.started.clone(),
            self.event_log.clone(),
            self.context.clone(),
        );
    }

    pub fn has_leg(&self, label: MediaLabel) -> bool {
        self.legs.contains_key(&label)
    }

    /// Unsubscribe from all original channels, shut every leg down and
    /// emit `RecMediaEnd` for each. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let mut labels: Vec<MediaLabel> = self.legs.keys().copied().collect();
        labels.sort_unstable();

        for label in labels {
            let leg = self.legs.remove(&label).expect("label was just collected");

            leg.forward.abort();
            leg.sink.shutdown();

            self.event_log.log(LogEvent::new(
                LogEventKind::RecMediaEnd {
                    media_label: label.value(),
                },
                &self.context,
            ));
        }
    }
}

impl Drop for MediaBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn rtp_packets(
    label: MediaLabel,
    channel: &Arc<dyn RtpChannel>,
) -> broadcast::Receiver<MediaPacket> {
    if label.is_received() {
        channel.received_packets()
    } else {
        channel.sent_packets()
    }
}

fn msrp_packets(
    label: MediaLabel,
    connection: &Arc<dyn MsrpConnection>,
) -> broadcast::Receiver<MediaPacket> {
    if label.is_received() {
        connection.received_messages()
    } else {
        connection.sent_messages()
    }
}

fn spawn_forward(
    label: MediaLabel,
    mut packets: broadcast::Receiver<MediaPacket>,
    sink: Arc<dyn RecordingSink>,
    started: Arc<AtomicBool>,
    event_log: Arc<dyn EventLogClient>,
    context: CallEventContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match packets.recv().await {
                Ok(packet) => {
                    if !started.swap(true, Ordering::Relaxed) {
                        event_log.log(LogEvent::new(
                            LogEventKind::RecMediaStart {
                                media_label: label.value(),
                            },
                            &context,
                        ));
                    }

                    sink.send(packet);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("media leg {label} lagged, {missed} packets not mirrored");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
