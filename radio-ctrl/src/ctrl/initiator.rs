//! Initiator side: the reliable delivery engine.
//!
//! The medium gives no delivery guarantee and the responder's channel is not
//! known a priori, so every bind or control send runs the same loop: try the
//! last channel that worked, retransmit with backoff until the per-channel
//! budget is spent, then search the rest of the regulatory domain the same
//! way. The first acknowledgment ends the search and its channel becomes the
//! new hint. The whole sequence holds the node's channel lock; one delivery
//! is in flight at a time, process-wide.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::device::frame::{FrameHeader, FrameKind, Packet, RETRANSMIT_MAX};
use crate::device::transport::Transport;
use crate::error::CtrlError;
use crate::storage::Storage;
use crate::ADDR_BROADCAST;

use super::message::{ControlMessage, ControlValue};
use super::node::Shared;
use super::Attribute;

/// Channel tried first when no delivery ever succeeded.
pub const DEFAULT_CHANNEL: u8 = 1;

/// Storage key under which the last-known-good channel is persisted.
pub const CHANNEL_HINT_KEY: &str = "ctrl_channel";

/// Hop budget granted to relays for control traffic.
const INITIATOR_FORWARD_TTL: u8 = 10;
/// Relays hearing us below this strength leave the frame alone.
const INITIATOR_FORWARD_RSSI: i8 = -25;

/// Granularity of the optional power-save pause between attempts.
const SEND_DELAY_UNIT: Duration = Duration::from_millis(2);

/// Delivery progresses through these states; the sleep between retries is a
/// hook, not control flow, and never changes the transition sequence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DeliveryState {
    Sending,
    AwaitingAck,
    Retrying,
    ChannelSearch,
    Done,
    Failed,
}

/// Sending half of a protocol node.
///
/// Obtained from [super::Node::initiator]; the node's poll loop must keep
/// running while a delivery is in flight, it is what feeds acknowledgments
/// back to the engine.
pub struct Initiator<T: Transport, S: Storage> {
    shared: Arc<Shared<T>>,
    storage: Arc<S>,
}

impl<T: Transport, S: Storage> Initiator<T, S> {
    pub(crate) fn new(shared: Arc<Shared<T>>, storage: Arc<S>) -> Self {
        Initiator { shared, storage }
    }

    /// Asks responders in range to add (`enable = true`) or drop
    /// (`enable = false`) a binding for the given initiator attribute.
    ///
    /// Succeeds once any receiver acknowledged the frame; whether a bind was
    /// actually accepted is reported on the responder as an event, never
    /// here. Bind requests carry no relay budget: pairing is meant to happen
    /// in person, judged by the responder on the direct signal.
    pub fn bind(&self, attribute: Attribute, enable: bool) -> Result<(), CtrlError<T::Error>> {
        let message = ControlMessage::new(attribute, 0, ControlValue::Bool(enable));
        self.deliver(FrameKind::Bind, &message)
    }

    /// Delivers a control message to bound responders.
    pub fn send_control(
        &self,
        initiator_attribute: Attribute,
        responder_attribute: Attribute,
        value: ControlValue,
    ) -> Result<(), CtrlError<T::Error>> {
        let message = ControlMessage::new(initiator_attribute, responder_attribute, value);
        self.deliver(FrameKind::ControlData, &message)
    }

    fn deliver(&self, kind: FrameKind, message: &ControlMessage) -> Result<(), CtrlError<T::Error>> {
        let payload = message.to_bytes()?;
        let (payload, secured) = self.shared.seal(kind, payload)?;

        let wait = self.shared.config.send_max_timeout;
        let deadline = Instant::now() + wait;
        let Some(_guard) = self.shared.send_lock.acquire(wait) else {
            return Err(CtrlError::Timeout);
        };
        let primary = self
            .shared
            .transport
            .channel()
            .map_err(CtrlError::Transport)?;

        let channels = self.search_order();
        if channels.is_empty() {
            return Err(CtrlError::InvalidArgument {
                context: "transport advertises an empty channel domain".to_owned(),
            });
        }
        let result = self.drive(kind, &payload, secured, &channels, deadline);
        self.shared.ack_waiter.disarm();

        if let Err(err) = self.shared.transport.set_channel(primary) {
            warn!("could not park the radio back on channel {}: {:?}", primary, err);
        }

        let channel = result?;
        if let Err(err) = self.storage.set(CHANNEL_HINT_KEY, &[channel]) {
            warn!("could not persist channel hint: {}", err);
        }
        debug!("delivery acknowledged on channel {}", channel);
        Ok(())
    }

    /// The state machine proper. Returns the channel the delivery was
    /// acknowledged on.
    fn drive(
        &self,
        kind: FrameKind,
        payload: &[u8],
        secured: bool,
        channels: &[u8],
        deadline: Instant,
    ) -> Result<u8, CtrlError<T::Error>> {
        let transport = &self.shared.transport;
        let config = &self.shared.config;
        let retry_budget = config.send_retry_num.clamp(1, RETRANSMIT_MAX);

        let mut channel_idx = 0usize;
        let mut count: u8 = 0;
        let mut magic = fresh_magic();
        transport
            .set_channel(channels[channel_idx])
            .map_err(CtrlError::Transport)?;

        let mut state = DeliveryState::Sending;
        loop {
            state = match state {
                DeliveryState::Sending => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        DeliveryState::Failed
                    } else {
                        let packet = self.build_packet(
                            kind,
                            channels[channel_idx],
                            magic,
                            secured,
                            retry_budget,
                            payload,
                        );
                        let bytes = packet.to_bytes()?;
                        self.shared.ack_waiter.arm(magic);
                        transport
                            .send(&ADDR_BROADCAST, &bytes, remaining)
                            .map_err(CtrlError::Transport)?;
                        trace!(
                            "sent {:?} 0x{:04x} on channel {}, attempt {}",
                            kind,
                            magic,
                            channels[channel_idx],
                            count + 1
                        );
                        DeliveryState::AwaitingAck
                    }
                }
                DeliveryState::AwaitingAck => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if self.shared.ack_waiter.wait(ack_backoff(count).min(remaining)) {
                        DeliveryState::Done
                    } else {
                        DeliveryState::Retrying
                    }
                }
                DeliveryState::Retrying => {
                    count += 1;
                    if count < retry_budget {
                        if let Some(pause) = &config.power_save {
                            pause(SEND_DELAY_UNIT);
                        }
                        DeliveryState::Sending
                    } else {
                        DeliveryState::ChannelSearch
                    }
                }
                DeliveryState::ChannelSearch => {
                    channel_idx += 1;
                    if channel_idx >= channels.len() {
                        DeliveryState::Failed
                    } else {
                        count = 0;
                        magic = fresh_magic();
                        transport
                            .set_channel(channels[channel_idx])
                            .map_err(CtrlError::Transport)?;
                        debug!("no acknowledgment, searching channel {}", channels[channel_idx]);
                        DeliveryState::Sending
                    }
                }
                DeliveryState::Done => return Ok(channels[channel_idx]),
                DeliveryState::Failed => {
                    debug!("delivery failed, {} channels exhausted", channels.len());
                    return Err(CtrlError::Timeout);
                }
            };
        }
    }

    fn build_packet(
        &self,
        kind: FrameKind,
        channel: u8,
        magic: u16,
        secured: bool,
        retry_budget: u8,
        payload: &[u8],
    ) -> Packet {
        Packet {
            kind,
            header: FrameHeader {
                magic,
                channel,
                broadcast: true,
                ack: true,
                security: secured,
                retransmit_count: retry_budget,
                forward_ttl: if kind == FrameKind::Bind {
                    0
                } else {
                    INITIATOR_FORWARD_TTL
                },
                forward_rssi: INITIATOR_FORWARD_RSSI,
                ..FrameHeader::default()
            },
            dest: ADDR_BROADCAST,
            src: self.shared.self_addr,
            payload: payload.to_vec(),
        }
    }

    /// Channels in the order the search will try them: the persisted
    /// last-known-good channel first, then the rest of the domain.
    fn search_order(&self) -> Vec<u8> {
        let domain = self.shared.transport.channel_domain();
        let stored = match self.storage.get(CHANNEL_HINT_KEY) {
            Ok(bytes) => bytes.and_then(|b| b.first().copied()),
            Err(err) => {
                warn!("could not read channel hint: {}", err);
                None
            }
        };
        let hint = stored.unwrap_or(DEFAULT_CHANNEL);
        let mut channels = Vec::with_capacity(domain.len() + 1);
        if domain.contains(&hint) {
            channels.push(hint);
        }
        for channel in domain {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        channels
    }
}

fn fresh_magic() -> u16 {
    loop {
        let magic: u16 = rand::random();
        if magic != 0 {
            return magic;
        }
    }
}

/// Retry backoff: 2, 4, 8, 16, 32, 64 then 100 milliseconds.
fn ack_backoff(count: u8) -> Duration {
    let units: u64 = if count < 6 { 1 << count } else { 50 };
    SEND_DELAY_UNIT * (units as u32)
}
