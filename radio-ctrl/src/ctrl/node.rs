//! A protocol node: receive dispatch and the state shared with the
//! initiator engine and the relay.
//!
//! The node does not own a task; the application drives it by calling
//! [Node::poll] from a dedicated loop while other threads use the
//! [Initiator] handle. All state behind the node is mutex-guarded, and the
//! radio channel register is protected by a single acquire-with-timeout lock
//! so that the engine's channel search, the relay's flood and ack sweeps
//! never interleave their channel switches.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::device::frame::{FrameKind, Packet, CHANNEL_ALL};
use crate::device::transport::{RxMetadata, Transport};
use crate::error::CtrlError;
use crate::security::{SecureChannel, APP_KEY_LEN};
use crate::storage::Storage;
use crate::{format_addr, is_broadcast, RadioAddress};

use super::bindlist::BindEntry;
use super::initiator::Initiator;
use super::message::ControlMessage;
use super::relay;
use super::responder::Responder;
use super::{BindPredicate, CtrlEvent, EventSink};

/// Number of (kind, magic) pairs remembered for duplicate suppression.
const DEDUP_CACHE: usize = 32;

/// Storage key under which the session key is persisted.
pub const KEY_INFO_KEY: &str = "key_info";

/// Node-wide configuration. The defaults match deployed devices.
pub struct NodeConfig {
    /// Re-broadcast received frames that ask for forwarding.
    pub forward_enable: bool,
    /// Sweep all domain channels when forwarding, instead of staying on the
    /// channel the frame arrived on.
    pub forward_switch_channel: bool,
    /// Per-channel retransmission budget of the delivery engine.
    pub send_retry_num: u8,
    /// Upper bound on how long any single send operation may take.
    pub send_max_timeout: Duration,
    /// Encrypt outbound payloads and accept encrypted inbound ones.
    pub sec_enable: bool,
    /// Optional low-power wait invoked between unsuccessful delivery
    /// attempts. Purely a power optimization; delivery semantics do not
    /// depend on it.
    pub power_save: Option<Arc<dyn Fn(Duration) + Send + Sync>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            forward_enable: true,
            forward_switch_channel: true,
            send_retry_num: 10,
            send_max_timeout: Duration::from_secs(3),
            sec_enable: false,
            power_save: None,
        }
    }
}

/// Exclusive, time-bounded ownership of the radio channel register.
pub(crate) struct SendLock {
    busy: Mutex<bool>,
    freed: Condvar,
}

impl SendLock {
    pub(crate) fn new() -> Self {
        SendLock {
            busy: Mutex::new(false),
            freed: Condvar::new(),
        }
    }

    /// Takes the lock, giving up after `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Option<SendGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.lock();
        while *busy {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.freed.wait_for(&mut busy, remaining).timed_out() {
                if !*busy {
                    break;
                }
                return None;
            }
        }
        *busy = true;
        Some(SendGuard { lock: self })
    }
}

pub(crate) struct SendGuard<'a> {
    lock: &'a SendLock,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        *self.lock.busy.lock() = false;
        self.lock.freed.notify_one();
    }
}

struct AckSlot {
    armed: Option<u16>,
    acked: bool,
}

/// Single-slot rendezvous between the delivery engine and the receive path.
/// Only one delivery may be in flight per process, so one slot is enough.
pub(crate) struct AckWaiter {
    slot: Mutex<AckSlot>,
    signal: Condvar,
}

impl AckWaiter {
    pub(crate) fn new() -> Self {
        AckWaiter {
            slot: Mutex::new(AckSlot {
                armed: None,
                acked: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Arms the waiter for the given magic, clearing any stale state.
    pub fn arm(&self, magic: u16) {
        let mut slot = self.slot.lock();
        if slot.armed != Some(magic) {
            slot.armed = Some(magic);
            slot.acked = false;
        }
    }

    pub fn disarm(&self) {
        let mut slot = self.slot.lock();
        slot.armed = None;
        slot.acked = false;
    }

    /// Called from the receive path on every inbound acknowledgment.
    pub fn complete(&self, magic: u16) -> bool {
        let mut slot = self.slot.lock();
        if slot.armed == Some(magic) {
            slot.acked = true;
            self.signal.notify_all();
            true
        } else {
            false
        }
    }

    /// Blocks until the armed magic is acknowledged or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while !slot.acked {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return slot.acked;
            }
            self.signal.wait_for(&mut slot, remaining);
        }
        true
    }
}

/// State shared between the node's receive path, the initiator engine and
/// the relay.
pub(crate) struct Shared<T: Transport> {
    pub transport: T,
    pub self_addr: RadioAddress,
    pub config: NodeConfig,
    pub send_lock: SendLock,
    pub ack_waiter: AckWaiter,
    pub security: Mutex<SecureChannel>,
}

impl<T: Transport> Shared<T> {
    /// Encrypts a payload when node security applies to this frame kind.
    /// Returns the payload to put on the wire and whether it was sealed.
    pub fn seal(&self, kind: FrameKind, payload: Vec<u8>) -> Result<(Vec<u8>, bool), CtrlError<T::Error>> {
        if !self.config.sec_enable || kind.is_plaintext_only() {
            return Ok((payload, false));
        }
        let security = self.security.lock();
        if !security.is_ready() {
            return Err(CtrlError::Security(crate::security::SecError::NotReady));
        }
        let sealed = security.encrypt(&payload).map_err(CtrlError::Security)?;
        Ok((sealed, true))
    }
}

/// One protocol endpoint on top of a [Transport].
pub struct Node<T: Transport, S: Storage> {
    shared: Arc<Shared<T>>,
    storage: Arc<S>,
    responder: Mutex<Responder<S>>,
    dedup: Mutex<LruCache<(FrameKind, u16), ()>>,
    groups: Mutex<Vec<RadioAddress>>,
    sink: Arc<dyn EventSink>,
}

impl<T: Transport, S: Storage> Node<T, S> {
    pub fn new(transport: T, storage: Arc<S>, config: NodeConfig, sink: Arc<dyn EventSink>) -> Self {
        let self_addr = transport.address();
        Node {
            shared: Arc::new(Shared {
                self_addr,
                config,
                transport,
                send_lock: SendLock::new(),
                ack_waiter: AckWaiter::new(),
                security: Mutex::new(SecureChannel::new()),
            }),
            responder: Mutex::new(Responder::new(Arc::clone(&storage))),
            storage,
            dedup: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEDUP_CACHE).expect("cache size is nonzero"),
            )),
            groups: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// A handle for sending bind and control messages through the reliable
    /// delivery engine. The node's [Node::poll] loop must keep running for
    /// acknowledgments to be seen.
    pub fn initiator(&self) -> Initiator<T, S> {
        Initiator::new(Arc::clone(&self.shared), Arc::clone(&self.storage))
    }

    /// Opens (or replaces) the bind window during which bind requests are
    /// accepted, subject to `min_rssi` and the optional predicate.
    pub fn start_binding(
        &self,
        window: Duration,
        min_rssi: i8,
        predicate: Option<BindPredicate>,
    ) {
        self.responder.lock().open_window(window, min_rssi, predicate);
    }

    /// Installs the post-handshake session key and persists it.
    pub fn install_key(&self, app_key: &[u8; APP_KEY_LEN]) -> Result<(), CtrlError<T::Error>> {
        self.shared.security.lock().install_key(app_key);
        self.storage
            .set(KEY_INFO_KEY, app_key)
            .map_err(CtrlError::Persistence)
    }

    /// Re-installs a previously persisted session key, if any.
    pub fn load_key(&self) -> Result<bool, CtrlError<T::Error>> {
        let Some(bytes) = self.storage.get(KEY_INFO_KEY).map_err(CtrlError::Persistence)? else {
            return Ok(false);
        };
        let Ok(app_key) = <[u8; APP_KEY_LEN]>::try_from(bytes.as_slice()) else {
            warn!("persisted session key has a bad length, ignoring it");
            return Ok(false);
        };
        self.shared.security.lock().install_key(&app_key);
        Ok(true)
    }

    pub fn list_bindings(&self, max: usize) -> Vec<BindEntry> {
        self.responder.lock().store().snapshot(max)
    }

    pub fn add_binding(&self, entry: BindEntry) -> Result<bool, CtrlError<T::Error>> {
        self.responder
            .lock()
            .store()
            .insert(entry)
            .map_err(CtrlError::Persistence)
    }

    pub fn remove_binding(&self, entry: &BindEntry) -> Result<bool, CtrlError<T::Error>> {
        self.responder
            .lock()
            .store()
            .remove(entry)
            .map_err(CtrlError::Persistence)
    }

    pub fn clear_bindings(&self) -> Result<(), CtrlError<T::Error>> {
        self.responder
            .lock()
            .store()
            .clear()
            .map_err(CtrlError::Persistence)
    }

    /// Starts accepting frames addressed to the given group address.
    pub fn join_group(&self, group: RadioAddress) {
        let mut groups = self.groups.lock();
        if !groups.contains(&group) {
            groups.push(group);
        }
    }

    pub fn leave_group(&self, group: &RadioAddress) {
        self.groups.lock().retain(|g| g != group);
    }

    pub fn in_group(&self, group: &RadioAddress) -> bool {
        self.groups.lock().contains(group)
    }

    /// Receives and dispatches at most one frame. Returns whether a frame
    /// was accepted for local processing.
    ///
    /// Run this from a dedicated loop; everything else on the node assumes
    /// somebody is polling.
    pub fn poll(&self, timeout: Duration) -> Result<bool, CtrlError<T::Error>> {
        let Some((bytes, meta)) = self
            .shared
            .transport
            .recv(timeout)
            .map_err(CtrlError::Transport)?
        else {
            return Ok(false);
        };

        let packet = match Packet::try_from_bytes(&bytes) {
            Ok((packet, _)) => packet,
            Err(err) => {
                debug!("dropping undecodable frame: {}", err);
                return Ok(false);
            }
        };

        if packet.src == self.shared.self_addr {
            return Ok(false);
        }

        let header = packet.header;
        if header.filter_adjacent_channel
            && header.channel != CHANNEL_ALL
            && header.channel != meta.channel
        {
            debug!(
                "filter adjacent channel, {} != {}",
                header.channel, meta.channel
            );
            return Ok(false);
        }
        if header.filter_weak_signal && header.forward_rssi > meta.rssi {
            debug!(
                "filter weak signal, {} > {}",
                header.forward_rssi, meta.rssi
            );
            return Ok(false);
        }
        if header.security && !self.shared.config.sec_enable {
            debug!("filter secured frame, security is disabled here");
            return Ok(false);
        }

        // Acknowledgments go out for every copy we hear, even retransmitted
        // ones, so a lost ack does not strand the sender. Deduplication only
        // guards the dispatch below. The receipt is a frame-layer concern:
        // whether the payload then clears the bind policy or the
        // authorization gate is reported through events, not acks.
        if header.ack
            && matches!(packet.kind, FrameKind::Bind | FrameKind::ControlData)
            && self.concerns_us(&packet)
        {
            self.send_ack(&packet);
        }

        let dedup_key = (packet.kind, header.magic);
        {
            let mut dedup = self.dedup.lock();
            if dedup.contains(&dedup_key) {
                trace!("duplicate frame 0x{:04x}, dropped", header.magic);
                return Ok(false);
            }
            dedup.put(dedup_key, ());
        }

        let mut accepted = false;
        let mut event = None;
        match packet.kind {
            FrameKind::Ack => {
                if packet.dest == self.shared.self_addr
                    && self.shared.ack_waiter.complete(header.magic)
                {
                    trace!("acknowledgment 0x{:04x} consumed", header.magic);
                    accepted = true;
                }
            }
            FrameKind::Bind | FrameKind::ControlData => {
                if self.concerns_us(&packet) {
                    match self.open_payload(&packet) {
                        Some(payload) => {
                            event = self.dispatch(&packet, &payload, &meta);
                            accepted = true;
                        }
                        None => {}
                    }
                }
            }
            FrameKind::Forward | FrameKind::SecurityStatus | FrameKind::SecurityHandshake => {
                // Key establishment is handled out of band; these only matter
                // to the relay below.
                trace!("frame kind {:?} left to the relay", packet.kind);
            }
        }

        if relay::should_forward(&self.shared, &packet, &meta) {
            if let Err(err) = relay::forward(&self.shared, &packet) {
                debug!("relay flood failed: {:?}", err);
            }
        }

        if let Some(event) = event {
            self.sink.notify(event);
        }
        Ok(accepted)
    }

    /// Address gate: is this frame for us, one of our groups, or everybody?
    fn concerns_us(&self, packet: &Packet) -> bool {
        if packet.header.group {
            return self.in_group(&packet.dest);
        }
        packet.dest == self.shared.self_addr || is_broadcast(&packet.dest)
    }

    /// Removes the encryption layer, if any. `None` means the payload must
    /// not be processed.
    fn open_payload(&self, packet: &Packet) -> Option<Vec<u8>> {
        if !packet.header.security {
            return Some(packet.payload.clone());
        }
        let security = self.shared.security.lock();
        if !security.is_ready() {
            warn!("secured frame but no session key is installed");
            return None;
        }
        match security.decrypt(&packet.payload) {
            Ok(plaintext) => Some(plaintext),
            Err(err) => {
                warn!(
                    "discarding frame from {}: {}",
                    format_addr(&packet.src),
                    err
                );
                None
            }
        }
    }

    fn dispatch(&self, packet: &Packet, payload: &[u8], meta: &RxMetadata) -> Option<CtrlEvent> {
        let message = match ControlMessage::try_from_bytes(payload) {
            Ok((message, _)) => message,
            Err(err) => {
                debug!("bad control payload from {}: {}", format_addr(&packet.src), err);
                return None;
            }
        };
        let mut responder = self.responder.lock();
        match packet.kind {
            FrameKind::Bind => responder.handle_bind(
                packet.src,
                message.initiator_attribute,
                message.value.as_bool(),
                meta.rssi,
            ),
            FrameKind::ControlData => responder.handle_control(packet.src, message),
            _ => None,
        }
    }

    /// Returns the acknowledgment for a received frame. The reply reuses the
    /// sender's header so the magic correlates, and sweeps all channels when
    /// the acknowledged frame was relayable, since the sender may be parked
    /// on a different channel than the one we heard the frame on.
    fn send_ack(&self, packet: &Packet) {
        let mut header = packet.header;
        header.ack = false;
        header.security = false;
        header.broadcast = true;
        header.retransmit_count = 1;
        if header.forward_ttl > 0 {
            header.channel = CHANNEL_ALL;
        }
        let ack = Packet {
            kind: FrameKind::Ack,
            header,
            dest: packet.src,
            src: self.shared.self_addr,
            payload: Vec::new(),
        };
        trace!(
            "acknowledging 0x{:04x} towards {}",
            header.magic,
            format_addr(&packet.src)
        );
        let sweep = ack.header.channel == CHANNEL_ALL;
        if let Err(err) = relay::sweep_broadcast(&self.shared, &ack, sweep) {
            debug!("acknowledgment not sent: {:?}", err);
        }
    }
}
