//! In-process broadcast medium.
//!
//! Wires any number of endpoints into a shared ether: a transmitted frame
//! reaches every other endpoint parked on the transmit channel, stamped with
//! that endpoint's configured receive signal strength. Used by the test
//! suite and the demo client in place of a physical radio.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::transport::{RxMetadata, Transport};
use crate::RadioAddress;

/// Default receive signal strength of a fresh endpoint.
pub const DEFAULT_RSSI: i8 = -40;

/// Channels 1 through 11, a typical regulatory domain.
pub const DEFAULT_DOMAIN: [u8; 11] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

struct Endpoint {
    address: RadioAddress,
    channel: Arc<AtomicU8>,
    rssi: i8,
    queue: mpsc::Sender<(Vec<u8>, RxMetadata)>,
}

/// The shared ether between all endpoints.
pub struct LoopbackBus {
    endpoints: Mutex<Vec<Endpoint>>,
    tx_count: AtomicUsize,
}

impl LoopbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackBus {
            endpoints: Mutex::new(Vec::new()),
            tx_count: AtomicUsize::new(0),
        })
    }

    /// Attaches a new radio to the bus, parked on the first domain channel.
    pub fn endpoint(self: &Arc<Self>, address: RadioAddress) -> LoopbackRadio {
        self.endpoint_with_domain(address, DEFAULT_DOMAIN.to_vec())
    }

    pub fn endpoint_with_domain(
        self: &Arc<Self>,
        address: RadioAddress,
        domain: Vec<u8>,
    ) -> LoopbackRadio {
        assert!(!domain.is_empty(), "no channel declared!");
        let (tx, rx) = mpsc::channel();
        let channel = Arc::new(AtomicU8::new(domain[0]));
        self.endpoints.lock().push(Endpoint {
            address,
            channel: Arc::clone(&channel),
            rssi: DEFAULT_RSSI,
            queue: tx,
        });
        LoopbackRadio {
            bus: Arc::clone(self),
            address,
            channel,
            domain,
            rx: Mutex::new(rx),
        }
    }

    /// Signal strength stamped onto frames arriving at `address`.
    pub fn set_rssi(&self, address: &RadioAddress, rssi: i8) {
        for ep in self.endpoints.lock().iter_mut() {
            if ep.address == *address {
                ep.rssi = rssi;
            }
        }
    }

    /// Total number of frames ever put on the air, across all endpoints.
    pub fn tx_count(&self) -> usize {
        self.tx_count.load(Ordering::SeqCst)
    }
}

/// One endpoint of a [LoopbackBus].
pub struct LoopbackRadio {
    bus: Arc<LoopbackBus>,
    address: RadioAddress,
    channel: Arc<AtomicU8>,
    domain: Vec<u8>,
    rx: Mutex<mpsc::Receiver<(Vec<u8>, RxMetadata)>>,
}

#[derive(thiserror::Error, Debug)]
pub enum LoopbackError {
    #[error("channel {channel} is outside the regulatory domain")]
    InvalidChannel { channel: u8 },

    #[error("loopback bus is gone")]
    Closed,
}

impl Transport for LoopbackRadio {
    type Error = LoopbackError;

    fn address(&self) -> RadioAddress {
        self.address
    }

    fn channel(&self) -> Result<u8, Self::Error> {
        Ok(self.channel.load(Ordering::SeqCst))
    }

    fn set_channel(&self, channel: u8) -> Result<(), Self::Error> {
        if !self.domain.contains(&channel) {
            return Err(LoopbackError::InvalidChannel { channel });
        }
        self.channel.store(channel, Ordering::SeqCst);
        Ok(())
    }

    fn channel_domain(&self) -> Vec<u8> {
        self.domain.clone()
    }

    fn send(&self, _dest: &RadioAddress, frame: &[u8], _timeout: Duration) -> Result<(), Self::Error> {
        // The medium is broadcast by nature: destination filtering happens in
        // the protocol layer, every endpoint on the channel hears the frame.
        let channel = self.channel.load(Ordering::SeqCst);
        self.bus.tx_count.fetch_add(1, Ordering::SeqCst);
        for ep in self.bus.endpoints.lock().iter() {
            if ep.address == self.address || ep.channel.load(Ordering::SeqCst) != channel {
                continue;
            }
            let meta = RxMetadata {
                rssi: ep.rssi,
                channel,
            };
            // A receiver that went away is indistinguishable from radio
            // silence, so a failed push is simply dropped.
            let _ = ep.queue.send((frame.to_vec(), meta));
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<(Vec<u8>, RxMetadata)>, Self::Error> {
        let rx = self.rx.lock();
        match rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(LoopbackError::Closed),
        }
    }
}
