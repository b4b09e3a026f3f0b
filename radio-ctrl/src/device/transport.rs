//! Abstraction over the raw radio primitive.
//!
//! The primitive is assumed to be connectionless and unreliable: it can
//! broadcast a frame of bytes and hand back received frames together with
//! signal metadata, nothing more. Retries, pairing and confidentiality are
//! all built above this trait.

use std::fmt::Debug;
use std::time::Duration;

use crate::RadioAddress;

/// Radio metadata attached to every received frame.
#[derive(Copy, Clone, Debug)]
pub struct RxMetadata {
    /// Received signal strength, used as a proximity proxy.
    pub rssi: i8,
    /// Channel the frame was picked up on.
    pub channel: u8,
}

/// Raw transmit/receive primitive with a single, global channel register.
///
/// Implementations are shared between the send and receive paths, so all
/// methods take `&self` and the implementation is responsible for its own
/// synchronization. Switching channels affects every concurrent operation;
/// callers serialize channel changes through the protocol's channel lock.
pub trait Transport: Send + Sync {
    type Error: Debug;

    /// Our own address as seen by peers.
    fn address(&self) -> RadioAddress;

    /// Channel the radio is currently parked on.
    fn channel(&self) -> Result<u8, Self::Error>;

    /// Parks the radio on the given channel for transmit and receive alike.
    fn set_channel(&self, channel: u8) -> Result<(), Self::Error>;

    /// Channels allowed by the local regulatory domain.
    fn channel_domain(&self) -> Vec<u8>;

    /// Transmits a frame on the current channel. `dest` may be the broadcast
    /// sentinel; the medium itself gives no delivery guarantee either way.
    fn send(&self, dest: &RadioAddress, frame: &[u8], timeout: Duration) -> Result<(), Self::Error>;

    /// Blocks for the next frame on the current channel. Returns `None` when
    /// the timeout elapses without traffic.
    fn recv(&self, timeout: Duration) -> Result<Option<(Vec<u8>, RxMetadata)>, Self::Error>;
}
