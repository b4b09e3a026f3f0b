//! One-hop flood relay.
//!
//! A node that hears a relayable frame re-broadcasts it once on every
//! channel of the regulatory domain and parks the radio back where it was.
//! That is enough to bridge an initiator and a responder that are not on the
//! same channel; duplicate suppression by magic keeps floods from echoing
//! between relays. The forward time-to-live is a budget for the lower
//! multi-hop layer and is left untouched here.

use log::{trace, warn};

use crate::device::frame::{Packet, CHANNEL_ALL};
use crate::device::transport::{RxMetadata, Transport};
use crate::error::CtrlError;
use crate::ADDR_BROADCAST;

use super::node::Shared;

/// Whether a received frame qualifies for relaying.
pub(crate) fn should_forward<T: Transport>(
    shared: &Shared<T>,
    packet: &Packet,
    meta: &RxMetadata,
) -> bool {
    shared.config.forward_enable
        && packet.header.broadcast
        && packet.header.forward_ttl > 0
        && packet.header.forward_rssi <= meta.rssi
        && packet.dest != shared.self_addr
        && packet.src != shared.self_addr
}

/// Re-broadcasts the frame unchanged across the channel domain.
pub(crate) fn forward<T: Transport>(
    shared: &Shared<T>,
    packet: &Packet,
) -> Result<(), CtrlError<T::Error>> {
    trace!(
        "relaying frame 0x{:04x} from {}",
        packet.header.magic,
        crate::format_addr(&packet.src)
    );
    let sweep = shared.config.forward_switch_channel || packet.header.channel == CHANNEL_ALL;
    sweep_broadcast(shared, packet, sweep)
}

/// Broadcasts a packet, optionally sweeping every domain channel and
/// restoring the original channel afterwards. Channel switches happen under
/// the node's channel lock; when the lock cannot be taken in time the frame
/// is dropped, exactly as a congested medium would drop it.
pub(crate) fn sweep_broadcast<T: Transport>(
    shared: &Shared<T>,
    packet: &Packet,
    sweep: bool,
) -> Result<(), CtrlError<T::Error>> {
    let bytes = packet.to_bytes()?;
    let timeout = shared.config.send_max_timeout;

    let Some(_guard) = shared.send_lock.acquire(timeout) else {
        warn!("channel is busy, frame 0x{:04x} dropped", packet.header.magic);
        return Err(CtrlError::Timeout);
    };

    if !sweep {
        return shared
            .transport
            .send(&ADDR_BROADCAST, &bytes, timeout)
            .map_err(CtrlError::Transport);
    }

    let primary = shared.transport.channel().map_err(CtrlError::Transport)?;
    let mut result = Ok(());
    for channel in shared.transport.channel_domain() {
        if let Err(err) = shared
            .transport
            .set_channel(channel)
            .map_err(CtrlError::Transport)
            .and_then(|_| {
                shared
                    .transport
                    .send(&ADDR_BROADCAST, &bytes, timeout)
                    .map_err(CtrlError::Transport)
            })
        {
            warn!("sweep transmit failed on channel {}: {:?}", channel, err);
            result = Err(err);
        }
    }
    if let Err(err) = shared.transport.set_channel(primary) {
        return Err(CtrlError::Transport(err));
    }
    result
}
