//! The binding and control protocol itself.
//!
//! A responder opens a time- and signal-strength-bounded bind window during
//! which initiators can pair with it; once paired, an initiator's control
//! messages pass the responder's authorization gate and reach the
//! application. Delivery runs over [crate::device] with acknowledgment,
//! retry and channel search handled by the initiator-side engine.

pub mod bindlist;
pub mod initiator;
pub mod message;
pub mod node;
pub(crate) mod relay;
pub(crate) mod responder;

pub use bindlist::{BindEntry, BindStore, BIND_LIST_MAX};
pub use initiator::Initiator;
pub use message::{ControlMessage, ControlValue};
pub use node::{Node, NodeConfig};

use crate::RadioAddress;

/// A 16-bit code identifying a logical initiator key or a responder
/// controllable property. The first byte codes the device type, the second
/// the attribute itself.
pub type Attribute = u16;

/// Well-known attribute codes.
pub mod attribute {
    use super::Attribute;

    pub const BASE: Attribute = 0x0000;
    pub const POWER: Attribute = 0x0001;
    pub const POWER_ADD: Attribute = 0x0002;
    pub const ATTRIBUTE: Attribute = 0x0003;

    /* light */
    pub const LIGHT_BASE: Attribute = 0x0100;
    pub const BRIGHTNESS: Attribute = 0x0101;
    pub const BRIGHTNESS_ADD: Attribute = 0x0102;
    pub const HUE: Attribute = 0x0103;
    pub const HUE_ADD: Attribute = 0x0104;
    pub const SATURATION: Attribute = 0x0105;
    pub const SATURATION_ADD: Attribute = 0x0106;
    pub const WARM: Attribute = 0x0107;
    pub const WARM_ADD: Attribute = 0x0108;
    pub const COLD: Attribute = 0x0109;
    pub const COLD_ADD: Attribute = 0x010a;
    pub const RED: Attribute = 0x010b;
    pub const RED_ADD: Attribute = 0x010c;
    pub const GREEN: Attribute = 0x010d;
    pub const GREEN_ADD: Attribute = 0x010e;
    pub const BLUE: Attribute = 0x010f;
    pub const BLUE_ADD: Attribute = 0x0110;
    pub const MODE: Attribute = 0x0111;
    pub const MODE_ADD: Attribute = 0x0112;

    /* button */
    pub const BUTTON_BASE: Attribute = 0x0200;
    pub const KEY_1: Attribute = 0x0201;
    pub const KEY_2: Attribute = 0x0202;
    pub const KEY_3: Attribute = 0x0203;
    pub const KEY_4: Attribute = 0x0204;
    pub const KEY_5: Attribute = 0x0205;
    pub const KEY_6: Attribute = 0x0206;
    pub const KEY_7: Attribute = 0x0207;
    pub const KEY_8: Attribute = 0x0208;
    pub const KEY_9: Attribute = 0x0209;
    pub const KEY_10: Attribute = 0x0210;
}

/// Why a bind request was turned down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BindError {
    /// The application predicate said no; no protocol-level reason.
    None,
    /// The request arrived after the bind window's deadline.
    Timeout,
    /// The request arrived below the window's signal-strength floor.
    RssiTooLow,
    /// The bind list already holds its maximum number of entries.
    ListFull,
}

/// Notifications delivered to the application.
#[derive(Clone, Debug)]
pub enum CtrlEvent {
    /// A peer was added to the bind list.
    Bound(BindEntry),
    /// A peer was removed from the bind list.
    Unbound(BindEntry),
    /// A bind request was rejected; nothing changed.
    BindRejected(BindError),
    /// A control message from a bound peer.
    ControlReceived {
        src: RadioAddress,
        message: ControlMessage,
    },
}

/// Observer for [CtrlEvent] notifications.
///
/// Implemented for plain closures; hand an `mpsc` sender wrapped in a closure
/// to collect events on a channel. Callbacks run on the node's receive task
/// and should return quickly.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: CtrlEvent);
}

impl<F> EventSink for F
where
    F: Fn(CtrlEvent) + Send + Sync,
{
    fn notify(&self, event: CtrlEvent) {
        self(event)
    }
}

/// Application veto over individual bind requests, consulted before the
/// window's own deadline and signal checks.
pub type BindPredicate = Box<dyn Fn(Attribute, &RadioAddress, i8) -> bool + Send>;
