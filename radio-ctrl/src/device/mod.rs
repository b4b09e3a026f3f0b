//! Everything needed to exchange frames between peers over the physical
//! radio module: the wire format and the transport abstraction.

pub mod frame;
pub mod loopback;
pub mod transport;

pub use transport::{RxMetadata, Transport};
