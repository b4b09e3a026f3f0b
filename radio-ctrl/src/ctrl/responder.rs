//! Responder-side decision logic.
//!
//! Binding is not a negotiation: each incoming bind request is judged once
//! against the currently open bind window, and control messages are only
//! handed to the application when their sender passed that judgement at some
//! point in the past.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::storage::Storage;
use crate::{format_addr, RadioAddress};

use super::bindlist::{BindEntry, BindStore, BIND_LIST_MAX};
use super::message::ControlMessage;
use super::{Attribute, BindError, BindPredicate, CtrlEvent};

/// An open bind window. Opening a new window replaces the previous one.
pub(crate) struct BindWindow {
    deadline: Instant,
    min_rssi: i8,
    predicate: Option<BindPredicate>,
}

pub(crate) struct Responder<S: Storage> {
    store: BindStore<S>,
    window: Option<BindWindow>,
}

impl<S: Storage> Responder<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Responder {
            store: BindStore::new(storage),
            window: None,
        }
    }

    pub fn store(&mut self) -> &mut BindStore<S> {
        &mut self.store
    }

    pub fn open_window(
        &mut self,
        duration: Duration,
        min_rssi: i8,
        predicate: Option<BindPredicate>,
    ) {
        info!(
            "bind window open for {:?}, rssi floor {}",
            duration, min_rssi
        );
        self.window = Some(BindWindow {
            deadline: Instant::now() + duration,
            min_rssi,
            predicate,
        });
    }

    /// Judges one bind or unbind request. Returns the event to deliver, if
    /// any; the caller emits it outside the responder lock.
    pub fn handle_bind(
        &mut self,
        src: RadioAddress,
        attribute: Attribute,
        enable: bool,
        rssi: i8,
    ) -> Option<CtrlEvent> {
        if !enable {
            return self.handle_unbind(src, attribute);
        }

        let Some(window) = &self.window else {
            trace!(
                "bind request from {} ignored, no window was ever opened",
                format_addr(&src)
            );
            return None;
        };

        if let Some(predicate) = &window.predicate {
            if !predicate(attribute, &src, rssi) {
                debug!("bind request from {} vetoed", format_addr(&src));
                return Some(CtrlEvent::BindRejected(BindError::None));
            }
        }
        if Instant::now() > window.deadline {
            debug!(
                "bind request from {} arrived after the window closed",
                format_addr(&src)
            );
            return Some(CtrlEvent::BindRejected(BindError::Timeout));
        }
        if rssi < window.min_rssi {
            debug!(
                "bind request from {} too weak ({} < {})",
                format_addr(&src),
                rssi,
                window.min_rssi
            );
            return Some(CtrlEvent::BindRejected(BindError::RssiTooLow));
        }

        if self.store.is_bound(&src, attribute) {
            trace!("{} already bound for {:#06x}", format_addr(&src), attribute);
            return None;
        }
        if self.store.len() >= BIND_LIST_MAX {
            debug!("bind request from {} refused, list full", format_addr(&src));
            return Some(CtrlEvent::BindRejected(BindError::ListFull));
        }

        let entry = BindEntry {
            addr: src,
            initiator_attribute: attribute,
        };
        info!(
            "bound {} for initiator attribute {:#06x}",
            format_addr(&src),
            attribute
        );
        if let Err(err) = self.store.insert(entry) {
            warn!("binding accepted but not persisted: {}", err);
        }
        Some(CtrlEvent::Bound(entry))
    }

    fn handle_unbind(&mut self, src: RadioAddress, attribute: Attribute) -> Option<CtrlEvent> {
        match self.store.remove_matching(&src, attribute) {
            Ok(Some(entry)) => {
                info!(
                    "unbound {} for initiator attribute {:#06x}",
                    format_addr(&src),
                    attribute
                );
                Some(CtrlEvent::Unbound(entry))
            }
            Ok(None) => None,
            Err(err) => {
                warn!("unbinding succeeded in memory only: {}", err);
                None
            }
        }
    }

    /// The authorization gate: control data from senders without a matching
    /// binding never reaches the application.
    pub fn handle_control(
        &mut self,
        src: RadioAddress,
        message: ControlMessage,
    ) -> Option<CtrlEvent> {
        if !self.store.is_bound(&src, message.initiator_attribute) {
            trace!(
                "dropping control data from unbound {} ({:#06x})",
                format_addr(&src),
                message.initiator_attribute
            );
            return None;
        }
        Some(CtrlEvent::ControlReceived { src, message })
    }
}
