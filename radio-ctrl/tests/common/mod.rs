//! Shared plumbing for the integration tests: nodes on a loopback bus with
//! their events collected on a channel and their poll loop on a thread.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use radio_ctrl::ctrl::{CtrlEvent, EventSink, Node, NodeConfig};
use radio_ctrl::device::loopback::LoopbackRadio;
use radio_ctrl::storage::MemStorage;

pub type TestNode = Node<LoopbackRadio, MemStorage>;

pub struct Harness {
    pub node: Arc<TestNode>,
    pub storage: Arc<MemStorage>,
    pub events: mpsc::Receiver<CtrlEvent>,
}

/// Builds a node around an already configured radio endpoint.
pub fn node_with(radio: LoopbackRadio, config: NodeConfig) -> Harness {
    let (tx, events) = mpsc::channel();
    let tx = Mutex::new(tx);
    let sink: Arc<dyn EventSink> = Arc::new(move |event: CtrlEvent| {
        let _ = tx.lock().unwrap().send(event);
    });
    let storage = Arc::new(MemStorage::new());
    let node = Arc::new(Node::new(radio, Arc::clone(&storage), config, sink));
    Harness {
        node,
        storage,
        events,
    }
}

/// Keeps a node's receive loop running until dropped.
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub fn start_poll(node: &Arc<TestNode>) -> Poller {
    let stop = Arc::new(AtomicBool::new(false));
    let node = Arc::clone(node);
    let flag = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        while !flag.load(Ordering::SeqCst) {
            let _ = node.poll(Duration::from_millis(10));
        }
    });
    Poller {
        stop,
        handle: Some(handle),
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn next_event(events: &mpsc::Receiver<CtrlEvent>) -> Option<CtrlEvent> {
    events.recv_timeout(Duration::from_secs(2)).ok()
}

pub fn expect_silence(events: &mpsc::Receiver<CtrlEvent>) {
    if let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
        panic!("expected no event, got {:?}", event);
    }
}
