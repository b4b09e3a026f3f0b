//! Host demo: a light (responder) and a switch (initiator) talking over the
//! in-process loopback medium.
//!
//! The light opens a bind window, the switch pairs with it, toggles the
//! power a few times and fades the brightness, then unbinds again. Run with
//! `RUST_LOG=debug` to watch the protocol work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use radio_ctrl::ctrl::message::ControlValue;
use radio_ctrl::ctrl::{attribute, CtrlEvent, EventSink, Node, NodeConfig};
use radio_ctrl::device::loopback::{LoopbackBus, LoopbackRadio};
use radio_ctrl::format_addr;
use radio_ctrl::storage::MemStorage;

const LIGHT_ADDR: [u8; 6] = [0x24, 0x6f, 0x28, 0x00, 0x00, 0x01];
const SWITCH_ADDR: [u8; 6] = [0x24, 0x6f, 0x28, 0x00, 0x00, 0x02];

type DemoNode = Node<LoopbackRadio, MemStorage>;

fn spawn_node(
    bus: &Arc<LoopbackBus>,
    addr: [u8; 6],
) -> (Arc<DemoNode>, mpsc::Receiver<CtrlEvent>, Arc<AtomicBool>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let sink: Arc<dyn EventSink> = Arc::new(move |event: CtrlEvent| {
        let _ = tx.lock().unwrap().send(event);
    });
    let node = Arc::new(Node::new(
        bus.endpoint(addr),
        Arc::new(MemStorage::new()),
        NodeConfig::default(),
        sink,
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let poll_node = Arc::clone(&node);
    let poll_stop = Arc::clone(&stop);
    std::thread::spawn(move || {
        while !poll_stop.load(Ordering::SeqCst) {
            let _ = poll_node.poll(Duration::from_millis(20));
        }
    });

    (node, rx, stop)
}

fn main() -> Result<()> {
    env_logger::init();

    let bus = LoopbackBus::new();
    let (light, light_events, light_stop) = spawn_node(&bus, LIGHT_ADDR);
    let (switch, _switch_events, switch_stop) = spawn_node(&bus, SWITCH_ADDR);

    info!("light is {}", format_addr(&LIGHT_ADDR));
    info!("switch is {}", format_addr(&SWITCH_ADDR));

    // The light accepts binds for the next 30 seconds from anyone reasonably
    // close by.
    light.start_binding(Duration::from_secs(30), -55, None);

    let remote = switch.initiator();
    remote
        .bind(attribute::KEY_1, true)
        .context("pairing with the light")?;

    match light_events.recv_timeout(Duration::from_secs(2))? {
        CtrlEvent::Bound(entry) => {
            println!(
                "light bound to {} for attribute {:#06x}",
                format_addr(&entry.addr),
                entry.initiator_attribute
            );
        }
        other => anyhow::bail!("unexpected event while pairing: {:?}", other),
    }

    for on in [true, false, true] {
        remote
            .send_control(attribute::KEY_1, attribute::POWER, ControlValue::Bool(on))
            .context("toggling power")?;
        match light_events.recv_timeout(Duration::from_secs(2))? {
            CtrlEvent::ControlReceived { src, message } => {
                println!(
                    "light received power={} from {}",
                    message.value.as_bool(),
                    format_addr(&src)
                );
            }
            other => anyhow::bail!("unexpected event: {:?}", other),
        }
    }

    for level in [25, 50, 100] {
        remote
            .send_control(
                attribute::KEY_1,
                attribute::BRIGHTNESS,
                ControlValue::Int(level),
            )
            .context("fading brightness")?;
        match light_events.recv_timeout(Duration::from_secs(2))? {
            CtrlEvent::ControlReceived { message, .. } => {
                println!("light received brightness={}", message.value.as_i32());
            }
            other => anyhow::bail!("unexpected event: {:?}", other),
        }
    }

    remote
        .bind(attribute::KEY_1, false)
        .context("unpairing from the light")?;
    match light_events.recv_timeout(Duration::from_secs(2))? {
        CtrlEvent::Unbound(entry) => {
            println!("light unbound from {}", format_addr(&entry.addr));
        }
        other => anyhow::bail!("unexpected event while unpairing: {:?}", other),
    }

    light_stop.store(true, Ordering::SeqCst);
    switch_stop.store(true, Ordering::SeqCst);
    println!("demo finished, {} frames on the air", bus.tx_count());
    Ok(())
}
