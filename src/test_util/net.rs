use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::messaging::message::Message;
use crate::transport::transport_events::UpEvent;
use crate::transport::up_handler::UpHandler;
use crate::transport::wire_format;
use crate::transport::wire_format::DecodedFrame;
use crate::transport::wire_sender::{SendTarget, WireSender};


/// A [WireSender] that records every frame instead of sending it, so tests can assert on
///  what would have gone over the network.
pub struct CapturingWireSender {
    local_addr: SocketAddr,
    frames: Mutex<Vec<(SendTarget, Vec<u8>)>>,
    frame_recorded: Notify,
}

impl CapturingWireSender {
    pub fn new(local_addr: SocketAddr) -> CapturingWireSender {
        CapturingWireSender {
            local_addr,
            frames: Mutex::new(Vec::new()),
            frame_recorded: Notify::new(),
        }
    }

    pub fn frames(&self) -> Vec<(SendTarget, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn decoded_frames(&self) -> Vec<(SendTarget, DecodedFrame)> {
        self.frames()
            .into_iter()
            .map(|(target, frame)| {
                let decoded = wire_format::decode_frame(&mut &frame[..], true)
                    .unwrap()
                    .unwrap();
                (target, decoded)
            })
            .collect()
    }

    /// waits until at least `n` frames were recorded, panicking after a generous timeout
    pub async fn wait_for_frames(&self, n: usize) {
        loop {
            let notified = self.frame_recorded.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.frames.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::timeout(Duration::from_secs(5), notified).await
                .expect("timed out waiting for frames");
        }
    }

    fn record(&self, target: SendTarget, frame: &[u8]) {
        self.frames.lock().unwrap().push((target, frame.to_vec()));
        self.frame_recorded.notify_waiters();
    }
}

#[async_trait]
impl WireSender for CapturingWireSender {
    async fn send_unicast(&self, to: SocketAddr, frame: &[u8]) {
        self.record(SendTarget::Unicast(to), frame);
    }

    async fn send_multicast(&self, frame: &[u8]) {
        self.record(SendTarget::Multicast, frame);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}


/// An [UpHandler] that records everything the transport passes up.
pub struct CapturingUpHandler {
    events: Mutex<Vec<UpEvent>>,
    event_recorded: Notify,
}

impl CapturingUpHandler {
    pub fn new() -> CapturingUpHandler {
        CapturingUpHandler {
            events: Mutex::new(Vec::new()),
            event_recorded: Notify::new(),
        }
    }

    pub fn events(&self) -> Vec<UpEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn received_messages(&self) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UpEvent::MessageReceived(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub async fn wait_for_events(&self, n: usize) {
        loop {
            let notified = self.event_recorded.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.events.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::timeout(Duration::from_secs(5), notified).await
                .expect("timed out waiting for up events");
        }
    }
}

impl Default for CapturingUpHandler {
    fn default() -> Self {
        CapturingUpHandler::new()
    }
}

#[async_trait]
impl UpHandler for CapturingUpHandler {
    async fn up(&self, event: UpEvent) {
        self.events.lock().unwrap().push(event);
        self.event_recorded.notify_waiters();
    }
}
