use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::messaging::message::Message;
use crate::transport::transport::TransportStats;
use crate::transport::transport_config::BundlingConfig;
use crate::transport::wire_format;
use crate::transport::wire_sender::{send_frame, SendTarget, WireSender};


/// Upper bound on concurrently scheduled timer flushes. One is the common case; a second can
///  arise when a batch is started while the previous timer is still about to fire. Beyond
///  that, additional timers would only pile up behind each other.
const MAX_FLUSH_TASKS: u32 = 2;

struct BatchState {
    /// batched messages, grouped by where the resulting frame will go
    per_target: FxHashMap<SendTarget, Vec<Message>>,
    /// total serialized size of everything in `per_target`
    accumulated_size: usize,
    enqueued_at: Option<Instant>,
    num_flush_tasks: u32,
}

impl BatchState {
    fn is_empty(&self) -> bool {
        self.per_target.is_empty()
    }

    /// Takes the complete batch out, encoded into one frame per target. The caller does the
    ///  actual sending, after releasing the lock this was called under.
    fn take_frames(&mut self) -> Vec<(SendTarget, BytesMut)> {
        if self.per_target.is_empty() {
            return Vec::new();
        }
        if let Some(enqueued_at) = self.enqueued_at {
            trace!("flushing {} batched bytes, oldest message waited {:?}", self.accumulated_size, enqueued_at.elapsed());
        }

        let mut frames = Vec::with_capacity(self.per_target.len());
        for (target, messages) in self.per_target.drain() {
            let mut buf = BytesMut::new();
            wire_format::encode_frame(&messages, target.is_multicast(), &mut buf);
            frames.push((target, buf));
        }
        self.accumulated_size = 0;
        self.enqueued_at = None;
        frames
    }
}

/// Batches outgoing messages into shared frames to reduce per-datagram overhead, which is
///  what makes many small messages affordable.
///
/// Messages accumulate across all targets, with one frame per target at flush time. A flush
///  happens when the accumulated serialized size reaches the configured maximum, or when the
///  oldest batched message has waited for the configured timeout, whichever comes first.
///
/// All state lives behind one mutex that is only held for bookkeeping; frames are encoded
///  under the lock but handed to the network after it is released.
pub struct Bundler {
    shared: Arc<BundlerShared>,
}

struct BundlerShared {
    config: BundlingConfig,
    wire_sender: Arc<dyn WireSender>,
    stats: Arc<TransportStats>,
    batch: Mutex<BatchState>,
}

impl Bundler {
    pub(crate) fn new(config: BundlingConfig, wire_sender: Arc<dyn WireSender>, stats: Arc<TransportStats>) -> Bundler {
        Bundler {
            shared: Arc::new(BundlerShared {
                config,
                wire_sender,
                stats,
                batch: Mutex::new(BatchState {
                    per_target: FxHashMap::default(),
                    accumulated_size: 0,
                    enqueued_at: None,
                    num_flush_tasks: 0,
                }),
            }),
        }
    }

    /// Queues a message for batched sending. Messages for the same target leave in
    ///  submission order; the frame a message ends up in is never larger than the
    ///  configured maximum.
    pub async fn send(&self, message: Message, target: SendTarget) -> anyhow::Result<()> {
        let size = message.serialized_size();
        if size > self.shared.config.max_size {
            bail!("message of {} serialized bytes exceeds the maximum bundle size of {} - it cannot be sent unfragmented", size, self.shared.config.max_size);
        }

        let mut frames = Vec::new();
        {
            let mut batch = self.shared.batch.lock().unwrap();

            // flush what is there if this message would push the batch over the limit
            if batch.accumulated_size + size > self.shared.config.max_size {
                frames = batch.take_frames();
            }

            let starts_new_batch = batch.is_empty();
            batch.per_target.entry(target).or_default().push(message);
            batch.accumulated_size += size;
            if batch.enqueued_at.is_none() {
                batch.enqueued_at = Some(Instant::now());
            }

            if batch.accumulated_size >= self.shared.config.max_size {
                frames.extend(batch.take_frames());
            }
            else if starts_new_batch && batch.num_flush_tasks < MAX_FLUSH_TASKS {
                batch.num_flush_tasks += 1;
                tokio::spawn(timed_flush(self.shared.clone()));
            }
        }

        send_frames(&self.shared, frames).await;
        Ok(())
    }

    /// sends out everything that is batched right now; a no-op on an empty batch
    pub async fn flush(&self) {
        let frames = {
            self.shared.batch.lock().unwrap().take_frames()
        };
        send_frames(&self.shared, frames).await;
    }

    #[cfg(test)]
    fn num_flush_tasks(&self) -> u32 {
        self.shared.batch.lock().unwrap().num_flush_tasks
    }
}

async fn timed_flush(shared: Arc<BundlerShared>) {
    tokio::time::sleep(shared.config.max_timeout).await;
    let frames = {
        let mut batch = shared.batch.lock().unwrap();
        batch.num_flush_tasks -= 1;
        batch.take_frames()
    };
    send_frames(&shared, frames).await;
}

async fn send_frames(shared: &BundlerShared, frames: Vec<(SendTarget, BytesMut)>) {
    for (target, frame) in frames {
        shared.stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        send_frame(shared.wire_sender.as_ref(), target, &frame).await;
    }
}
