use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::bail;
use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::messaging::member_addr::MemberAddr;
use crate::messaging::message::{Destination, Message, MessageFlags, TransportHeader, TRANSPORT_LAYER};
use crate::transport::address_cache::AddressCache;
use crate::transport::bundler::Bundler;
use crate::transport::dispatch_pool::{DispatchPool, PoolStatsSnapshot, RejectReason, SubmitOutcome};
use crate::transport::pending_resolutions::PendingResolutions;
use crate::transport::transport_config::TransportConfig;
use crate::transport::transport_events::{DownEvent, DownResult, UpEvent};
use crate::transport::up_handler::UpHandler;
use crate::transport::wire_format;
use crate::transport::wire_sender::{send_frame, SendTarget, WireSender};


#[derive(Default)]
pub struct TransportStats {
    pub(crate) msgs_sent: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) msgs_received: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) oob_frames_received: AtomicU64,
    pub(crate) regular_frames_received: AtomicU64,
    pub(crate) incompatible_version_dropped: AtomicU64,
    pub(crate) wrong_cluster_dropped: AtomicU64,
    pub(crate) unresolved_dropped: AtomicU64,
    pub(crate) loopback_delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStatsSnapshot {
    pub msgs_sent: u64,
    pub bytes_sent: u64,
    pub msgs_received: u64,
    pub bytes_received: u64,
    pub oob_frames_received: u64,
    pub regular_frames_received: u64,
    pub incompatible_version_dropped: u64,
    pub wrong_cluster_dropped: u64,
    pub unresolved_dropped: u64,
    pub loopback_delivered: u64,
    pub oob_pool: PoolStatsSnapshot,
    pub regular_pool: PoolStatsSnapshot,
}


/// The message transport: the bottommost layer of a group communication stack, feeding raw
///  datagrams from the network into the protocol layers above and turning logical send
///  requests into frames on the wire.
///
/// The layer above drives it through [Transport::down]; whatever the transport has to say
///  travels through the [UpHandler] passed in at construction. The network side is behind
///  [WireSender] on the way out, and whoever owns the receive socket calls
///  [Transport::receive] for every datagram (see
///  [crate::transport::wire_sender::udp_receive_loop] for the UDP glue).
pub struct Transport {
    config: TransportConfig,
    wire_sender: Arc<dyn WireSender>,
    up_handler: Arc<dyn UpHandler>,
    address_cache: AddressCache,
    pending_resolutions: PendingResolutions,
    oob_pool: DispatchPool,
    regular_pool: DispatchPool,
    bundler: Bundler,
    stats: Arc<TransportStats>,
    local_addr: ArcSwapOption<MemberAddr>,
    cluster_name: ArcSwapOption<String>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Validates the configuration and assembles the transport. Workers and the maintenance
    ///  task are started lazily, so this can be called outside a runtime.
    pub fn new(
        config: TransportConfig,
        wire_sender: Arc<dyn WireSender>,
        up_handler: Arc<dyn UpHandler>,
    ) -> anyhow::Result<Arc<Transport>> {
        config.validate()?;

        let stats = Arc::new(TransportStats::default());
        let bundler = Bundler::new(config.bundling.clone(), wire_sender.clone(), stats.clone());

        Ok(Arc::new(Transport {
            address_cache: AddressCache::new(config.address_cache.clone()),
            pending_resolutions: PendingResolutions::new(config.pending_resolution_ttl),
            oob_pool: DispatchPool::new("oob", &config.oob_pool),
            regular_pool: DispatchPool::new("regular", &config.regular_pool),
            bundler,
            stats,
            wire_sender,
            up_handler,
            local_addr: ArcSwapOption::empty(),
            cluster_name: ArcSwapOption::empty(),
            maintenance: Mutex::new(None),
            config,
        }))
    }

    /// single entry point for the layer above
    pub async fn down(self: &Arc<Self>, event: DownEvent) -> anyhow::Result<DownResult> {
        match event {
            DownEvent::SendMessage(message) => {
                self.do_send(message).await?;
                Ok(DownResult::Handled)
            }
            DownEvent::ViewChange(members) => {
                let members: FxHashSet<MemberAddr> = members.into_iter().collect();
                self.address_cache.retain_all(&members);
                Ok(DownResult::Handled)
            }
            DownEvent::Connect { cluster_name } => {
                self.handle_connect(cluster_name);
                Ok(DownResult::Handled)
            }
            DownEvent::Disconnect => {
                self.handle_disconnect().await;
                Ok(DownResult::Handled)
            }
            DownEvent::GetPhysicalAddress(member) => {
                Ok(DownResult::PhysicalAddress(self.address_cache.get(member)))
            }
            DownEvent::SetPhysicalAddress(member, physical) => {
                self.address_cache.put(member, physical);
                Ok(DownResult::Handled)
            }
            DownEvent::RemoveAddress(member) => {
                self.address_cache.remove(member);
                Ok(DownResult::Handled)
            }
            DownEvent::SetLocalAddress(member) => {
                self.handle_set_local_address(member);
                Ok(DownResult::Handled)
            }
        }
    }

    fn handle_connect(self: &Arc<Self>, cluster_name: String) {
        debug!("connecting to cluster {:?}", cluster_name);
        self.cluster_name.store(Some(Arc::new(cluster_name)));

        let mut maintenance = self.maintenance.lock().unwrap();
        if maintenance.is_none() {
            *maintenance = Some(tokio::spawn(maintenance_loop(
                Arc::downgrade(self),
                self.config.sweep_interval,
            )));
        }
    }

    async fn handle_disconnect(&self) {
        debug!("disconnecting from cluster {:?}", self.cluster_name.load_full());
        self.cluster_name.store(None);
        self.bundler.flush().await;
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn handle_set_local_address(&self, member: MemberAddr) {
        let physical = self.wire_sender.local_addr();
        debug!("local address is {:?}, reachable at {}", member, physical);
        self.local_addr.store(Some(Arc::new(member)));
        self.address_cache.put_pinned(member, physical);
    }

    async fn do_send(&self, mut message: Message) -> anyhow::Result<()> {
        let Some(cluster_name) = self.cluster_name.load_full() else {
            bail!("dropping {:?}: the transport is not connected to a cluster", message);
        };

        let local_addr = self.local_addr();
        if let Some(local) = local_addr {
            message.set_src_if_absent(local);
        }
        message.put_header_if_absent(TRANSPORT_LAYER, || {
            TransportHeader::new((*cluster_name).clone()).to_bytes()
        });

        let dest = message.dest();
        let multicast = dest.is_multicast();
        let to_self = matches!((dest, local_addr), (Destination::Member(m), Some(local)) if m == local);

        if self.config.loopback && (multicast || to_self) {
            self.deliver_loopback_copy(&message).await?;
            if !multicast {
                // purely local, nothing for the network
                return Ok(());
            }
        }

        let target = match dest {
            Destination::AllMembers => SendTarget::Multicast,
            Destination::Physical(physical) => {
                // the endpoint is consumed here, the wire carries no destination
                message.clear_dest();
                SendTarget::Unicast(physical)
            }
            Destination::Member(member) => {
                match self.address_cache.get(member) {
                    Some(physical) => SendTarget::Unicast(physical),
                    None => {
                        self.request_resolution(member).await;
                        self.stats.unresolved_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping {:?}: no physical address for {:?} (yet)", message, member);
                        return Ok(());
                    }
                }
            }
        };

        self.stats.msgs_sent.fetch_add(1, Ordering::Relaxed);

        let bundle = self.config.bundling.enabled
            && !message.flags().intersects(MessageFlags::OOB | MessageFlags::DONT_BUNDLE)
            && (multicast || self.config.bundling.bundle_unicasts);

        if bundle {
            self.bundler.send(message, target).await
        }
        else {
            trace!("sending {:?} unbundled to {:?}", message, target);
            let mut buf = BytesMut::new();
            wire_format::encode_frame(std::slice::from_ref(&message), target.is_multicast(), &mut buf);
            self.stats.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
            send_frame(self.wire_sender.as_ref(), target, &buf).await;
            Ok(())
        }
    }

    /// Delivery to self skips serialization entirely: the upper layer gets a copy of the
    ///  message through the same dispatch pools an off-the-wire message would go through.
    async fn deliver_loopback_copy(&self, message: &Message) -> anyhow::Result<()> {
        let pool = if message.is_oob() { &self.oob_pool } else { &self.regular_pool };

        let copy = message.clone();
        let up_handler = self.up_handler.clone();
        let stats = self.stats.clone();
        let outcome = pool.submit(Box::pin(async move {
            stats.loopback_delivered.fetch_add(1, Ordering::Relaxed);
            up_handler.up(UpEvent::MessageReceived(copy)).await;
        }));

        match outcome {
            SubmitOutcome::Queued | SubmitOutcome::Discarded => Ok(()),
            SubmitOutcome::Inline(task) => {
                task.await;
                Ok(())
            }
            SubmitOutcome::Rejected(RejectReason::QueueFull) => {
                bail!("loopback delivery failed: the dispatch pool queue is full");
            }
            SubmitOutcome::Rejected(RejectReason::PoolClosed) => {
                debug!("skipping loopback delivery: the dispatch pool is shut down");
                Ok(())
            }
        }
    }

    async fn request_resolution(&self, member: MemberAddr) {
        if self.pending_resolutions.try_mark(member) {
            trace!("asking the layer above to resolve {:?}", member);
            self.up_handler.up(UpEvent::GetPhysicalAddress(member)).await;
        }
    }

    /// Entry point for raw datagrams from the network.
    ///
    /// The frame is classified as OOB or regular on its flags byte alone and handed to the
    ///  matching dispatch pool; decoding happens on the pool. The datagram buffer is only
    ///  copied if the work is actually queued - with a direct pool, processing runs right
    ///  here on the caller's buffer.
    pub async fn receive(self: &Arc<Self>, sender: SocketAddr, data: &[u8]) {
        if data.len() < wire_format::MIN_FRAME_LEN {
            warn!("discarding a runt datagram of {} bytes from {}", data.len(), sender);
            return;
        }
        self.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);

        let pool = if wire_format::is_oob_frame(data) {
            self.stats.oob_frames_received.fetch_add(1, Ordering::Relaxed);
            &self.oob_pool
        }
        else {
            self.stats.regular_frames_received.fetch_add(1, Ordering::Relaxed);
            &self.regular_pool
        };

        if pool.is_direct() {
            pool.note_inline_run();
            self.process_frame(sender, data).await;
            return;
        }

        let owned = Bytes::copy_from_slice(data);
        let this = self.clone();
        let outcome = pool.submit(Box::pin(async move {
            this.process_frame(sender, &owned).await;
        }));
        match outcome {
            SubmitOutcome::Queued | SubmitOutcome::Discarded => {}
            SubmitOutcome::Inline(task) => task.await,
            SubmitOutcome::Rejected(RejectReason::QueueFull) => {
                warn!("dropping a datagram from {}: the dispatch pool queue is full", sender);
            }
            SubmitOutcome::Rejected(RejectReason::PoolClosed) => {
                debug!("dropping a datagram from {}: the transport is shut down", sender);
            }
        }
    }

    async fn process_frame(&self, sender: SocketAddr, data: &[u8]) {
        let mut buf = data;
        match wire_format::decode_frame(&mut buf, self.config.discard_incompatible_version) {
            Ok(None) => {
                self.stats.incompatible_version_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("discarding a frame with an incompatible wire version from {}", sender);
            }
            Err(e) => {
                warn!("discarding a malformed frame from {}: {}", sender, e);
            }
            Ok(Some(frame)) => {
                let multicast = frame.multicast;
                for message in frame.messages {
                    if let Err(e) = self.deliver_up(message, multicast).await {
                        debug!("discarding a message from {}: {}", sender, e);
                    }
                }
            }
        }
    }

    async fn deliver_up(&self, message: Message, multicast: bool) -> anyhow::Result<()> {
        let Some(header_bytes) = message.header(TRANSPORT_LAYER) else {
            self.stats.wrong_cluster_dropped.fetch_add(1, Ordering::Relaxed);
            bail!("no transport header in {:?}", message);
        };
        let header = TransportHeader::try_deser(&mut header_bytes.clone())?;

        let Some(cluster_name) = self.cluster_name.load_full() else {
            bail!("the transport is not connected to a cluster");
        };
        if header.cluster_name != *cluster_name {
            self.stats.wrong_cluster_dropped.fetch_add(1, Ordering::Relaxed);
            bail!("message is for cluster {:?}, this transport is in {:?}", header.cluster_name, cluster_name);
        }

        if multicast && self.config.loopback {
            if let (Some(src), Some(local)) = (message.src(), self.local_addr()) {
                if src == local {
                    // already delivered locally when it was sent
                    trace!("suppressing the network copy of own multicast {:?}", message);
                    return Ok(());
                }
            }
        }

        self.stats.msgs_received.fetch_add(1, Ordering::Relaxed);
        trace!("delivering {:?}", message);
        self.up_handler.up(UpEvent::MessageReceived(message)).await;
        Ok(())
    }

    /// Stops the maintenance task, flushes the bundler and shuts down the dispatch pools.
    ///  The transport is not usable afterwards.
    pub async fn shutdown(&self) {
        debug!("shutting down the transport");
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            handle.abort();
        }
        self.bundler.flush().await;
        self.oob_pool.shutdown(self.config.shutdown_grace).await;
        self.regular_pool.shutdown(self.config.shutdown_grace).await;
    }

    pub fn local_addr(&self) -> Option<MemberAddr> {
        self.local_addr.load_full().map(|member| *member)
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            msgs_sent: self.stats.msgs_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            msgs_received: self.stats.msgs_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            oob_frames_received: self.stats.oob_frames_received.load(Ordering::Relaxed),
            regular_frames_received: self.stats.regular_frames_received.load(Ordering::Relaxed),
            incompatible_version_dropped: self.stats.incompatible_version_dropped.load(Ordering::Relaxed),
            wrong_cluster_dropped: self.stats.wrong_cluster_dropped.load(Ordering::Relaxed),
            unresolved_dropped: self.stats.unresolved_dropped.load(Ordering::Relaxed),
            loopback_delivered: self.stats.loopback_delivered.load(Ordering::Relaxed),
            oob_pool: self.oob_pool.stats(),
            regular_pool: self.regular_pool.stats(),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Periodic cleanup of aged-out address mappings and expired resolution requests. Holds only
///  a weak reference so an abandoned transport can actually be dropped.
async fn maintenance_loop(transport: Weak<Transport>, sweep_interval: Duration) {
    let mut ticks = tokio::time::interval(sweep_interval);
    loop {
        ticks.tick().await;
        let Some(transport) = transport.upgrade() else {
            return;
        };
        transport.address_cache.purge_stale();
        transport.pending_resolutions.sweep();
    }
}
