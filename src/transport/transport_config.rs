use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;


/// What to do with a task submitted to a dispatch pool that can neither be handed to a worker
///  nor queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionPolicy {
    /// run the task on the submitting task, applying backpressure to the caller
    Run,
    /// refuse the task with an error the caller gets to see
    Abort,
    /// silently drop the new task
    Discard,
    /// drop the oldest queued task to make room for the new one
    DiscardOldest,
}

impl FromStr for RejectionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<RejectionPolicy, anyhow::Error> {
        match s.to_ascii_lowercase().as_str() {
            "run" => Ok(RejectionPolicy::Run),
            "abort" => Ok(RejectionPolicy::Abort),
            "discard" => Ok(RejectionPolicy::Discard),
            "discard-oldest" | "discardoldest" => Ok(RejectionPolicy::DiscardOldest),
            _ => bail!("invalid rejection policy {:?}: expected one of 'run', 'abort', 'discard', 'discard-oldest'", s),
        }
    }
}


/// Sizing and overflow behavior for one of the dispatch pools.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Disabling a pool turns it into a degenerate executor that runs every task directly on
    ///  the submitting task. That skips a buffer copy on the receive path and can actually be
    ///  the best choice when the layers above are cheap.
    pub enabled: bool,
    /// number of workers to keep alive even when idle
    pub min_workers: usize,
    pub max_workers: usize,
    /// how long a worker beyond `min_workers` lingers without work before it exits
    pub keep_alive: Duration,
    /// Without a queue, a task is only accepted if a worker can take it over immediately
    ///  (spawning up to `max_workers`); with a queue, up to `queue_capacity` tasks wait for
    ///  the next free worker.
    pub queue_enabled: bool,
    pub queue_capacity: usize,
    pub rejection_policy: RejectionPolicy,
}

impl PoolConfig {
    pub fn validate(&self, name: &str) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_workers == 0 {
            bail!("{}: max_workers must be positive", name);
        }
        if self.min_workers > self.max_workers {
            bail!("{}: min_workers {} exceeds max_workers {}", name, self.min_workers, self.max_workers);
        }
        if self.queue_enabled && self.queue_capacity == 0 {
            bail!("{}: queue_capacity must be positive when the queue is enabled", name);
        }
        Ok(())
    }
}


/// Controls how outgoing messages are batched into frames.
#[derive(Clone, Debug)]
pub struct BundlingConfig {
    pub enabled: bool,
    /// Upper bound for the accumulated serialized size of batched messages. Should be
    ///  comfortably below the network's datagram size limit.
    pub max_size: usize,
    /// how long a batched message waits for company before the batch is flushed regardless
    ///  of size
    pub max_timeout: Duration,
    /// when false, only multicast messages are bundled and every unicast message goes out
    ///  as a frame of its own
    pub bundle_unicasts: bool,
}


#[derive(Clone, Debug)]
pub struct AddressCacheConfig {
    /// bound on the number of cached logical-to-physical mappings (pinned entries can
    ///  exceed it)
    pub max_entries: usize,
    /// entries older than this are dropped by the periodic sweep
    pub max_age: Duration,
}


/// All the transport's knobs in one place. [TransportConfig::default] has values that work
///  for a LAN deployment; [TransportConfig::validate] is called when the transport is built
///  so inconsistent settings fail fast instead of misbehaving at runtime.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// pool for messages flagged as out-of-band. No queue by default: OOB messages are
    ///  urgent, and making them wait in line defeats their purpose.
    pub oob_pool: PoolConfig,
    /// pool for everything else
    pub regular_pool: PoolConfig,
    pub bundling: BundlingConfig,
    /// deliver multicast and self-addressed messages locally without a network round trip
    pub loopback: bool,
    /// drop frames whose wire format version differs from ours; turning this off enables a
    ///  best-effort decode, which can ease rolling upgrades but risks misinterpreting data
    pub discard_incompatible_version: bool,
    pub address_cache: AddressCacheConfig,
    /// how long a physical address resolution request suppresses further requests for the
    ///  same member
    pub pending_resolution_ttl: Duration,
    /// interval of the periodic cleanup of stale cache entries and expired resolutions
    pub sweep_interval: Duration,
    /// how long shutdown waits for in-flight work before aborting it
    pub shutdown_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            oob_pool: PoolConfig {
                enabled: true,
                min_workers: 2,
                max_workers: 8,
                keep_alive: Duration::from_secs(30),
                queue_enabled: false,
                queue_capacity: 500,
                rejection_policy: RejectionPolicy::Discard,
            },
            regular_pool: PoolConfig {
                enabled: true,
                min_workers: 2,
                max_workers: 8,
                keep_alive: Duration::from_secs(30),
                queue_enabled: true,
                queue_capacity: 500,
                rejection_policy: RejectionPolicy::Discard,
            },
            bundling: BundlingConfig {
                enabled: true,
                max_size: 64_000,
                max_timeout: Duration::from_millis(20),
                bundle_unicasts: true,
            },
            loopback: true,
            discard_incompatible_version: true,
            address_cache: AddressCacheConfig {
                max_entries: 500,
                max_age: Duration::from_secs(120),
            },
            pending_resolution_ttl: Duration::from_millis(5_000),
            sweep_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.oob_pool.validate("oob_pool")?;
        self.regular_pool.validate("regular_pool")?;

        if self.bundling.max_size == 0 {
            bail!("bundling.max_size must be positive");
        }
        if self.bundling.max_timeout.is_zero() {
            bail!("bundling.max_timeout must be positive");
        }
        if self.address_cache.max_entries == 0 {
            bail!("address_cache.max_entries must be positive");
        }
        if self.pending_resolution_ttl.is_zero() {
            bail!("pending_resolution_ttl must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep_interval must be positive");
        }
        Ok(())
    }
}
