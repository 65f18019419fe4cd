use std::net::SocketAddr;

use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messaging::member_addr::MemberAddr;
use crate::transport::transport_config::AddressCacheConfig;
use crate::util::atomic_map::AtomicMap;


#[derive(Clone, Copy)]
struct CacheEntry {
    physical: SocketAddr,
    /// timestamp of the last write, not the last read - staleness is about the mapping no
    ///  longer being refreshed, not about it being unpopular
    last_update: Instant,
    pinned: bool,
}

/// The mapping from logical member addresses to the network endpoints they are currently
///  reachable at.
///
/// This sits on the hot send path, so lookups are wait-free at the price of copy-on-write
///  modifications (see [AtomicMap]) - updates are rare compared to lookups.
///
/// The mapping for the local member is added as 'pinned': it can never be evicted, aged out
///  or displaced by anything short of a forced clear, because a transport that forgets its
///  own address cannot even talk to itself anymore.
pub struct AddressCache {
    config: AddressCacheConfig,
    entries: AtomicMap<MemberAddr, CacheEntry>,
}

impl AddressCache {
    pub fn new(config: AddressCacheConfig) -> AddressCache {
        AddressCache {
            config,
            entries: AtomicMap::new(),
        }
    }

    pub fn get(&self, member: MemberAddr) -> Option<SocketAddr> {
        self.entries.get(&member).map(|entry| entry.physical)
    }

    pub fn put(&self, member: MemberAddr, physical: SocketAddr) {
        self.do_put(member, physical, false);
    }

    pub fn put_pinned(&self, member: MemberAddr, physical: SocketAddr) {
        self.do_put(member, physical, true);
    }

    fn do_put(&self, member: MemberAddr, physical: SocketAddr, pin: bool) {
        trace!("address mapping {:?} -> {}{}", member, physical, if pin { " (pinned)" } else { "" });
        let now = Instant::now();
        let max_entries = self.config.max_entries;

        self.entries.update(|entries| {
            match entries.get_mut(&member) {
                Some(entry) => {
                    entry.physical = physical;
                    entry.last_update = now;
                    // a plain put never unpins
                    entry.pinned |= pin;
                }
                None => {
                    entries.insert(member, CacheEntry {
                        physical,
                        last_update: now,
                        pinned: pin,
                    });
                }
            }

            while entries.len() > max_entries {
                let oldest = entries.iter()
                    .filter(|(_, entry)| !entry.pinned)
                    .min_by_key(|(_, entry)| entry.last_update)
                    .map(|(member, _)| *member);
                match oldest {
                    Some(evicted) => {
                        debug!("address cache is full, evicting the mapping for {:?}", evicted);
                        entries.remove(&evicted);
                    }
                    None => break,
                }
            }
        });
    }

    /// Removes a member's mapping unconditionally, pinned or not. This is the explicit
    ///  'that address is wrong' signal, and it outranks pinning.
    pub fn remove(&self, member: MemberAddr) {
        self.entries.update(|entries| {
            entries.remove(&member);
        });
    }

    /// drops all mappings for members outside the given set, keeping pinned entries
    pub fn retain_all(&self, members: &FxHashSet<MemberAddr>) {
        self.entries.update(|entries| {
            entries.retain(|member, entry| entry.pinned || members.contains(member));
        });
    }

    pub fn clear(&self, force: bool) {
        self.entries.update(|entries| {
            if force {
                entries.clear();
            }
            else {
                entries.retain(|_, entry| entry.pinned);
            }
        });
    }

    /// drops non-pinned mappings that were not refreshed within the configured max age
    pub fn purge_stale(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.config.max_age) else {
            return;
        };
        self.entries.update(|entries| {
            entries.retain(|_, entry| entry.pinned || entry.last_update > cutoff);
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
