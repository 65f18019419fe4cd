use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::messaging::member_addr::MemberAddr;


/// Tracks for which members a physical address resolution has recently been requested, so a
///  burst of sends to an unresolved member triggers one resolution request instead of one
///  per message.
///
/// Entries expire after a TTL, at which point the next send is allowed to ask again.
///  Expiry is checked lazily on access; the periodic [PendingResolutions::sweep] merely
///  keeps the map from accumulating entries for members nobody sends to anymore.
pub struct PendingResolutions {
    ttl: Duration,
    pending: Mutex<FxHashMap<MemberAddr, Instant>>,
}

impl PendingResolutions {
    pub fn new(ttl: Duration) -> PendingResolutions {
        PendingResolutions {
            ttl,
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns true if no resolution for this member is currently in flight, registering one
    ///  in that case. The caller sends the actual resolution request if and only if this
    ///  returns true.
    pub fn try_mark(&self, member: MemberAddr) -> bool {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();

        match pending.get(&member) {
            Some(&requested_at) if now.duration_since(requested_at) < self.ttl => false,
            _ => {
                trace!("registering pending address resolution for {:?}", member);
                pending.insert(member, now);
                true
            }
        }
    }

    /// drops expired entries; called periodically
    pub fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.pending.lock().unwrap()
            .retain(|_, requested_at| now.duration_since(*requested_at) < ttl);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
