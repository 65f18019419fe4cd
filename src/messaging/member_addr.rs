use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;


/// A member's logical address, i.e. its stable identity in the cluster.
///
/// The logical address is generated when a member starts and stays the same for its entire
///  lifetime, even if the member's network endpoint changes (which can happen e.g. when
///  interfaces go up or down). The mapping from logical to physical addresses is maintained
///  separately and can change over time - see [crate::transport::address_cache::AddressCache].
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberAddr {
    uuid: u128,
}

impl MemberAddr {
    pub const SERIALIZED_LEN: usize = 16;

    /// a new random address - guaranteed unique for all practical purposes
    pub fn new_random() -> MemberAddr {
        MemberAddr {
            uuid: Uuid::new_v4().as_u128(),
        }
    }

    pub const fn from_uuid(uuid: u128) -> MemberAddr {
        MemberAddr { uuid }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.uuid);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MemberAddr> {
        Ok(MemberAddr {
            uuid: buf.try_get_u128()?,
        })
    }
}

impl Debug for MemberAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print only the low 64 bits to keep log lines readable
        write!(f, "[{:016x}]", self.uuid as u64)
    }
}
