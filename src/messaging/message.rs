use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::FxHashMap;

use crate::messaging::member_addr::MemberAddr;
use crate::util::buf::{put_string, try_get_string, varint_len};


/// Identifies the protocol layer that owns a given header entry. The single u64 is meant to
///  be used as up to eight ASCII characters for readability in logs and network dumps, but
///  that is a convention and not enforced.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LayerId(pub u64);

impl LayerId {
    pub const fn new(value: &[u8; 8]) -> LayerId {
        LayerId(u64::from_be_bytes(*value))
    }
}

impl Debug for LayerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:016X}({:?})",
            self.0,
            String::from_utf8_lossy(&self.0.to_be_bytes())
        )
    }
}

/// the transport's own header entry
pub const TRANSPORT_LAYER: LayerId = LayerId::new(b"GRPTRANS");


bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone)]
    pub struct MessageFlags: u8 {
        /// out-of-band: delivered on a separate thread pool, not subject to ordering with
        ///  regular messages, and never batched
        const OOB = 1;
        /// send immediately as a single frame even if bundling is enabled
        const DONT_BUNDLE = 1 << 1;
    }
}

impl Default for MessageFlags {
    fn default() -> Self {
        MessageFlags::empty()
    }
}


/// where a message is going
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// all current cluster members
    AllMembers,
    /// a single member, identified by its logical address
    Member(MemberAddr),
    /// A concrete network endpoint. This is for discovery traffic that must be sent before
    ///  logical addresses can be resolved; the endpoint is not part of the wire format.
    Physical(SocketAddr),
}

impl Destination {
    /// Whether sending to this destination means sending to the group rather than a single
    ///  member. For a physical destination that depends on the endpoint's IP address.
    pub fn is_multicast(&self) -> bool {
        match self {
            Destination::AllMembers => true,
            Destination::Member(_) => false,
            Destination::Physical(addr) => addr.ip().is_multicast(),
        }
    }
}

impl Debug for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::AllMembers => write!(f, "*"),
            Destination::Member(member) => write!(f, "{:?}", member),
            Destination::Physical(addr) => write!(f, "phys:{}", addr),
        }
    }
}


/// The transport's header: it tags every outbound message with the name of the cluster the
///  sender is connected to, so receivers can discard traffic from a foreign cluster that
///  happens to share the same network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportHeader {
    pub cluster_name: String,
}

impl TransportHeader {
    pub fn new(cluster_name: impl Into<String>) -> TransportHeader {
        TransportHeader {
            cluster_name: cluster_name.into(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.cluster_name);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TransportHeader> {
        Ok(TransportHeader {
            cluster_name: try_get_string(buf)?,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}


const DEST_PRESENT: u8 = 1;
const SRC_PRESENT: u8 = 1 << 1;

/// A message as it travels between cluster members: optional source and destination
///  addresses, flags, a set of per-layer headers, and an opaque payload.
///
/// Headers are kept as raw bytes here - each layer serializes and parses its own header, the
///  transport only moves them around.
#[derive(Clone, PartialEq)]
pub struct Message {
    src: Option<MemberAddr>,
    dest: Destination,
    flags: MessageFlags,
    headers: FxHashMap<LayerId, Bytes>,
    payload: Bytes,
}

impl Message {
    pub fn new(dest: Destination, payload: Bytes) -> Message {
        Message {
            src: None,
            dest,
            flags: MessageFlags::empty(),
            headers: FxHashMap::default(),
            payload,
        }
    }

    pub fn with_src(mut self, src: MemberAddr) -> Message {
        self.src = Some(src);
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Message {
        self.flags |= flags;
        self
    }

    pub fn with_header(mut self, layer: LayerId, value: Bytes) -> Message {
        self.headers.insert(layer, value);
        self
    }

    pub fn src(&self) -> Option<MemberAddr> {
        self.src
    }

    pub fn dest(&self) -> Destination {
        self.dest
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn is_oob(&self) -> bool {
        self.flags.contains(MessageFlags::OOB)
    }

    pub fn header(&self, layer: LayerId) -> Option<&Bytes> {
        self.headers.get(&layer)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub(crate) fn set_src_if_absent(&mut self, src: MemberAddr) {
        if self.src.is_none() {
            self.src = Some(src);
        }
    }

    pub(crate) fn put_header_if_absent(&mut self, layer: LayerId, value: impl FnOnce() -> Bytes) {
        self.headers.entry(layer).or_insert_with(value);
    }

    /// Resets the destination to [Destination::AllMembers], which is not encoded on the wire.
    ///  This is for messages addressed by physical endpoint: the endpoint is consumed when
    ///  the send target is determined, and nothing of it remains in the serialized message.
    pub(crate) fn clear_dest(&mut self) {
        self.dest = Destination::AllMembers;
    }

    /// The exact number of bytes [Message::ser] will write. Bundling decisions are based on
    ///  this, so it must be kept in sync with the actual serialization code.
    pub fn serialized_size(&self) -> usize {
        let mut size = 2; // presence byte + flags byte
        if matches!(self.dest, Destination::Member(_)) {
            size += MemberAddr::SERIALIZED_LEN;
        }
        if self.src.is_some() {
            size += MemberAddr::SERIALIZED_LEN;
        }
        size += varint_len(self.headers.len() as u64);
        for value in self.headers.values() {
            size += size_of::<u64>() + varint_len(value.len() as u64) + value.len();
        }
        size += varint_len(self.payload.len() as u64) + self.payload.len();
        size
    }

    /// Serialization is self-describing: a presence byte says which of the optional addresses
    ///  follow. Only a [Destination::Member] destination is encoded; 'all members' is the
    ///  absence of a destination, and a physical destination never reaches serialization.
    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut presence = 0u8;
        if matches!(self.dest, Destination::Member(_)) {
            presence |= DEST_PRESENT;
        }
        if self.src.is_some() {
            presence |= SRC_PRESENT;
        }

        buf.put_u8(presence);
        buf.put_u8(self.flags.bits());
        if let Destination::Member(member) = self.dest {
            member.ser(buf);
        }
        if let Some(src) = self.src {
            src.ser(buf);
        }

        buf.put_usize_varint(self.headers.len());
        for (layer, value) in &self.headers {
            buf.put_u64(layer.0);
            buf.put_usize_varint(value.len());
            buf.put_slice(value);
        }

        buf.put_usize_varint(self.payload.len());
        buf.put_slice(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let presence = buf.try_get_u8()?;
        let flags = MessageFlags::from_bits_truncate(buf.try_get_u8()?);

        let dest = if presence & DEST_PRESENT != 0 {
            Destination::Member(MemberAddr::try_deser(buf)?)
        }
        else {
            Destination::AllMembers
        };
        let src = if presence & SRC_PRESENT != 0 {
            Some(MemberAddr::try_deser(buf)?)
        }
        else {
            None
        };

        let num_headers = buf.try_get_usize_varint()?;
        let mut headers = FxHashMap::default();
        for _ in 0..num_headers {
            let layer = LayerId(buf.try_get_u64()?);
            let len = buf.try_get_usize_varint()?;
            if buf.remaining() < len {
                bail!("message header truncated: {} bytes announced, {} available", len, buf.remaining());
            }
            headers.insert(layer, buf.copy_to_bytes(len));
        }

        let payload_len = buf.try_get_usize_varint()?;
        if buf.remaining() < payload_len {
            bail!("message payload truncated: {} bytes announced, {} available", payload_len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Message {
            src,
            dest,
            flags,
            headers,
            payload,
        })
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MSG{{{}->{:?}, flags={:02x}, {} headers, {} payload bytes}}",
            self.src
                .map(|src| format!("{:?}", src))
                .unwrap_or_else(|| "-".to_string()),
            self.dest,
            self.flags.bits(),
            self.headers.len(),
            self.payload.len(),
        )
    }
}
