//! The bottommost layer of a group communication stack: it turns logical messages addressed
//!  to cluster members into UDP datagrams and back, without providing any reliability or
//!  ordering guarantees of its own - those are the business of the layers stacked on top.
//!
//! ## Responsibilities
//!
//! * Addressing: members are identified by a transport-independent [messaging::member_addr::MemberAddr];
//!    the mapping to physical socket addresses lives in a cache inside the transport
//!    ([transport::address_cache::AddressCache]), fed by the layer above. Sending to a member
//!    whose physical address is unknown drops the message and asks the layer above to resolve
//!    the address - at most once per member within a grace period.
//! * Cluster scoping: every outgoing message is tagged with the cluster name, and incoming
//!    messages for a different cluster are discarded. Nodes of different clusters can share
//!    a multicast group without seeing each other's traffic.
//! * Bundling: small regular messages are accumulated per destination and flushed as a single
//!    frame when enough bytes pile up or a timer expires ([transport::bundler::Bundler]),
//!    trading a little latency for fewer syscalls. Out-of-band messages bypass this.
//! * Concurrency: incoming frames are classified as out-of-band or regular by peeking at the
//!    frame header and are processed on one of two dispatch pools
//!    ([transport::dispatch_pool::DispatchPool]), so slow regular traffic cannot starve
//!    urgent coordination messages.
//! * Loopback: messages addressed to the whole cluster or to the local member itself are
//!    delivered locally without serialization, and the network echo of an own multicast is
//!    suppressed on the way in.
//!
//! ## Wire format
//!
//! A frame is the payload of one UDP datagram - all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  wire format version (u16)
//! 2:  flags (8 bits):
//!     * bit 0: LIST - the frame holds a counted list of messages instead of a single one
//!     * bit 1: MULTICAST - the frame was sent to the cluster at large
//!     * bit 2: OOB - the frame's messages want out-of-band processing
//!     * 3-7: unused, should be 0
//! 3:  number of messages (u32) - present only if LIST is set
//! *:  the message(s), back to back
//! ```
//!
//! Each message is self-describing:
//!
//! ```ascii
//! 0:  presence (u8): bit 0 - destination address present, bit 1 - source address present
//! 1:  message flags (u8)
//! 2:  destination member address (16 bytes) - present only for a single-member destination,
//!      a message to all members travels without one
//! *:  source member address (16 bytes) - if present
//! *:  number of headers (varint), then per header: the layer id (u64 BE), the header length
//!      (varint) and the header bytes
//! *:  payload length (varint), then the payload bytes
//! ```
//!
//! Physical socket addresses never appear on the wire - a message sent to an explicit
//!  endpoint arrives with no destination address at all.

pub mod messaging;
pub mod test_util;
pub mod transport;
pub mod util;
