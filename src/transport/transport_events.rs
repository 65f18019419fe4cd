use std::net::SocketAddr;

use crate::messaging::member_addr::MemberAddr;
use crate::messaging::message::Message;


/// Events the layer above passes down into the transport. Most of them feed the mapping from
///  logical to physical addresses; [DownEvent::SendMessage] is the data path.
#[derive(Debug)]
pub enum DownEvent {
    SendMessage(Message),
    /// the new set of cluster members - mappings for members no longer in it are dropped
    ViewChange(Vec<MemberAddr>),
    Connect { cluster_name: String },
    Disconnect,
    /// look up the physical address for a member, answered synchronously
    GetPhysicalAddress(MemberAddr),
    SetPhysicalAddress(MemberAddr, SocketAddr),
    RemoveAddress(MemberAddr),
    /// announce this process' own logical address; its mapping to the local endpoint is
    ///  pinned and survives cache eviction
    SetLocalAddress(MemberAddr),
}

/// what [crate::transport::transport::Transport::down] hands back to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum DownResult {
    Handled,
    PhysicalAddress(Option<SocketAddr>),
}

/// Events the transport passes up to the layer above it.
#[derive(Debug, Clone, PartialEq)]
pub enum UpEvent {
    MessageReceived(Message),
    /// The transport was asked to send to a member it has no physical address for. It is up
    ///  to the discovery layer to find one and pass it down via
    ///  [DownEvent::SetPhysicalAddress].
    GetPhysicalAddress(MemberAddr),
}
