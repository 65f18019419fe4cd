use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::transport::transport::Transport;


/// The target a fully assembled frame is sent to. Batches are keyed on this, so two messages
///  end up in the same frame only if they resolved to the same target.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendTarget {
    /// the cluster's multicast group
    Multicast,
    Unicast(SocketAddr),
}

impl SendTarget {
    /// whether frames to this target reach the group rather than a single member, which
    ///  decides the multicast marker on the frame
    pub fn is_multicast(&self) -> bool {
        match self {
            SendTarget::Multicast => true,
            SendTarget::Unicast(addr) => addr.ip().is_multicast(),
        }
    }
}

impl Debug for SendTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SendTarget::Multicast => write!(f, "mcast"),
            SendTarget::Unicast(addr) => write!(f, "{}", addr),
        }
    }
}


/// Abstraction of the network on the sending side, mostly to allow mocking actual network
///  communication in tests.
///
/// Sending is fire-and-forget: implementations log failures, but callers get no feedback.
///  That reflects what UDP provides - even a send that reaches the network driver carries no
///  delivery guarantee, so reliability has to come from retransmission layers anyway.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireSender: Send + Sync + 'static {
    async fn send_unicast(&self, to: SocketAddr, frame: &[u8]);

    async fn send_multicast(&self, frame: &[u8]);

    /// the local endpoint receivers can reach this process at
    fn local_addr(&self) -> SocketAddr;
}

pub async fn send_frame(sender: &dyn WireSender, target: SendTarget, frame: &[u8]) {
    match target {
        SendTarget::Multicast => sender.send_multicast(frame).await,
        SendTarget::Unicast(to) => sender.send_unicast(to, frame).await,
    }
}


/// [WireSender] on a UDP socket, with a fixed multicast group.
pub struct UdpWireSender {
    socket: Arc<UdpSocket>,
    multicast_group: SocketAddr,
}

impl UdpWireSender {
    pub fn new(socket: Arc<UdpSocket>, multicast_group: SocketAddr) -> UdpWireSender {
        UdpWireSender {
            socket,
            multicast_group,
        }
    }
}

#[async_trait]
impl WireSender for UdpWireSender {
    async fn send_unicast(&self, to: SocketAddr, frame: &[u8]) {
        trace!("sending frame of {} bytes to {}", frame.len(), to);
        if let Err(e) = self.socket.send_to(frame, to).await {
            error!("error sending frame to {}: {}", to, e);
        }
    }

    async fn send_multicast(&self, frame: &[u8]) {
        trace!("sending frame of {} bytes to multicast group {}", frame.len(), self.multicast_group);
        if let Err(e) = self.socket.send_to(frame, self.multicast_group).await {
            error!("error sending frame to multicast group {}: {}", self.multicast_group, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
            .expect("UDP socket should have an initialized local address")
    }
}


/// Reads datagrams off a socket and feeds them into the transport until the socket fails,
///  typically because it was shut down. Callers usually spawn this.
pub async fn udp_receive_loop(transport: Arc<Transport>, socket: Arc<UdpSocket>) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        transport.receive(from, &buf[..len]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::mcast(SendTarget::Multicast, true)]
    #[case::unicast(SendTarget::Unicast("127.0.0.1:7800".parse().unwrap()), false)]
    #[case::unicast_to_group(SendTarget::Unicast("239.1.2.3:7600".parse().unwrap()), true)]
    fn test_send_target_is_multicast(#[case] target: SendTarget, #[case] expected: bool) {
        assert_eq!(target.is_multicast(), expected);
    }

    #[test]
    fn test_udp_wire_sender_roundtrip() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let receiver_addr = receiver.local_addr().unwrap();

            let sender_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let sender = UdpWireSender::new(sender_socket.clone(), receiver_addr);
            assert_eq!(sender.local_addr(), sender_socket.local_addr().unwrap());

            sender.send_unicast(receiver_addr, b"unicast frame").await;
            sender.send_multicast(b"multicast frame").await;

            let mut buf = [0u8; 100];
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"unicast frame");
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"multicast frame");
        });
    }
}
