use bytes::Bytes;
use std::net::SocketAddr;

use crate::messaging::member_addr::MemberAddr;
use crate::messaging::message::{Destination, Message};


pub fn test_member(n: u128) -> MemberAddr {
    MemberAddr::from_uuid(n)
}

pub fn test_endpoint(n: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 20_000 + n))
}

/// a message with an all-zero payload padded so that its serialized size is exactly `size`
pub fn message_of_size(size: usize, dest: Destination) -> Message {
    for payload_len in size.saturating_sub(64)..=size {
        let message = Message::new(dest, Bytes::from(vec![0u8; payload_len]));
        if message.serialized_size() == size {
            return message;
        }
    }
    panic!("no payload length yields a serialized size of {}", size);
}
