use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use tracing::warn;

use crate::messaging::message::Message;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};


/// to be incremented on every incompatible change to the frame or message encoding
pub const WIRE_VERSION: u16 = 1;

/// version and flags; anything shorter cannot even be classified
pub const MIN_FRAME_LEN: usize = 3;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone)]
    pub struct FrameFlags: u8 {
        /// the frame holds a message count followed by that many messages, rather than a
        ///  single message
        const LIST = 1;
        /// the frame was sent to the group, not to this member specifically
        const MULTICAST = 1 << 1;
        /// The single contained message is out-of-band. Never set on list frames: OOB
        ///  messages bypass batching.
        const OOB = 1 << 2;
    }
}

/// Checks the OOB marker on a raw frame without decoding it. This is what receive-side
///  classification runs on, so it has to work before any allocation or parsing.
pub fn is_oob_frame(data: &[u8]) -> bool {
    data.len() >= MIN_FRAME_LEN && FrameFlags::from_bits_truncate(data[2]).contains(FrameFlags::OOB)
}


pub struct DecodedFrame {
    pub messages: Vec<Message>,
    pub multicast: bool,
    pub oob: bool,
}

/// Writes a frame containing the given messages. A single message is framed without the list
///  envelope, both to save the count field and to allow setting the OOB marker, which only
///  has meaning for a frame holding exactly one message.
pub fn encode_frame(messages: &[Message], multicast: bool, buf: &mut impl BufMut) {
    let mut flags = FrameFlags::empty();
    if multicast {
        flags |= FrameFlags::MULTICAST;
    }

    match messages {
        [single] => {
            if single.is_oob() {
                flags |= FrameFlags::OOB;
            }
            buf.put_u16(WIRE_VERSION);
            buf.put_u8(flags.bits());
            single.ser(buf);
        }
        _ => {
            flags |= FrameFlags::LIST;
            buf.put_u16(WIRE_VERSION);
            buf.put_u8(flags.bits());
            buf.put_u32(messages.len().prechecked_cast());
            for message in messages {
                message.ser(buf);
            }
        }
    }
}

/// Parses a frame back into its messages.
///
/// Returns `Ok(None)` for a frame with a different wire version when
///  `discard_incompatible_version` is set. With the setting off, decoding proceeds on a
///  best-effort basis, which works for version bumps that leave the layout intact.
pub fn decode_frame(buf: &mut impl Buf, discard_incompatible_version: bool) -> anyhow::Result<Option<DecodedFrame>> {
    let version = buf.try_get_u16()?;
    if version != WIRE_VERSION {
        if discard_incompatible_version {
            return Ok(None);
        }
        warn!("received a frame with wire version {} (local version is {}), attempting to decode anyway", version, WIRE_VERSION);
    }

    let flags = FrameFlags::from_bits_truncate(buf.try_get_u8()?);
    let multicast = flags.contains(FrameFlags::MULTICAST);
    let oob = flags.contains(FrameFlags::OOB);

    let messages = if flags.contains(FrameFlags::LIST) {
        let num_messages: usize = buf.try_get_u32()?.safe_cast();
        if num_messages > buf.remaining() / 2 {
            // the smallest possible message record is two bytes
            bail!("frame claims {} messages in {} remaining bytes", num_messages, buf.remaining());
        }
        let mut messages = Vec::with_capacity(num_messages);
        for _ in 0..num_messages {
            messages.push(Message::try_deser(buf)?);
        }
        messages
    }
    else {
        vec![Message::try_deser(buf)?]
    };

    Ok(Some(DecodedFrame {
        messages,
        multicast,
        oob,
    }))
}
