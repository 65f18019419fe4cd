use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    let mut result = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        result.push(buf.try_get_u8()?);
    }

    let s = String::from_utf8(result)?;
    Ok(s)
}

/// The number of bytes a value occupies when varint encoded - needed to precompute serialized
///  sizes without actually encoding.
pub fn varint_len(value: u64) -> usize {
    let significant_bits = (u64::BITS - value.leading_zeros()).max(1);
    significant_bits.div_ceil(7) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![1,97])]
    #[case::abc("abc", vec![3,97,98,99])]
    #[case::umlaut("ä", vec![2,0xc3,0xa4])]
    #[case::heart("❤️", vec![6, 226,157,164,239,184,143])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, &expected);

        let mut deser_buf = &buf[..];
        let deser = try_get_string(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_try_get_string_remaining() {
        let mut buf = &b"\x01abc"[..];
        let actual = try_get_string(&mut buf).unwrap();
        assert_eq!(&actual, "a");
        assert_eq!(buf, b"bc");
    }

    #[test]
    fn test_try_get_string_too_short() {
        let mut buf = &b"\x02a"[..];
        assert!(try_get_string(&mut buf).is_err());
    }

    #[test]
    fn test_try_get_string_not_unicode() {
        let mut buf = &b"\x02\xc0\xaf"[..];
        assert!(try_get_string(&mut buf).is_err());
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::one(1, 1)]
    #[case::max_one_byte(127, 1)]
    #[case::min_two_bytes(128, 2)]
    #[case::max_two_bytes(16383, 2)]
    #[case::min_three_bytes(16384, 3)]
    #[case::u32_max(u32::MAX as u64, 5)]
    #[case::u64_max(u64::MAX, 10)]
    fn test_varint_len(#[case] value: u64, #[case] expected: usize) {
        assert_eq!(varint_len(value), expected);

        let mut buf = BytesMut::new();
        buf.put_u64_varint(value);
        assert_eq!(buf.len(), expected);
    }
}
