/// A conversion that can fail based on the actual value (e.g. usize -> u32), but with the
///  twist that calling code 'knows' it can never fail at runtime because of checks against
///  configured bounds. So the conversion panics if it fails after all.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

/// A numeric cast that is lossless for every possible input value, i.e. to a strictly wider
///  type. This is what `as` does, but with a compile time guarantee that no truncation can
///  sneak in when one of the types changes.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        if self > u32::MAX as usize {
            panic!("value {} exceeds u32 range", self);
        }
        self as u32
    }
}

impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}
