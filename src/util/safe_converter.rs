
/// For narrowing casts where protocol invariants keep the value in the narrower type's range,
///  e.g. segment sizes that are bounded by the configured datagram size.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: configuration validation should have ensured the value range")
    }
}
