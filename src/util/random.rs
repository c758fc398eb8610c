use rand::{Rng, RngCore};
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of the random parts of a datagram (nonce and padding), abstracted to allow pinning them
///  in tests
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn fill_bytes(buf: &mut [u8]);

    /// a padding length in `0..=max`
    fn gen_padding_len(max: usize) -> usize;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn fill_bytes(buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf)
    }

    fn gen_padding_len(max: usize) -> usize {
        rand::thread_rng().gen_range(0..=max)
    }
}
