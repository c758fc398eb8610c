use md5::{Digest, Md5};

pub const NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 8;

const BLOCK_LEN: usize = 16;

/// Keyed MD5 over the pre-shared secret: an authentication tag and a keystream for XOR
///  obfuscation, both bound to a per-datagram nonce.
///
/// The keystream's first block is `MD5(nonce | secret)`, every following block is
///  `MD5(previous block | secret)`.
pub struct Obfuscation {
    secret: Vec<u8>,
}

impl Obfuscation {
    pub fn new(secret: &[u8]) -> Obfuscation {
        Obfuscation {
            secret: secret.to_vec(),
        }
    }

    /// first bytes of `MD5(nonce | secret | plaintext)`
    pub fn auth_tag(&self, nonce: &[u8], plaintext: &[u8]) -> [u8; TAG_LEN] {
        let digest: [u8; BLOCK_LEN] = Md5::new()
            .chain_update(nonce)
            .chain_update(&self.secret)
            .chain_update(plaintext)
            .finalize()
            .into();

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        tag
    }

    /// XORs the buffer with the nonce's keystream. Applying it twice is the identity.
    pub fn apply_keystream(&self, nonce: &[u8], buf: &mut [u8]) {
        let mut block: [u8; BLOCK_LEN] = Md5::new()
            .chain_update(nonce)
            .chain_update(&self.secret)
            .finalize()
            .into();

        for chunk in buf.chunks_mut(BLOCK_LEN) {
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
            block = Md5::new()
                .chain_update(block)
                .chain_update(&self.secret)
                .finalize()
                .into();
        }
    }
}
