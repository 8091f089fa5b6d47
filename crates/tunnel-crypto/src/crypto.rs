//! AES-256 primitives for one hop: the IV block transform and the CBC
//! payload layer, both applied in place.
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::types::{SessionKey, IV_LENGTH};

/// AES block length.
pub(crate) const BLOCK_LEN: usize = 16;

type Block = [u8; BLOCK_LEN];

/// Expanded key schedules for one hop's IV key and layer key.
///
/// Read-only after construction, so a single instance can serve any number
/// of threads. `Aes256` zeroizes its round keys on drop.
#[derive(Clone)]
pub(crate) struct LayerCipher {
    iv: Aes256,
    layer: Aes256,
}

impl LayerCipher {
    pub(crate) fn new(iv_key: &SessionKey, layer_key: &SessionKey) -> Self {
        Self {
            iv: Aes256::new(GenericArray::from_slice(iv_key.as_bytes())),
            layer: Aes256::new(GenericArray::from_slice(layer_key.as_bytes())),
        }
    }

    /// Single-block encryption of the IV under the IV key.
    pub(crate) fn encrypt_iv(&self, iv: &mut Block) {
        self.iv.encrypt_block(GenericArray::from_mut_slice(iv));
    }

    pub(crate) fn decrypt_iv(&self, iv: &mut Block) {
        self.iv.decrypt_block(GenericArray::from_mut_slice(iv));
    }

    /// CBC-encrypt `data` in place under the layer key.
    ///
    /// `data.len()` must be a multiple of [`BLOCK_LEN`].
    pub(crate) fn cbc_encrypt(&self, iv: &Block, data: &mut [u8]) {
        debug_assert_eq!(data.len() % BLOCK_LEN, 0);
        let mut prev = *iv;
        for block in data.chunks_exact_mut(BLOCK_LEN) {
            xor_into(block, &prev);
            self.layer.encrypt_block(GenericArray::from_mut_slice(block));
            prev.copy_from_slice(block);
        }
    }

    /// CBC-decrypt `data` in place under the layer key.
    pub(crate) fn cbc_decrypt(&self, iv: &Block, data: &mut [u8]) {
        debug_assert_eq!(data.len() % BLOCK_LEN, 0);
        let mut prev = *iv;
        let mut ciphertext = [0u8; BLOCK_LEN];
        for block in data.chunks_exact_mut(BLOCK_LEN) {
            ciphertext.copy_from_slice(block);
            self.layer.decrypt_block(GenericArray::from_mut_slice(block));
            xor_into(block, &prev);
            prev = ciphertext;
        }
    }
}

fn xor_into(block: &mut [u8], mask: &Block) {
    for (b, m) in block.iter_mut().zip(mask) {
        *b ^= m;
    }
}

/// Copy the IV out of the head of a tunnel message region.
pub(crate) fn read_iv(region: &[u8]) -> Block {
    let mut iv = [0u8; IV_LENGTH];
    iv.copy_from_slice(&region[..IV_LENGTH]);
    iv
}
