// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! AES-256-CBC with PKCS7 padding, the payload cipher of encrypted
//! messages. The envelope carries the per-message IV in the clear; only
//! the payload bytes pass through here.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const BLOCK_SIZE: usize = 16;

/// Encrypt the plaintext, padding it to the AES block size.
///
/// The output is always a whole number of blocks, at least one block
/// longer than `plaintext` demands (PKCS7 always pads).
pub fn cbc_encrypt(plaintext: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> Vec<u8> {
    let mut buffer = vec![0u8; plaintext.len() + BLOCK_SIZE];
    buffer[..plaintext.len()].copy_from_slice(plaintext);

    let cipher = Aes256CbcEnc::new(key.into(), iv.into());
    let written = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .expect("buffer is sized to fit the padding")
        .len();

    buffer.truncate(written);
    buffer
}

/// Decrypt the ciphertext and strip the PKCS7 padding.
pub fn cbc_decrypt(ciphertext: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> Result<Vec<u8>, Error> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::InvalidBuffer);
    }

    let mut buffer = ciphertext.to_vec();
    let cipher = Aes256CbcDec::new(key.into(), iv.into());
    let len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| Error::InvalidBuffer)?
        .len();

    buffer.truncate(len);
    Ok(buffer)
}
