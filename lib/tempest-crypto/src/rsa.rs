// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! RSA operations for the handshake: signing the public key material and
//! wrapping the session key under the peer's public encryption key.

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{Error, HashAlgorithm};

const KEY_BITS: usize = 2048;

/// The public half of an asymmetric key, importable from the bytes the
/// peer sent during the handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PublicKey {
    pub fn from_der(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            inner: RsaPublicKey::from_pkcs1_der(bytes).map_err(|_| Error::InvalidKey)?,
        })
    }

    /// Exports the key in the form it travels on the wire.
    pub fn to_der(&self) -> Vec<u8> {
        self.inner
            .to_pkcs1_der()
            .expect("a valid rsa public key always encodes")
            .as_bytes()
            .to_vec()
    }

    /// Verifies an RSA signature over `data` made with the private half.
    pub fn verify(&self, algorithm: HashAlgorithm, data: &[u8], signature: &[u8]) -> bool {
        let (padding, digest) = digest_for(algorithm, data);
        self.inner.verify(padding, &digest, signature).is_ok()
    }

    /// Encrypts a small secret (the session key) for the private half.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        self.inner
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext)
            .map_err(|_| Error::Asymmetric)
    }
}

/// An asymmetric key pair owned by one end of a connection.
pub struct PrivateKey {
    inner: RsaPrivateKey,
    public: PublicKey,
}

impl PrivateKey {
    /// Generates a fresh 2048-bit key pair.
    pub fn generate() -> Result<Self, Error> {
        let inner =
            RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS).map_err(|_| Error::KeyGeneration)?;
        let public = PublicKey {
            inner: inner.to_public_key(),
        };
        Ok(Self { inner, public })
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, algorithm: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, Error> {
        let (padding, digest) = digest_for(algorithm, data);
        self.inner
            .sign(padding, &digest)
            .map_err(|_| Error::Asymmetric)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.inner
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| Error::Asymmetric)
    }
}

fn digest_for(algorithm: HashAlgorithm, data: &[u8]) -> (Pkcs1v15Sign, Vec<u8>) {
    match algorithm {
        HashAlgorithm::Sha256 => (
            Pkcs1v15Sign::new::<Sha256>(),
            Sha256::digest(data).to_vec(),
        ),
        HashAlgorithm::Sha1 => (Pkcs1v15Sign::new::<Sha1>(), Sha1::digest(data).to_vec()),
    }
}
