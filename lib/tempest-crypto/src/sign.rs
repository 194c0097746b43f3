// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

/// Hash algorithms a peer may offer for message signing.
///
/// The client lists the algorithms it supports in preference order during
/// the handshake; the server picks the first one both sides share, and the
/// selection applies to every authenticated message on the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
}

impl HashAlgorithm {
    /// The algorithm name as carried inside `Connect` and
    /// `AcknowledgeConnect`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha1 => "SHA1",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SHA256" => Some(Self::Sha256),
            "SHA1" => Some(Self::Sha1),
            _ => None,
        }
    }

    /// Every algorithm this build understands, in preference order.
    pub fn all() -> &'static [HashAlgorithm] {
        &[Self::Sha256, Self::Sha1]
    }
}

/// Signs and verifies steady-state messages with an HMAC keyed by the
/// session key negotiated in the handshake.
#[derive(Clone)]
pub struct MessageSigner {
    algorithm: HashAlgorithm,
    key: [u8; 32],
}

impl MessageSigner {
    pub fn new(algorithm: HashAlgorithm, key: [u8; 32]) -> Self {
        Self { algorithm, key }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
                    .expect("hmac accepts keys of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key)
                    .expect("hmac accepts keys of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Constant-time verification of a received signature.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
                    .expect("hmac accepts keys of any size");
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
            HashAlgorithm::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key)
                    .expect("hmac accepts keys of any size");
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let signer = MessageSigner::new(HashAlgorithm::Sha256, [9u8; 32]);
        let tag = signer.sign(b"frame bytes");
        assert_eq!(tag.len(), 32);
        assert!(signer.verify(b"frame bytes", &tag));
    }

    #[test]
    fn tampered_data_fails_verification() {
        let signer = MessageSigner::new(HashAlgorithm::Sha256, [9u8; 32]);
        let tag = signer.sign(b"frame bytes");
        assert!(!signer.verify(b"frame byteS", &tag));
    }

    #[test]
    fn different_keys_disagree() {
        let a = MessageSigner::new(HashAlgorithm::Sha256, [1u8; 32]);
        let b = MessageSigner::new(HashAlgorithm::Sha256, [2u8; 32]);
        let tag = a.sign(b"payload");
        assert!(!b.verify(b"payload", &tag));
    }

    #[test]
    fn sha1_produces_twenty_bytes() {
        let signer = MessageSigner::new(HashAlgorithm::Sha1, [9u8; 32]);
        let tag = signer.sign(b"frame bytes");
        assert_eq!(tag.len(), 20);
        assert!(signer.verify(b"frame bytes", &tag));
    }

    #[test]
    fn names_round_trip() {
        for algorithm in HashAlgorithm::all() {
            assert_eq!(HashAlgorithm::from_name(algorithm.name()), Some(*algorithm));
        }
        assert_eq!(HashAlgorithm::from_name("MD5"), None);
    }
}
