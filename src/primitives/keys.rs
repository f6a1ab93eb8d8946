// Copyright (c) 2024 The Inkchain Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::Hash128;
use p384::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::elliptic_curve::generic_array::GenericArray;
use p384::pkcs8::{DecodePrivateKey, EncodePublicKey};
use p384::SecretKey;
use std::fmt;

/// Size of a P-384 field element in bytes.
const FIELD_BYTES: usize = 48;

#[derive(Debug)]
pub enum KeyErr {
    /// The provided private key could not be deserialised.
    InvalidKey,

    /// The key could not produce a signature.
    SigningFailed,
}

impl fmt::Display for KeyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyErr::InvalidKey => write!(f, "invalid private key encoding"),
            KeyErr::SigningFailed => write!(f, "signing failed"),
        }
    }
}

impl std::error::Error for KeyErr {}

/// The miner's ECDSA P-384 identity. The public identity string is the
/// lowercase hex of the SPKI DER encoding of the public key; it is what
/// appears in blocks (`miner_pub_key`) and operations (`pub_key`), and it
/// is registered with the directory on startup.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
    public_hex: String,
}

impl Identity {
    /// Parses a hex-encoded DER private key. Both SEC1 and PKCS#8 documents
    /// are accepted since key generation tooling differs on this.
    pub fn from_private_key_hex(hex_str: &str) -> Result<Self, KeyErr> {
        let der = hex::decode(hex_str.trim()).map_err(|_| KeyErr::InvalidKey)?;
        let secret = SecretKey::from_sec1_der(&der)
            .or_else(|_| SecretKey::from_pkcs8_der(&der))
            .map_err(|_| KeyErr::InvalidKey)?;
        Self::from_secret(secret)
    }

    /// Generates a fresh identity.
    pub fn generate() -> Result<Self, KeyErr> {
        Self::from_secret(SecretKey::random(&mut rand::rngs::OsRng))
    }

    fn from_secret(secret: SecretKey) -> Result<Self, KeyErr> {
        let spki = secret
            .public_key()
            .to_public_key_der()
            .map_err(|_| KeyErr::InvalidKey)?;
        let public_hex = hex::encode(spki.as_bytes());
        Ok(Self {
            signing: SigningKey::from(secret),
            public_hex,
        })
    }

    #[must_use]
    pub fn public_key_hex(&self) -> &str {
        &self.public_hex
    }

    /// Signs an operation's canonical bytes. The hex DER signature doubles
    /// as the shape hash clients use to refer to the operation, so it must
    /// be stable for the lifetime of the chain.
    pub fn sign_op_bytes(&self, bytes: &[u8]) -> Result<String, KeyErr> {
        let digest = Hash128::hash_bytes(bytes);
        let prehash = widen_digest(&digest.0).ok_or(KeyErr::SigningFailed)?;
        let sig: Signature = self
            .signing
            .sign_prehash(&prehash)
            .map_err(|_| KeyErr::SigningFailed)?;
        Ok(hex::encode(sig.to_der().as_bytes()))
    }

    /// Signs a prehashed message, returning the raw `(r, s)` scalar pair.
    /// This is the client side of the request authentication handshake.
    pub fn sign_prehashed(&self, prehash: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyErr> {
        let prehash = widen_digest(prehash).ok_or(KeyErr::SigningFailed)?;
        let sig: Signature = self
            .signing
            .sign_prehash(&prehash)
            .map_err(|_| KeyErr::SigningFailed)?;
        let (r, s) = sig.split_bytes();
        Ok((r.to_vec(), s.to_vec()))
    }

    /// Authenticates a client request: the embedded hash must be the MD5 of
    /// the message bytes and `(r, s)` must verify against this identity's
    /// public key. Proves the caller holds the miner's own private key.
    #[must_use]
    pub fn verify_request(&self, msg: &[u8], hashed_msg: &[u8], r: &[u8], s: &[u8]) -> bool {
        if Hash128::hash_bytes(msg).0 != *hashed_msg {
            return false;
        }
        let Some(prehash) = widen_digest(hashed_msg) else {
            return false;
        };

        let (Some(r), Some(s)) = (pad_scalar(r), pad_scalar(s)) else {
            return false;
        };
        let sig = match Signature::from_scalars(r, s) {
            Ok(sig) => sig,
            Err(_) => return false,
        };

        let verifying: &VerifyingKey = self.signing.verifying_key();
        verifying.verify_prehash(&prehash, &sig).is_ok()
    }
}

/// Left-pads a digest to the field size. The curve backend rejects
/// prehashes shorter than half a field element, which every MD5 digest
/// is; both signing and verification must widen identically.
fn widen_digest(digest: &[u8]) -> Option<[u8; FIELD_BYTES]> {
    if digest.is_empty() || digest.len() > FIELD_BYTES {
        return None;
    }
    let mut out = [0u8; FIELD_BYTES];
    out[FIELD_BYTES - digest.len()..].copy_from_slice(digest);
    Some(out)
}

/// Left-pads a big-endian scalar to the field size. Signers strip leading
/// zeroes from big integers, so short encodings are legitimate.
fn pad_scalar(bytes: &[u8]) -> Option<GenericArray<u8, p384::elliptic_curve::consts::U48>> {
    if bytes.is_empty() || bytes.len() > FIELD_BYTES {
        return None;
    }
    let mut out = [0u8; FIELD_BYTES];
    out[FIELD_BYTES - bytes.len()..].copy_from_slice(bytes);
    Some(GenericArray::clone_from_slice(&out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_auth_accepts_own_key() {
        let identity = Identity::generate().unwrap();
        let msg = b"open canvas please".to_vec();
        let hashed = Hash128::hash_bytes(&msg).0.to_vec();
        let (r, s) = identity.sign_prehashed(&hashed).unwrap();

        assert!(identity.verify_request(&msg, &hashed, &r, &s));
    }

    #[test]
    fn request_auth_rejects_other_key() {
        let identity = Identity::generate().unwrap();
        let intruder = Identity::generate().unwrap();
        let msg = b"open canvas please".to_vec();
        let hashed = Hash128::hash_bytes(&msg).0.to_vec();
        let (r, s) = intruder.sign_prehashed(&hashed).unwrap();

        assert!(!identity.verify_request(&msg, &hashed, &r, &s));
    }

    #[test]
    fn request_auth_rejects_tampered_message() {
        let identity = Identity::generate().unwrap();
        let msg = b"draw a line".to_vec();
        let hashed = Hash128::hash_bytes(&msg).0.to_vec();
        let (r, s) = identity.sign_prehashed(&hashed).unwrap();

        assert!(!identity.verify_request(b"draw a square", &hashed, &r, &s));
    }

    #[test]
    fn op_signatures_are_stable() {
        let identity = Identity::generate().unwrap();
        let sig1 = identity.sign_op_bytes(b"op bytes").unwrap();
        let sig2 = identity.sign_op_bytes(b"op bytes").unwrap();
        assert_eq!(sig1, sig2);
        assert_ne!(sig1, identity.sign_op_bytes(b"other bytes").unwrap());
    }
}
