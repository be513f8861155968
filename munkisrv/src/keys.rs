// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Decoding of the CloudFront signing key.
//!
//! The key is provided by the operator as PEM text, usually via the configuration file or an
//! environment variable. Operators export keys with whatever tool is at hand, so the PEM block
//! type is not trusted; the contents are tried as PKCS #1, PKCS #8, and SEC 1 in that order.

use openssl::{
    ec::EcKey,
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sign::Signer,
};

use crate::error::{KeyError, SignError};

/// The algorithm family of a [`PrivateKeyMaterial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyAlgorithm::Rsa => write!(f, "RSA"),
            KeyAlgorithm::Ec => write!(f, "EC"),
            KeyAlgorithm::Ed25519 => write!(f, "Ed25519"),
        }
    }
}

/// A decoded private key that is guaranteed to be usable for signing.
pub enum PrivateKeyMaterial {
    Rsa(Rsa<Private>),
    Ec(EcKey<Private>),
    Ed25519(PKey<Private>),
}

impl std::fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKeyMaterial")
            .field(&self.algorithm())
            .finish()
    }
}

impl PrivateKeyMaterial {
    /// Decode a PEM-encoded private key.
    ///
    /// The `label` is only used to identify the key in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidPem`] if there's no PEM block, [`KeyError::DisallowedAlgorithm`]
    /// if the block is a PKCS #8 key for an unsupported algorithm, and
    /// [`KeyError::UnrecognizedFormat`] if the block isn't a private key at all.
    pub fn from_pem(pem: &[u8], label: &str) -> Result<Self, KeyError> {
        // Anything before the first BEGIN line is ignored, and RFC 1421 headers are dropped,
        // which leaves an encrypted body that won't parse as any key format.
        let block = pem::parse(pem).map_err(|error| {
            tracing::debug!(label, %error, "No PEM block found");
            KeyError::InvalidPem {
                label: label.to_string(),
            }
        })?;
        let der = block.contents();

        if let Ok(key) = Rsa::private_key_from_der(der) {
            tracing::debug!(label, block_type = block.tag(), "Parsed PKCS #1 private key");
            return Ok(Self::Rsa(key));
        }
        if let Ok(key) = PKey::private_key_from_pkcs8(der) {
            tracing::debug!(label, block_type = block.tag(), "Parsed PKCS #8 private key");
            return Self::from_pkcs8(key).map_err(|id| KeyError::DisallowedAlgorithm {
                label: label.to_string(),
                algorithm: Nid::from_raw(id.as_raw())
                    .short_name()
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        if let Ok(key) = EcKey::private_key_from_der(der) {
            tracing::debug!(label, block_type = block.tag(), "Parsed SEC 1 private key");
            return Ok(Self::Ec(key));
        }

        Err(KeyError::UnrecognizedFormat {
            label: label.to_string(),
            block_type: block.tag().to_string(),
        })
    }

    fn from_pkcs8(key: PKey<Private>) -> Result<Self, Id> {
        match key.id() {
            Id::RSA => key.rsa().map(Self::Rsa).map_err(|_| Id::RSA),
            Id::EC => key.ec_key().map(Self::Ec).map_err(|_| Id::EC),
            Id::ED25519 => Ok(Self::Ed25519(key)),
            other => Err(other),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Rsa(_) => KeyAlgorithm::Rsa,
            Self::Ec(_) => KeyAlgorithm::Ec,
            Self::Ed25519(_) => KeyAlgorithm::Ed25519,
        }
    }

    /// Sign `payload`.
    ///
    /// RSA keys produce RSASSA-PKCS1-v1_5 signatures and EC keys produce DER-encoded ECDSA
    /// signatures, both over the SHA-1 digest of the payload since that is what CloudFront
    /// verifies. Ed25519 signs the payload directly.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignError> {
        match self {
            Self::Rsa(key) => {
                let key = PKey::from_rsa(key.clone())?;
                let mut signer = Signer::new(MessageDigest::sha1(), &key)?;
                Ok(signer.sign_oneshot_to_vec(payload)?)
            }
            Self::Ec(key) => {
                let digest = openssl::sha::sha1(payload);
                Ok(EcdsaSig::sign(&digest, key)?.to_der()?)
            }
            Self::Ed25519(key) => {
                let mut signer = Signer::new_without_digest(key)?;
                Ok(signer.sign_oneshot_to_vec(payload)?)
            }
        }
    }

    /// The PEM-encoded SubjectPublicKeyInfo for this key.
    ///
    /// This is the public key to upload to CloudFront.
    pub fn public_key_to_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        match self {
            Self::Rsa(key) => PKey::from_rsa(key.clone())?.public_key_to_pem(),
            Self::Ec(key) => PKey::from_ec_key(key.clone())?.public_key_to_pem(),
            Self::Ed25519(key) => key.public_key_to_pem(),
        }
    }
}
