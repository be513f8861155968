// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the key decoder, URL signer, and TLS policy builder.

use std::path::PathBuf;

/// Errors returned while decoding the CloudFront signing key.
///
/// These only occur at startup and are always fatal.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The input does not contain a PEM block, or the block's body is not valid base64.
    ///
    /// Empty input also produces this error.
    #[error("failed to decode {label}: no valid PEM block found")]
    InvalidPem { label: String },

    /// The PEM block decoded, but its contents are not a PKCS #1, PKCS #8, or SEC 1 private key.
    #[error("failed to parse {label} of type {block_type}")]
    UnrecognizedFormat { label: String, block_type: String },

    /// The PKCS #8 container parsed, but holds a key for an algorithm other than RSA, EC,
    /// or Ed25519.
    #[error("unmarshaled PKCS8 {label} is not an RSA, ECDSA, or Ed25519 private key (found {algorithm})")]
    DisallowedAlgorithm { label: String, algorithm: String },
}

/// Errors that occur while producing a signed URL.
///
/// These are scoped to a single request; the HTTP layer maps them to an error status and
/// never exposes the details to the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignError {
    /// The URL to sign is not an absolute HTTP(S) URL.
    #[error("invalid URL to sign ({url}): {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The URL to sign already includes a query parameter that the signature would add.
    #[error("URL already contains the reserved query parameter '{0}'")]
    ReservedParameter(String),

    /// The requested expiry is not after the signing instant.
    #[error("the expiry must be in the future")]
    ExpiryNotInFuture,

    /// The key can't produce the signatures CloudFront verifies (RSA with SHA-1).
    #[error("CloudFront signed URLs require an RSA key, not {0}")]
    UnsupportedKey(crate::keys::KeyAlgorithm),

    /// The request path includes a `..` segment.
    #[error("the request path contains a parent directory segment")]
    PathTraversal,

    /// Encoding the policy statement failed.
    #[error("failed to encode the policy statement: {0}")]
    Policy(#[from] serde_json::Error),

    /// The signing primitive failed.
    ///
    /// This is likely a bug or a problem with the system OpenSSL library.
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

/// Errors reported by [`crate::tls::validate`].
///
/// Validation only inspects the configuration and the filesystem metadata; no file is parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("tls.cert_file is required when tls.enabled is true")]
    CertFileRequired,

    #[error("tls.key_file is required when tls.enabled is true")]
    KeyFileRequired,

    /// A path in the configuration doesn't reference an existing file.
    #[error("tls.{field} does not exist: {}", path.display())]
    MissingFile { field: &'static str, path: PathBuf },

    #[error("invalid tls.{field}: {value}")]
    InvalidVersion { field: &'static str, value: String },

    #[error("invalid tls.client_auth: {0}")]
    InvalidClientAuth(String),

    /// Any client authentication mode other than "none" needs a trust store.
    #[error("tls.ca_file is required when tls.client_auth is '{0}'")]
    CaFileRequired(String),

    #[error("tls.min_version ({min}) is greater than tls.max_version ({max})")]
    VersionRange { min: String, max: String },
}

/// Errors reported by [`crate::tls::build`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The configuration failed the same checks [`crate::tls::validate`] performs.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// The server certificate (chain) could not be loaded.
    #[error("failed to load server certificate from {}: {source}", path.display())]
    Certificate {
        path: PathBuf,
        source: openssl::error::ErrorStack,
    },

    /// The server private key could not be loaded.
    #[error("failed to load server private key from {}: {source}", path.display())]
    PrivateKey {
        path: PathBuf,
        source: openssl::error::ErrorStack,
    },

    /// The private key does not match the certificate.
    #[error("the server private key does not match the certificate: {0}")]
    KeyMismatch(openssl::error::ErrorStack),

    /// The CA certificate file could not be read.
    #[error("failed to read CA certificate {}: {source}", path.display())]
    ReadCa {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The CA certificate file exists, but contains no PEM-encoded certificates.
    #[error("failed to parse CA certificate {}", path.display())]
    ParseCa { path: PathBuf },

    /// Returned in the event that OpenSSL rejects the derived configuration.
    #[error("openssl could not be configured: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}
