// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! TLS policy for the listening socket.
//!
//! [`validate`] checks a [`TlsConfig`] without reading any file contents, and [`build`]
//! compiles it into an [`SslAcceptor`]. Both reject unknown version and client
//! authentication literals; absent (or empty) fields use the defaults of TLS 1.2, TLS 1.3,
//! and [`ClientAuth::None`].

use std::{fmt::Display, path::Path, str::FromStr};

use openssl::{
    ssl::{SslAcceptor, SslAcceptorBuilder, SslFiletype, SslMethod, SslVerifyMode, SslVersion},
    x509::X509,
};

use crate::{
    config::TlsConfig,
    error::{BuildError, ValidationError},
};

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub const DEFAULT_MIN: Self = Self::Tls12;
    pub const DEFAULT_MAX: Self = Self::Tls13;

    pub fn ssl_version(self) -> SslVersion {
        match self {
            Self::Tls10 => SslVersion::TLS1,
            Self::Tls11 => SslVersion::TLS1_1,
            Self::Tls12 => SslVersion::TLS1_2,
            Self::Tls13 => SslVersion::TLS1_3,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1.0" => Ok(Self::Tls10),
            "1.1" => Ok(Self::Tls11),
            "1.2" => Ok(Self::Tls12),
            "1.3" => Ok(Self::Tls13),
            _ => Err(s.to_string()),
        }
    }
}

impl Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tls10 => "1.0",
            Self::Tls11 => "1.1",
            Self::Tls12 => "1.2",
            Self::Tls13 => "1.3",
        })
    }
}

/// How the server treats client certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientAuth {
    /// Don't ask for a client certificate.
    #[default]
    None,
    /// Ask for a certificate, but accept the connection with or without one. Any certificate
    /// presented is accepted without verification.
    Request,
    /// Require a certificate, but don't verify it.
    Require,
    /// Ask for a certificate and verify it against the CA file if one is presented.
    VerifyIfGiven,
    /// Require a certificate that verifies against the CA file.
    RequireAndVerify,
}

impl ClientAuth {
    /// The OpenSSL verification mode for this policy.
    pub fn verify_mode(self) -> SslVerifyMode {
        match self {
            Self::None => SslVerifyMode::NONE,
            Self::Request | Self::VerifyIfGiven => SslVerifyMode::PEER,
            Self::Require | Self::RequireAndVerify => {
                SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
            }
        }
    }

    /// Whether a presented certificate must chain to the configured CA.
    pub fn verifies_chain(self) -> bool {
        matches!(self, Self::VerifyIfGiven | Self::RequireAndVerify)
    }
}

impl FromStr for ClientAuth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "request" => Ok(Self::Request),
            "require" => Ok(Self::Require),
            "verify-if-given" => Ok(Self::VerifyIfGiven),
            "require-and-verify" => Ok(Self::RequireAndVerify),
            _ => Err(s.to_string()),
        }
    }
}

impl Display for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Request => "request",
            Self::Require => "require",
            Self::VerifyIfGiven => "verify-if-given",
            Self::RequireAndVerify => "require-and-verify",
        })
    }
}

/// The literal settings of an enabled [`TlsConfig`], parsed and checked for consistency.
struct Policy<'a> {
    cert_file: &'a Path,
    key_file: &'a Path,
    ca_file: Option<&'a Path>,
    client_auth: ClientAuth,
    min_version: TlsVersion,
    max_version: TlsVersion,
}

impl<'a> Policy<'a> {
    fn resolve(config: &'a TlsConfig) -> Result<Self, ValidationError> {
        let cert_file = config
            .cert_file()
            .ok_or(ValidationError::CertFileRequired)?;
        let key_file = config.key_file().ok_or(ValidationError::KeyFileRequired)?;

        let version = |field: &'static str, value: Option<&str>, default: TlsVersion| {
            value.map_or(Ok(default), |value| {
                value
                    .parse::<TlsVersion>()
                    .map_err(|value| ValidationError::InvalidVersion { field, value })
            })
        };
        let min_version = version("min_version", config.min_version(), TlsVersion::DEFAULT_MIN)?;
        let max_version = version("max_version", config.max_version(), TlsVersion::DEFAULT_MAX)?;

        let client_auth = config.client_auth().map_or(Ok(ClientAuth::None), |value| {
            value
                .parse::<ClientAuth>()
                .map_err(ValidationError::InvalidClientAuth)
        })?;

        let ca_file = config.ca_file();
        if client_auth != ClientAuth::None && ca_file.is_none() {
            return Err(ValidationError::CaFileRequired(client_auth.to_string()));
        }
        if min_version > max_version {
            return Err(ValidationError::VersionRange {
                min: min_version.to_string(),
                max: max_version.to_string(),
            });
        }

        Ok(Self {
            cert_file,
            key_file,
            ca_file,
            client_auth,
            min_version,
            max_version,
        })
    }
}

/// Check a TLS configuration before any socket is bound.
///
/// A disabled configuration is always valid. Referenced files must exist, but their contents
/// are not inspected; [`build`] reports unparseable files.
///
/// # Errors
///
/// The first problem found is returned.
pub fn validate(config: &TlsConfig) -> Result<(), ValidationError> {
    if !config.enabled {
        return Ok(());
    }

    let cert_file = config
        .cert_file()
        .ok_or(ValidationError::CertFileRequired)?;
    let key_file = config.key_file().ok_or(ValidationError::KeyFileRequired)?;
    for (field, path) in [
        ("cert_file", Some(cert_file)),
        ("key_file", Some(key_file)),
        ("ca_file", config.ca_file()),
    ] {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ValidationError::MissingFile {
                    field,
                    path: path.to_path_buf(),
                });
            }
        }
    }

    Policy::resolve(config).map(|_| ())
}

/// A server TLS context built from a [`TlsConfig`].
pub struct TlsContext {
    acceptor: SslAcceptor,
    min_version: TlsVersion,
    max_version: TlsVersion,
    client_auth: ClientAuth,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn acceptor(&self) -> &SslAcceptor {
        &self.acceptor
    }

    pub fn min_version(&self) -> TlsVersion {
        self.min_version
    }

    pub fn max_version(&self) -> TlsVersion {
        self.max_version
    }

    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }
}

fn acceptor_builder(min_version: TlsVersion) -> Result<SslAcceptorBuilder, BuildError> {
    // The v5 profile disables everything older than TLS 1.2 outright.
    let builder = if min_version < TlsVersion::Tls12 {
        SslAcceptor::mozilla_intermediate(SslMethod::tls_server())?
    } else {
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?
    };

    Ok(builder)
}

fn load_ca_certificates(path: &Path) -> Result<Vec<X509>, BuildError> {
    let pem = std::fs::read(path).map_err(|source| BuildError::ReadCa {
        path: path.to_path_buf(),
        source,
    })?;
    match X509::stack_from_pem(&pem) {
        Ok(certs) if !certs.is_empty() => Ok(certs),
        _ => Err(BuildError::ParseCa {
            path: path.to_path_buf(),
        }),
    }
}

/// Build the server TLS context.
///
/// Returns `Ok(None)` when TLS is disabled.
///
/// # Errors
///
/// Any literal [`validate`] would reject is an error here as well. The certificate chain and
/// private key must load and match. If a CA file is configured it must contain at least one
/// PEM certificate; those certificates are advertised to clients and used to verify client
/// certificates.
#[tracing::instrument(skip_all, err)]
pub fn build(config: &TlsConfig) -> Result<Option<TlsContext>, BuildError> {
    if !config.enabled {
        tracing::debug!("TLS is disabled");
        return Ok(None);
    }
    let policy = Policy::resolve(config)?;

    let mut acceptor = acceptor_builder(policy.min_version)?;
    acceptor.set_min_proto_version(Some(policy.min_version.ssl_version()))?;
    acceptor.set_max_proto_version(Some(policy.max_version.ssl_version()))?;
    // The key is loaded first: OpenSSL drops a key that doesn't match a certificate loaded
    // after it, and check_private_key then reports the mismatch.
    acceptor
        .set_private_key_file(policy.key_file, SslFiletype::PEM)
        .map_err(|source| BuildError::PrivateKey {
            path: policy.key_file.to_path_buf(),
            source,
        })?;
    acceptor
        .set_certificate_chain_file(policy.cert_file)
        .map_err(|source| BuildError::Certificate {
            path: policy.cert_file.to_path_buf(),
            source,
        })?;
    acceptor
        .check_private_key()
        .map_err(BuildError::KeyMismatch)?;

    if let Some(ca_file) = policy.ca_file {
        let certs = load_ca_certificates(ca_file)?;
        tracing::debug!(
            ca_file = %ca_file.display(),
            certificates = certs.len(),
            "Loaded client certificate authorities"
        );
        for cert in certs {
            acceptor.add_client_ca(&cert)?;
            acceptor.cert_store_mut().add_cert(cert)?;
        }
    }

    let mode = policy.client_auth.verify_mode();
    if policy.client_auth.verifies_chain() {
        acceptor.set_verify(mode);
    } else {
        // Certificates are requested, but anything the client presents is accepted.
        acceptor.set_verify_callback(mode, |_preverify_ok, _context| true);
    }

    tracing::info!(
        min_version = %policy.min_version,
        max_version = %policy.max_version,
        client_auth = %policy.client_auth,
        "TLS context built"
    );
    Ok(Some(TlsContext {
        acceptor: acceptor.build(),
        min_version: policy.min_version,
        max_version: policy.max_version,
        client_auth: policy.client_auth,
    }))
}
