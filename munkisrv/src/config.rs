// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Service configuration.

use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Configuration for munkisrv.
///
/// The file is TOML with three tables: `[server]`, `[cloudfront]`, and `[tls]`. Only
/// `[cloudfront]` is required; without `[tls]`, TLS is disabled.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub cloudfront: CloudfrontConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cloudfront: CloudfrontConfig {
                url: "https://d111111abcdef8.cloudfront.net/munki".to_string(),
                key_id: "K2JCJMDEHXQW5F".to_string(),
                private_key: String::new(),
            },
            tls: TlsConfig::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("cloudfront", &self.cloudfront)
            .field("tls", &self.tls)
            .finish()
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut redacted = self.clone();
        if !redacted.cloudfront.private_key.is_empty() {
            redacted.cloudfront.private_key = REDACTED.to_string();
        }
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&redacted).unwrap_or_default()
        )
    }
}

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The socket address to listen on for HTTP(S) connections.
    ///
    /// The default is to listen on all interfaces on port 8080.
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    /// The directory holding the Munki repository (catalogs, manifests, icons, and so on).
    ///
    /// Everything except packages is served from here; package requests are redirected to
    /// CloudFront.
    #[serde(default = "default_repo_directory")]
    pub repo_directory: PathBuf,
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0_u16; 8], 8080))
}

fn default_repo_directory() -> PathBuf {
    PathBuf::from("/var/lib/munkisrv/repo")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            repo_directory: default_repo_directory(),
        }
    }
}

/// The CloudFront distribution packages are redirected to.
#[derive(Clone, Serialize, Deserialize)]
pub struct CloudfrontConfig {
    /// The base URL of the distribution, optionally with a path prefix.
    ///
    /// A request for `/repo/pkgs/apps/Firefox.pkg` is redirected to `<url>/apps/Firefox.pkg`.
    pub url: String,
    /// The ID of the CloudFront public key that matches `private_key`.
    pub key_id: String,
    /// The PEM-encoded private key used to sign URLs.
    ///
    /// The key must be RSA, since CloudFront only verifies RSA-SHA1 signatures. It may be
    /// encoded as PKCS #1 or PKCS #8; EC keys in SEC 1 or PKCS #8 and Ed25519 keys decode,
    /// but are refused at startup. Rather than storing the key in the
    /// configuration file, it can be provided via the `MUNKISRV_CLOUDFRONT_PRIVATE_KEY`
    /// environment variable.
    #[serde(default)]
    pub private_key: String,
}

impl std::fmt::Debug for CloudfrontConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudfrontConfig")
            .field("url", &self.url)
            .field("key_id", &self.key_id)
            .field("private_key", &REDACTED)
            .finish()
    }
}

/// TLS settings for the listening socket.
///
/// Empty strings are treated the same as omitted fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Serve HTTPS rather than plain HTTP.
    ///
    /// When `false`, every other field is ignored.
    pub enabled: bool,
    /// The PEM-encoded server certificate, optionally followed by intermediates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    /// The PEM-encoded private key matching `cert_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// PEM-encoded certificate authorities used to verify client certificates.
    ///
    /// Required unless `client_auth` is "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// One of "none", "request", "require", "verify-if-given", or "require-and-verify".
    ///
    /// Defaults to "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_auth: Option<String>,
    /// One of "1.0", "1.1", "1.2", or "1.3"; defaults to "1.2".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    /// One of "1.0", "1.1", "1.2", or "1.3"; defaults to "1.3".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

fn non_empty_path(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|path| !path.as_os_str().is_empty())
}

fn non_empty_str(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

impl TlsConfig {
    pub fn cert_file(&self) -> Option<&Path> {
        non_empty_path(&self.cert_file)
    }

    pub fn key_file(&self) -> Option<&Path> {
        non_empty_path(&self.key_file)
    }

    pub fn ca_file(&self) -> Option<&Path> {
        non_empty_path(&self.ca_file)
    }

    pub fn client_auth(&self) -> Option<&str> {
        non_empty_str(&self.client_auth)
    }

    pub fn min_version(&self) -> Option<&str> {
        non_empty_str(&self.min_version)
    }

    pub fn max_version(&self) -> Option<&str> {
        non_empty_str(&self.max_version)
    }

    /// A summary of the settings suitable for logging.
    ///
    /// Only `enabled` is reported when TLS is disabled.
    pub fn info(&self) -> TlsInfo {
        if !self.enabled {
            return TlsInfo {
                enabled: false,
                ..Default::default()
            };
        }

        let path = |path: Option<&Path>| {
            Some(path.map(|path| path.display().to_string()).unwrap_or_default())
        };
        let text = |value: Option<&str>| Some(value.unwrap_or_default().to_string());
        TlsInfo {
            enabled: true,
            cert_file: path(self.cert_file()),
            key_file: path(self.key_file()),
            ca_file: path(self.ca_file()),
            client_auth: text(self.client_auth()),
            min_version: text(self.min_version()),
            max_version: text(self.max_version()),
        }
    }
}

/// The output of [`TlsConfig::info`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsInfo {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

impl std::fmt::Display for TlsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

impl FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

fn private_load_config(path: &Path) -> anyhow::Result<Config> {
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    config
        .parse::<Config>()
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", Config::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked.  If the default config doesn't exist, the [`Default`] implementation is returned. It's
/// expected that CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
pub fn load_config(path: Option<PathBuf>, default: &Path) -> anyhow::Result<Config> {
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(Config::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config(&path)
        },
    )
}
