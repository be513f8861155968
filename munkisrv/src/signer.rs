// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! CloudFront signed URLs.
//!
//! Package downloads are redirected to CloudFront with a canned policy: the signature covers
//! the exact resource URL and an expiry time, nothing else. Refer to the [CloudFront
//! documentation][1] for the format.
//!
//! [1]: https://docs.aws.amazon.com/AmazonCloudFront/latest/DeveloperGuide/private-content-creating-signed-url-canned-policy.html

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use percent_encoding::percent_decode_str;
use serde::Serialize;
use url::{form_urlencoded, Url};

use crate::{
    error::SignError,
    keys::{KeyAlgorithm, PrivateKeyMaterial},
};

/// How long a signed package URL remains valid.
pub const SIGNED_URL_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Query parameters CloudFront interprets; a URL that already has one can't be signed.
const RESERVED_PARAMETERS: [&str; 4] = ["Expires", "Signature", "Key-Pair-Id", "Policy"];

#[derive(Serialize)]
struct CannedPolicy<'a> {
    #[serde(rename = "Statement")]
    statement: [Statement<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Statement<'a> {
    resource: &'a str,
    condition: Condition,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Condition {
    date_less_than: EpochTime,
}

#[derive(Serialize)]
struct EpochTime {
    #[serde(rename = "AWS:EpochTime")]
    epoch_time: u64,
}

impl<'a> CannedPolicy<'a> {
    fn new(resource: &'a str, expires: u64) -> Self {
        Self {
            statement: [Statement {
                resource,
                condition: Condition {
                    date_less_than: EpochTime {
                        epoch_time: expires,
                    },
                },
            }],
        }
    }
}

/// A URL with the CloudFront signature parameters appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    url: String,
    expires: u64,
}

impl SignedUrl {
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// The expiry embedded in the URL, in seconds since the Unix epoch.
    pub fn expires(&self) -> u64 {
        self.expires
    }
}

/// Signs URLs on behalf of a CloudFront key pair.
///
/// The signer is built once at startup and shared, read-only, by every request handler.
#[derive(Debug)]
pub struct UrlSigner {
    key_id: String,
    key: PrivateKeyMaterial,
}

impl UrlSigner {
    /// Create a signer for the CloudFront public key identified by `key_id`.
    ///
    /// # Errors
    ///
    /// CloudFront verifies canned policies with RSA-SHA1, so any other key type is rejected
    /// with [`SignError::UnsupportedKey`].
    pub fn new(key_id: impl Into<String>, key: PrivateKeyMaterial) -> Result<Self, SignError> {
        match key.algorithm() {
            KeyAlgorithm::Rsa => Ok(Self {
                key_id: key_id.into(),
                key,
            }),
            other => Err(SignError::UnsupportedKey(other)),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn key(&self) -> &PrivateKeyMaterial {
        &self.key
    }

    /// Sign `url` so that CloudFront serves it until `expires`.
    ///
    /// The expiry is truncated to whole seconds.
    ///
    /// # Errors
    ///
    /// The URL must be an absolute HTTP(S) URL without any of the CloudFront signing
    /// parameters, and `expires` must be in the future.
    pub fn sign(&self, url: &str, expires: SystemTime) -> Result<SignedUrl, SignError> {
        validate_url(url)?;
        match expires.duration_since(SystemTime::now()) {
            Ok(remaining) if !remaining.is_zero() => {}
            _ => return Err(SignError::ExpiryNotInFuture),
        }
        let expires = expires
            .duration_since(UNIX_EPOCH)
            .map_err(|_| SignError::ExpiryNotInFuture)?
            .as_secs();

        let policy = serde_json::to_vec(&CannedPolicy::new(url, expires))?;
        let signature = cloudfront_base64(&self.key.sign(&policy)?);
        let key_id = form_urlencoded::byte_serialize(self.key_id.as_bytes()).collect::<String>();
        let separator = if url.contains('?') { '&' } else { '?' };

        Ok(SignedUrl {
            url: format!("{url}{separator}Expires={expires}&Signature={signature}&Key-Pair-Id={key_id}"),
            expires,
        })
    }

    /// Sign `url` with an expiry of [`SIGNED_URL_LIFETIME`] from now.
    pub fn sign_with_default_lifetime(&self, url: &str) -> Result<SignedUrl, SignError> {
        self.sign(url, SystemTime::now() + SIGNED_URL_LIFETIME)
    }
}

fn validate_url(url: &str) -> Result<(), SignError> {
    let invalid = |reason: String| SignError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|error| invalid(error.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    if let Some((name, _)) = parsed
        .query_pairs()
        .find(|(name, _)| RESERVED_PARAMETERS.contains(&name.as_ref()))
    {
        return Err(SignError::ReservedParameter(name.into_owned()));
    }

    Ok(())
}

/// Base64 with the substitutions CloudFront requires for query strings.
fn cloudfront_base64(data: &[u8]) -> String {
    openssl::base64::encode_block(data)
        .chars()
        .map(|c| match c {
            '+' => '-',
            '=' => '_',
            '/' => '~',
            c => c,
        })
        .collect()
}

fn is_current_dir(segment: &str) -> bool {
    percent_decode_str(segment).decode_utf8_lossy() == "."
}

// Encoded separators count, so `apps%2F..` names the parent just as `apps/..` does once an
// origin decodes it.
fn has_parent_component(segment: &str) -> bool {
    percent_decode_str(segment)
        .decode_utf8_lossy()
        .split(['/', '\\'])
        .any(|component| component == "..")
}

/// Build the CDN URL for a package.
///
/// `path` is the portion of the request path below the packages prefix, still
/// percent-encoded as received. Segments are compared in their decoded form: empty and `.`
/// segments are dropped, and a `..` anywhere, including behind an encoded `/` or `\`, is
/// refused with [`SignError::PathTraversal`] so the signed URL can't leave the base.
pub fn package_url(base: &Url, path: &str) -> Result<Url, SignError> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        if segment.is_empty() || is_current_dir(segment) {
            continue;
        }
        if has_parent_component(segment) {
            return Err(SignError::PathTraversal);
        }
        segments.push(segment);
    }

    let mut url = base.clone();
    url.set_path(&format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        segments.join("/")
    ));
    Ok(url)
}
