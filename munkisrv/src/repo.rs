// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The on-disk Munki repository.
//!
//! Catalogs, manifests, icons, and client resources are small and are served directly from
//! the repository directory. Packages are never read from disk; they're redirected to the CDN.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

/// The file whose presence marks a usable repository.
const HEALTH_CHECK_FILE: &str = "catalogs/all";

#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    healthy: bool,
}

impl Repository {
    /// Open the repository rooted at `root`.
    ///
    /// The health of the repository is determined once, here: it's healthy if
    /// `catalogs/all` exists.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let check = root.join(HEALTH_CHECK_FILE);
        let healthy = check.is_file();
        if healthy {
            tracing::info!(root = %root.display(), "Munki repository opened");
        } else {
            tracing::warn!(
                root = %root.display(),
                missing = %check.display(),
                "Munki repository is missing its catalog; health checks will fail"
            );
        }

        Self { root, healthy }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Map a decoded request path to a file under the repository root.
    ///
    /// Returns `None` for paths that would leave the root.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }

        Some(resolved)
    }

    /// Read a file from the repository.
    ///
    /// Returns `Ok(None)` if the path escapes the root, doesn't exist, or is a directory. A
    /// path the filesystem rejects outright is treated as missing.
    pub async fn read(&self, path: &str) -> io::Result<Option<RepoFile>> {
        let Some(resolved) = self.resolve(path) else {
            tracing::debug!(path, "Refusing to serve a path outside the repository");
            return Ok(None);
        };

        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Ok(None),
            Err(error) if is_missing(&error) => return Ok(None),
            Err(error) => return Err(error),
        }
        let contents = match tokio::fs::read(&resolved).await {
            Ok(contents) => contents,
            Err(error) if is_missing(&error) => return Ok(None),
            Err(error) => return Err(error),
        };

        Ok(Some(RepoFile {
            content_type: content_type(&resolved),
            contents,
        }))
    }
}

// Names the filesystem can't represent, such as those with a NUL byte, can't exist either.
fn is_missing(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory | io::ErrorKind::InvalidInput
    )
}

/// A file read from the repository.
#[derive(Debug)]
pub struct RepoFile {
    pub content_type: &'static str,
    pub contents: Vec<u8>,
}

/// Pick a Content-Type from the file extension.
///
/// Catalogs and manifests have no extension; they're property lists.
fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("plist" | "xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("dmg") => "application/x-apple-diskimage",
        None => "application/xml",
        Some(_) => "application/octet-stream",
    }
}
