// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# munkisrv

munkisrv serves a [Munki][1] repository. Catalogs, manifests, icons, and other small files are
served from a local directory, while requests for packages under `/repo/pkgs/` are answered with
a temporary redirect to a CloudFront distribution. Each redirect carries a [canned-policy signed
URL][2] that expires an hour after it was issued, so the distribution can be private.

## Components

* [`keys`] decodes the CloudFront signing key from PEM (PKCS #1, PKCS #8, or SEC 1).
* [`signer`] produces the signed URLs.
* [`tls`] validates and builds the optional (mutual) TLS policy for the listening socket.
* [`server`] ties these together behind an [axum][3] router.

## Crate features

* **cli** -
  Include the `munkisrv` command line interface. This is a default feature.

[1]: https://github.com/munki/munki
[2]: https://docs.aws.amazon.com/AmazonCloudFront/latest/DeveloperGuide/private-content-creating-signed-url-canned-policy.html
[3]: https://docs.rs/axum
*/

pub mod config;
pub mod error;
pub mod keys;
pub mod repo;
pub mod server;
pub mod signer;
pub mod tls;
