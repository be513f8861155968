// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    net::SocketAddr,
    pin::Pin,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use http_body_util::{BodyExt, Empty};
use hyper::{body::Bytes, client::conn::http1, header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use munkisrv::{
    config::{CloudfrontConfig, Config, ServerConfig, TlsConfig},
    error::ValidationError,
    server,
};
use munkisrv_test::{create_pki, create_repo, keys, sample, Pki};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVersion};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_openssl::SslStream;
use url::Url;

const CDN_BASE: &str = "https://cdn.example.com/munki";
const KEY_ID: &str = "K2JCJMDEHXQW5F";

struct Instance {
    pub listener: server::Listener,
    // Dropping TempDir cleans up the directory, but it needs to live to the end of the test.
    #[allow(dead_code)]
    pub repo_dir: tempfile::TempDir,
}

async fn create_instance(tls: TlsConfig) -> anyhow::Result<Instance> {
    let repo_dir = create_repo()?;
    let config = Config {
        server: ServerConfig {
            listen_address: SocketAddr::from_str("127.0.0.1:0")?,
            repo_directory: repo_dir.path().to_path_buf(),
        },
        cloudfront: CloudfrontConfig {
            url: CDN_BASE.to_string(),
            key_id: KEY_ID.to_string(),
            private_key: keys::RSA_PKCS1_FIXTURE.to_string(),
        },
        tls,
    };
    let listener = server::listen(config).await?;

    Ok(Instance { listener, repo_dir })
}

fn tls_config(pki: &Pki) -> TlsConfig {
    TlsConfig {
        enabled: true,
        cert_file: Some(pki.server_certificate.clone()),
        key_file: Some(pki.server_private_key.clone()),
        ..Default::default()
    }
}

/// Send one request over an established connection and collect the response body.
async fn request<S>(stream: S, method: Method, path: &str) -> anyhow::Result<Response<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(connection);

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, "localhost")
        .body(Empty::<Bytes>::new())?;
    let (parts, body) = sender.send_request(request).await?.into_parts();
    let body = body.collect().await?.to_bytes();

    Ok(Response::from_parts(parts, body))
}

async fn http_request(
    addr: SocketAddr,
    method: Method,
    path: &str,
) -> anyhow::Result<Response<Bytes>> {
    let stream = TcpStream::connect(addr).await?;
    request(stream, method, path).await
}

#[derive(Default)]
struct ClientOptions {
    with_certificate: bool,
    max_version: Option<SslVersion>,
}

async fn tls_connect(
    addr: SocketAddr,
    pki: &Pki,
    options: ClientOptions,
) -> anyhow::Result<SslStream<TcpStream>> {
    let mut connector = SslConnector::builder(SslMethod::tls_client())?;
    connector.set_ca_file(&pki.ca_certificate)?;
    if options.with_certificate {
        connector.set_certificate_file(&pki.client_certificate, SslFiletype::PEM)?;
        connector.set_private_key_file(&pki.client_private_key, SslFiletype::PEM)?;
    }
    connector.set_max_proto_version(options.max_version)?;
    let ssl = connector.build().configure()?.into_ssl("localhost")?;

    let tcp_stream = TcpStream::connect(addr).await?;
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    Pin::new(&mut stream).connect().await?;

    Ok(stream)
}

async fn https_request(
    addr: SocketAddr,
    pki: &Pki,
    options: ClientOptions,
    method: Method,
    path: &str,
) -> anyhow::Result<Response<Bytes>> {
    let stream = tls_connect(addr, pki, options).await?;
    request(stream, method, path).await
}

fn assert_signed_redirect(
    response: &Response<Bytes>,
    expected_resource: &str,
) -> anyhow::Result<()> {
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get(header::LOCATION)
        .context("no Location header")?
        .to_str()?;
    assert!(
        location.starts_with(&format!("{expected_resource}?Expires=")),
        "unexpected Location: {location}"
    );

    let location = Url::parse(location)?;
    let expires: u64 = location
        .query_pairs()
        .find(|(key, _)| key == "Expires")
        .context("no Expires parameter")?
        .1
        .parse()?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    assert!(expires > now + 3500 && expires <= now + 3600);
    assert!(location.query_pairs().any(|(key, _)| key == "Signature"));
    assert!(location
        .query_pairs()
        .any(|(key, value)| key == "Key-Pair-Id" && value == KEY_ID));

    Ok(())
}

#[tokio::test]
async fn plain_http() -> anyhow::Result<()> {
    let instance = create_instance(TlsConfig::default()).await?;
    let addr = instance.listener.local_addr();
    assert!(!instance.listener.is_tls());

    let response = http_request(addr, Method::GET, "/repo/pkgs/apps/Firefox-120.0.pkg").await?;
    assert_signed_redirect(&response, "https://cdn.example.com/munki/apps/Firefox-120.0.pkg")?;
    assert!(response.body().is_empty());

    let response = http_request(addr, Method::HEAD, "/repo/pkgs/apps/Firefox-120.0.pkg").await?;
    assert_signed_redirect(&response, "https://cdn.example.com/munki/apps/Firefox-120.0.pkg")?;

    let response = http_request(addr, Method::GET, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = http_request(addr, Method::GET, "/repo/catalogs/all").await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), sample::CATALOG.as_bytes());

    let response = http_request(addr, Method::GET, "/repo/catalogs/does-not-exist").await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    for path in [
        "/repo/pkgs/apps/../../catalogs/all",
        "/repo/pkgs/apps%2F..%2F..%2Fsecret.pkg",
    ] {
        let response = http_request(addr, Method::GET, path).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        assert!(response.headers().get(header::LOCATION).is_none());
    }

    instance.listener.halt().await?;
    Ok(())
}

#[tokio::test]
async fn halt_stops_listening() -> anyhow::Result<()> {
    let instance = create_instance(TlsConfig::default()).await?;
    let addr = instance.listener.local_addr();
    let response = http_request(addr, Method::GET, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);

    let halt_token = instance.listener.halt_token();
    halt_token.cancel();
    instance.listener.wait_to_finish().await?;
    assert!(http_request(addr, Method::GET, "/healthz").await.is_err());

    Ok(())
}

#[tokio::test]
async fn tls() -> anyhow::Result<()> {
    let pki = create_pki()?;
    let instance = create_instance(tls_config(&pki)).await?;
    let addr = instance.listener.local_addr();
    assert!(instance.listener.is_tls());

    let response =
        https_request(addr, &pki, ClientOptions::default(), Method::GET, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = https_request(
        addr,
        &pki,
        ClientOptions::default(),
        Method::GET,
        "/repo/pkgs/apps/Firefox-120.0.pkg",
    )
    .await?;
    assert_signed_redirect(&response, "https://cdn.example.com/munki/apps/Firefox-120.0.pkg")?;

    // Plain HTTP on the TLS port gets nothing useful back.
    assert!(http_request(addr, Method::GET, "/healthz").await.is_err());

    // The listener keeps working after a failed handshake.
    let response =
        https_request(addr, &pki, ClientOptions::default(), Method::GET, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);

    instance.listener.halt().await?;
    Ok(())
}

#[tokio::test]
async fn tls_minimum_version() -> anyhow::Result<()> {
    let pki = create_pki()?;
    let instance = create_instance(TlsConfig {
        min_version: Some("1.3".to_string()),
        ..tls_config(&pki)
    })
    .await?;
    let addr = instance.listener.local_addr();

    let result = https_request(
        addr,
        &pki,
        ClientOptions {
            max_version: Some(SslVersion::TLS1_2),
            ..Default::default()
        },
        Method::GET,
        "/healthz",
    )
    .await;
    assert!(result.is_err());

    let response =
        https_request(addr, &pki, ClientOptions::default(), Method::GET, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);

    instance.listener.halt().await?;
    Ok(())
}

#[tokio::test]
async fn mutual_tls() -> anyhow::Result<()> {
    let pki = create_pki()?;
    let instance = create_instance(TlsConfig {
        ca_file: Some(pki.ca_certificate.clone()),
        client_auth: Some("require-and-verify".to_string()),
        ..tls_config(&pki)
    })
    .await?;
    let addr = instance.listener.local_addr();

    let with_certificate = || ClientOptions {
        with_certificate: true,
        ..Default::default()
    };
    let response =
        https_request(addr, &pki, with_certificate(), Method::GET, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);

    // With TLS 1.3 the client may finish its side of the handshake before the server
    // rejects it, so the failure can surface on the request rather than the connect.
    let result =
        https_request(addr, &pki, ClientOptions::default(), Method::GET, "/healthz").await;
    assert!(result.is_err(), "request without a certificate succeeded: {result:?}");

    let response = https_request(
        addr,
        &pki,
        with_certificate(),
        Method::GET,
        "/repo/pkgs/apps/Firefox-120.0.pkg",
    )
    .await?;
    assert_signed_redirect(&response, "https://cdn.example.com/munki/apps/Firefox-120.0.pkg")?;

    instance.listener.halt().await?;
    Ok(())
}

#[tokio::test]
async fn optional_client_certificate() -> anyhow::Result<()> {
    let pki = create_pki()?;
    let instance = create_instance(TlsConfig {
        ca_file: Some(pki.ca_certificate.clone()),
        client_auth: Some("verify-if-given".to_string()),
        ..tls_config(&pki)
    })
    .await?;
    let addr = instance.listener.local_addr();

    let response =
        https_request(addr, &pki, ClientOptions::default(), Method::GET, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let response = https_request(
        addr,
        &pki,
        ClientOptions {
            with_certificate: true,
            ..Default::default()
        },
        Method::GET,
        "/healthz",
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);

    instance.listener.halt().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_tls_config_is_fatal() -> anyhow::Result<()> {
    let pki = create_pki()?;

    let result = create_instance(TlsConfig {
        cert_file: None,
        ..tls_config(&pki)
    })
    .await;
    let error = result.err().context("listen should fail without a certificate")?;
    assert_eq!(
        error.downcast_ref::<ValidationError>(),
        Some(&ValidationError::CertFileRequired)
    );

    let result = create_instance(TlsConfig {
        client_auth: Some("require".to_string()),
        ..tls_config(&pki)
    })
    .await;
    let error = result.err().context("listen should fail without a CA")?;
    assert_eq!(
        error.downcast_ref::<ValidationError>(),
        Some(&ValidationError::CaFileRequired("require".to_string()))
    );

    let result = create_instance(TlsConfig {
        key_file: Some(pki.unrelated_private_key.clone()),
        ..tls_config(&pki)
    })
    .await;
    assert!(result.is_err());

    Ok(())
}
