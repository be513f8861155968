// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use munkisrv::{
    config::{load_config, Config},
    keys::PrivateKeyMaterial,
    server, tls,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "munkisrv/config.toml";

/// Serve a Munki repository, redirecting package downloads to CloudFront.
///
/// Catalogs, manifests, and other metadata are served from the repository directory. Requests
/// under /repo/pkgs/ are redirected to the CloudFront distribution with a signed URL that
/// is valid for one hour.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the service's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the service configuration,
    /// run the `config` subcommand.
    #[arg(long, short, env = "MUNKISRV_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "MUNKISRV_LOG", default_value = "WARN,munkisrv=INFO")]
    pub log_filter: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the service.
    Listen {
        /// Override the socket address from the configuration file.
        #[arg(long, env = "MUNKISRV_LISTEN_ADDRESS")]
        listen_address: Option<SocketAddr>,

        /// The PEM-encoded CloudFront signing key.
        ///
        /// This overrides `cloudfront.private_key` in the configuration file, and is the
        /// recommended way to provide the key. It can't be passed as an argument.
        #[arg(long, env = "MUNKISRV_CLOUDFRONT_PRIVATE_KEY", hide_env_values = true, hide = true)]
        cloudfront_private_key: Option<String>,
    },

    /// See the current service configuration.
    Config {
        /// The PEM-encoded CloudFront signing key.
        ///
        /// If provided, the matching public key is printed.
        #[arg(long, env = "MUNKISRV_CLOUDFRONT_PRIVATE_KEY", hide_env_values = true, hide = true)]
        cloudfront_private_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "MUNKISRV_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config = load_config(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        Command::Listen {
            listen_address,
            cloudfront_private_key,
        } => {
            if let Some(listen_address) = listen_address {
                config.server.listen_address = listen_address;
            }
            if let Some(private_key) = cloudfront_private_key {
                config.cloudfront.private_key = private_key;
            }

            let root_span = tracing::info_span!("munkisrv");
            async move {
                let listener = server::listen(config).await?;
                tokio::spawn(signal_handler(listener.halt_token()));

                listener.wait_to_finish().await?;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(root_span)
            .await?;
        }
        Command::Config {
            cloudfront_private_key,
        } => {
            if let Some(private_key) = cloudfront_private_key {
                config.cloudfront.private_key = private_key;
            }
            print_config(&config);
        }
    }

    Ok(())
}

fn print_config(config: &Config) {
    println!(
        "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
    );
    println!("# TLS summary\n\n{}", config.tls.info());

    _ = tls::validate(&config.tls).inspect_err(|error| {
        eprintln!("The configuration format is valid, but the TLS settings aren't: {error}");
    });

    if config.cloudfront.private_key.is_empty() {
        eprintln!("No CloudFront private key is configured; set MUNKISRV_CLOUDFRONT_PRIVATE_KEY");
        return;
    }
    match PrivateKeyMaterial::from_pem(
        config.cloudfront.private_key.as_bytes(),
        "CloudFront private key",
    )
    .map_err(anyhow::Error::from)
    .and_then(|key| Ok(key.public_key_to_pem()?))
    {
        Ok(public_key) => println!(
            "# CloudFront public key for key ID {}\n\n{}",
            config.cloudfront.key_id,
            String::from_utf8_lossy(&public_key)
        ),
        Err(error) => eprintln!("The CloudFront private key is invalid: {error:?}"),
    }
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting new
/// requests. In-flight requests will be allowed to complete before the process
/// shuts down.
async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
