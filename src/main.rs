use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use claimsrv::cli::Cli;
use claimsrv::lifecycle::Server;
use claimsrv::validation::ValidationPipeline;
use claimsrv::{config, telemetry};
use claimsrv_claims::{Account, Claims, Operator};
use claimsrv_notifier::Notifier;
use claimsrv_store::{ExpiryPolicy, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(telemetry::level_from_flags(cli.debug, cli.verbose), false)
        .context("failed to install tracing subscriber")?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cfg = config::load(&cli).context("failed to load configuration")?;

    let operator_jwt = cfg
        .operator_jwt_path
        .as_deref()
        .map(std::fs::read_to_string)
        .transpose()
        .context("failed to read operator JWT")?
        .map(|s| s.trim().to_string());

    let trusted_keys = match &operator_jwt {
        Some(encoded) => {
            let claims = Claims::<Operator>::decode(encoded).context("invalid operator JWT")?;
            let mut keys = vec![claims.subject.clone()];
            keys.extend(claims.metadata.valid_signers.unwrap_or_default());
            keys
        }
        None => Vec::new(),
    };

    let system_account = cfg
        .system_account_jwt_path
        .as_deref()
        .map(std::fs::read_to_string)
        .transpose()
        .context("failed to read system account JWT")?
        .map(|s| s.trim().to_string())
        .and_then(|encoded| {
            let subject = Claims::<Account>::decode(&encoded).ok()?.subject;
            Some((subject, encoded))
        });

    let store = if let Some(dir) = &cfg.store.dir {
        let policy = ExpiryPolicy {
            sweep_interval: Duration::from_secs(cfg.store.cleanup_interval),
            max_entries: cfg.store.max_entries,
        };
        Arc::new(
            Store::open_expiring_directory(dir, cfg.store.shard, cfg.store.read_only, policy)
                .context("failed to open claim store directory")?,
        )
    } else {
        Arc::new(Store::open_in_memory(cfg.store.read_only))
    };

    let mut connect_options = async_nats::ConnectOptions::new();
    if let Some(creds) = &cfg.nats.user_credentials {
        connect_options = connect_options.credentials_file(creds).await.context("invalid nats credentials file")?;
    }
    if let Some(ca_path) = cfg.nats.tls.as_ref().and_then(|tls| tls.ca.as_deref()) {
        let pem = std::fs::read_to_string(ca_path).context("failed to read nats CA bundle")?;
        let mut roots = async_nats::rustls::RootCertStore::empty();
        for item in rustls_pemfile::certs(&mut pem.as_bytes()) {
            let cert = item.context("invalid certificate in nats CA bundle")?;
            roots
                .add(cert)
                .context("failed to add certificate to nats root store")?;
        }
        let tls_client = async_nats::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        connect_options = connect_options.tls_client_config(tls_client).require_tls(true);
    }

    let node_id = nuid::next();
    let notifier = Arc::new(Notifier::pending(node_id));

    let validation = Arc::new(ValidationPipeline::new(
        trusted_keys,
        cfg.sign_request_subject.clone(),
        cfg.sign_request_timeout(),
        Arc::clone(&store),
        Arc::clone(&notifier),
    ));

    let server = Arc::new(Server::new(
        cfg,
        store,
        notifier,
        validation,
        operator_jwt,
        system_account,
        connect_options,
    ));

    let shutdown_server = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_server.stop().await;
    });

    server.start().await
}
