//! Start/stop orchestration for the resolver process: trusted-key loading,
//! store/notifier/listener bring-up in order, and a mirrored shutdown that
//! drains in-flight requests before closing the store.
//!
//! A single mutex around start/stop makes a duplicate stop call a no-op
//! rather than a double-close panic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use claimsrv_notifier::Notifier;
use claimsrv_store::Store;

use crate::bootstrap;
use crate::config::Config;
use crate::http::{self, AppState};
use crate::tls;
use crate::validation::ValidationPipeline;

pub struct Server {
    config: Config,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    validation: Arc<ValidationPipeline>,
    operator_jwt: Option<String>,
    system_account: Option<(String, String)>,
    nats_connect_options: async_nats::ConnectOptions,
    lifecycle: Mutex<()>,
    started: AtomicBool,
    handle: Handle,
    notifier_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        validation: Arc<ValidationPipeline>,
        operator_jwt: Option<String>,
        system_account: Option<(String, String)>,
        nats_connect_options: async_nats::ConnectOptions,
    ) -> Self {
        Server {
            config,
            store,
            notifier,
            validation,
            operator_jwt,
            system_account,
            nats_connect_options,
            lifecycle: Mutex::new(()),
            started: AtomicBool::new(false),
            handle: Handle::new(),
            notifier_task: Mutex::new(None),
            sweep_task: Mutex::new(None),
        }
    }

    /// Starts the notifier's connect-and-reconcile loop in the background,
    /// pulls a bootstrap pack if configured as a replica, then serves HTTP
    /// until `stop` shuts the listener's `Handle` down.
    ///
    /// The notifier is spawned first and never awaited here: a NATS outage
    /// at startup must not stop the replica bootstrap or the HTTP listener
    /// from coming up and serving whatever is already on disk.
    ///
    /// The lifecycle mutex only guards the started-flag transition, not the
    /// serve loop itself — holding it for the whole call would deadlock
    /// against a concurrent `stop`.
    pub async fn start(&self) -> Result<()> {
        {
            let _guard = self.lifecycle.lock().unwrap();
            if self.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        let notifier = Arc::clone(&self.notifier);
        let notifier_store = Arc::clone(&self.store);
        let nats_servers = self.config.nats.servers.clone();
        let nats_options = self.nats_connect_options.clone();
        let reconnect_wait = self.config.nats_reconnect_wait();
        let task = tokio::spawn(async move {
            if let Err(err) = notifier
                .run(&nats_servers, nats_options, notifier_store, reconnect_wait)
                .await
            {
                warn!(%err, "notifier loop exited");
            }
        });
        *self.notifier_task.lock().unwrap() = Some(task);

        if self.config.primary.is_some() {
            // Replica deployments commonly sit behind the same private CA as
            // the message bus, so the bootstrap fetch reuses it.
            let extra_ca = self.config.nats.tls.as_ref().and_then(|tls| tls.ca.as_deref());
            let tls_config = tls::client_config(extra_ca)?;
            let client = reqwest::Client::builder()
                .use_preconfigured_tls(tls_config)
                .build()
                .context("failed to build bootstrap HTTP client")?;
            bootstrap::run(
                &self.store,
                self.config.primary.as_deref(),
                self.config.max_replication_pack,
                self.config.replication_timeout(),
                &client,
            )
            .await;
        }

        let sweep_store = Arc::clone(&self.store);
        let sweep_interval = Duration::from_secs(self.config.store.cleanup_interval);
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweep_store.sweep_expired();
                if removed > 0 {
                    debug!(removed, "swept expired claims");
                }
            }
        });
        *self.sweep_task.lock().unwrap() = Some(sweep_task);

        let state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            validation: Arc::clone(&self.validation),
            operator_jwt: self.operator_jwt.clone(),
            system_account: self.system_account.clone(),
        });
        let app = http::router(state);
        let addr: SocketAddr = self
            .config
            .http
            .addr()
            .parse()
            .context("invalid HTTP listen address")?;

        info!(%addr, "starting HTTP listener");
        let tls_paths = self
            .config
            .http
            .tls
            .as_ref()
            .and_then(|tls| Some((tls.cert.as_ref()?, tls.key.as_ref()?)));
        let result = if let Some((cert, key)) = tls_paths {
            let tls_config = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("failed to load TLS certificate/key")?;
            axum_server::bind_rustls(addr, tls_config)
                .handle(self.handle.clone())
                .serve(app.into_make_service())
                .await
        } else {
            axum_server::bind(addr)
                .handle(self.handle.clone())
                .serve(app.into_make_service())
                .await
        };
        result.context("HTTP server exited with an error")
    }

    /// Stops accepting new connections, waits briefly for in-flight requests
    /// to drain, then tears down the notifier and store. Safe to call more
    /// than once or before `start` returns.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().unwrap();
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.handle.graceful_shutdown(Some(Duration::from_secs(10)));

        if let Some(task) = self.notifier_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.sweep_task.lock().unwrap().take() {
            task.abort();
        }

        self.store.close();
        debug!("store closed");
    }
}
