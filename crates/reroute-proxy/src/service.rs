//! Proxy lifecycle
//!
//! [`ProxyService`] owns the engine: it builds the redirect policy, binds the
//! listener, starts hudsucker with the reroute hooks and registers the system
//! proxy. `start` and `shutdown` are guarded by a compare-and-set run state,
//! so a second start fails and a second shutdown is a no-op.

use crate::system_proxy::{registration_host, SystemProxy};
use crate::tls::{self, CertificateAuthority, TlsError};
use crate::{RequestStats, RerouteHttpHandler};
use hudsucker::Proxy;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use reroute_core::{ConfigError, RerouteConfig, RunState, RunStateCell};
use rustls::crypto::aws_lc_rs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors surfaced by [`ProxyService::start`] and [`ProxyService::shutdown`]
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Proxy is already {0}")]
    AlreadyRunning(RunState),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("Proxy engine error: {0}")]
    Engine(String),
}

/// Handles of a running engine
struct RunningProxy {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<(), hudsucker::Error>>,
    stats: Arc<RequestStats>,
    system_proxy_registered: bool,
}

/// Starts and stops the proxy engine
pub struct ProxyService {
    config: RerouteConfig,
    system_proxy: Arc<dyn SystemProxy>,
    state: RunStateCell,
    running: Mutex<Option<RunningProxy>>,
}

impl ProxyService {
    pub fn new(config: RerouteConfig, system_proxy: Arc<dyn SystemProxy>) -> Self {
        Self {
            config,
            system_proxy,
            state: RunStateCell::new(),
            running: Mutex::new(None),
        }
    }

    /// Current run state
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.addr)
    }

    /// Request counters of the current run
    pub fn stats(&self) -> Option<Arc<RequestStats>> {
        self.lock_running().as_ref().map(|r| r.stats.clone())
    }

    /// Start with the listen and redirect settings from the configuration
    pub async fn start_configured(&self) -> Result<SocketAddr, ServiceError> {
        let proxy = &self.config.proxy;
        let redirect = &self.config.redirect;
        self.start(
            &proxy.listen_host,
            proxy.listen_port,
            &redirect.host,
            redirect.port,
        )
        .await
    }

    /// Start the proxy and return the bound address.
    ///
    /// Listen port 0 picks a free port. On any failure the service is left
    /// stopped.
    pub async fn start(
        &self,
        listen_host: &str,
        listen_port: u16,
        redirect_host: &str,
        redirect_port: u16,
    ) -> Result<SocketAddr, ServiceError> {
        self.state
            .begin_start()
            .map_err(ServiceError::AlreadyRunning)?;

        match self
            .launch(listen_host, listen_port, redirect_host, redirect_port)
            .await
        {
            Ok(running) => {
                let addr = running.addr;
                *self.lock_running() = Some(running);
                self.state.set(RunState::Running);
                info!(addr = %addr, "Proxy started");
                Ok(addr)
            }
            Err(e) => {
                self.state.set(RunState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        listen_host: &str,
        listen_port: u16,
        redirect_host: &str,
        redirect_port: u16,
    ) -> Result<RunningProxy, ServiceError> {
        if listen_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost.into());
        }

        let mut redirect = self.config.redirect.clone();
        redirect.host = redirect_host.to_string();
        redirect.port = redirect_port;
        let policy = Arc::new(redirect.to_policy()?);

        let bind_addr = format!("{}:{}", listen_host, listen_port);
        let listener = TcpListener::bind((listen_host, listen_port))
            .await
            .map_err(|source| ServiceError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ServiceError::Bind {
                addr: bind_addr,
                source,
            })?;

        let ca = match self.config.tls.ca_paths() {
            Some((cert_path, key_path)) => {
                let ca = CertificateAuthority::load_or_create(&cert_path, &key_path)?;
                info!(
                    path = %cert_path.display(),
                    "Trust this root certificate to decrypt intercepted domains"
                );
                ca
            }
            None => {
                warn!("Root certificate is not persisted, clients will reject intercepted tunnels");
                CertificateAuthority::generate()?
            }
        };

        let provider = aws_lc_rs::default_provider();
        let connector = tls::upstream_connector(Arc::new(provider.clone()))?;
        let authority = ca.into_authority(self.config.tls.cache_size, provider);

        let stats = Arc::new(RequestStats::default());
        let handler = RerouteHttpHandler::new(policy.clone(), stats.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_client(Client::builder(TokioExecutor::new()).build(connector))
            .with_http_handler(handler)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .build()
            .map_err(|e| ServiceError::Engine(e.to_string()))?;

        let task = tokio::spawn(proxy.start());

        debug!(
            domains = ?policy.domains().suffixes(),
            target = %policy.target().base_url(),
            "Redirect policy installed"
        );

        let mut system_proxy_registered = false;
        if self.config.proxy.configure_system_proxy {
            match self
                .system_proxy
                .enable(&registration_host(addr), addr.port())
            {
                Ok(()) => system_proxy_registered = true,
                Err(e) => warn!("Failed to configure system proxy: {}", e),
            }
        }

        Ok(RunningProxy {
            addr,
            shutdown_tx,
            task,
            stats,
            system_proxy_registered,
        })
    }

    /// Stop the proxy. Calling it when not running does nothing.
    ///
    /// In-flight connections get the configured drain window, after which
    /// the engine is aborted, so this always returns in bounded time.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        if let Err(current) = self.state.begin_stop() {
            debug!(state = %current, "Shutdown requested while not running");
            return Ok(());
        }

        let Some(running) = self.lock_running().take() else {
            self.state.set(RunState::Stopped);
            return Ok(());
        };

        if running.system_proxy_registered {
            if let Err(e) = self.system_proxy.disable() {
                warn!("Failed to clear system proxy: {}", e);
            }
        }

        let _ = running.shutdown_tx.send(());

        let drain = Duration::from_secs(self.config.proxy.shutdown_timeout_secs);
        let mut task = running.task;
        let result = match tokio::time::timeout(drain, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(ServiceError::Engine(e.to_string())),
            Ok(Err(e)) => Err(ServiceError::Engine(e.to_string())),
            Err(_) => {
                warn!(
                    timeout_secs = drain.as_secs(),
                    "Connections still open after drain window, aborting"
                );
                task.abort();
                Ok(())
            }
        };

        self.state.set(RunState::Stopped);
        info!(
            requests = running.stats.seen(),
            redirected = running.stats.rewritten(),
            "Proxy stopped"
        );

        result
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningProxy>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProxyService {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            if running.system_proxy_registered {
                if let Err(e) = self.system_proxy.disable() {
                    warn!("Failed to clear system proxy: {}", e);
                }
            }
            let _ = running.shutdown_tx.send(());
            running.task.abort();
        }
    }
}
