//! Reroute Proxy Library - selective TLS-intercepting redirect proxy
//!
//! Runs a forward proxy that decrypts only the tunnels whose host belongs to
//! the intercepted domain set, rewrites matching requests to a local gateway
//! and passes everything else through untouched.
//!
//! The proxy engine is `hudsucker`. The hooks it calls are implemented by
//! [`RerouteHttpHandler`] (tunnel decision and request rewrite) and
//! [`tls::UpstreamCertVerifier`] (upstream certificate trust).

pub mod service;
pub mod system_proxy;
pub mod tls;

pub use service::{ProxyService, ServiceError};
pub use system_proxy::{NoopSystemProxy, OsSystemProxy, SystemProxy};

use anyhow::{Context, Result};
use http::{header, Method, Uri};
use hudsucker::{hyper::Request, Body, HttpContext, HttpHandler, RequestOrResponse};
use reroute_core::{RedirectPolicy, RerouteConfig, RewriteDecision};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default proxy port
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Counters shared by all connections
#[derive(Debug, Default)]
pub struct RequestStats {
    seen: AtomicU64,
    rewritten: AtomicU64,
}

impl RequestStats {
    /// Requests observed by the request hook
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    /// Requests sent to the redirect target
    pub fn rewritten(&self) -> u64 {
        self.rewritten.load(Ordering::Relaxed)
    }
}

/// HTTP handler that decides interception and rewrites matching requests
#[derive(Clone)]
pub struct RerouteHttpHandler {
    policy: Arc<RedirectPolicy>,
    stats: Arc<RequestStats>,
}

impl RerouteHttpHandler {
    pub fn new(policy: Arc<RedirectPolicy>, stats: Arc<RequestStats>) -> Self {
        Self { policy, stats }
    }

    /// Tunnel hook: decrypt only hosts in the intercepted domain set
    pub fn decide_tunnel(&self, req: &Request<Body>) -> bool {
        let host = req.uri().host().unwrap_or_default();
        let intercept = self.policy.should_intercept(host);

        debug!(host = %host, intercept, "Tunnel decision");
        intercept
    }

    /// Request hook: point the request at the redirect target when a rule matches.
    ///
    /// Only the URI changes. Method, headers and body are forwarded as received.
    pub fn rewrite_request(&self, mut req: Request<Body>) -> Request<Body> {
        if req.method() == Method::CONNECT {
            return req;
        }

        self.stats.seen.fetch_add(1, Ordering::Relaxed);

        let Some((host, url)) = request_target(&req) else {
            debug!(uri = %req.uri(), "Request without a host, passing through");
            return req;
        };

        if let RewriteDecision::Rewrite { url: rewritten } = self.policy.build_rewrite(&host, &url)
        {
            match rewritten.parse::<Uri>() {
                Ok(uri) => {
                    *req.uri_mut() = uri;
                    self.stats.rewritten.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(
                    url = %rewritten,
                    error = %e,
                    "Rewritten URL rejected, leaving request unmodified"
                ),
            }
        }

        req
    }
}

impl HttpHandler for RerouteHttpHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        RequestOrResponse::Request(self.rewrite_request(req))
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, req: &Request<Body>) -> bool {
        self.decide_tunnel(req)
    }
}

/// Host and absolute URL of a request.
///
/// Proxied requests carry an absolute URI. Origin-form requests fall back to
/// the `Host` header.
fn request_target(req: &Request<Body>) -> Option<(String, String)> {
    let uri = req.uri();

    if let (Some(_), Some(host)) = (uri.scheme(), uri.host()) {
        return Some((host.to_string(), uri.to_string()));
    }

    let authority = req.headers().get(header::HOST)?.to_str().ok()?;
    let host = authority
        .parse::<http::uri::Authority>()
        .ok()?
        .host()
        .to_string();
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Some((host, format!("http://{}{}", authority, path)))
}

/// Run the proxy until Ctrl-C (or SIGTERM), then shut it down
pub async fn run_proxy(config: RerouteConfig, system_proxy: Arc<dyn SystemProxy>) -> Result<()> {
    let redirect_host = config.redirect.host.clone();
    let redirect_port = config.redirect.port;

    let service = ProxyService::new(config, system_proxy);

    let addr = service
        .start_configured()
        .await
        .context("Failed to start proxy")?;

    info!("=================================================");
    info!("  Reroute Proxy is running!");
    info!("  Proxy:    http://{}", addr);
    info!("  Redirect: http://{}:{}", redirect_host, redirect_port);
    info!("=================================================");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let stats = service.stats();
    service.shutdown().await.context("Error while stopping proxy")?;

    if let Some(stats) = stats {
        info!(
            "Total requests processed: {} ({} redirected)",
            stats.seen(),
            stats.rewritten()
        );
    }

    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
