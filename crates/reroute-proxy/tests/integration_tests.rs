//! Integration tests for Reroute Proxy
//!
//! These drive the full service on loopback: lifecycle, system proxy
//! registration through a recording stub, opaque and decrypted CONNECT
//! tunnels, and requests rerouted to a local fake gateway.

use anyhow::Result;
use reroute_core::{RerouteConfig, RunState};
use reroute_proxy::{ProxyService, ServiceError, SystemProxy};
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Records every call instead of touching the OS
#[derive(Default)]
struct RecordingSystemProxy {
    calls: Mutex<Vec<String>>,
}

impl RecordingSystemProxy {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl SystemProxy for RecordingSystemProxy {
    fn enable(&self, host: &str, port: u16) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("enable {}:{}", host, port));
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        self.calls.lock().unwrap().push("disable".to_string());
        Ok(())
    }
}

/// System proxy whose registration always fails
#[derive(Default)]
struct FailingSystemProxy {
    disable_calls: AtomicUsize,
}

impl SystemProxy for FailingSystemProxy {
    fn enable(&self, _host: &str, _port: u16) -> Result<()> {
        anyhow::bail!("networksetup -setwebproxy exited with exit status: 1")
    }

    fn disable(&self) -> Result<()> {
        self.disable_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config() -> RerouteConfig {
    let mut config = RerouteConfig::default();
    config.proxy.shutdown_timeout_secs = 1;
    config.tls.persist_ca = false;
    config
}

/// Read a response head byte by byte so no tunneled bytes are consumed
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed inside the response head");
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Accept one connection and echo everything back
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    port
}

/// Accept one connection and answer with the request line it received
async fn spawn_fake_gateway() -> (u16, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }

        let head = String::from_utf8_lossy(&head).into_owned();
        let request_line = head.lines().next().unwrap_or_default().to_string();

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            request_line.len(),
            request_line
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();

        head
    });

    (port, handle)
}

#[tokio::test]
async fn test_lifecycle_registers_and_clears_system_proxy() {
    let recorder = Arc::new(RecordingSystemProxy::default());
    let service = ProxyService::new(test_config(), recorder.clone());

    let addr = service
        .start("127.0.0.1", 0, "127.0.0.1", 8888)
        .await
        .unwrap();
    assert_eq!(service.state(), RunState::Running);
    assert_eq!(recorder.calls(), vec![format!("enable 127.0.0.1:{}", addr.port())]);

    service.shutdown().await.unwrap();
    assert_eq!(service.state(), RunState::Stopped);
    assert_eq!(recorder.calls().last().map(String::as_str), Some("disable"));

    // Second shutdown is a no-op
    service.shutdown().await.unwrap();
    assert_eq!(service.state(), RunState::Stopped);
    assert_eq!(recorder.calls().len(), 2);
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let service = ProxyService::new(test_config(), Arc::new(RecordingSystemProxy::default()));

    let addr = service
        .start("127.0.0.1", 0, "127.0.0.1", 8888)
        .await
        .unwrap();

    let err = service
        .start("127.0.0.1", 0, "127.0.0.1", 8888)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyRunning(RunState::Running)));

    // The first run is unaffected
    assert_eq!(service.local_addr(), Some(addr));
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_after_shutdown() {
    let service = ProxyService::new(test_config(), Arc::new(RecordingSystemProxy::default()));

    service.start("127.0.0.1", 0, "127.0.0.1", 8888).await.unwrap();
    service.shutdown().await.unwrap();

    service.start("127.0.0.1", 0, "127.0.0.1", 8888).await.unwrap();
    assert_eq!(service.state(), RunState::Running);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let service = ProxyService::new(test_config(), Arc::new(RecordingSystemProxy::default()));
    let err = service
        .start("127.0.0.1", port, "127.0.0.1", 8888)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Bind { .. }));
    assert_eq!(service.state(), RunState::Stopped);
}

#[tokio::test]
async fn test_system_proxy_failure_is_not_fatal() {
    let system_proxy = Arc::new(FailingSystemProxy::default());
    let service = ProxyService::new(test_config(), system_proxy.clone());

    service.start("127.0.0.1", 0, "127.0.0.1", 8888).await.unwrap();
    assert_eq!(service.state(), RunState::Running);

    service.shutdown().await.unwrap();
    assert_eq!(service.state(), RunState::Stopped);

    // Nothing was registered, so nothing is cleared
    assert_eq!(system_proxy.disable_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_intercepted_request_reaches_gateway() {
    let (gateway_port, gateway) = spawn_fake_gateway().await;

    let mut config = test_config();
    config.proxy.configure_system_proxy = false;
    let service = ProxyService::new(config, Arc::new(RecordingSystemProxy::default()));
    let addr = service
        .start("127.0.0.1", 0, "127.0.0.1", gateway_port)
        .await
        .unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"GET http://api.bhsr.com/v1/login?x=1 HTTP/1.1\r\n\
              Host: api.bhsr.com\r\n\
              X-Trace: abc\r\n\
              Connection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("GET /v1/login?x=1 HTTP/1.1"), "{}", response);

    // Headers travel unchanged
    let head = gateway.await.unwrap();
    assert!(head.to_ascii_lowercase().contains("x-trace: abc"), "{}", head);

    let stats = service.stats().unwrap();
    assert_eq!(stats.seen(), 1);
    assert_eq!(stats.rewritten(), 1);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_other_host_is_tunneled_untouched() {
    let echo_port = spawn_echo_server().await;

    let service = ProxyService::new(test_config(), Arc::new(RecordingSystemProxy::default()));
    let addr = service
        .start("127.0.0.1", 0, "127.0.0.1", 8888)
        .await
        .unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = echo_port
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    // Opaque bytes, not HTTP and not TLS
    let payload = b"\x00\xffping https://api.bhsr.com/v1 \r\n\x16\x03";
    client.write_all(payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], &payload[..]);

    let stats = service.stats().unwrap();
    assert_eq!(stats.seen(), 0);
    assert_eq!(stats.rewritten(), 0);

    drop(client);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_intercepted_host_is_decrypted_and_redirected() {
    let (gateway_port, gateway) = spawn_fake_gateway().await;

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.crt");

    let mut config = test_config();
    config.tls.persist_ca = true;
    config.tls.ca_cert_path = Some(cert_path.clone());
    config.tls.ca_key_path = Some(dir.path().join("ca.key"));

    let service = ProxyService::new(config, Arc::new(RecordingSystemProxy::default()));
    let addr = service
        .start("127.0.0.1", 0, "127.0.0.1", gateway_port)
        .await
        .unwrap();

    // The client trusts the root certificate the service wrote to disk
    let ca = CertificateDer::from_pem_file(&cert_path).unwrap();

    let response = tokio::task::spawn_blocking(move || {
        let mut tcp = std::net::TcpStream::connect(addr).unwrap();
        tcp.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        tcp.write_all(b"CONNECT api.bhsr.com:443 HTTP/1.1\r\nHost: api.bhsr.com:443\r\n\r\n")
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            tcp.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 200"));

        let mut roots = RootCertStore::empty();
        roots.add(ca).unwrap();
        let tls_config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let conn = ClientConnection::new(
            Arc::new(tls_config),
            ServerName::try_from("api.bhsr.com").unwrap(),
        )
        .unwrap();

        let mut tls = StreamOwned::new(conn, tcp);
        tls.write_all(
            b"GET /v1/login?x=1 HTTP/1.1\r\n\
              Host: api.bhsr.com\r\n\
              Connection: close\r\n\r\n",
        )
        .unwrap();

        // The peer may close without close_notify, keep what arrived
        let mut response = Vec::new();
        let _ = tls.read_to_end(&mut response);
        String::from_utf8_lossy(&response).into_owned()
    })
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("GET /v1/login?x=1 HTTP/1.1"), "{}", response);

    let head = gateway.await.unwrap();
    assert!(head.starts_with("GET /v1/login?x=1 HTTP/1.1"), "{}", head);

    let stats = service.stats().unwrap();
    assert_eq!(stats.rewritten(), 1);

    service.shutdown().await.unwrap();
}
