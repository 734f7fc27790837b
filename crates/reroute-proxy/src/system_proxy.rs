//! OS-level system proxy registration
//!
//! The lifecycle service talks to the OS through the [`SystemProxy`] trait so
//! that tests (and `--no-system-proxy`) can swap in [`NoopSystemProxy`].

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::process::Command;

/// Registers and clears this process as the system HTTP/HTTPS proxy
pub trait SystemProxy: Send + Sync {
    /// Route system HTTP and HTTPS traffic through `host:port`
    fn enable(&self, host: &str, port: u16) -> Result<()>;

    /// Restore direct connections
    fn disable(&self) -> Result<()>;
}

/// Host that other processes should use to reach a listener bound at `addr`
pub fn registration_host(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() || addr.ip().is_loopback() {
        "127.0.0.1".to_string()
    } else {
        addr.ip().to_string()
    }
}

/// Run an OS tool and return its stdout, failing on a non-zero exit
#[cfg_attr(not(any(target_os = "macos", windows)), allow(dead_code))]
fn run_checked(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Leaves OS settings alone
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSystemProxy;

impl SystemProxy for NoopSystemProxy {
    fn enable(&self, _host: &str, _port: u16) -> Result<()> {
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        Ok(())
    }
}

/// Uses the platform's own proxy settings
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSystemProxy;

impl SystemProxy for OsSystemProxy {
    fn enable(&self, host: &str, port: u16) -> Result<()> {
        platform::set_system_proxy(host, port)
    }

    fn disable(&self) -> Result<()> {
        platform::clear_system_proxy()
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::run_checked;
    use anyhow::{bail, Result};

    const SERVICES: [&str; 3] = ["Wi-Fi", "Ethernet", "USB 10/100/1000 LAN"];

    fn networksetup(args: &[&str]) -> Result<String> {
        run_checked("networksetup", args)
    }

    /// Known network services present on this machine
    fn active_services() -> Result<Vec<&'static str>> {
        let listed = networksetup(&["-listallnetworkservices"])?;
        let services: Vec<_> = SERVICES
            .into_iter()
            .filter(|service| listed.lines().any(|line| line.trim() == *service))
            .collect();

        if services.is_empty() {
            bail!("No known network service found ({})", SERVICES.join(", "));
        }
        Ok(services)
    }

    pub fn set_system_proxy(host: &str, port: u16) -> Result<()> {
        let port = port.to_string();

        for service in active_services()? {
            networksetup(&["-setwebproxy", service, host, &port])?;
            networksetup(&["-setsecurewebproxy", service, host, &port])?;
            networksetup(&["-setwebproxystate", service, "on"])?;
            networksetup(&["-setsecurewebproxystate", service, "on"])?;

            tracing::info!("Configured system proxy for {}", service);
        }

        Ok(())
    }

    pub fn clear_system_proxy() -> Result<()> {
        let mut failed = Vec::new();

        for service in active_services()? {
            let result = networksetup(&["-setwebproxystate", service, "off"])
                .and_then(|_| networksetup(&["-setsecurewebproxystate", service, "off"]));

            match result {
                Ok(_) => tracing::info!("Cleared system proxy for {}", service),
                Err(e) => {
                    tracing::warn!("Failed to clear system proxy for {}: {}", service, e);
                    failed.push(service);
                }
            }
        }

        if !failed.is_empty() {
            bail!("Could not clear system proxy for {}", failed.join(", "));
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use super::run_checked;
    use anyhow::Result;

    const INTERNET_SETTINGS: &str =
        r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    fn reg_add(value: &str, kind: &str, data: &str) -> Result<()> {
        run_checked(
            "reg",
            &["add", INTERNET_SETTINGS, "/v", value, "/t", kind, "/d", data, "/f"],
        )?;
        Ok(())
    }

    pub fn set_system_proxy(host: &str, port: u16) -> Result<()> {
        let server = format!("http={host}:{port};https={host}:{port}");
        reg_add("ProxyServer", "REG_SZ", &server)?;
        reg_add("ProxyEnable", "REG_DWORD", "1")?;

        tracing::info!("Configured system proxy {}", server);
        Ok(())
    }

    pub fn clear_system_proxy() -> Result<()> {
        reg_add("ProxyEnable", "REG_DWORD", "0")?;

        tracing::info!("Cleared system proxy");
        Ok(())
    }
}

#[cfg(not(any(target_os = "macos", windows)))]
mod platform {
    use anyhow::Result;

    pub fn set_system_proxy(_host: &str, _port: u16) -> Result<()> {
        tracing::warn!("System proxy configuration not supported on this platform");
        Ok(())
    }

    pub fn clear_system_proxy() -> Result<()> {
        Ok(())
    }
}
