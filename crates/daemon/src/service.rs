//! Systemd service integration
//!
//! Speaks the sd-notify datagram protocol directly: readiness, stopping,
//! free-form status lines and watchdog keepalives. Every call is a no-op when
//! `NOTIFY_SOCKET` is unset, so the daemon behaves the same outside systemd.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Send one notify message; returns whether a socket was present
fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };
    send_notify(&socket_path, message)?;
    Ok(true)
}

fn send_notify(socket_path: &str, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    Ok(())
}

/// Tell systemd the daemon finished starting (Type=notify)
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1").map(|_| ())
}

/// Watchdog period configured by systemd
pub fn watchdog_timeout() -> Option<Duration> {
    env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_micros)
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Keepalive interval: half the watchdog period, at least one second
fn keepalive_interval(timeout: Duration) -> Duration {
    (timeout / 2).max(Duration::from_secs(1))
}

/// Spawn a task sending WATCHDOG=1 at half the configured period
///
/// Returns `None` when the watchdog is not enabled.
pub fn spawn_watchdog_task() -> Option<JoinHandle<()>> {
    let Some(timeout) = watchdog_timeout() else {
        debug!("Systemd watchdog not enabled");
        return None;
    };

    let interval = keepalive_interval(timeout);
    info!(
        "Systemd watchdog enabled, interval: {:?} (timeout: {:?})",
        interval, timeout
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_functions_without_socket() {
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }

        assert!(!is_systemd());
        assert!(notify_ready().is_ok());
        assert!(notify_stopping().is_ok());
        assert!(notify_watchdog().is_ok());
        assert!(notify_status("2 sessions active").is_ok());
    }

    #[test]
    fn test_notify_reaches_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        send_notify(path.to_str().unwrap(), "STATUS=testing").unwrap();

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS=testing");
    }

    #[test]
    fn test_keepalive_interval() {
        assert_eq!(
            keepalive_interval(Duration::from_secs(30)),
            Duration::from_secs(15)
        );
        assert_eq!(
            keepalive_interval(Duration::from_millis(500)),
            Duration::from_secs(1)
        );
    }
}
