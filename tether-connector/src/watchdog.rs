//! Systemd readiness and watchdog notifications.
//!
//! Implements the `sd_notify(3)` datagram protocol: `READY=1` once, then
//! `WATCHDOG=1` every `WATCHDOG_USEC / 2`. Best-effort; failures never
//! affect the connector.

use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub async fn watchdog_loop(cancel: CancellationToken) {
    let Ok(socket) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    let Some(interval) = watchdog_interval() else {
        return;
    };

    if !notify(&socket, "READY=1") {
        tracing::warn!("systemd notify failed, watchdog disabled");
        return;
    }
    tracing::info!(interval_secs = interval.as_secs(), "systemd watchdog active");

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                notify(&socket, "WATCHDOG=1");
            }
        }
    }
}

/// Half of `WATCHDOG_USEC`, or `None` when the watchdog is not requested.
fn watchdog_interval() -> Option<Duration> {
    let usec: u64 = std::env::var("WATCHDOG_USEC").ok()?.trim().parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec / 2))
}

/// Sends one state message. Abstract sockets are addressed with a leading
/// NUL in place of the `@` prefix.
fn notify(socket: &str, state: &str) -> bool {
    let resolved = socket
        .strip_prefix('@')
        .map_or_else(|| socket.to_string(), |suffix| format!("\0{suffix}"));

    let Ok(sock) = UnixDatagram::unbound() else {
        return false;
    };
    match sock.send_to(state.as_bytes(), Path::new(&resolved)) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "sd_notify send failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_reaches_a_bound_socket() {
        let dir = std::env::temp_dir().join(format!("tether-wd-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("notify.sock");
        let _ = std::fs::remove_file(&path);
        let receiver = UnixDatagram::bind(&path).unwrap();

        assert!(notify(path.to_str().unwrap(), "READY=1"));

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");

        let _ = std::fs::remove_file(&path);
    }
}
