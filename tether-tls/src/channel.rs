//! gRPC channel construction over rustls.

use std::time::Duration;

use rustls::ClientConfig;
use tonic::transport::Channel;

use crate::TlsError;

/// Transport keepalive ping interval; detects dead peers without
/// application-level heartbeats.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for a keepalive acknowledgement.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a TLS channel to `addr` with the given client configuration.
///
/// `addr` is a `host:port` pair or an `https://` URL; plain `http://`
/// prefixes are upgraded. HTTP/2 keepalives are always enabled.
pub async fn build_tls_channel(addr: &str, tls_config: ClientConfig) -> Result<Channel, TlsError> {
    let url = if addr.contains("://") {
        addr.replace("http://", "https://")
    } else {
        format!("https://{addr}")
    };

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_only()
        .enable_http2()
        .build();

    let channel = Channel::from_shared(url)
        .map_err(|e| TlsError::Address(e.to_string()))?
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
        .connect_with_connector(https_connector)
        .await?;

    Ok(channel)
}
