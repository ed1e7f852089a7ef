//! Certificate renewal loop.
//!
//! One renewal task runs per workload identity. Each cycle generates a
//! fresh key pair, calls `Renew` over the current mTLS identity, verifies
//! the returned CA against the pinned CA by DER comparison, and atomically
//! swaps the certificate store. Failures are logged and retried on the
//! next scheduled tick; if renewal keeps failing until expiry the workload
//! loses its identity and its supervisor must restart it through
//! enrollment.

use std::sync::Arc;

use rcgen::KeyPair;
use tether_identity::spiffe::{TrustDomain, WorkloadRole};
use tether_identity::{ca_der_equal, cert};
use tether_proto::enrollment_service_client::EnrollmentServiceClient;
use tether_proto::EnrollRequest;
use tether_tls::{ActiveCert, CertStore};
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::dial::mtls_channel;
use crate::AgentError;

/// Fraction of the total TTL to renew ahead of expiry, in percent.
const RENEW_AHEAD_PERCENT: i32 = 30;

/// Minimum advance before the next renewal attempt.
const MIN_ADVANCE: Duration = Duration::seconds(10);

/// Computes the next renewal instant:
/// `max(now + 10s, not_after − total_ttl × 0.30)`.
pub fn next_renewal(
    now: OffsetDateTime,
    not_after: OffsetDateTime,
    total_ttl: Duration,
) -> OffsetDateTime {
    let remaining = not_after - now;
    if remaining <= Duration::ZERO {
        return now + MIN_ADVANCE;
    }
    let total = if total_ttl <= Duration::ZERO {
        remaining
    } else {
        total_ttl
    };
    let next = not_after - total * RENEW_AHEAD_PERCENT / 100;
    if next < now + MIN_ADVANCE {
        now + MIN_ADVANCE
    } else {
        next
    }
}

/// Inputs for the renewal loop of one workload identity.
pub struct RenewalTask {
    pub controller_addr: String,
    pub trust_domain: TrustDomain,
    pub workload_id: String,
    pub store: Arc<CertStore>,
    /// Pinned internal CA; the renewal response must match it exactly.
    pub ca_pem: String,
    /// Signalled after every successful swap so stream tasks can tear down
    /// their session and pick up the new certificate.
    pub reload: tokio::sync::watch::Sender<()>,
}

/// Runs the renewal loop until cancellation.
pub async fn renewal_loop(task: RenewalTask, cancel: CancellationToken) {
    let mut ca_mismatch_streak: u32 = 0;

    loop {
        let now = OffsetDateTime::now_utc();
        let next = next_renewal(now, task.store.not_after(), task.store.total_ttl());
        let delay = (next - now).max(Duration::ZERO);
        let delay = std::time::Duration::try_from(delay).unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match renew_once(&task).await {
            Ok(not_after) => {
                ca_mismatch_streak = 0;
                tracing::info!(
                    id = %task.workload_id,
                    not_after = %not_after,
                    "certificate renewed"
                );
                let _ = task.reload.send(());
            }
            Err(AgentError::CaMismatch) => {
                // The workload keeps its current identity; a repeat is a
                // distinct structured event for operators.
                ca_mismatch_streak += 1;
                if ca_mismatch_streak >= 2 {
                    tracing::error!(
                        id = %task.workload_id,
                        event = "ca_mismatch_repeated",
                        consecutive = ca_mismatch_streak,
                        "internal CA mismatch during renewal"
                    );
                } else {
                    tracing::warn!(
                        id = %task.workload_id,
                        "internal CA mismatch during renewal"
                    );
                }
            }
            Err(e) => {
                ca_mismatch_streak = 0;
                tracing::warn!(id = %task.workload_id, error = %e, "certificate renewal failed");
            }
        }
    }
}

/// Performs one renewal attempt and swaps the store on success. Returns the
/// new expiry.
async fn renew_once(task: &RenewalTask) -> Result<OffsetDateTime, AgentError> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| AgentError::KeyGeneration(e.to_string()))?;

    let channel = mtls_channel(
        &task.controller_addr,
        &task.ca_pem,
        &task.trust_domain,
        WorkloadRole::Controller,
        task.store.clone(),
    )
    .await?;

    let mut client = EnrollmentServiceClient::new(channel);
    let response = client
        .renew(EnrollRequest {
            id: task.workload_id.clone(),
            public_key: key.public_key_pem().into_bytes(),
            ..Default::default()
        })
        .await?
        .into_inner();

    if response.ca_certificate.is_empty() {
        return Err(AgentError::EmptyCa);
    }
    if !ca_der_equal(task.ca_pem.as_bytes(), &response.ca_certificate) {
        return Err(AgentError::CaMismatch);
    }

    let cert_pem = std::str::from_utf8(&response.certificate)
        .map_err(|e| AgentError::BadCertificate(e.to_string()))?;
    let leaf = cert::parse_leaf(cert_pem.as_bytes())
        .map_err(|e| AgentError::BadCertificate(e.to_string()))?;
    if leaf.uri_sans.len() != 1 {
        return Err(AgentError::UriSanCount);
    }

    // The previous private key is dropped with the swapped-out cert.
    task.store
        .update(ActiveCert::from_pem_and_key(cert_pem, key.serialize_der())?);

    Ok(leaf.not_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(ts).unwrap()
    }

    #[test]
    fn schedules_at_seventy_percent_of_ttl() {
        let now = at(1_000_000);
        let ttl = Duration::minutes(30);
        let not_after = now + ttl;
        // 30% of 30m = 9m lead, so renewal fires at now + 21m.
        assert_eq!(next_renewal(now, not_after, ttl), now + Duration::minutes(21));
    }

    #[test]
    fn expired_certificate_schedules_in_ten_seconds() {
        let now = at(1_000_000);
        assert_eq!(next_renewal(now, now, Duration::minutes(30)), now + MIN_ADVANCE);
        assert_eq!(
            next_renewal(now, now - Duration::minutes(1), Duration::minutes(30)),
            now + MIN_ADVANCE
        );
    }

    #[test]
    fn near_expiry_is_floored_at_ten_seconds() {
        let now = at(1_000_000);
        let not_after = now + Duration::seconds(30);
        // Lead of 9m pushes the target into the past; floor to now + 10s.
        assert_eq!(
            next_renewal(now, not_after, Duration::minutes(30)),
            now + MIN_ADVANCE
        );
    }

    #[test]
    fn zero_total_ttl_falls_back_to_remaining() {
        let now = at(1_000_000);
        let not_after = now + Duration::minutes(10);
        // total = remaining = 10m, lead 3m, fires at now + 7m.
        assert_eq!(
            next_renewal(now, not_after, Duration::ZERO),
            now + Duration::minutes(7)
        );
    }
}
