//! Background health checker
//!
//! A fixed number of probe loops per process. Each loop claims due targets
//! from the shared schedule with the store's atomic pop-and-reschedule, so
//! a target is probed by at most one worker per cycle even across
//! processes. Probe results are written back only when the status actually
//! flips; steady state just logs.
//!
//! Probe schemes: `tcp://` and `tcps://` succeed on an established
//! connection (`tcps` skips certificate validation), `http://` and
//! `https://` issue a GET and require a 2xx, also without certificate
//! validation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

use pendingdns_common::observability::metrics;
use pendingdns_common::types::HealthState;
use pendingdns_config::HealthConfig;
use pendingdns_store::zone::{HEALTH_QUEUE_KEY, HEALTH_RESULT_KEY};
use pendingdns_store::{names, StoreResult, ZoneStore};

/// Pause after a sweep drained the queue.
const SWEEP_IDLE: Duration = Duration::from_secs(10);
/// Pause after a loop error before retrying.
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// The probing subsystem; one instance per process, `handlers` loops.
pub struct HealthChecker {
    zone: ZoneStore,
    config: HealthConfig,
    http: reqwest::Client,
    tls: TlsConnector,
}

impl HealthChecker {
    pub fn new(zone: ZoneStore, config: HealthConfig) -> Self {
        let probe_timeout = Duration::from_secs(config.ttl);
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(probe_timeout)
            .build()
            .expect("reqwest client");

        let tls_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();

        Self {
            zone,
            config,
            http,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Spawn the configured number of probe loops and return immediately.
    pub fn spawn(self: Arc<Self>) {
        for worker in 0..self.config.handlers.max(1) {
            let checker = self.clone();
            tokio::spawn(async move {
                metrics().health_workers.inc();
                checker.worker_loop(worker).await;
                metrics().health_workers.dec();
            });
        }
    }

    async fn worker_loop(&self, worker: usize) {
        debug!(worker, "health worker started");
        loop {
            match self.sweep().await {
                Ok(()) => sleep(SWEEP_IDLE).await,
                Err(e) => {
                    warn!(worker, error = %e, "health sweep failed");
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Drain everything currently due, one claim at a time.
    async fn sweep(&self) -> StoreResult<()> {
        let delay_ms = (self.config.delay * 1000) as i64;
        loop {
            let now = Utc::now().timestamp_millis();
            let member = match self
                .zone
                .keystore()
                .next_due(HEALTH_QUEUE_KEY, now, now + delay_ms)
                .await?
            {
                Some(member) => member,
                None => return Ok(()),
            };
            if let Err(e) = self.probe_member(&member).await {
                warn!(member = %member, error = %e, "probe bookkeeping failed");
            }
        }
    }

    async fn probe_member(&self, member: &str) -> StoreResult<()> {
        let Some((_rev_zone, id)) = member.split_once(':') else {
            return self.forget(member).await;
        };
        let Some((rev_name, rtype, hid)) = names::parse_id(id) else {
            return self.forget(member).await;
        };

        let value = match self.zone.fetch_value(&rev_name, rtype, &hid).await? {
            Some(value) => value,
            None => {
                debug!(member = %member, "record gone; dropping from schedule");
                return self.forget(member).await;
            }
        };
        let Some(uri) = value.health_check_uri() else {
            debug!(member = %member, "health check cleared; dropping from schedule");
            return self.forget(member).await;
        };

        let state = self.probe(uri).await;
        let scheme = uri.split("://").next().unwrap_or("unknown");
        metrics()
            .health_probes
            .with_label_values(&[scheme, if state.status { "up" } else { "down" }])
            .inc();

        let previous: Option<HealthState> = self
            .zone
            .keystore()
            .hget(HEALTH_RESULT_KEY, member)
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let transitioned = previous.as_ref().map(|p| p.status) != Some(state.status);
        if transitioned {
            self.zone
                .keystore()
                .hset(
                    HEALTH_RESULT_KEY,
                    member,
                    &serde_json::to_string(&state)?,
                )
                .await?;
            metrics()
                .health_transitions
                .with_label_values(&[if state.status { "up" } else { "down" }])
                .inc();
            info!(
                member = %member,
                uri = %uri,
                status = state.status,
                error = state.error.as_deref().unwrap_or(""),
                "health status transition"
            );
        } else {
            debug!(member = %member, status = state.status, "health status unchanged");
        }
        Ok(())
    }

    async fn forget(&self, member: &str) -> StoreResult<()> {
        self.zone.keystore().zrem(HEALTH_QUEUE_KEY, member).await?;
        self.zone.keystore().hdel(HEALTH_RESULT_KEY, member).await?;
        Ok(())
    }

    /// One probe, bounded by the configured ttl.
    async fn probe(&self, uri: &str) -> HealthState {
        let budget = Duration::from_secs(self.config.ttl);
        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(e) => return HealthState::down(format!("invalid health uri: {}", e)),
        };

        match url.scheme() {
            "tcp" | "tcps" => {
                let Some(host) = url.host_str() else {
                    return HealthState::down("health uri missing host");
                };
                let Some(port) = url.port() else {
                    return HealthState::down("health uri missing port");
                };
                match timeout(budget, self.probe_tcp(host, port, url.scheme() == "tcps")).await {
                    Ok(result) => result,
                    Err(_) => HealthState::down("connect timed out"),
                }
            }
            "http" | "https" => self.probe_http(url.as_str()).await,
            other => HealthState::down(format!("unsupported health scheme {:?}", other)),
        }
    }

    async fn probe_tcp(&self, host: &str, port: u16, with_tls: bool) -> HealthState {
        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => return HealthState::down(e.to_string()),
        };
        if !with_tls {
            return HealthState::up();
        }

        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(e) => return HealthState::down(format!("bad tls name: {}", e)),
        };
        match self.tls.connect(server_name, stream).await {
            Ok(_) => HealthState::up(),
            Err(e) => HealthState::down(format!("tls handshake failed: {}", e)),
        }
    }

    async fn probe_http(&self, uri: &str) -> HealthState {
        match self.http.get(uri).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                if response.status().is_success() {
                    HealthState::up()
                } else {
                    HealthState::down_with_code("unexpected status", code)
                }
            }
            Err(e) => HealthState::down(e.to_string()),
        }
    }
}

/// Certificate verifier that accepts everything; probes measure liveness,
/// not trust.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pendingdns_store::RecordValue;

    #[test]
    fn test_health_uri_schemes() {
        let url = Url::parse("tcp://192.0.2.1:443").unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.host_str(), Some("192.0.2.1"));
        assert_eq!(url.port(), Some(443));

        let url = Url::parse("tcps://db.example.com:5432").unwrap();
        assert_eq!(url.scheme(), "tcps");
        assert_eq!(url.port(), Some(5432));
    }

    #[test]
    fn test_member_format_splits_on_first_colon() {
        let member = "com.example:ZXhhbXBsZQ";
        let (rev_zone, id) = member.split_once(':').unwrap();
        assert_eq!(rev_zone, "com.example");
        assert_eq!(id, "ZXhhbXBsZQ");
    }

    #[test]
    fn test_health_uri_extraction() {
        let value = RecordValue::A {
            address: "192.0.2.7".into(),
            health_check: Some("https://192.0.2.7/healthz".into()),
        };
        assert_eq!(
            value.health_check_uri(),
            Some("https://192.0.2.7/healthz")
        );
    }
}
