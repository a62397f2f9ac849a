//! Per-SNI TLS configuration
//!
//! Every HTTPS handshake resolves its server name against the zone store
//! and the certificate manager: names carrying a URL record get a real
//! certificate (issued on demand), everything else gets the default
//! context. Built configurations are cached per process and invalidated by
//! the certificate's expiry fingerprint, so a renewed certificate replaces
//! its predecessor on the next handshake.

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::crypto::ring;
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use tracing::{debug, warn};

use pendingdns_config::HttpsConfig;
use pendingdns_store::tickets::TicketStore;
use pendingdns_store::{RecordSource, RecordType};

use crate::acme::{CertData, CertManager};

/// ALPN protocols offered on the HTTPS listener.
const ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

struct SniEntry {
    /// `expires.getTime()` of the certificate this config was built from.
    fingerprint: i64,
    config: Arc<ServerConfig>,
}

/// Resolves an SNI name to a ready `ServerConfig`.
pub struct TlsGateway {
    records: Arc<dyn RecordSource>,
    certs: Arc<CertManager>,
    tickets: Arc<TicketStore>,
    default_config: Arc<ServerConfig>,
    cache: RwLock<HashMap<String, SniEntry>>,
    ciphers: Vec<String>,
}

impl TlsGateway {
    pub fn new(
        records: Arc<dyn RecordSource>,
        certs: Arc<CertManager>,
        tickets: Arc<TicketStore>,
        https: &HttpsConfig,
    ) -> anyhow::Result<Self> {
        let default_config = Arc::new(default_server_config(https, tickets.clone())?);
        Ok(Self {
            records,
            certs,
            tickets,
            default_config,
            cache: RwLock::new(HashMap::new()),
            ciphers: https.ciphers.clone(),
        })
    }

    /// Server configuration for one handshake.
    pub async fn config_for_sni(&self, server_name: Option<&str>) -> Arc<ServerConfig> {
        let Some(raw) = server_name else {
            return self.default_config.clone();
        };
        let domain = raw.trim_end_matches('.').to_ascii_lowercase();

        // Only names that actually serve something get a certificate.
        match self.records.resolve(&domain, RecordType::Url, true).await {
            Ok(rows) if !rows.is_empty() => {}
            Ok(_) => return self.default_config.clone(),
            Err(e) => {
                warn!(domain = %domain, error = %e, "URL lookup failed during SNI");
                return self.default_config.clone();
            }
        }

        let Some(cert) = self.certs.load_certificate(&domain).await else {
            return self.default_config.clone();
        };
        let fingerprint = cert.expires.timestamp_millis();

        if let Some(entry) = self.cache.read().get(&domain) {
            if entry.fingerprint == fingerprint {
                return entry.config.clone();
            }
        }

        match server_config_for_cert(&cert, self.tickets.clone(), &self.ciphers) {
            Ok(config) => {
                let config = Arc::new(config);
                debug!(domain = %domain, "built SNI context");
                self.cache.write().insert(
                    domain,
                    SniEntry {
                        fingerprint,
                        config: config.clone(),
                    },
                );
                config
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "certificate unusable; serving default context");
                self.default_config.clone()
            }
        }
    }
}

/// Build a server config from issued certificate material.
fn server_config_for_cert(
    cert: &CertData,
    tickets: Arc<TicketStore>,
    ciphers: &[String],
) -> anyhow::Result<ServerConfig> {
    let mut pem = cert.cert.clone();
    if !cert.chain.is_empty() {
        pem.push('\n');
        pem.push_str(&cert.chain);
    }
    let chain = read_cert_chain(&pem)?;
    let key = read_private_key(&cert.key)?;
    build_config(chain, key, tickets, ciphers)
}

/// The context served when no certificate applies: operator-provided PEM
/// pair or a process-local self-signed one.
fn default_server_config(
    https: &HttpsConfig,
    tickets: Arc<TicketStore>,
) -> anyhow::Result<ServerConfig> {
    let (chain, key) = match (&https.cert, &https.key) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path)?;
            let key_pem = std::fs::read_to_string(key_path)?;
            (read_cert_chain(&cert_pem)?, read_private_key(&key_pem)?)
        }
        _ => self_signed_pair()?,
    };
    build_config(chain, key, tickets, &https.ciphers)
}

fn self_signed_pair() -> anyhow::Result<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    PrivateKeyDer<'static>,
)> {
    let key = rcgen::KeyPair::generate()?;
    let cert = rcgen::CertificateParams::new(vec!["pendingdns.invalid".to_string()])?
        .self_signed(&key)?;
    let chain = read_cert_chain(&cert.pem())?;
    let key = read_private_key(&key.serialize_pem())?;
    Ok((chain, key))
}

fn build_config(
    chain: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    tickets: Arc<TicketStore>,
    ciphers: &[String],
) -> anyhow::Result<ServerConfig> {
    let mut provider = ring::default_provider();
    if !ciphers.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            ciphers.iter().any(|want| want.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            anyhow::bail!("cipher list matched no supported suites");
        }
    }

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    config.alpn_protocols = ALPN.iter().map(|proto| proto.to_vec()).collect();
    config.session_storage = tickets;
    Ok(config)
}

fn read_cert_chain(
    pem: &str,
) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let chain: Vec<_> = rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    if chain.is_empty() {
        anyhow::bail!("no certificates in PEM");
    }
    Ok(chain)
}

fn read_private_key(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key in PEM"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_pair_parses() {
        let (chain, _key) = self_signed_pair().unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_read_cert_chain_rejects_garbage() {
        assert!(read_cert_chain("not pem").is_err());
    }
}
