//! ACME protocol client
//!
//! Wraps `instant-acme` for account management, ordering and finalization.
//! The account is initialized once per process and its credentials persist
//! in the key store, so every worker on every host shares one identity.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, trace};

use pendingdns_config::AcmeConfig;
use pendingdns_store::certs::CertStorage;

use super::error::AcmeError;

/// Budget for challenge validation and order readiness.
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Budget for certificate issuance after finalization.
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(60);

/// A pending dns-01 challenge.
#[derive(Debug, Clone)]
pub struct DnsChallenge {
    /// Domain this challenge authorizes (may carry a `*.` prefix).
    pub domain: String,
    /// Value to publish in the challenge TXT record.
    pub record_value: String,
    /// Challenge URL used to signal readiness.
    pub url: String,
}

/// ACME client with a per-process account memo backed by the key store.
pub struct AcmeClient {
    config: AcmeConfig,
    storage: CertStorage,
    account: OnceCell<Account>,
}

impl AcmeClient {
    pub fn new(config: AcmeConfig, storage: CertStorage) -> Self {
        Self {
            config,
            storage,
            account: OnceCell::new(),
        }
    }

    /// The dns-01 record value: base64url-encoded SHA-256 of the key
    /// authorization.
    pub fn compute_challenge_value(key_authorization: &str) -> String {
        let digest = Sha256::digest(key_authorization.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// The shared ACME account, loading or registering as needed.
    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(creds_json) = self.storage.account(&self.config.key).await? {
                    info!(account = %self.config.key, "loading ACME account from store");
                    let credentials: AccountCredentials = serde_json::from_str(&creds_json)
                        .map_err(|e| {
                            AcmeError::Account(format!("stored credentials unreadable: {}", e))
                        })?;
                    let account = Account::builder()
                        .map_err(|e| AcmeError::Account(e.to_string()))?
                        .from_credentials(credentials)
                        .await
                        .map_err(|e| AcmeError::Account(e.to_string()))?;
                    return Ok(account);
                }

                info!(
                    account = %self.config.key,
                    email = %self.config.email,
                    directory = %self.config.directory_url,
                    "registering new ACME account"
                );
                let (account, credentials) = Account::builder()
                    .map_err(|e| AcmeError::Account(e.to_string()))?
                    .create(
                        &NewAccount {
                            contact: &[&format!("mailto:{}", self.config.email)],
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.config.directory_url.clone(),
                        None,
                    )
                    .await
                    .map_err(|e| AcmeError::Account(e.to_string()))?;

                let creds_json = serde_json::to_string(&credentials)
                    .map_err(|e| AcmeError::Account(e.to_string()))?;
                self.storage.save_account(&self.config.key, &creds_json).await?;
                info!(account = %self.config.key, "ACME account registered");
                Ok(account)
            })
            .await
    }

    /// Create an order with dns-01 challenges for every pending
    /// authorization.
    pub async fn create_order(
        &self,
        domains: &[String],
    ) -> Result<(Order, Vec<DnsChallenge>), AcmeError> {
        let account = self.account().await?;

        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();

        info!(domains = ?domains, "creating certificate order");

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::Order(e.to_string()))?;

        let mut challenges = Vec::new();
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz =
                    result.map_err(|e| AcmeError::Order(format!("authorization: {}", e)))?;

                let identifier = authz.identifier();
                let domain = match &identifier.identifier {
                    Identifier::Dns(domain) => domain.clone(),
                    _ => continue,
                };

                debug!(domain = %domain, status = ?authz.status, "processing authorization");
                if authz.status == AuthorizationStatus::Valid {
                    continue;
                }

                let challenge = authz
                    .challenge(ChallengeType::Dns01)
                    .ok_or_else(|| AcmeError::NoDns01Challenge(domain.clone()))?;
                let key_authorization = challenge.key_authorization();

                challenges.push(DnsChallenge {
                    domain,
                    record_value: Self::compute_challenge_value(key_authorization.as_str()),
                    url: challenge.url.clone(),
                });
            }
        }

        Ok((order, challenges))
    }

    /// Tell the CA a challenge is ready for validation.
    pub async fn set_challenge_ready(
        &self,
        order: &mut Order,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        debug!(challenge_url = %challenge_url, "marking challenge ready");

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| AcmeError::ChallengeValidation {
                domain: "unknown".to_string(),
                message: e.to_string(),
            })?;

            let matching_type = authz
                .challenges
                .iter()
                .find(|c| c.url == challenge_url)
                .map(|c| c.r#type.clone());

            if let Some(challenge_type) = matching_type {
                if let Some(mut challenge) = authz.challenge(challenge_type) {
                    challenge
                        .set_ready()
                        .await
                        .map_err(|e| AcmeError::ChallengeValidation {
                            domain: "unknown".to_string(),
                            message: e.to_string(),
                        })?;
                    return Ok(());
                }
            }
        }

        Err(AcmeError::ChallengeValidation {
            domain: "unknown".to_string(),
            message: format!("challenge not found for URL: {}", challenge_url),
        })
    }

    /// Poll until every challenge validated and the order is ready.
    pub async fn wait_for_order_ready(&self, order: &mut Order) -> Result<(), AcmeError> {
        let deadline = tokio::time::Instant::now() + CHALLENGE_TIMEOUT;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::Order(format!("refresh: {}", e)))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    error!("order became invalid");
                    return Err(AcmeError::Order("order became invalid".to_string()));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "order did not become ready".to_string(),
                        ));
                    }
                    trace!(status = ?state.status, "order not ready yet");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Submit the CSR over an existing private key and collect the issued
    /// chain PEM.
    pub async fn finalize(
        &self,
        order: &mut Order,
        domains: &[String],
        key_pem: &str,
    ) -> Result<String, AcmeError> {
        info!(domains = ?domains, "finalizing certificate order");

        let key = rcgen::KeyPair::from_pem(key_pem)
            .map_err(|e| AcmeError::Finalization(format!("loading key: {}", e)))?;
        let params = rcgen::CertificateParams::new(domains.to_vec())
            .map_err(|e| AcmeError::Finalization(format!("csr params: {}", e)))?;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| AcmeError::Finalization(format!("csr: {}", e)))?
            .der()
            .to_vec();

        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| AcmeError::Finalization(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + ISSUANCE_TIMEOUT;
        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::Finalization(format!("refresh: {}", e)))?;

            match state.status {
                OrderStatus::Valid => {
                    let chain = order
                        .certificate()
                        .await
                        .map_err(|e| AcmeError::Finalization(e.to_string()))?;
                    return chain.ok_or_else(|| {
                        AcmeError::Finalization("no certificate in response".to_string())
                    });
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout("certificate issuance".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_value_is_base64url() {
        let value = AcmeClient::compute_challenge_value(
            "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA.QxKhYaH6VWOWyLVV9dVRqY8hZVp-ZxCfmYkf8BwqF0c",
        );
        assert!(!value.is_empty());
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
        assert!(!value.contains('='));
    }

    #[test]
    fn test_challenge_value_deterministic() {
        let a = AcmeClient::compute_challenge_value("token.thumbprint");
        let b = AcmeClient::compute_challenge_value("token.thumbprint");
        assert_eq!(a, b);
        let c = AcmeClient::compute_challenge_value("other.thumbprint");
        assert_ne!(a, c);
    }
}
