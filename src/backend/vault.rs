//! Vault / OpenBao client.
//!
//! OpenBao keeps Vault's HTTP API, so one client serves both backends. KV v2
//! reads and writes, policies and tokens go through `vaultrs`; the health
//! probe is a plain HTTP request because only the status code matters and the
//! two servers disagree on some health response fields.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vaultrs::api::token::requests::CreateTokenRequestBuilder;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;
use vaultrs::kv2;

use super::{SecretStore, StoreConnector, StoreError, StoreResult};
use crate::config::SecretLocation;
use crate::types::SecretString;

/// TTL of issued driver tokens; comfortably longer than one scenario
const TOKEN_TTL: &str = "1h";

/// Per-request timeout of the health probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// KV v2 store reached over HTTP
pub struct VaultKvStore {
    client: VaultClient,
    http: reqwest::Client,
    address: String,
}

impl VaultKvStore {
    pub fn new(address: &str, token: &SecretString) -> StoreResult<Self> {
        let settings = VaultClientSettingsBuilder::default()
            .address(address)
            .token(token.expose_secret())
            .build()
            .map_err(|e| StoreError::api(format!("invalid client settings: {e}")))?;

        let client = VaultClient::new(settings)
            .map_err(|e| StoreError::unreachable(format!("failed to create client: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| StoreError::api(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, http, address: address.trim_end_matches('/').to_string() })
    }
}

fn map_client_error(err: ClientError) -> StoreError {
    match err {
        ClientError::APIError { code: 401 | 403, errors } => {
            StoreError::Denied { message: errors.join("; ") }
        }
        ClientError::APIError { code, errors } => {
            StoreError::api(format!("HTTP {code}: {}", errors.join("; ")))
        }
        ClientError::RestClientError { source } => StoreError::unreachable(source.to_string()),
        other => StoreError::api(other.to_string()),
    }
}

#[async_trait]
impl SecretStore for VaultKvStore {
    async fn health(&self) -> StoreResult<()> {
        let url = format!("{}/v1/sys/health", self.address);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::unreachable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(StoreError::Unhealthy { status: status.as_u16() })
        }
    }

    async fn write_kv(&self, location: &SecretLocation, value: &SecretString) -> StoreResult<()> {
        let data = HashMap::from([(location.field.as_str(), value.expose_secret())]);
        kv2::set(&self.client, &location.mount, &location.path, &data)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, path = %location.display_path(), "Failed to write secret");
                map_client_error(e)
            })?;
        Ok(())
    }

    async fn read_kv(&self, location: &SecretLocation) -> StoreResult<Option<SecretString>> {
        let data: HashMap<String, String> =
            match kv2::read(&self.client, &location.mount, &location.path).await {
                Ok(data) => data,
                Err(ClientError::APIError { code: 404, .. }) => return Ok(None),
                Err(e) => return Err(map_client_error(e)),
            };

        Ok(data.get(&location.field).map(|value| SecretString::new(value.as_str())))
    }

    async fn write_policy(&self, name: &str, document: &str) -> StoreResult<()> {
        vaultrs::sys::policy::set(&self.client, name, document).await.map_err(map_client_error)
    }

    async fn create_token(&self, policy: &str) -> StoreResult<SecretString> {
        let mut request = CreateTokenRequestBuilder::default();
        request.policies(vec![policy.to_string()]).no_default_policy(true).ttl(TOKEN_TTL);

        let auth = vaultrs::token::new(&self.client, Some(&mut request))
            .await
            .map_err(map_client_error)?;
        Ok(SecretString::new(auth.client_token))
    }
}

/// Connector producing [`VaultKvStore`] clients
#[derive(Debug, Clone, Copy, Default)]
pub struct VaultConnector;

impl StoreConnector for VaultConnector {
    fn connect(&self, address: &str, token: &SecretString) -> StoreResult<Arc<dyn SecretStore>> {
        Ok(Arc::new(VaultKvStore::new(address, token)?))
    }
}
