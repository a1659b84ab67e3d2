use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{CloudProvider, CloudResource, Error, ResourceType};
use crate::clock::Clock;
use crate::config::{AzureAuthType, Config};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const POLL_INTERVAL: Duration = Duration::from_secs(10);

enum Auth {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: SecretString,
    },
    ManagedIdentity,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// ARM REST client covering the operations the executor needs: list by
/// resource group, begin-stop, begin-start and completion polling.
pub struct AzureClient {
    http: reqwest::Client,
    auth: Auth,
    subscription_id: String,
    clock: Arc<dyn Clock>,
    token: Mutex<Option<CachedToken>>,
}

impl AzureClient {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let auth = match config.azure_auth_type {
            AzureAuthType::Default => Auth::ClientSecret {
                tenant_id: config
                    .azure_tenant_id
                    .clone()
                    .ok_or_else(|| Error::Auth("AZURE_TENANT_ID is required for default auth".into()))?,
                client_id: config
                    .azure_client_id
                    .clone()
                    .ok_or_else(|| Error::Auth("AZURE_CLIENT_ID is required for default auth".into()))?,
                client_secret: config
                    .azure_client_secret
                    .clone()
                    .ok_or_else(|| Error::Auth("AZURE_CLIENT_SECRET is required for default auth".into()))?,
            },
            AzureAuthType::Msi => Auth::ManagedIdentity,
        };
        Ok(Self {
            http: reqwest::Client::new(),
            auth,
            subscription_id: config.azure_subscription_id.clone(),
            clock,
            token: Mutex::new(None),
        })
    }

    async fn token(&self) -> Result<String, Error> {
        {
            let cached = self.token.lock().unwrap();
            if let Some(token) = cached.as_ref() {
                if token.expires_at > self.clock.now() + chrono::Duration::seconds(60) {
                    return Ok(token.value.clone());
                }
            }
        }

        let (value, expires_in) = match &self.auth {
            Auth::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => self.fetch_client_secret_token(tenant_id, client_id, client_secret).await?,
            Auth::ManagedIdentity => self.fetch_msi_token().await?,
        };

        let expires_at = self.clock.now() + chrono::Duration::seconds(expires_in);
        let mut cached = self.token.lock().unwrap();
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    async fn fetch_client_secret_token(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &SecretString,
    ) -> Result<(String, i64), Error> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let url = format!("https://login.microsoftonline.com/{}/oauth2/v2.0/token", tenant_id);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret.expose_secret().as_str()),
            ("scope", "https://management.azure.com/.default"),
        ];
        let response = self.http.post(&url).form(&params).send().await?;
        let response = Self::ensure_success(response).await?;
        let token: TokenResponse = response.json().await?;
        Ok((token.access_token, token.expires_in))
    }

    async fn fetch_msi_token(&self) -> Result<(String, i64), Error> {
        // IMDS returns numeric fields as strings
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: String,
        }

        let response = self
            .http
            .get(IMDS_TOKEN_ENDPOINT)
            .header("Metadata", "true")
            .query(&[
                ("api-version", "2018-02-01"),
                ("resource", "https://management.azure.com/"),
            ])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        let token: TokenResponse = response.json().await?;
        let expires_in = token
            .expires_in
            .parse()
            .map_err(|_| Error::Auth(format!("unparsable token expiry {:?}", token.expires_in)))?;
        Ok((token.access_token, expires_in))
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(Error::Api {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    async fn invoke(&self, resource: &CloudResource, action: &str, wait: bool) -> Result<(), Error> {
        let url = format!(
            "{}{}/{}?api-version={}",
            MANAGEMENT_ENDPOINT,
            resource.id(),
            action,
            resource.resource_type().api_version()
        );
        let token = self.token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        if !wait {
            return Ok(());
        }

        let poll_url = response
            .headers()
            .get("azure-asyncoperation")
            .or_else(|| response.headers().get(reqwest::header::LOCATION))
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        match poll_url {
            Some(url) => self.poll_until_done(&url).await,
            // synchronous completion
            None => Ok(()),
        }
    }

    async fn poll_until_done(&self, url: &str) -> Result<(), Error> {
        #[derive(Deserialize, Default)]
        struct OperationStatus {
            status: Option<String>,
        }

        loop {
            let token = self.token().await?;
            let response = self.http.get(url).bearer_auth(&token).send().await?;
            let status_code = response.status();
            let response = Self::ensure_success(response).await?;

            if status_code == reqwest::StatusCode::ACCEPTED {
                self.clock.sleep(POLL_INTERVAL).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            let operation: OperationStatus = serde_json::from_str(&body).unwrap_or_default();
            match operation.status.as_deref() {
                None | Some("Succeeded") => return Ok(()),
                Some("InProgress") | Some("Running") => {
                    self.clock.sleep(POLL_INTERVAL).await;
                }
                Some(other) => return Err(Error::Operation(other.to_string())),
            }
        }
    }
}

#[async_trait]
impl CloudProvider for AzureClient {
    async fn list(
        &self,
        resource_type: ResourceType,
        resource_group: &str,
    ) -> Result<Vec<CloudResource>, Error> {
        #[derive(Deserialize)]
        struct ResourceEntry {
            id: String,
        }

        #[derive(Deserialize)]
        struct ResourceList {
            #[serde(default)]
            value: Vec<ResourceEntry>,
            #[serde(rename = "nextLink")]
            next_link: Option<String>,
        }

        let mut resources = Vec::new();
        let mut url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}?api-version={}",
            MANAGEMENT_ENDPOINT,
            self.subscription_id,
            resource_group,
            resource_type.arm_type(),
            resource_type.api_version()
        );
        loop {
            let token = self.token().await?;
            let response = self.http.get(&url).bearer_auth(&token).send().await?;
            let page: ResourceList = Self::ensure_success(response).await?.json().await?;
            for entry in page.value {
                resources.push(CloudResource::parse(&entry.id)?);
            }
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(resources)
    }

    async fn stop(&self, resource: &CloudResource, wait: bool) -> Result<(), Error> {
        let action = match resource.resource_type() {
            ResourceType::VirtualMachine => "deallocate",
            ResourceType::ManagedMySql => "stop",
        };
        self.invoke(resource, action, wait).await
    }

    async fn start(&self, resource: &CloudResource, wait: bool) -> Result<(), Error> {
        self.invoke(resource, "start", wait).await
    }
}
