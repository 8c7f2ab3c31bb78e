//! Google Secret Manager v1 REST client.
//!
//! Authentication uses an OAuth2 bearer token taken from
//! `GOOGLE_OAUTH_ACCESS_TOKEN`, falling back to
//! `gcloud auth print-access-token`. The token is fetched once when the
//! client is built; gcloud tokens are valid for an hour, which bounds the
//! length of a single migration run.

use std::future::Future;
use std::process::Stdio;

use async_stream::try_stream;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::stream::BoxStream;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::process::Command;

use super::{secret_resource_name, Labels, SecretRef, SecretStore, SecretValue, StoreError};

/// Default Secret Manager REST endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://secretmanager.googleapis.com/v1";

/// Environment variable overriding [`DEFAULT_ENDPOINT`].
pub const ENDPOINT_ENV: &str = "SECRET_MANAGER_ENDPOINT";

/// Environment variable holding a ready-made access token.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const LIST_PAGE_SIZE: u32 = 250;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSecretsResponse {
    #[serde(default)]
    secrets: Vec<ApiSecret>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiSecret {
    name: String,
    #[serde(default)]
    labels: Option<Labels>,
}

#[derive(Debug, Deserialize)]
struct AccessSecretVersionResponse {
    payload: ApiPayload,
}

#[derive(Debug, Deserialize)]
struct ApiPayload {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Secret Manager client speaking the v1 REST API.
pub struct GcpSecretStore {
    client: Client,
    endpoint: String,
    access_token: String,
}

impl GcpSecretStore {
    /// Create a client for `endpoint` using `access_token`.
    pub fn new(endpoint: &str, access_token: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    /// Build a client from the environment, obtaining a token from gcloud if
    /// `GOOGLE_OAUTH_ACCESS_TOKEN` is unset.
    pub async fn from_env() -> Result<Self, StoreError> {
        let endpoint = std::env::var(ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let token = match std::env::var(ACCESS_TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
            _ => gcloud_access_token().await?,
        };
        tracing::debug!("Using Secret Manager endpoint {}", endpoint);
        Ok(Self::new(&endpoint, &token))
    }

    fn secrets_url(&self, project: &str) -> String {
        format!(
            "{}/projects/{}/secrets",
            self.endpoint,
            urlencoding::encode(project)
        )
    }

    fn secret_url(&self, project: &str, secret_id: &str) -> String {
        format!(
            "{}/{}",
            self.secrets_url(project),
            urlencoding::encode(secret_id)
        )
    }

    fn list_url(&self, project: &str, page_token: Option<&str>) -> String {
        let mut url = format!("{}?pageSize={}", self.secrets_url(project), LIST_PAGE_SIZE);
        if let Some(token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    async fn list_page(
        &self,
        project: &str,
        page_token: Option<&str>,
    ) -> Result<ListSecretsResponse, StoreError> {
        let resp = self
            .client
            .get(self.list_url(project, page_token))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let resp = check_response(resp, &format!("projects/{}", project)).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Decode(format!("list secrets response: {}", e)))
    }
}

#[async_trait]
impl SecretStore for GcpSecretStore {
    fn list_secrets<'a>(&'a self, project: &'a str) -> BoxStream<'a, Result<SecretRef, StoreError>> {
        paginate(project, move |page_token| async move {
            self.list_page(project, page_token.as_deref()).await
        })
    }

    async fn access_latest(
        &self,
        project: &str,
        secret_id: &str,
    ) -> Result<SecretValue, StoreError> {
        let url = format!(
            "{}/versions/latest:access",
            self.secret_url(project, secret_id)
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let resp = check_response(resp, &secret_resource_name(project, secret_id)).await?;
        let text = resp.text().await?;
        decode_access_response(&text)
    }

    async fn create_secret(
        &self,
        project: &str,
        secret_id: &str,
        labels: &Labels,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}?secretId={}",
            self.secrets_url(project),
            urlencoding::encode(secret_id)
        );
        let body = serde_json::json!({
            "replication": { "automatic": {} },
            "labels": labels,
        });
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        check_response(resp, &secret_resource_name(project, secret_id)).await?;
        Ok(())
    }

    async fn add_version(
        &self,
        project: &str,
        secret_id: &str,
        payload: &SecretValue,
    ) -> Result<(), StoreError> {
        let url = format!("{}:addVersion", self.secret_url(project, secret_id));
        let body = serde_json::json!({
            "payload": { "data": BASE64.encode(payload.as_bytes()) },
        });
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        check_response(resp, &secret_resource_name(project, secret_id)).await?;
        Ok(())
    }

    async fn delete_secret(&self, project: &str, secret_id: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.secret_url(project, secret_id))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        check_response(resp, &secret_resource_name(project, secret_id)).await?;
        Ok(())
    }
}

/// Follow `nextPageToken` through the pages returned by `fetch_page` until a
/// page comes back without one (or with an empty one).
fn paginate<'a, F, Fut>(project: &'a str, mut fetch_page: F) -> BoxStream<'a, Result<SecretRef, StoreError>>
where
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<ListSecretsResponse, StoreError>> + Send + 'a,
{
    Box::pin(try_stream! {
        let mut page_token: Option<String> = None;
        loop {
            let page = fetch_page(page_token.take()).await?;
            tracing::debug!(
                "Fetched {} secret(s) from projects/{}",
                page.secrets.len(),
                project
            );
            for secret in page.secrets {
                yield SecretRef::new(secret.name, secret.labels.unwrap_or_default());
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
    })
}

async fn gcloud_access_token() -> Result<String, StoreError> {
    let output = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| StoreError::Auth(format!("failed to run gcloud: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StoreError::Auth(format!(
            "gcloud auth print-access-token failed: {}",
            stderr.trim()
        )));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(StoreError::Auth("gcloud returned an empty token".to_string()));
    }
    Ok(token)
}

async fn check_response(resp: Response, resource: &str) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(api_error(status, &text, resource))
}

fn api_error(status: StatusCode, body: &str, resource: &str) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(resource.to_string()),
        StatusCode::CONFLICT => StoreError::AlreadyExists(resource.to_string()),
        StatusCode::UNAUTHORIZED => StoreError::Auth(error_message(body)),
        _ => StoreError::Api {
            status: status.as_u16(),
            message: error_message(body),
        },
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

fn decode_access_response(text: &str) -> Result<SecretValue, StoreError> {
    let parsed: AccessSecretVersionResponse = serde_json::from_str(text)
        .map_err(|e| StoreError::Decode(format!("access response: {}", e)))?;
    let bytes = BASE64
        .decode(parsed.payload.data.as_bytes())
        .map_err(|e| StoreError::Decode(format!("payload is not base64: {}", e)))?;
    Ok(SecretValue::new(bytes))
}
