use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{
    CloudError, CloudResult, Instance, InstanceCreateRequest, LinodeApi, SshKey,
    SshKeyCreateRequest,
};

pub static DEFAULT_API_URL: &str = "https://api.linode.com/v4";

const PAGE_SIZE: u32 = 500;

/// REST client for a single Linode account, authenticated with a bearer token.
#[derive(Clone)]
pub struct LinodeClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    pages: u32,
}

#[derive(Deserialize, Default)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<ApiErrorReason>,
}

#[derive(Deserialize)]
struct ApiErrorReason {
    reason: String,
    #[serde(default)]
    field: Option<String>,
}

fn error_message(body: &str) -> String {
    let parsed: ApiErrors = serde_json::from_str(body).unwrap_or_default();
    if parsed.errors.is_empty() {
        return body.trim().to_string();
    }

    parsed
        .errors
        .iter()
        .map(|e| match &e.field {
            Some(field) => format!("{field}: {}", e.reason),
            None => e.reason.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

async fn check(response: Response, what: &str) -> CloudResult<Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(CloudError::NotFound(what.to_string()));
    }
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

impl LinodeClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> CloudResult<T> {
        let response = request.bearer_auth(&self.token).send().await?;
        Ok(check(response, what).await?.json().await?)
    }

    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> CloudResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let request = self
                .http
                .get(self.url(path))
                .query(&[("page", page), ("page_size", PAGE_SIZE)]);
            let current: Page<T> = self.send(request, path).await?;
            items.extend(current.data);

            if current.page >= current.pages {
                return Ok(items);
            }
            page = current.page + 1;
        }
    }
}

#[async_trait]
impl LinodeApi for LinodeClient {
    #[instrument(skip(self))]
    async fn get_instance(&self, id: u64) -> CloudResult<Instance> {
        let path = format!("/linode/instances/{id}");
        self.send(self.http.get(self.url(&path)), &path).await
    }

    #[instrument(skip(self))]
    async fn list_instances(&self) -> CloudResult<Vec<Instance>> {
        self.list_all("/linode/instances").await
    }

    #[instrument(skip_all, fields(label = %request.label, region = %request.region))]
    async fn create_instance(&self, request: &InstanceCreateRequest) -> CloudResult<Instance> {
        let path = "/linode/instances";
        let instance: Instance = self
            .send(self.http.post(self.url(path)).json(request), path)
            .await?;
        debug!(id = instance.id, "instance created");
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn delete_instance(&self, id: u64) -> CloudResult<()> {
        let path = format!("/linode/instances/{id}");
        let _: serde_json::Value = self.send(self.http.delete(self.url(&path)), &path).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_ssh_keys(&self) -> CloudResult<Vec<SshKey>> {
        self.list_all("/profile/sshkeys").await
    }

    #[instrument(skip_all, fields(label = %request.label))]
    async fn create_ssh_key(&self, request: &SshKeyCreateRequest) -> CloudResult<SshKey> {
        let path = "/profile/sshkeys";
        self.send(self.http.post(self.url(path)).json(request), path)
            .await
    }

    #[instrument(skip(self))]
    async fn delete_ssh_key(&self, id: u64) -> CloudResult<()> {
        let path = format!("/profile/sshkeys/{id}");
        let _: serde_json::Value = self.send(self.http.delete(self.url(&path)), &path).await?;
        Ok(())
    }
}
