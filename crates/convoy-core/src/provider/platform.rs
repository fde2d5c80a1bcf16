//! Remote task platform API - a Cloud Foundry v3 style task client.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::RemoteConfig;
use crate::error::{PlatformError, ProviderError};

/// Platform-side task state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Canceling,
    Succeeded,
    Failed,
    Unknown(String),
}

impl TaskState {
    pub fn from_api(state: &str) -> Self {
        match state.to_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "CANCELING" => Self::Canceling,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Task to launch on a worker app.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSpec {
    #[serde(skip)]
    pub app: String,
    pub name: String,
    pub command: String,
    #[serde(rename = "memory_in_mb")]
    pub memory_mb: u32,
    #[serde(rename = "disk_in_mb")]
    pub disk_mb: u32,
}

#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub guid: String,
    pub name: String,
    pub state: TaskState,
    pub failure_reason: Option<String>,
}

/// Operations the remote backend needs from a task platform.
#[async_trait]
pub trait TaskPlatform: Send + Sync {
    async fn create_task(&self, spec: &TaskSpec) -> Result<TaskInfo, PlatformError>;

    async fn get_task(&self, guid: &str) -> Result<TaskInfo, PlatformError>;

    /// Most recent task with this name on an app
    async fn find_task(&self, app: &str, name: &str) -> Result<Option<TaskInfo>, PlatformError>;

    async fn cancel_task(&self, guid: &str) -> Result<(), PlatformError>;

    /// Recent log lines of an app, all units interleaved
    async fn recent_logs(&self, app: &str) -> Result<String, PlatformError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    resources: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct AppResource {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct TaskResource {
    guid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    result: Option<TaskResult>,
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    #[serde(default)]
    failure_reason: Option<String>,
}

impl From<TaskResource> for TaskInfo {
    fn from(task: TaskResource) -> Self {
        Self {
            guid: task.guid,
            name: task.name,
            state: TaskState::from_api(&task.state),
            failure_reason: task.result.and_then(|r| r.failure_reason),
        }
    }
}

/// HTTP client with a cached bearer token and app GUID cache.
pub struct HttpTaskPlatform {
    client: Client,
    api_url: String,
    auth_url: String,
    client_id: String,
    username_env: String,
    password_env: String,
    space_guid: Option<String>,
    log_url: Option<String>,
    token: Mutex<Option<CachedToken>>,
    app_guids: RwLock<HashMap<String, String>>,
}

impl HttpTaskPlatform {
    pub fn from_config(config: &RemoteConfig) -> Result<Self, ProviderError> {
        let api_url = config
            .api_url
            .clone()
            .ok_or(ProviderError::MissingConfig("remote.api_url"))?;
        let auth_url = config.auth_url.clone().unwrap_or_else(|| api_url.clone());

        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(PlatformError::from)?,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth_url: auth_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            username_env: config.username_env.clone(),
            password_env: config.password_env.clone(),
            space_guid: config.space_guid.clone(),
            log_url: config.log_url.clone(),
            token: Mutex::new(None),
            app_guids: RwLock::new(HashMap::new()),
        })
    }

    /// Drop the cached token and app GUIDs.
    pub async fn shutdown(&self) {
        self.token.lock().await.take();
        self.app_guids.write().await.clear();
    }

    async fn bearer(&self) -> Result<String, PlatformError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let username = std::env::var(&self.username_env)
            .map_err(|_| PlatformError::MissingCredentials(self.username_env.clone()))?;
        let password = std::env::var(&self.password_env)
            .map_err(|_| PlatformError::MissingCredentials(self.password_env.clone()))?;

        let response = self
            .client
            .post(format!("{}/oauth/token", self.auth_url))
            .basic_auth(&self.client_id, Some(""))
            .form(&[
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ])
            .send()
            .await?;
        let token: TokenResponse = decode("token response", response).await?;
        if token.access_token.is_empty() {
            return Err(PlatformError::Malformed("token response has an empty access_token".to_string()));
        }

        // Refresh a minute before the platform expires it
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn app_guid(&self, app: &str) -> Result<String, PlatformError> {
        if let Some(guid) = self.app_guids.read().await.get(app) {
            return Ok(guid.clone());
        }

        let mut query = vec![("names", app.to_string())];
        if let Some(space) = &self.space_guid {
            query.push(("space_guids", space.clone()));
        }

        let response = self
            .client
            .get(format!("{}/v3/apps", self.api_url))
            .bearer_auth(self.bearer().await?)
            .query(&query)
            .send()
            .await?;
        let page: Page<AppResource> = decode("app list", response).await?;
        let guid = page
            .resources
            .into_iter()
            .next()
            .map(|a| a.guid)
            .ok_or_else(|| PlatformError::AppNotFound(app.to_string()))?;

        self.app_guids
            .write()
            .await
            .insert(app.to_string(), guid.clone());
        Ok(guid)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PlatformError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Read a successful response body as `T`.
async fn decode<T: DeserializeOwned>(what: &str, response: reqwest::Response) -> Result<T, PlatformError> {
    let body = check(response).await?.text().await?;
    parse_body(what, &body)
}

fn parse_body<T: DeserializeOwned>(what: &str, body: &str) -> Result<T, PlatformError> {
    serde_json::from_str(body).map_err(|e| PlatformError::Malformed(format!("{}: {}", what, e)))
}

#[async_trait]
impl TaskPlatform for HttpTaskPlatform {
    async fn create_task(&self, spec: &TaskSpec) -> Result<TaskInfo, PlatformError> {
        let app_guid = self.app_guid(&spec.app).await?;
        let response = self
            .client
            .post(format!("{}/v3/apps/{}/tasks", self.api_url, app_guid))
            .bearer_auth(self.bearer().await?)
            .json(spec)
            .send()
            .await?;
        let task: TaskResource = decode("task", response).await?;
        Ok(task.into())
    }

    async fn get_task(&self, guid: &str) -> Result<TaskInfo, PlatformError> {
        let response = self
            .client
            .get(format!("{}/v3/tasks/{}", self.api_url, guid))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        let task: TaskResource = decode("task", response).await?;
        Ok(task.into())
    }

    async fn find_task(&self, app: &str, name: &str) -> Result<Option<TaskInfo>, PlatformError> {
        let app_guid = self.app_guid(app).await?;
        let response = self
            .client
            .get(format!("{}/v3/apps/{}/tasks", self.api_url, app_guid))
            .bearer_auth(self.bearer().await?)
            .query(&[("names", name), ("order_by", "-created_at")])
            .send()
            .await?;
        let page: Page<TaskResource> = decode("task list", response).await?;
        Ok(page.resources.into_iter().next().map(TaskInfo::from))
    }

    async fn cancel_task(&self, guid: &str) -> Result<(), PlatformError> {
        let response = self
            .client
            .post(format!("{}/v3/tasks/{}/actions/cancel", self.api_url, guid))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn recent_logs(&self, app: &str) -> Result<String, PlatformError> {
        let Some(template) = &self.log_url else {
            return Ok(String::new());
        };
        let app_guid = self.app_guid(app).await?;
        let response = self
            .client
            .get(template.replace("{app_guid}", &app_guid))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        Ok(check(response).await?.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_body_maps_result() {
        let body = r#"{"guid":"t-1","name":"convoy-tester-A","state":"FAILED","result":{"failure_reason":"OOM"}}"#;
        let info: TaskInfo = parse_body::<TaskResource>("task", body).unwrap().into();
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.failure_reason.as_deref(), Some("OOM"));
    }

    #[test]
    fn test_malformed_body_is_reported() {
        let err = parse_body::<TaskResource>("task", r#"{"state":"RUNNING"}"#).unwrap_err();
        assert!(matches!(err, PlatformError::Malformed(ref msg) if msg.starts_with("task: ")));

        let err = parse_body::<Page<AppResource>>("app list", "<html>").unwrap_err();
        assert!(matches!(err, PlatformError::Malformed(_)));
    }
}
