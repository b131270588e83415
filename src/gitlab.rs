use crate::errors::{AppError, AppResult};
use crate::models::{FetchedBatch, MergeEvent};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const PAGE_SIZE: &str = "100";
const NEXT_PAGE_HEADER: &str = "x-next-page";

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_events(&self, project: &str, since: DateTime<Utc>) -> AppResult<FetchedBatch>;
}

#[derive(Debug, Deserialize)]
struct MergeRequestPayload {
    project_id: i64,
    #[serde(default)]
    author: Option<AuthorPayload>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AuthorPayload {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
    id: i64,
}

impl MergeRequestPayload {
    fn into_event(self) -> Option<MergeEvent> {
        let username = self.author.map(|author| author.username).unwrap_or_default();
        if username.trim().is_empty() {
            return None;
        }
        self.merged_at.map(|merged_at| MergeEvent { username, merged_at })
    }
}

#[derive(Clone)]
pub struct GitLabClient {
    host: Url,
    token: String,
    client: reqwest::Client,
}

impl GitLabClient {
    pub fn new(host_url: &str, token: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let host = Url::parse(host_url)
            .map_err(|err| AppError::Config(format!("invalid GitLab host URL '{}': {}", host_url, err)))?;
        if host.cannot_be_a_base() {
            return Err(AppError::Config(format!("GitLab host URL '{}' cannot be a base", host_url)));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build HTTP client: {}", err)))?;
        Ok(Self {
            host,
            token: token.into(),
            client,
        })
    }

    /// `{host}/api/v4/projects/{project}/{tail..}` with the project path encoded
    /// as a single segment (`group/proj` -> `group%2Fproj`).
    fn project_url(&self, project: &str, tail: &[&str]) -> AppResult<Url> {
        let mut url = self.host.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("GitLab host URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "v4", "projects", project])
            .extend(tail);
        Ok(url)
    }

    async fn resolve_project_id(&self, project: &str) -> AppResult<i64> {
        let response = self
            .client
            .get(self.project_url(project, &[])?)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|err| AppError::Fetch(format!("project lookup for {} failed: {}", project, err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Fetch(format!(
                "GitLab API returned {} for project {}",
                status, project
            )));
        }

        let payload = response
            .json::<ProjectPayload>()
            .await
            .map_err(|err| AppError::Fetch(format!("invalid project payload for {}: {}", project, err)))?;
        Ok(payload.id)
    }
}

#[async_trait]
impl EventSource for GitLabClient {
    async fn fetch_events(&self, project: &str, since: DateTime<Utc>) -> AppResult<FetchedBatch> {
        let updated_after = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut events = Vec::new();
        let mut project_id = None;
        let mut page: u32 = 1;

        loop {
            let page_param = page.to_string();
            let response = self
                .client
                .get(self.project_url(project, &["merge_requests"])?)
                .header("PRIVATE-TOKEN", &self.token)
                .query(&[
                    ("state", "merged"),
                    ("updated_after", updated_after.as_str()),
                    ("per_page", PAGE_SIZE),
                    ("page", page_param.as_str()),
                ])
                .send()
                .await
                .map_err(|err| AppError::Fetch(format!("request for {} page {} failed: {}", project, page, err)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(AppError::Fetch(format!(
                    "GitLab API returned {} for {} page {}",
                    status, project, page
                )));
            }

            let has_next_page = response
                .headers()
                .get(NEXT_PAGE_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false);

            let payload = response
                .json::<Vec<MergeRequestPayload>>()
                .await
                .map_err(|err| AppError::Fetch(format!("invalid merge request page for {}: {}", project, err)))?;
            if payload.is_empty() {
                break;
            }
            if project_id.is_none() {
                project_id = payload.first().map(|mr| mr.project_id);
            }
            events.extend(payload.into_iter().filter_map(MergeRequestPayload::into_event));

            if !has_next_page {
                break;
            }
            page += 1;
        }

        let project_id = match project_id {
            Some(id) => id,
            None => self.resolve_project_id(project).await?,
        };

        tracing::debug!(project, project_id, pages = page, events = events.len(), "fetched merge events");
        Ok(FetchedBatch { project_id, events })
    }
}
