//! HTTP client for the CI service's runner gate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;

use snake_core::client::Client;
use snake_core::sshkey::SshKey;
use snake_core::status::Status;
use snake_core::task::Task;
use snake_core::{Error, Result};

/// Client for the service's runner gate endpoints.
pub struct GateClient {
    base_url: String,
    access_token: String,
    runner_name: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct TaskRequest<'a> {
    running_pipelines: &'a [i64],
    has_capacity: bool,
    /// Public half only; the private half never leaves the runner.
    ssh_key: &'a str,
}

#[derive(Serialize)]
struct StatusUpdate {
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl GateClient {
    pub fn new(base_url: &str, access_token: &str, runner_name: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            runner_name: runner_name.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("X-Snake-Runner-Name", &self.runner_name)
            .send()
            .await
            .map_err(|err| Error::Service(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Service(format!(
            "service responded with {status}: {body}"
        )))
    }
}

#[async_trait]
impl Client for GateClient {
    async fn get_task(
        &self,
        running_pipelines: Vec<i64>,
        has_capacity: bool,
        ssh_key: &SshKey,
    ) -> Result<Option<Task>> {
        let response = self
            .send(self.http.post(self.url("/gate/task")).json(&TaskRequest {
                running_pipelines: &running_pipelines,
                has_capacity,
                ssh_key: &ssh_key.public,
            }))
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let task = response
            .json()
            .await
            .map_err(|err| Error::Service(format!("unable to decode task: {err}")))?;
        Ok(Some(task))
    }

    async fn update_pipeline(
        &self,
        pipeline_id: i64,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.send(
            self.http
                .put(self.url(&format!("/gate/pipelines/{pipeline_id}")))
                .json(&StatusUpdate {
                    status,
                    started_at,
                    finished_at,
                }),
        )
        .await?;
        Ok(())
    }

    async fn update_job(
        &self,
        pipeline_id: i64,
        job_id: i64,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.send(
            self.http
                .put(self.url(&format!(
                    "/gate/pipelines/{pipeline_id}/jobs/{job_id}"
                )))
                .json(&StatusUpdate {
                    status,
                    started_at,
                    finished_at,
                }),
        )
        .await?;
        Ok(())
    }

    async fn push_logs(&self, pipeline_id: i64, job_id: i64, text: &str) -> Result<()> {
        self.send(
            self.http
                .post(self.url(&format!(
                    "/gate/pipelines/{pipeline_id}/jobs/{job_id}/logs"
                )))
                .body(text.to_string()),
        )
        .await?;
        Ok(())
    }
}
