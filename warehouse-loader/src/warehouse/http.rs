use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{
    JobDescription, LoadStatement, RemoteJobState, SinkTarget, WarehouseClient, WarehouseError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct SubmitRequest<'a> {
    statement: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct DescribeResponse {
    status: String,
    rows_affected: Option<u64>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RunningJobsResponse {
    count: usize,
}

#[derive(Deserialize)]
struct ColumnsResponse {
    columns: Vec<String>,
}

#[derive(Serialize)]
struct AddColumnRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    ty: &'a str,
}

/// Warehouse client over the target's JSON statement API.
pub struct HttpWarehouseClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpWarehouseClient {
    pub fn new(target: &SinkTarget) -> Result<Self, WarehouseError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            endpoint: target.endpoint.trim_end_matches('/').to_owned(),
            token: target.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.endpoint, path));
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, WarehouseError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(WarehouseError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl WarehouseClient for HttpWarehouseClient {
    async fn submit(&self, statement: &LoadStatement) -> Result<String, WarehouseError> {
        let sql = statement.to_sql();
        let response = self
            .request(reqwest::Method::POST, "/api/v1/statements")
            .json(&SubmitRequest { statement: &sql })
            .send()
            .await?;

        let body: SubmitResponse = Self::check(response).await?.json().await?;
        Ok(body.id)
    }

    async fn describe(&self, external_job_id: &str) -> Result<JobDescription, WarehouseError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/statements/{external_job_id}"),
            )
            .send()
            .await?;

        let body: DescribeResponse = Self::check(response).await?.json().await?;
        let state = match body.status.as_str() {
            "queued" => RemoteJobState::Queued,
            "running" => RemoteJobState::Running,
            "success" => RemoteJobState::Success,
            "failed" | "aborted" => RemoteJobState::Failed,
            other => {
                return Err(WarehouseError::Protocol(format!(
                    "unknown job status {other:?}"
                )))
            }
        };

        Ok(JobDescription {
            state,
            rows_affected: body.rows_affected,
            error: body.error,
        })
    }

    async fn running_jobs(&self) -> Result<usize, WarehouseError> {
        let response = self
            .request(reqwest::Method::GET, "/api/v1/jobs/running")
            .send()
            .await?;

        let body: RunningJobsResponse = Self::check(response).await?.json().await?;
        Ok(body.count)
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/tables/{table}/columns"),
            )
            .send()
            .await?;

        let body: ColumnsResponse = Self::check(response).await?.json().await?;
        Ok(body.columns)
    }

    async fn add_column(
        &self,
        table: &str,
        column: &str,
        ty: &str,
    ) -> Result<(), WarehouseError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/tables/{table}/columns"),
            )
            .json(&AddColumnRequest {
                name: column,
                ty,
            })
            .send()
            .await?;

        // Concurrent loaders race to add the same column; the loser's
        // conflict is success for our purposes.
        if response.status() == StatusCode::CONFLICT {
            return Err(WarehouseError::ColumnExists(column.to_owned()));
        }

        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(endpoint: &str) -> SinkTarget {
        SinkTarget {
            name: "primary".to_string(),
            endpoint: endpoint.to_string(),
            token: "secret".to_string(),
            table: "events".to_string(),
            schema_evolution: true,
        }
    }

    #[tokio::test]
    async fn test_submit_returns_external_job_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/statements")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "01-abc"}"#)
            .create_async()
            .await;

        let client = HttpWarehouseClient::new(&target(&server.url())).unwrap();
        let statement = LoadStatement {
            table: "events".to_string(),
            location: "s3://bucket/loads/1/part-0000.ndjson.gz".to_string(),
            manifest: false,
        };
        let id = client.submit(&statement).await.unwrap();
        assert_eq!(id, "01-abc");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_describe_maps_states() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/statements/01-abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "success", "rows_affected": 42, "error": null}"#)
            .create_async()
            .await;

        let client = HttpWarehouseClient::new(&target(&server.url())).unwrap();
        let description = client.describe("01-abc").await.unwrap();
        assert_eq!(description.state, RemoteJobState::Success);
        assert_eq!(description.rows_affected, Some(42));
    }

    #[tokio::test]
    async fn test_describe_rejects_unknown_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/statements/01-abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "sideways"}"#)
            .create_async()
            .await;

        let client = HttpWarehouseClient::new(&target(&server.url())).unwrap();
        let result = client.describe("01-abc").await;
        assert!(matches!(result, Err(WarehouseError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_add_column_conflict_is_column_exists() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/tables/events/columns")
            .with_status(409)
            .with_body("column exists")
            .create_async()
            .await;

        let client = HttpWarehouseClient::new(&target(&server.url())).unwrap();
        let result = client.add_column("events", "plan", "TEXT").await;
        assert!(matches!(result, Err(WarehouseError::ColumnExists(c)) if c == "plan"));
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/jobs/running")
            .with_status(503)
            .with_body("warming up")
            .create_async()
            .await;

        let client = HttpWarehouseClient::new(&target(&server.url())).unwrap();
        match client.running_jobs().await {
            Err(WarehouseError::Api { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "warming up");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
