use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use gcp_auth::TokenProvider;
use reqwest::{
    header::{CONTENT_TYPE, LOCATION},
    Client, Response,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info};

use super::{
    job::{Job, JobConfiguration, JobReference, LoadConfiguration, LoadJob, SourceFormat},
    LoadOutcome, LoadRequest, LoadTarget,
};

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com";

/// Payloads up to this size go in a single multipart request; larger ones
/// use a resumable upload session.
const MULTIPART_MAX_BYTES: usize = 5 * 1024 * 1024;

const POLL_INITIAL: Duration = Duration::from_secs(1);
const POLL_MAX: Duration = Duration::from_secs(10);

/// Where access tokens come from.
enum Credentials {
    /// Application default credentials, refreshed as needed.
    Provider(Arc<dyn TokenProvider>),
    /// A fixed bearer token, for emulators and local endpoints.
    Static(String),
}

/// BigQuery REST client for load jobs. Build one per run and share it.
pub struct BigQueryClient {
    http: Client,
    credentials: Credentials,
    project_id: String,
    endpoint: String,
}

impl BigQueryClient {
    /// Authenticate with application default credentials. Jobs run in
    /// `project`, or in the credentials' own project when that is `None`.
    pub async fn new(project: Option<String>) -> Result<Self> {
        let auth = gcp_auth::provider()
            .await
            .context("authenticating with application default credentials")?;
        let project_id = match project {
            Some(p) => p,
            None => auth
                .project_id()
                .await
                .context("no project id: pass --project or set GOOGLE_CLOUD_PROJECT")?
                .to_string(),
        };
        info!(project = %project_id, "BigQuery client ready");

        Ok(Self {
            http: Client::new(),
            credentials: Credentials::Provider(auth),
            project_id,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        })
    }

    /// A client that sends the same bearer token on every request instead of
    /// looking up application default credentials.
    pub fn with_token(project_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            credentials: Credentials::Static(token.into()),
            project_id: project_id.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    /// Point the client at a different API root (emulators, proxies).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn bearer(&self) -> Result<String> {
        match &self.credentials {
            Credentials::Provider(auth) => {
                let token = auth
                    .token(&[BIGQUERY_SCOPE])
                    .await
                    .context("fetching BigQuery access token")?;
                Ok(token.as_str().to_string())
            }
            Credentials::Static(token) => Ok(token.clone()),
        }
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/bigquery/v2/projects/{}/jobs",
            self.endpoint, self.project_id
        )
    }

    async fn submit_multipart(&self, job: &LoadJob<'_>, payload: Vec<u8>) -> Result<Job> {
        let metadata = serde_json::to_vec(job).context("serializing load job")?;
        let boundary = multipart_boundary();
        let body = multipart_body(&boundary, &metadata, &payload);

        let resp = self
            .http
            .post(self.upload_url())
            .query(&[("uploadType", "multipart")])
            .bearer_auth(self.bearer().await?)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .context("sending multipart load job")?;
        let resp = expect_success(resp, "multipart load job upload").await?;
        resp.json().await.context("decoding submitted job")
    }

    async fn submit_resumable(&self, job: &LoadJob<'_>, payload: Vec<u8>) -> Result<Job> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .post(self.upload_url())
            .query(&[("uploadType", "resumable")])
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", payload.len().to_string())
            .json(job)
            .send()
            .await
            .context("starting resumable upload session")?;
        let resp = expect_success(resp, "resumable upload session").await?;
        let session = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("resumable upload session returned no Location header"))?;
        debug!(bytes = payload.len(), "uploading chunk through resumable session");

        let resp = self
            .http
            .put(session)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await
            .context("uploading chunk to resumable session")?;
        let resp = expect_success(resp, "resumable upload").await?;
        resp.json().await.context("decoding submitted job")
    }

    async fn get_job(&self, reference: &JobReference) -> Result<Job> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.endpoint, reference.project_id, reference.job_id
        );
        let mut req = self.http.get(url).bearer_auth(self.bearer().await?);
        if let Some(location) = &reference.location {
            req = req.query(&[("location", location)]);
        }
        let resp = req.send().await.context("polling load job")?;
        let resp = expect_success(resp, "jobs.get").await?;
        resp.json().await.context("decoding job status")
    }

    /// Poll until the job is DONE, then surface its error if it has one.
    async fn wait_for(&self, mut job: Job) -> Result<Job> {
        let mut delay = POLL_INITIAL;
        while !job.is_done() {
            sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
            job = self.get_job(&job.job_reference).await?;
            debug!(job_id = %job.job_reference.job_id, state = ?job.status.state, "polled load job");
        }
        match job.failure() {
            Some(err) => Err(err),
            None => Ok(job),
        }
    }
}

impl LoadTarget for BigQueryClient {
    async fn load(&self, request: LoadRequest<'_>) -> Result<LoadOutcome> {
        let job = LoadJob {
            job_reference: JobReference {
                project_id: self.project_id.clone(),
                job_id: job_id(request.chunk_index),
                location: None,
            },
            configuration: JobConfiguration {
                load: LoadConfiguration {
                    destination_table: request.table,
                    schema: request.schema,
                    source_format: SourceFormat::Parquet,
                    write_disposition: request.disposition,
                },
            },
        };

        let bytes = request.payload.len();
        let submitted = if bytes <= MULTIPART_MAX_BYTES {
            self.submit_multipart(&job, request.payload).await?
        } else {
            self.submit_resumable(&job, request.payload).await?
        };
        debug!(job_id = %submitted.job_reference.job_id, bytes, "load job submitted");

        let finished = self.wait_for(submitted).await.with_context(|| {
            format!(
                "loading chunk {} ({} rows) into {}",
                request.chunk_index, request.rows, request.table
            )
        })?;
        Ok(LoadOutcome {
            output_rows: finished.output_rows(),
            job_id: finished.job_reference.job_id,
        })
    }
}

/// Unique per chunk and per run.
fn job_id(chunk_index: usize) -> String {
    format!(
        "bqload_{}_chunk{}",
        Utc::now().format("%Y%m%d_%H%M%S_%f"),
        chunk_index
    )
}

fn multipart_boundary() -> String {
    format!("bqload_boundary_{}", Utc::now().format("%Y%m%d%H%M%S%f"))
}

/// `multipart/related` body: the job resource as JSON, then the media.
fn multipart_body(boundary: &str, metadata: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + payload.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

async fn expect_success(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("{} failed with HTTP {}: {}", what, status, body.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bigquery::{TableRef, WriteDisposition},
        process::schema::TableSchema,
    };
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn multipart_body_frames_metadata_then_media() {
        let body = multipart_body("XYZ", br#"{"a":1}"#, b"PAR1\x00PAR1");
        let expected: &[u8] = b"--XYZ\r\n\
Content-Type: application/json; charset=UTF-8\r\n\r\n\
{\"a\":1}\r\n\
--XYZ\r\n\
Content-Type: application/octet-stream\r\n\r\n\
PAR1\x00PAR1\r\n\
--XYZ--\r\n";
        assert_eq!(body, expected);
    }

    #[test]
    fn job_ids_use_only_allowed_characters() {
        let id = job_id(12);
        assert!(id.starts_with("bqload_"));
        assert!(id.ends_with("_chunk12"));
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    const JOBS_PATH: &str = "/upload/bigquery/v2/projects/proj/jobs";

    fn client_for(server: &MockServer) -> BigQueryClient {
        BigQueryClient::with_token("proj", "test_token").with_endpoint(server.uri())
    }

    fn orders() -> TableRef {
        TableRef {
            project_id: "proj".into(),
            dataset_id: "sales".into(),
            table_id: "orders".into(),
        }
    }

    fn request<'a>(
        table: &'a TableRef,
        schema: &'a TableSchema,
        payload: Vec<u8>,
    ) -> LoadRequest<'a> {
        LoadRequest {
            table,
            schema,
            disposition: WriteDisposition::WriteAppend,
            chunk_index: 0,
            rows: 2,
            payload,
        }
    }

    fn job_json(state: &str) -> serde_json::Value {
        json!({
            "jobReference": {"projectId": "proj", "jobId": "bqload_fixed", "location": "US"},
            "status": {"state": state}
        })
    }

    #[tokio::test]
    async fn forbidden_upload_reports_status_and_body() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .and(query_param("uploadType", "multipart"))
            .and(header("Authorization", "Bearer test_token"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("Access Denied: Table proj:sales.orders"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let table = orders();
        let schema = TableSchema::all_strings(&["Region"])?;
        let err = client_for(&server)
            .load(request(&table, &schema, b"PAR1".to_vec()))
            .await
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("HTTP 403"), "{msg}");
        assert!(msg.contains("Access Denied: Table proj:sales.orders"), "{msg}");
        Ok(())
    }

    #[tokio::test]
    async fn running_job_is_polled_until_done() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .and(query_param("uploadType", "multipart"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_json("RUNNING")))
            .expect(1)
            .mount(&server)
            .await;
        let mut done = job_json("DONE");
        done["statistics"] = json!({"load": {"outputRows": "2"}});
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/bqload_fixed"))
            .and(query_param("location", "US"))
            .and(header("Authorization", "Bearer test_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(done))
            .expect(1)
            .mount(&server)
            .await;

        let table = orders();
        let schema = TableSchema::all_strings(&["Region"])?;
        let outcome = client_for(&server)
            .load(request(&table, &schema, b"PAR1".to_vec()))
            .await?;
        assert_eq!(
            outcome,
            LoadOutcome {
                job_id: "bqload_fixed".into(),
                output_rows: Some(2),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn done_job_with_error_result_fails() -> Result<()> {
        let server = MockServer::start().await;
        let mut failed = job_json("DONE");
        failed["status"]["errorResult"] =
            json!({"reason": "invalid", "message": "Provided Schema does not match Table"});
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(failed))
            .expect(1)
            .mount(&server)
            .await;

        let table = orders();
        let schema = TableSchema::all_strings(&["Region"])?;
        let err = client_for(&server)
            .load(request(&table, &schema, b"PAR1".to_vec()))
            .await
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("loading chunk 0 (2 rows) into proj.sales.orders"), "{msg}");
        assert!(
            msg.contains("load job bqload_fixed failed: Provided Schema does not match Table (invalid)"),
            "{msg}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn large_payload_uses_resumable_session() -> Result<()> {
        let server = MockServer::start().await;
        let payload = vec![7u8; MULTIPART_MAX_BYTES + 1];
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .and(query_param("uploadType", "multipart"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_json("DONE")))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .and(query_param("uploadType", "resumable"))
            .and(header("X-Upload-Content-Length", payload.len().to_string().as_str()))
            .respond_with(
                ResponseTemplate::new(200).insert_header(
                    "Location",
                    format!("{}/upload/session/abc", server.uri()).as_str(),
                ),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/session/abc"))
            .and(header("Authorization", "Bearer test_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_json("DONE")))
            .expect(1)
            .mount(&server)
            .await;

        let table = orders();
        let schema = TableSchema::all_strings(&["Region"])?;
        let outcome = client_for(&server)
            .load(request(&table, &schema, payload))
            .await?;
        assert_eq!(outcome.job_id, "bqload_fixed");
        assert_eq!(outcome.output_rows, None);
        Ok(())
    }
}
