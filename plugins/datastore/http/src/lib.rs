use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use encoder_api::{CollaboratorError, Component, DatastoreClient, EncryptedRecord};

/// Path of the datastore's write method, relative to the endpoint.
pub const WRITE_PATH: &str = "/twirp/decode.iot.datastore.Datastore/WriteData";

#[derive(Serialize)]
struct WriteRequest<'a> {
    bucket: &'a str,
    /// Base64 of the age ciphertext.
    data: String,
    observed_at: i64,
}

/// Datastore reached over Twirp-style JSON/HTTP.
///
/// 5xx and transport failures are `Unavailable`; any other non-success
/// status is `Rejected`.
pub struct HttpDatastore {
    http: reqwest::Client,
    write_url: String,
}

impl HttpDatastore {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            write_url: format!("{}{WRITE_PATH}", endpoint.trim_end_matches('/')),
        })
    }
}

impl Component for HttpDatastore {
    fn name(&self) -> &str {
        "datastore-http"
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!(url = %self.write_url, "datastore client ready");
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

impl DatastoreClient for HttpDatastore {
    fn write(
        &self,
        record: EncryptedRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&WriteRequest {
                bucket: &record.datastore_target,
                data: BASE64.encode(&record.ciphertext),
                observed_at: record.observed_at_ms,
            })
            .map_err(|e| CollaboratorError::internal(format!("encode request: {e}")))?;

            let resp = self
                .http
                .post(&self.write_url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| CollaboratorError::unavailable(format!("datastore request: {e}")))?;

            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("datastore answered {status}: {text}");
            if status.is_server_error() {
                Err(CollaboratorError::unavailable(msg))
            } else {
                Err(CollaboratorError::rejected(msg))
            }
        })
    }
}
