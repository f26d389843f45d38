//! hyper-based client for the control backend.

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{Backend, CommandResponse, NewRun, RunRecord, RunStop};
use crate::connection::BackendAddress;
use crate::error::{HmiError, Result};
use crate::protocol::{CommandRequest, DeviceId};

/// Longest response body kept in an `HttpStatus` error.
const MAX_ERROR_BODY: usize = 512;

/// REST client for a live control backend.
///
/// Requests carry no explicit timeout; an unresponsive backend stalls the call until the
/// connection itself errors out.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client<HttpConnector, Body>,
    address: BackendAddress,
}

impl HttpBackend {
    /// Create a client for `address`.
    #[must_use]
    pub fn new(address: BackendAddress) -> Self {
        Self {
            client: Client::new(),
            address,
        }
    }

    /// Base address requests are sent to.
    #[must_use]
    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let uri = self.address.endpoint(path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri.as_str())
            .header(ACCEPT, "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .map_err(|e| HmiError::InvalidUri(format!("{uri}: {e}")))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        debug!(%method, %uri, status = status.as_u16(), len = bytes.len(), "Backend response");
        Ok((status, bytes.to_vec()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, bytes) = self.execute(Method::GET, path, None).await?;
        decode(status, &bytes)
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let payload = body.map(serde_json::to_vec).transpose()?;
        let (status, bytes) = self.execute(Method::POST, path, payload).await?;
        decode(status, &bytes)
    }
}

fn status_error(status: StatusCode, bytes: &[u8]) -> HmiError {
    let mut body = String::from_utf8_lossy(bytes).into_owned();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    HmiError::HttpStatus {
        status: status.as_u16(),
        body,
    }
}

fn decode<T: DeserializeOwned>(status: StatusCode, bytes: &[u8]) -> Result<T> {
    if !status.is_success() {
        return Err(status_error(status, bytes));
    }
    // Some endpoints answer 2xx with an empty body.
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(bytes)?)
}

#[async_trait]
impl Backend for HttpBackend {
    #[instrument(skip(self, request), fields(device = %request.device))]
    async fn send_command(&self, request: &CommandRequest) -> Result<CommandResponse> {
        self.post_json("send_command/", Some(request)).await
    }

    async fn emergency_stop(&self) -> Result<CommandResponse> {
        self.post_json::<Value, _>("emergency_stop", None).await
    }

    async fn device_status(&self) -> Result<Value> {
        self.get_json("device_status/").await
    }

    async fn device_data(&self, device: DeviceId) -> Result<Option<Value>> {
        let (status, bytes) = self
            .execute(Method::GET, &format!("device_data/{device}"), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(status, &bytes).map(Some)
    }

    async fn all_device_data(&self) -> Result<Value> {
        self.get_json("device_data/").await
    }

    async fn create_run(
        &self,
        project_id: i64,
        experiment_id: i64,
        run: &NewRun,
    ) -> Result<RunRecord> {
        self.post_json(
            &format!("projects/{project_id}/experiments/{experiment_id}/runs"),
            Some(run),
        )
        .await
    }

    async fn stop_run(&self, run_id: i64, stop: &RunStop) -> Result<()> {
        let _: Value = self
            .post_json(&format!("runs/{run_id}/stop"), Some(stop))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AddressSource;

    #[test]
    fn decode_maps_non_success_to_http_status() {
        let err = decode::<Value>(StatusCode::SERVICE_UNAVAILABLE, b"down").unwrap_err();
        assert!(matches!(err, HmiError::HttpStatus { status: 503, ref body } if body == "down"));
    }

    #[test]
    fn decode_accepts_empty_success_body() {
        let value: Value = decode(StatusCode::OK, b"").unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn status_error_truncates_long_bodies() {
        let body = "é".repeat(MAX_ERROR_BODY);
        match status_error(StatusCode::BAD_GATEWAY, body.as_bytes()) {
            HmiError::HttpStatus { body, .. } => assert!(body.len() <= MAX_ERROR_BODY),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transient_error() {
        // Port 9 (discard) is closed on test hosts.
        let address = BackendAddress::parse("127.0.0.1:9", AddressSource::UserInput).unwrap();
        let backend = HttpBackend::new(address);
        let err = backend.device_status().await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
