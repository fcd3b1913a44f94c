use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::ClientError;

/// Keystone-style token header shared by all three remote APIs.
pub(crate) const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Map a non-success status to the client error taxonomy.
async fn status_error(resp: Response) -> ClientError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
        StatusCode::NOT_FOUND => ClientError::NotFound,
        StatusCode::CONFLICT => ClientError::Conflict,
        StatusCode::BAD_REQUEST => ClientError::BadRequest(body),
        _ => ClientError::Internal(format!("unexpected status {}: {}", status, body)),
    }
}

/// Expect `status` and decode the body as JSON. A success response with an
/// empty body where a record was expected is an [`ClientError::EmptyResponse`].
pub(crate) async fn expect_json<T: DeserializeOwned>(
    resp: Response,
    status: StatusCode,
    url: &str,
) -> Result<T, ClientError> {
    if resp.status() != status {
        return Err(status_error(resp).await);
    }
    let bytes = resp.bytes().await?;
    if bytes.is_empty() {
        return Err(ClientError::EmptyResponse {
            url: url.to_string(),
        });
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| ClientError::Internal(format!("decoding {}: {}", url, e)))
}

/// Expect `status`; the body is discarded.
pub(crate) async fn expect_status(resp: Response, status: StatusCode) -> Result<(), ClientError> {
    if resp.status() != status {
        return Err(status_error(resp).await);
    }
    Ok(())
}

/// Expect any 2xx; the body is discarded.
pub(crate) async fn expect_success(resp: Response) -> Result<(), ClientError> {
    if !resp.status().is_success() {
        return Err(status_error(resp).await);
    }
    Ok(())
}
