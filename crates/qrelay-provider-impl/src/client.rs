use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::StatusCode;
use qrelay_provider_core::{RelayError, RelayResult};

static SHARED_CLIENT: OnceLock<Arc<wreq::Client>> = OnceLock::new();
static IMPATIENT_CLIENT: OnceLock<Arc<wreq::Client>> = OnceLock::new();

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-lived client for the main body transfer. No overall timeout: a
/// streaming response stays open as long as the upstream keeps talking.
pub fn shared_client() -> RelayResult<Arc<wreq::Client>> {
    if let Some(client) = SHARED_CLIENT.get() {
        return Ok(client.clone());
    }
    let client = wreq::Client::builder().build().map_err(client_error)?;
    Ok(SHARED_CLIENT.get_or_init(|| Arc::new(client)).clone())
}

/// Short-timeout client for auxiliary calls (multipart uploads) that must
/// not stall the request for long.
pub fn impatient_client() -> RelayResult<Arc<wreq::Client>> {
    if let Some(client) = IMPATIENT_CLIENT.get() {
        return Ok(client.clone());
    }
    let client = wreq::Client::builder()
        .connect_timeout(UPLOAD_CONNECT_TIMEOUT)
        .timeout(UPLOAD_TIMEOUT)
        .build()
        .map_err(client_error)?;
    Ok(IMPATIENT_CLIENT.get_or_init(|| Arc::new(client)).clone())
}

fn client_error(err: wreq::Error) -> RelayError {
    RelayError::local(
        "do_request_failed",
        StatusCode::INTERNAL_SERVER_ERROR,
        err.to_string(),
    )
}
