use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::debug;
use ureq::Agent;

use super::{ProbeOutcome, RemoteStore, TransferError};

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// HTTP remote backed by one shared `ureq` agent (and its connection pool).
#[derive(Clone)]
pub struct HttpRemote {
    agent: Agent,
}

impl HttpRemote {
    /// Build a remote whose requests (headers and body) must finish within `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(request_timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: Agent::new_with_config(config),
        }
    }
}

impl RemoteStore for HttpRemote {
    fn probe(&self, url: &str) -> Result<ProbeOutcome, TransferError> {
        let response = self.agent.head(url).call().map_err(|err| classify_ureq_error(url, err))?;
        let status = response.status().as_u16();
        debug!(url, status, "probe response");
        match status {
            200..=299 => Ok(ProbeOutcome::Exists),
            404 => Ok(ProbeOutcome::NotFound),
            other => Err(TransferError::Permanent(format!(
                "HEAD '{url}' returned HTTP {other}"
            ))),
        }
    }

    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, TransferError> {
        let response = self.agent.get(url).call().map_err(|err| classify_ureq_error(url, err))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status(url, status));
        }
        // Decoded bodies no longer match the wire length.
        let expected_bytes = if response.headers().contains_key("content-encoding") {
            None
        } else {
            response
                .headers()
                .get("content-length")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
        };

        let mut reader = response.into_body().into_reader();
        let mut buffer = vec![0u8; READ_BUFFER_BYTES];
        let mut total_bytes = 0u64;
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(TransferError::Transient(format!(
                        "reading body of '{url}' failed after {total_bytes} bytes: {err}"
                    )));
                }
            };
            sink.write_all(&buffer[..read]).map_err(|err| {
                TransferError::Permanent(format!("writing body of '{url}' failed: {err}"))
            })?;
            total_bytes = total_bytes.saturating_add(read as u64);
        }

        if let Some(expected) = expected_bytes
            && total_bytes < expected
        {
            return Err(TransferError::Transient(format!(
                "truncated transfer of '{url}': {total_bytes}/{expected} bytes"
            )));
        }
        Ok(total_bytes)
    }
}

fn classify_status(url: &str, status: u16) -> TransferError {
    let reason = format!("GET '{url}' returned HTTP {status}");
    match status {
        408 | 425 | 429 | 500 | 502 | 503 | 504 => TransferError::Transient(reason),
        _ => TransferError::Permanent(reason),
    }
}

// Status codes never surface here: the agent runs with `http_status_as_error(false)`.
fn classify_ureq_error(url: &str, err: ureq::Error) -> TransferError {
    let reason = format!("request to '{url}' failed: {err}");
    match err {
        ureq::Error::Io(_) | ureq::Error::Timeout(_) | ureq::Error::ConnectionFailed => {
            TransferError::Transient(reason)
        }
        _ => TransferError::Permanent(reason),
    }
}
