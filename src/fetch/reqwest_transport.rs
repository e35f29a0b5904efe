//! [`HttpTransport`] over `reqwest`'s blocking client.

use super::{Header, HttpResponse, HttpTransport};
use crate::error::FetchError;
use reqwest::blocking::{Client, Response};
use reqwest::redirect::Policy;
use std::io::{self, Read};
use std::time::Duration;

/// Blocking HTTPS transport with redirects left to the [`super::Fetcher`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a transport.
    ///
    /// `connect_timeout` bounds connection setup; `download_timeout` bounds
    /// the whole request including the body.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(connect_timeout: Duration, download_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(connect_timeout)
            .timeout(download_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn open(&self, url: &str, headers: &[Header<'_>]) -> Result<Box<dyn HttpResponse>, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().map_err(|e| FetchError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(ReqwestResponse {
            response,
            connected: true,
        }))
    }
}

struct ReqwestResponse {
    response: Response,
    connected: bool,
}

impl HttpResponse for ReqwestResponse {
    fn status_code(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.response.read(buf) {
            Ok(0) => {
                self.connected = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.connected = false;
                Err(surface_io_kind(e))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Re-tag `error` with the kind of the innermost `io::Error` in its source
/// chain. The body reader reports hyper failures as `ErrorKind::Other`.
fn surface_io_kind(error: io::Error) -> io::Error {
    if error.kind() != io::ErrorKind::Other {
        return error;
    }

    let mut kind = None;
    let mut source: Option<&(dyn std::error::Error + 'static)> =
        error.get_ref().map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(current) = source {
        if let Some(io_error) = current.downcast_ref::<io::Error>() {
            if io_error.kind() != io::ErrorKind::Other {
                kind = Some(io_error.kind());
            }
        }
        source = current.source();
    }

    match kind {
        Some(kind) => io::Error::new(kind, error),
        None => error,
    }
}
