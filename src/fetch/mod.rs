//! Redirect-following firmware download.
//!
//! [`Fetcher`] resolves a URL through redirects on top of an
//! [`HttpTransport`] and hands back a [`BodyStream`] positioned at the
//! response body. Redirects are bounded by [`DEFAULT_MAX_REDIRECTS`] unless
//! configured otherwise, so a redirect loop always terminates.

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use crate::error::{FetchError, ReadError};
use reqwest::Url;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default bound on followed redirects.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// A request header as `(name, value)`.
pub type Header<'a> = (&'a str, &'a str);

/// An HTTP client able to issue a GET and expose the response.
pub trait HttpTransport: Send + Sync {
    /// Send a GET request for `url` and read the response head.
    ///
    /// Automatic redirect handling must be disabled; redirect responses are
    /// returned as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened or the request
    /// cannot be sent.
    fn open(&self, url: &str, headers: &[Header<'_>]) -> Result<Box<dyn HttpResponse>, FetchError>;
}

/// A response whose head has been received.
pub trait HttpResponse: Send {
    /// Status code.
    fn status_code(&self) -> u16;

    /// Value of a response header, if present and valid text.
    fn header(&self, name: &str) -> Option<String>;

    /// Declared body length, if any.
    fn content_length(&self) -> Option<u64>;

    /// Read body bytes into `buf`. Returns `0` once the transport has no
    /// more data.
    ///
    /// # Errors
    ///
    /// Returns the transport error, including timeouts.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether the underlying connection is still open.
    fn is_connected(&self) -> bool;
}

/// Whether `status` asks the client to repeat the request elsewhere.
#[must_use]
pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Resolves redirects and opens response bodies.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    max_redirects: usize,
}

impl Fetcher {
    /// Create a fetcher with the default redirect bound.
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    /// Set the maximum number of redirects to follow.
    #[must_use]
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Request `url`, following redirects, and return the body stream.
    ///
    /// # Errors
    ///
    /// Returns an error if a request cannot be opened, a redirect has no
    /// usable `Location`, the redirect bound is exceeded, or the final status
    /// is not a success.
    pub fn open(&self, url: &str, headers: &[Header<'_>]) -> Result<BodyStream, FetchError> {
        let mut current = parse_url(url)?;
        let mut redirects = 0;

        loop {
            debug!("Request: {current}");
            let response = self.transport.open(current.as_str(), headers)?;
            let status = response.status_code();
            debug!("Status: {status}");

            if is_redirect(status) {
                if redirects >= self.max_redirects {
                    warn!("Giving up on {url} after {redirects} redirects");
                    return Err(FetchError::TooManyRedirects {
                        max: self.max_redirects,
                        url: url.to_string(),
                    });
                }
                let location =
                    response
                        .header("location")
                        .ok_or_else(|| FetchError::MissingLocation {
                            status,
                            url: current.to_string(),
                        })?;
                current = current.join(&location).map_err(|e| FetchError::InvalidUrl {
                    url: location.clone(),
                    reason: e.to_string(),
                })?;
                redirects += 1;
                continue;
            }

            if !(200..300).contains(&status) {
                return Err(FetchError::Status {
                    status,
                    url: current.to_string(),
                });
            }

            return Ok(BodyStream::new(response, current));
        }
    }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// A response body, read in bounded chunks.
pub struct BodyStream {
    response: Box<dyn HttpResponse>,
    url: Url,
    expected: Option<u64>,
    received: u64,
    eof: bool,
}

impl BodyStream {
    fn new(response: Box<dyn HttpResponse>, url: Url) -> Self {
        let expected = response.content_length();
        Self {
            response,
            url,
            expected,
            received: 0,
            eof: false,
        }
    }

    /// Final URL after redirects.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Declared body length, if any.
    #[must_use]
    pub fn expected_len(&self) -> Option<u64> {
        self.expected
    }

    /// Body bytes received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Read up to `buf.len()` body bytes. `Ok(0)` means the body ended
    /// cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::ConnectionReset`] if the transport closes before
    /// the declared length arrived, or [`ReadError::Io`] for other failures.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if self.eof || buf.is_empty() {
            return Ok(0);
        }

        let n = self.response.read(buf).map_err(|e| self.classify(e))?;
        if n == 0 {
            self.eof = true;
            if self.expected.is_some_and(|len| self.received < len) {
                return Err(self.reset());
            }
            return Ok(0);
        }

        self.received += n as u64;
        Ok(n)
    }

    /// Whether the whole body has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self.expected {
            Some(len) => self.received >= len,
            None => self.eof,
        }
    }

    /// Whether the transport can still deliver body bytes.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.eof && self.response.is_connected()
    }

    fn reset(&self) -> ReadError {
        ReadError::ConnectionReset {
            received: self.received,
            expected: self.expected,
        }
    }

    fn classify(&mut self, error: io::Error) -> ReadError {
        let missing = self.expected.is_some_and(|len| self.received < len);
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => {
                self.eof = true;
                self.reset()
            }
            // Any other failure before the declared length is a lost body.
            io::ErrorKind::Other if missing => {
                debug!("Body read failed after {} B: {error}", self.received);
                self.eof = true;
                self.reset()
            }
            _ => ReadError::Io(error),
        }
    }
}
