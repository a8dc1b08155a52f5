use std::error::Error as StdError;
use std::time::Duration;

use http::header::{HeaderMap, CONTENT_TYPE};
use http::StatusCode;
use reqwest::blocking::Client;
use thiserror::Error;
use url::Url;

/// Content type of signed ACME requests.
pub const JOSE_JSON: &str = "application/jose+json";

/// Connection-level failure while talking to the ACME server.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build ACME HTTP client: {0}")]
    Client(String),
    #[error("{method} {url} failed: {source}")]
    Request {
        method: &'static str,
        url: Url,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl HttpError {
    pub fn request<E>(method: &'static str, url: &Url, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Request {
            method,
            url: url.clone(),
            source: Box::new(source),
        }
    }
}

/// Raw HTTP response handed back to the transport.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Blocking HTTP operations the ACME transport needs.
///
/// Implementations must not follow redirects or retry on their own.
pub trait AcmeHttpClient {
    /// `HEAD` request, used against `newNonce`.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on connection-level failures only.
    fn head(&self, url: &Url) -> Result<HttpResponse, HttpError>;

    /// Unauthenticated `GET`, used for the directory.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on connection-level failures only.
    fn get(&self, url: &Url) -> Result<HttpResponse, HttpError>;

    /// `POST` of a JWS body with `Content-Type: application/jose+json`.
    ///
    /// # Errors
    ///
    /// Returns `HttpError` on connection-level failures only.
    fn post_jose(&self, url: &Url, body: Vec<u8>) -> Result<HttpResponse, HttpError>;
}

impl<T: AcmeHttpClient + ?Sized> AcmeHttpClient for &T {
    fn head(&self, url: &Url) -> Result<HttpResponse, HttpError> {
        (**self).head(url)
    }

    fn get(&self, url: &Url) -> Result<HttpResponse, HttpError> {
        (**self).get(url)
    }

    fn post_jose(&self, url: &Url, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        (**self).post_jose(url, body)
    }
}

/// [`AcmeHttpClient`] backed by `reqwest::blocking`.
#[derive(Debug, Clone)]
pub struct ReqwestAcmeClient {
    client: Client,
}

impl ReqwestAcmeClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// # Errors
    ///
    /// Returns `HttpError::Client` when the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, HttpError> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// # Errors
    ///
    /// Returns `HttpError::Client` when the TLS backend cannot be initialised.
    pub fn with_timeout(timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("certflow-acme/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| HttpError::Client(err.to_string()))?;
        Ok(Self { client })
    }

    fn collect(
        method: &'static str,
        url: &Url,
        response: reqwest::Result<reqwest::blocking::Response>,
    ) -> Result<HttpResponse, HttpError> {
        let response = response.map_err(|err| HttpError::request(method, url, err))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .map_err(|err| HttpError::request(method, url, err))?
            .to_vec();
        Ok(HttpResponse::new(status, headers, body))
    }
}

impl AcmeHttpClient for ReqwestAcmeClient {
    fn head(&self, url: &Url) -> Result<HttpResponse, HttpError> {
        Self::collect("HEAD", url, self.client.head(url.as_str()).send())
    }

    fn get(&self, url: &Url) -> Result<HttpResponse, HttpError> {
        Self::collect("GET", url, self.client.get(url.as_str()).send())
    }

    fn post_jose(&self, url: &Url, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        let request = self
            .client
            .post(url.as_str())
            .header(CONTENT_TYPE, JOSE_JSON)
            .body(body);
        Self::collect("POST", url, request.send())
    }
}
