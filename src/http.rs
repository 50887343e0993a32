use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::config::HttpSettings;
use crate::error::StplugError;

/// A response whose body has not been read yet.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpSource: Send + Sync {
    /// Issues a GET and returns as soon as headers arrive. Redirects are
    /// followed. Non-2xx statuses are not errors.
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, StplugError>;

    /// Existence probe; returns the final status code.
    fn head(&self, url: &str, timeout: Duration) -> Result<u16, StplugError>;
}

#[derive(Clone)]
pub struct ReqwestSource {
    client: Client,
}

impl ReqwestSource {
    pub fn new(settings: &HttpSettings) -> Result<Self, StplugError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&settings.user_agent)
                .map_err(|err| StplugError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| StplugError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpSource for ReqwestSource {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, StplugError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|err| StplugError::Http(err.to_string()))?;
        Ok(HttpResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }

    fn head(&self, url: &str, timeout: Duration) -> Result<u16, StplugError> {
        let response = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .map_err(|err| StplugError::Http(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}
