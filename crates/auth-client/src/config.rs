//! Client-wide request defaults

use reqwest::header::HeaderMap;

use crate::error::{Error, Result};
use crate::request::Request;

/// Defaults applied to every request before its first attempt.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Prefix for relative request URLs.
    pub base_url: Option<String>,
    /// Headers added unless the request already sets them.
    pub default_headers: HeaderMap,
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Resolve the URL and merge default headers into `request`.
    pub fn apply(&self, request: &mut Request) -> Result<()> {
        request.url = self.resolve_url(&request.url)?;
        for (name, value) in &self.default_headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn resolve_url(&self, url: &str) -> Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(url.to_owned());
        }
        match &self.base_url {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            )),
            None => Err(Error::InvalidRequest(format!(
                "relative URL {url:?} without a base_url"
            ))),
        }
    }
}
