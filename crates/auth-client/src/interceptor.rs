//! Request interceptor: stamp the bearer token

use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

use crate::error::{Error, Result};

/// Set `Authorization: Bearer <token>` when a token is available.
///
/// Without a token the headers are left as they are and the request goes out
/// unauthenticated; the server's rejection drives the rest. The header value
/// is marked sensitive so it never shows up in `Debug` output.
pub fn authorize(headers: &mut HeaderMap, token: Option<&Secret<String>>) -> Result<()> {
    let Some(token) = token else {
        return Ok(());
    };
    let mut value = HeaderValue::from_str(&token.bearer()).map_err(|e| {
        Error::InvalidRequest(format!("access token is not a valid header value: {e}"))
    })?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(())
}
