//! Bearer-token authentication for the trading backend.
//!
//! The token is obtained out of band (login is not part of this crate) and
//! sent verbatim as `Authorization: Bearer <token>`. Its structure is never
//! parsed or validated here.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Bearer token is required")]
    MissingToken,
    #[error("Bearer token contains characters not allowed in a header")]
    InvalidHeaderValue,
}

/// Bearer credentials attached to every backend request.
#[derive(Clone)]
pub struct BearerAuth {
    header: HeaderValue,
}

impl BearerAuth {
    pub fn new(token: &str) -> Result<Self, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut header = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| AuthError::InvalidHeaderValue)?;
        header.set_sensitive(true);

        Ok(Self { header })
    }

    /// Headers for one request.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.header.clone());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuth")
            .field("token", &"<redacted>")
            .finish()
    }
}
