//! Single-sign-on options and extracted credentials.
//!
//! The full SSO flow (redirects to an authenticator, token validation) is the
//! host application's business. Shoreline only carries enough to surface who
//! a connection belongs to: a cookie name to look for, and the credentials
//! pulled out of it, which feed the stats document and are available to
//! WebSocket handlers.

use crate::http::request::RequestHead;

/// Configuration for single-sign-on credential extraction.
#[derive(Debug, Clone)]
pub struct SsoOptions {
    /// Name of the cookie carrying the authenticated username.
    pub cookie_name: String,
}

impl Default for SsoOptions {
    fn default() -> Self {
        Self {
            cookie_name: "username".to_owned(),
        }
    }
}

impl SsoOptions {
    /// Options looking for the given cookie.
    #[must_use]
    pub fn with_cookie_name(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }

    /// Extracts credentials from a parsed request head, if present.
    #[must_use]
    pub fn extract(&self, head: &RequestHead) -> Option<Credentials> {
        head.cookie(&self.cookie_name).map(|username| Credentials {
            username: username.to_owned(),
        })
    }
}

/// Identity attached to a connection once its request has been seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Authenticated username.
    pub username: String,
}
