use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::CredentialsError;

/// # Credentials
///
/// OAuth2 client-credentials pair for the OpenSky auth server.
///
/// Loaded once from a JSON file of the shape `{"clientId": "...", "clientSecret": "..."}`
/// and never mutated afterwards. The token manager may swap the whole set for an
/// alternate one when the upstream starts rate limiting.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// OAuth2 `client_id`.
    pub client_id: String,
    /// OAuth2 `client_secret`.
    pub client_secret: String,
}

impl Credentials {
    /// Builds a credential pair in memory.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Reads and parses a credentials file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialsError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| CredentialsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| CredentialsError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

// Keep the secret out of log lines.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

/// # Access Token
///
/// The bearer token plus its validity flag. Owned by the token manager and only
/// mutated under its lock.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw bearer string as returned by the auth server.
    pub bearer: String,
    /// Cleared on any 401 from the upstream API.
    pub authenticated: bool,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("bearer", &if self.bearer.is_empty() { "" } else { "***" })
            .field("authenticated", &self.authenticated)
            .finish()
    }
}
