//! Parsed server `INFO` frame and the `CONNECT` arguments sent in reply.
//!
//! NATS hands JSON arguments to both `INFO` and `CONNECT`, unlike this
//! codebase's ZMTP lineage (whose READY command uses manual length-prefixed
//! key/value pairs). `serde`/`serde_json` cover this one spot; everything
//! else in the wire format is still hand-rolled line/byte parsing.

use nats_core::options::Credentials;
use serde::{Deserialize, Serialize};

/// Parsed from the server's `INFO <json>\r\n` line.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: i64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub max_payload: i64,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_verify: bool,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

impl ServerInfo {
    /// Parse the JSON payload following `INFO ` on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON or is missing
    /// required fields.
    pub fn parse(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }
}

/// Arguments serialized into the `CONNECT <json>\r\n` line.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectArgs {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    pub name: String,
    pub lang: String,
    pub version: String,
    pub protocol: i64,
    pub headers: bool,
    pub echo: bool,
}

impl ConnectArgs {
    #[must_use]
    pub fn new(credentials: &Credentials, tls_required: bool, echo: bool) -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required,
            user: credentials.user.clone(),
            pass: credentials.pass.clone(),
            auth_token: credentials.auth_token.clone(),
            nkey: credentials.nkey.clone(),
            jwt: credentials.jwt.clone(),
            sig: credentials.signature.clone(),
            name: "natsclient".to_string(),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            headers: true,
            echo,
        }
    }

    /// Serialize to the bytes that follow `CONNECT ` on the wire (caller adds
    /// the verb and CRLF).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (it cannot for this type, but
    /// the signature stays fallible to mirror `serde_json`'s API).
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
