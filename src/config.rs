//! Client configuration
//!
//! A JSON document with kebab-case keys:
//!
//! ```json
//! {
//!   "endpoint-name": "lwm2m-device-01",
//!   "lifetime": 3600,
//!   "binding": "U",
//!   "server-uri": "coap://127.0.0.1:5683"
//! }
//! ```

use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Lwm2mError, Result};

/// Shortest registration lifetime accepted, in seconds
pub const MIN_LIFETIME: u32 = 60;

const COAP_DEFAULT_PORT: u16 = 5683;
const COAPS_DEFAULT_PORT: u16 = 5684;
const BINDINGS: [&str; 6] = ["U", "UQ", "S", "SQ", "US", "UQS"];

/// Endpoint and server settings of the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    pub endpoint_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_server_uri: Option<String>,
}

impl ClientConfig {
    /// Minimal configuration for `endpoint_name`
    pub fn new(endpoint_name: &str) -> Self {
        Self {
            endpoint_name: endpoint_name.to_string(),
            endpoint_type: None,
            domain: None,
            lifetime: None,
            binding: None,
            server_uri: None,
            bootstrap_server_uri: None,
        }
    }

    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint_name.trim().is_empty() {
            return Err(Lwm2mError::InvalidConfig("endpoint-name is empty".into()));
        }
        if let Some(lifetime) = self.lifetime
            && lifetime < MIN_LIFETIME
        {
            return Err(Lwm2mError::InvalidConfig(format!(
                "lifetime {} is below {} seconds",
                lifetime, MIN_LIFETIME
            )));
        }
        if let Some(binding) = &self.binding
            && !BINDINGS.contains(&binding.as_str())
        {
            return Err(Lwm2mError::InvalidConfig(format!(
                "unknown binding {}",
                binding
            )));
        }
        for uri in [&self.server_uri, &self.bootstrap_server_uri]
            .into_iter()
            .flatten()
        {
            split_uri(uri)?;
        }
        Ok(())
    }

    /// Registration parameters handed to the CoAP engine
    pub fn endpoint_params(&self) -> EndpointParams {
        EndpointParams {
            endpoint_name: self.endpoint_name.clone(),
            endpoint_type: self.endpoint_type.clone(),
            domain: self.domain.clone(),
            lifetime: self.lifetime,
            binding: self.binding.clone(),
        }
    }

    pub fn server_address(&self) -> Result<Option<SocketAddr>> {
        self.server_uri.as_deref().map(resolve_uri).transpose()
    }

    pub fn bootstrap_server_address(&self) -> Result<Option<SocketAddr>> {
        self.bootstrap_server_uri
            .as_deref()
            .map(resolve_uri)
            .transpose()
    }
}

impl FromStr for ClientConfig {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_json_str(s)
    }
}

/// Endpoint parameters sent with Register and Bootstrap-Request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointParams {
    pub endpoint_name: String,
    pub endpoint_type: Option<String>,
    pub domain: Option<String>,
    pub lifetime: Option<u32>,
    pub binding: Option<String>,
}

impl EndpointParams {
    pub fn new(endpoint_name: &str) -> Self {
        Self {
            endpoint_name: endpoint_name.to_string(),
            ..Self::default()
        }
    }

    /// URI query of a Register request, e.g. `ep=dev&lt=3600&b=U`
    pub fn registration_query(&self) -> String {
        let mut query = format!("ep={}", self.endpoint_name);
        if let Some(lifetime) = self.lifetime {
            query.push_str(&format!("&lt={}", lifetime));
        }
        if let Some(binding) = &self.binding {
            query.push_str(&format!("&b={}", binding));
        }
        if let Some(endpoint_type) = &self.endpoint_type {
            query.push_str(&format!("&et={}", endpoint_type));
        }
        if let Some(domain) = &self.domain {
            query.push_str(&format!("&d={}", domain));
        }
        query
    }
}

/// Split a `coap://` or `coaps://` URI into `host:port`
fn split_uri(uri: &str) -> Result<String> {
    let (rest, default_port) = if let Some(rest) = uri.strip_prefix("coaps://") {
        (rest, COAPS_DEFAULT_PORT)
    } else if let Some(rest) = uri.strip_prefix("coap://") {
        (rest, COAP_DEFAULT_PORT)
    } else {
        return Err(Lwm2mError::InvalidConfig(format!(
            "unsupported server URI {}",
            uri
        )));
    };
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(Lwm2mError::InvalidConfig(format!("no host in {}", uri)));
    }
    let has_port = match authority.strip_prefix('[') {
        Some(v6) => v6.contains("]:"),
        None => authority.contains(':'),
    };
    Ok(if has_port {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default_port)
    })
}

/// Resolve a `coap://` or `coaps://` URI to a socket address
pub fn resolve_uri(uri: &str) -> Result<SocketAddr> {
    split_uri(uri)?
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Lwm2mError::InvalidConfig(format!("{} does not resolve", uri)))
}
