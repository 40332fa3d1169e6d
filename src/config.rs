//! Connection configuration.
//!
//! Named connections bind a name to an io type plus constructor parameters,
//! and default variants pick the implementation used when a request does not
//! name one. Configuration is JSON; the accepted shape is published as a JSON
//! schema through [`ConnectionsConfig::json_schema`].
//!
//! ```json
//! {
//!   "named_connections": {
//!     "backup-box": { "io_type": "ssh", "host": "10.0.0.5", "user": "fred", "password": "1234" }
//!   },
//!   "default_variants": { "ssh": "tokio", "memory": "tokio" }
//! }
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use crate::error::ConnectError;

/// Environment variable consulted by [`ConnectionsConfig::from_env`].
pub const CONFIG_ENV_VAR: &str = "LINEWIRE_CONFIG";

/// A connection declared in configuration under a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NamedConnection {
    /// Transport type, e.g. `memory`, `tcp` or `ssh`.
    pub io_type: String,
    /// Remaining keys are handed to the transport constructor.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl NamedConnection {
    pub fn new(io_type: impl Into<String>) -> Self {
        Self {
            io_type: io_type.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Named connections and per-type default variants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionsConfig {
    #[serde(default, alias = "NAMED_CONNECTIONS")]
    pub named_connections: BTreeMap<String, NamedConnection>,
    #[serde(default, alias = "DEFAULT_VARIANTS")]
    pub default_variants: BTreeMap<String, String>,
}

impl ConnectionsConfig {
    pub fn from_json_str(content: &str) -> Result<Self, ConnectError> {
        serde_json::from_str(content)
            .map_err(|e| ConnectError::InvalidConfig(format!("malformed connections config: {e}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConnectError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConnectError::InvalidConfig(format!(
                "failed to read configuration file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&content)
    }

    /// Loads the file named by the `var` environment variable.
    pub fn from_env_var(var: &str) -> Result<Self, ConnectError> {
        let path = env::var(var).map_err(|_| {
            ConnectError::InvalidConfig(format!("environment variable '{var}' is not set"))
        })?;
        Self::from_path(path)
    }

    /// Loads the file named by [`CONFIG_ENV_VAR`].
    pub fn from_env() -> Result<Self, ConnectError> {
        Self::from_env_var(CONFIG_ENV_VAR)
    }

    /// Overlays `other` onto `self`; entries of `other` win on conflicts.
    pub fn merge(&mut self, other: ConnectionsConfig) {
        self.named_connections.extend(other.named_connections);
        self.default_variants.extend(other.default_variants);
    }

    pub fn json_schema() -> Result<Value, ConnectError> {
        let schema = schemars::schema_for!(ConnectionsConfig);
        Ok(serde_json::to_value(&schema)?)
    }
}
