//! Query definitions and the configuration document they are parsed from

use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_STRIDE: Duration = Duration::from_secs(60);

/// Reduction requested for the points of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    #[default]
    Average,
    Min,
    Max,
}

impl Aggregate {
    /// Unrecognized names fall back to [`Aggregate::Average`].
    pub fn from_name(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "min" => Aggregate::Min,
            "max" => Aggregate::Max,
            _ => Aggregate::Average,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregate::Average => "average",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
        }
    }
}

/// One configured external metric
#[derive(Clone, PartialEq)]
pub struct QueryDefinition {
    pub external_name: String,
    pub query_text: String,
    pub credential_id: String,
    pub window: Duration,
    pub stride: Duration,
    pub aggregate: Aggregate,
}

impl fmt::Debug for QueryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDefinition")
            .field("external_name", &self.external_name)
            .field("query_text", &self.query_text)
            .field("credential_id", &redact_credential(&self.credential_id))
            .field("window", &self.window)
            .field("stride", &self.stride)
            .field("aggregate", &self.aggregate)
            .finish()
    }
}

/// Masks all but the last four characters of a credential for logging.
pub fn redact_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

/// Top-level shape of a configuration document
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdapterConfig {
    queries: Vec<QueryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryEntry {
    caql: String,
    circonus_api_key: String,
    external_name: String,
    #[serde(default = "default_window", deserialize_with = "deserialize_duration")]
    window: Duration,
    #[serde(default = "default_stride", deserialize_with = "deserialize_duration")]
    stride: Duration,
    #[serde(default)]
    aggregate: Option<String>,
}

fn default_window() -> Duration {
    DEFAULT_WINDOW
}

fn default_stride() -> Duration {
    DEFAULT_STRIDE
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

impl QueryEntry {
    fn into_definition(self) -> Result<QueryDefinition, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidQuery {
            external_name: self.external_name.clone(),
            message: message.to_string(),
        };

        if self.external_name.trim().is_empty() {
            return Err(invalid("external_name must not be empty"));
        }
        if self.caql.trim().is_empty() {
            return Err(invalid("caql must not be empty"));
        }
        if self.window.as_secs() == 0 {
            return Err(invalid("window must be at least one second"));
        }
        if self.stride.as_secs() == 0 {
            return Err(invalid("stride must be at least one second"));
        }

        let aggregate = self
            .aggregate
            .as_deref()
            .map(Aggregate::from_name)
            .unwrap_or_default();

        Ok(QueryDefinition {
            external_name: self.external_name,
            query_text: self.caql,
            credential_id: self.circonus_api_key,
            window: self.window,
            stride: self.stride,
            aggregate,
        })
    }
}

/// Parses a raw configuration document into query definitions.
///
/// The document is YAML (JSON documents are accepted as well); unknown fields
/// reject the whole document. Definitions keep document order, so a later entry
/// with the same external name wins once merged into the store.
pub fn parse_document(raw: &[u8]) -> Result<Vec<QueryDefinition>, ConfigError> {
    let document: AdapterConfig =
        serde_yaml::from_slice(raw).map_err(|e| ConfigError::ParseFailed {
            message: e.to_string(),
        })?;

    document
        .queries
        .into_iter()
        .map(QueryEntry::into_definition)
        .collect()
}
