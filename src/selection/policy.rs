//! Per-server tool inclusion policies.
//!
//! Policies arrive from configuration storage either as a native list of
//! names or as encoded text. Text is accepted only as `all`, `*`, or a JSON
//! array of strings. Anything else fails closed: the server contributes no
//! tools and the failure is reported. Text is never searched for names.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mcp::{ServerId, ToolDescriptor};

/// Inclusion set as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InclusionSpec {
    Names(Vec<String>),
    Encoded(String),
}

impl InclusionSpec {
    pub fn all() -> Self {
        InclusionSpec::Encoded("all".to_string())
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InclusionSpec::Names(names.into_iter().map(Into::into).collect())
    }

    /// Decode into a filter, failing closed on anything unrecognised.
    pub fn parse(&self) -> Result<ToolFilter, String> {
        match self {
            InclusionSpec::Names(names) => Ok(ToolFilter::Only(names.iter().cloned().collect())),
            InclusionSpec::Encoded(text) => parse_encoded(text),
        }
    }
}

impl Default for InclusionSpec {
    fn default() -> Self {
        Self::all()
    }
}

fn parse_encoded(text: &str) -> Result<ToolFilter, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty inclusion set".to_string());
    }
    if trimmed.eq_ignore_ascii_case("all") || trimmed == "*" {
        return Ok(ToolFilter::All);
    }
    if trimmed.starts_with('[') {
        let names: Vec<String> = serde_json::from_str(trimmed)
            .map_err(|e| format!("malformed JSON name list: {}", e))?;
        return Ok(ToolFilter::Only(names.into_iter().collect()));
    }
    Err(format!(
        "unrecognised encoding '{}': expected \"all\", \"*\" or a JSON array of names",
        crate::error::truncate_payload(trimmed)
    ))
}

/// Decoded inclusion set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFilter {
    /// Every currently discovered tool, including ones added later.
    All,
    /// Exact name membership.
    Only(BTreeSet<String>),
}

impl ToolFilter {
    pub fn admits(&self, name: &str) -> bool {
        match self {
            ToolFilter::All => true,
            ToolFilter::Only(names) => names.contains(name),
        }
    }

    /// Named tools the server does not expose.
    pub fn missing_from(&self, tools: &[ToolDescriptor]) -> Vec<String> {
        match self {
            ToolFilter::All => Vec::new(),
            ToolFilter::Only(names) => names
                .iter()
                .filter(|name| !tools.iter().any(|t| &t.name == *name))
                .cloned()
                .collect(),
        }
    }
}

/// Inclusion policy for one server in an agent's tool set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPolicy {
    #[serde(rename = "server")]
    pub server_id: ServerId,
    #[serde(default)]
    pub tools: InclusionSpec,
}

impl ServerPolicy {
    pub fn all(server_id: impl Into<ServerId>) -> Self {
        Self {
            server_id: server_id.into(),
            tools: InclusionSpec::all(),
        }
    }

    pub fn only<I, S>(server_id: impl Into<ServerId>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            server_id: server_id.into(),
            tools: InclusionSpec::names(names),
        }
    }

    pub fn encoded(server_id: impl Into<ServerId>, text: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            tools: InclusionSpec::Encoded(text.into()),
        }
    }
}

/// A policy that could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid tool policy for '{server_id}': {reason}")]
pub struct PolicyError {
    pub server_id: ServerId,
    pub reason: String,
}
