//! Canonical call-spec shapes for the two collaborators consumed through the
//! cache core: a generic HTTP fetch and an LLM generation service.
//!
//! A spec is only the fingerprint key; the actual transport lives in the
//! `exec` closure handed to [`CallRequest`](crate::CallRequest). Specs are
//! plain `serde` values, so callers can extend them, persist them, or build
//! their own shapes, as long as every semantically relevant input is
//! included.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Query parameters that only carry attribution noise. Two URLs differing
/// only in these point at the same resource and must share a cache entry.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "msclkid", "ref_src"];

/// Fingerprint key for an HTTP call: `(url, method, headers, body)`.
///
/// Headers are kept in a sorted map with lowercased names, so header order
/// and casing never affect the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl HttpSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_lowercase(), value.into());
        self
    }

    /// Normalizes the spec so that logically identical calls fingerprint
    /// identically: the method is uppercased and the URL's query string is
    /// sorted with tracking parameters (`utm_*` and friends) stripped.
    pub fn normalize(mut self) -> Self {
        self.method = self.method.to_uppercase();
        self.url = normalize_url(&self.url);
        self
    }
}

/// Fingerprint key for an LLM generation call:
/// `(system, prompt, schema, model, tools)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmSpec {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl LlmSpec {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            schema: None,
            tools: Vec::new(),
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }
}

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name)
}

/// Drops the fragment, strips tracking parameters, and sorts the remaining
/// query parameters, so that cosmetic URL variants collapse onto one
/// fingerprint. An emptied query loses its `?` entirely.
fn normalize_url(url: &str) -> String {
    let (rest, _fragment) = match url.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (url, None),
    };

    let Some((base, query)) = rest.split_once('?') else {
        return rest.to_string();
    };

    let mut params: Vec<&str> = query
        .split('&')
        .filter(|param| !param.is_empty())
        .filter(|param| {
            let name = param.split('=').next().unwrap_or(param);
            !is_tracking_param(name)
        })
        .collect();
    params.sort_unstable();

    if params.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", params.join("&"))
    }
}
