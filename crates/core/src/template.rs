// Parameter templates for SQL statements and table names

use crate::error::ResolutionError;
use crate::types::ParameterSet;
use serde::{Deserialize, Serialize};

/// Prefix accepted in front of a key, e.g. `{{ params.table }}`.
const PARAMS_PREFIX: &str = "params.";

/// A string with `{{ key }}` placeholders, resolved lazily at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template(String);

/// A piece of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bind every placeholder to a value from `params`.
    ///
    /// Either all placeholders resolve or nothing is produced.
    pub fn resolve(&self, params: &ParameterSet) -> Result<String, ResolutionError> {
        ParameterResolver::resolve(self.as_str(), params)
    }

    /// Keys referenced by this template, sorted and unique.
    pub fn placeholders(&self) -> Result<Vec<String>, ResolutionError> {
        ParameterResolver::placeholders(self.as_str())
    }
}

impl From<&str> for Template {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Template {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binds parameter sets to template strings
pub struct ParameterResolver;

impl ParameterResolver {
    /// Resolve `template` against `params`.
    pub fn resolve(template: &str, params: &ParameterSet) -> Result<String, ResolutionError> {
        let segments = Self::parse(template)?;

        let mut unbound: Vec<String> = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(key) if !params.contains(key) => Some(key.to_string()),
                _ => None,
            })
            .collect();

        if !unbound.is_empty() {
            unbound.sort();
            unbound.dedup();
            return Err(ResolutionError::UnboundParameter { names: unbound });
        }

        let mut out = String::with_capacity(template.len());
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => {
                    if let Some(value) = params.get(key) {
                        out.push_str(&value.to_string());
                    }
                }
            }
        }

        Ok(out)
    }

    /// Extract parameter names from a template string
    pub fn placeholders(template: &str) -> Result<Vec<String>, ResolutionError> {
        let mut keys: Vec<String> = Self::parse(template)?
            .into_iter()
            .filter_map(|s| match s {
                Segment::Placeholder(key) => Some(key.to_string()),
                Segment::Literal(_) => None,
            })
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn parse(template: &str) -> Result<Vec<Segment<'_>>, ResolutionError> {
        let mut segments = Vec::new();
        let mut rest = template;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(&rest[..open]));
            }

            let after_open = &rest[open + 2..];
            let close = after_open.find("}}").ok_or_else(|| ResolutionError::Malformed {
                offset: offset + open,
                reason: "unterminated placeholder".to_string(),
            })?;

            let raw = after_open[..close].trim();
            let key = raw.strip_prefix(PARAMS_PREFIX).unwrap_or(raw).trim();
            if key.is_empty() {
                return Err(ResolutionError::Malformed {
                    offset: offset + open,
                    reason: "empty placeholder".to_string(),
                });
            }
            segments.push(Segment::Placeholder(key));

            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest));
        }

        Ok(segments)
    }
}
