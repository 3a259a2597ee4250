use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Property bag of a resource. BTreeMap keeps key order stable so
/// serialization and fingerprints are deterministic.
pub type PropertyBag = BTreeMap<String, Value>;

/// Identity of a resource within a graph: resource type plus logical name,
/// written `type.name` (e.g. `database.main`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(kind, name))
            }
            _ => Err(EngineError::Parse(format!(
                "invalid resource identity '{s}', expected 'type.name'"
            ))),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for ResourceId {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

/// A reference token found in a property value: `${type.name.attribute}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub target: ResourceId,
    pub attribute: String,
}

/// A single declared resource: identity, desired properties, and explicit
/// dependencies. Inferred dependencies come from reference tokens in the
/// property bag. Immutable once diffed for a given apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub properties: PropertyBag,
    pub depends_on: Vec<ResourceId>,
}

impl Resource {
    pub fn new(id: ResourceId, properties: PropertyBag) -> Self {
        Self {
            id,
            properties,
            depends_on: Vec::new(),
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<ResourceId>) -> Self {
        self.depends_on = deps;
        self
    }

    /// All dependency identities: explicit `depends_on` plus every resource
    /// referenced from the property bag, deduplicated.
    pub fn dependencies(&self) -> Vec<ResourceId> {
        let mut deps = self.depends_on.clone();
        for reference in scan_references(&self.properties) {
            deps.push(reference.target);
        }
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Collect every `${type.name.attr}` token in a property bag, recursing into
/// lists and nested objects. Malformed tokens are left alone and treated as
/// plain text.
pub fn scan_references(bag: &PropertyBag) -> Vec<Reference> {
    let mut refs = Vec::new();
    for value in bag.values() {
        scan_value(value, &mut refs);
    }
    refs
}

fn scan_value(value: &Value, refs: &mut Vec<Reference>) {
    match value {
        Value::String(s) => scan_str(s, refs),
        Value::Array(items) => {
            for item in items {
                scan_value(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                scan_value(item, refs);
            }
        }
        _ => {}
    }
}

fn scan_str(s: &str, refs: &mut Vec<Reference>) {
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            return;
        };
        let token = &rest[start + 2..start + 2 + len];
        if let Some(reference) = parse_token(token) {
            refs.push(reference);
        }
        rest = &rest[start + 2 + len + 1..];
    }
}

/// `type.name.attribute` — the attribute may itself contain dots.
fn parse_token(token: &str) -> Option<Reference> {
    let mut parts = token.splitn(3, '.');
    let kind = parts.next()?;
    let name = parts.next()?;
    let attribute = parts.next()?;
    if kind.is_empty() || name.is_empty() || attribute.is_empty() {
        return None;
    }
    Some(Reference {
        target: ResourceId::new(kind, name),
        attribute: attribute.to_string(),
    })
}

/// Replace reference tokens with concrete values. `lookup` resolves a
/// (target, attribute) pair to the dependency's output value. A string that
/// is exactly one token takes the output value's own type; tokens embedded
/// in longer strings are interpolated as text.
pub fn resolve_references<F>(bag: &PropertyBag, lookup: &F) -> Result<PropertyBag>
where
    F: Fn(&ResourceId, &str) -> Option<Value>,
{
    let mut resolved = PropertyBag::new();
    for (key, value) in bag {
        resolved.insert(key.clone(), resolve_value(value, lookup)?);
    }
    Ok(resolved)
}

fn resolve_value<F>(value: &Value, lookup: &F) -> Result<Value>
where
    F: Fn(&ResourceId, &str) -> Option<Value>,
{
    match value {
        Value::String(s) => resolve_str(s, lookup),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, lookup))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str<F>(s: &str, lookup: &F) -> Result<Value>
where
    F: Fn(&ResourceId, &str) -> Option<Value>,
{
    // Whole-string token keeps the output value's type.
    if let Some(token) = s.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        if !token.contains("${") {
            if let Some(reference) = parse_token(token) {
                return lookup(&reference.target, &reference.attribute).ok_or_else(|| {
                    EngineError::State(format!(
                        "unresolved reference '${{{token}}}': no output '{}' on {}",
                        reference.attribute, reference.target
                    ))
                });
            }
        }
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let token = &rest[start + 2..start + 2 + len];
        match parse_token(token) {
            Some(reference) => {
                let value =
                    lookup(&reference.target, &reference.attribute).ok_or_else(|| {
                        EngineError::State(format!(
                            "unresolved reference '${{{token}}}': no output '{}' on {}",
                            reference.attribute, reference.target
                        ))
                    })?;
                match value {
                    Value::String(text) => out.push_str(&text),
                    other => out.push_str(&other.to_string()),
                }
            }
            None => {
                out.push_str(&rest[start..start + 2 + len + 1]);
            }
        }
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Content fingerprint of a property bag, stored in the snapshot for cheap
/// no-op detection.
pub fn fingerprint(bag: &PropertyBag) -> String {
    let bytes = serde_json::to_vec(bag).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}
