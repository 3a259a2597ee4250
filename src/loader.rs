use crate::resource::{PropertyBag, Resource, ResourceId};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Per-type provider settings carried in the resource-set document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Property keys whose change forces destroy-and-recreate.
    #[serde(default)]
    pub replace_on: Vec<String>,
}

#[derive(Deserialize)]
struct ResourceSetFile {
    #[serde(default)]
    providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    resources: Vec<ResourceDecl>,
}

#[derive(Deserialize)]
struct ResourceDecl {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    properties: PropertyBag,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Parsed declarative resource set.
pub struct ResourceSet {
    pub resources: Vec<Resource>,
    pub provider_config: BTreeMap<String, ProviderConfig>,
}

/// Load a resource-set document:
///
/// ```json
/// {
///   "providers": {"database": {"replace_on": ["engine"]}},
///   "resources": [
///     {"type": "network", "name": "vpc", "properties": {"cidr": "10.0.0.0/16"}},
///     {"type": "database", "name": "main",
///      "properties": {"subnet": "${network.vpc.subnet_id}"},
///      "depends_on": ["network.vpc"]}
///   ]
/// }
/// ```
pub fn load_resource_set(path: &Path) -> Result<ResourceSet> {
    let text = fs::read_to_string(path).map_err(|e| {
        EngineError::Parse(format!("cannot read resource set {}: {e}", path.display()))
    })?;
    let file: ResourceSetFile = serde_json::from_str(&text).map_err(|e| {
        EngineError::Parse(format!("invalid resource set {}: {e}", path.display()))
    })?;

    let mut resources = Vec::with_capacity(file.resources.len());
    for decl in file.resources {
        let id = ResourceId::new(decl.kind, decl.name);
        let depends_on = decl
            .depends_on
            .iter()
            .map(|d| ResourceId::parse(d))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| EngineError::Parse(format!("resource {id}: {e}")))?;
        resources.push(Resource::new(id, decl.properties).with_depends_on(depends_on));
    }

    tracing::debug!(
        path = %path.display(),
        resources = resources.len(),
        "loaded resource set"
    );
    Ok(ResourceSet {
        resources,
        provider_config: file.providers,
    })
}
