// Shared data model for scope definitions.
//
// A scope is a named, versioned mapping from a (name, value) selector to a
// set of namespace names. The `ScopeDefinition` object is the persisted
// source of truth; every API server in the fleet mirrors it into an
// in-memory mapping and reports its own progress back through the status.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub mod admission;
pub mod validation;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid scope selector: {0}")]
    InvalidSelector(String),
    #[error("invalid resource version: {0:?}")]
    InvalidResourceVersion(String),
    #[error("invalid group resource: {0}")]
    InvalidGroupResource(String),
}

/// A `(name, value)` pair identifying a scope, e.g. `workspace=alpha`.
///
/// Serializes as `name:value`, which is also the object name of the backing
/// [`ScopeDefinition`].
///
/// ```
/// use ambit_api::ScopeSelector;
///
/// let selector: ScopeSelector = "workspace:alpha".parse().expect("selector");
/// assert_eq!(selector.name(), "workspace");
/// assert_eq!(selector.value(), "alpha");
/// assert_eq!(selector.definition_name(), "workspace:alpha");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeSelector {
    name: String,
    value: String,
}

impl ScopeSelector {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() || value.is_empty() {
            return Err(Error::InvalidSelector(format!("{name}:{value}")));
        }
        Ok(Self { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    // The object name of the ScopeDefinition holding this selector's mapping.
    pub fn definition_name(&self) -> String {
        format!("{}:{}", self.name, self.value)
    }
}

impl fmt::Display for ScopeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

impl FromStr for ScopeSelector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        // Split on the first ':' only; values may themselves contain colons.
        let (name, value) = input
            .split_once(':')
            .ok_or_else(|| Error::InvalidSelector(input.to_string()))?;
        Self::new(name, value)
    }
}

/// A `(group, resource)` pair used to map resources onto backing stores.
/// The core group is represented by an empty group string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.resource)
    }
}

impl FromStr for GroupResource {
    type Err = Error;

    // Parses the `<group>/<resource>` form used in store override options.
    fn from_str(input: &str) -> Result<Self> {
        let (group, resource) = input
            .split_once('/')
            .ok_or_else(|| Error::InvalidGroupResource(input.to_string()))?;
        if resource.is_empty() {
            return Err(Error::InvalidGroupResource(input.to_string()));
        }
        Ok(Self::new(group, resource))
    }
}

/// Object metadata carried by every persisted definition.
/// `resource_version` is the registry's optimistic concurrency token and is
/// bumped on every successful write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub resource_version: u64,
}

/// The persisted mapping between a scope selector and a set of namespaces.
///
/// The object name must be of the form `<scope-name>:<scope-value>`, for
/// example `workspace:alpha`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDefinition {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ScopeDefinitionSpec,
    #[serde(default)]
    pub status: ScopeDefinitionStatus,
}

impl ScopeDefinition {
    pub fn selector(&self) -> Result<ScopeSelector> {
        self.metadata.name.parse()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDefinitionSpec {
    // Authoring-time desired set; order and duplicates are irrelevant.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDefinitionStatus {
    /// Unique identifier for this generation of the mapping. Reassigned by
    /// the admission mutator whenever `namespaces` changes; never set by
    /// clients.
    #[serde(default)]
    pub scope_id: String,

    /// The reconciled, sorted namespace list actually served.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Per-store lower bounds on acceptable starting resource versions,
    /// derived from `server_scope_versions`.
    #[serde(default)]
    pub minimum_resource_versions: Vec<MinimumResourceVersion>,

    /// One entry per (api_server_id, store_id) recording the store's
    /// resource version at or after the instant that server first served
    /// the given scope id.
    #[serde(default)]
    pub server_scope_versions: Vec<ServerScopeVersion>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimumResourceVersion {
    pub store_id: String,
    pub resource_version: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerScopeVersion {
    pub api_server_id: String,
    pub store_id: String,
    pub scope_id: String,
    pub resource_version: String,
}

/// Returns the entry for `(api_server_id, store_id)` if one exists.
pub fn get_server_scope_version<'a>(
    status: &'a ScopeDefinitionStatus,
    api_server_id: &str,
    store_id: &str,
) -> Option<&'a ServerScopeVersion> {
    status
        .server_scope_versions
        .iter()
        .find(|ssv| ssv.api_server_id == api_server_id && ssv.store_id == store_id)
}

/// Adds or replaces the entry with the same `(api_server_id, store_id)` key,
/// preserving the at-most-one-entry-per-key invariant.
pub fn set_server_scope_version(status: &mut ScopeDefinitionStatus, ssv: ServerScopeVersion) {
    status
        .server_scope_versions
        .retain(|c| !(c.api_server_id == ssv.api_server_id && c.store_id == ssv.store_id));
    status.server_scope_versions.push(ssv);
}

/// Removes the entry with the given `(api_server_id, store_id)` key.
pub fn remove_server_scope_version(
    status: &mut ScopeDefinitionStatus,
    api_server_id: &str,
    store_id: &str,
) {
    status
        .server_scope_versions
        .retain(|c| !(c.api_server_id == api_server_id && c.store_id == store_id));
}

/// Parses a resource version string into its numeric form.
/// Resource versions are decimal throughout the fleet; anything else is a
/// malformed object.
pub fn parse_resource_version(input: &str) -> Result<u64> {
    if input.is_empty() {
        return Err(Error::InvalidResourceVersion(input.to_string()));
    }
    input
        .parse::<u64>()
        .map_err(|_| Error::InvalidResourceVersion(input.to_string()))
}

/// The sorted deduplication of a namespace list, the canonical form stored
/// in `status.namespaces`.
pub fn normalized_namespaces(namespaces: &[String]) -> Vec<String> {
    namespaces
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parse_round_trip() {
        let selector: ScopeSelector = "workspace:alpha".parse().expect("parse");
        assert_eq!(selector.name(), "workspace");
        assert_eq!(selector.value(), "alpha");
        assert_eq!(selector.to_string(), "workspace:alpha");
    }

    #[test]
    fn selector_splits_on_first_colon_only() {
        let selector: ScopeSelector = "env:region:us-east".parse().expect("parse");
        assert_eq!(selector.name(), "env");
        assert_eq!(selector.value(), "region:us-east");
    }

    #[test]
    fn selector_rejects_empty_halves() {
        assert!(":alpha".parse::<ScopeSelector>().is_err());
        assert!("workspace:".parse::<ScopeSelector>().is_err());
        assert!("workspace".parse::<ScopeSelector>().is_err());
    }

    #[test]
    fn group_resource_parse() {
        let gr: GroupResource = "events.k8s.io/events".parse().expect("parse");
        assert_eq!(gr.group, "events.k8s.io");
        assert_eq!(gr.resource, "events");
        // core group resources use an empty group
        let core: GroupResource = "/pods".parse().expect("parse");
        assert_eq!(core.group, "");
        assert_eq!(core.resource, "pods");
        assert!("pods".parse::<GroupResource>().is_err());
        assert!("group/".parse::<GroupResource>().is_err());
    }

    #[test]
    fn set_server_scope_version_replaces_by_key() {
        let mut status = ScopeDefinitionStatus::default();
        set_server_scope_version(
            &mut status,
            ServerScopeVersion {
                api_server_id: "server-1".into(),
                store_id: "store-a".into(),
                scope_id: "g1".into(),
                resource_version: "10".into(),
            },
        );
        set_server_scope_version(
            &mut status,
            ServerScopeVersion {
                api_server_id: "server-1".into(),
                store_id: "store-a".into(),
                scope_id: "g2".into(),
                resource_version: "20".into(),
            },
        );
        set_server_scope_version(
            &mut status,
            ServerScopeVersion {
                api_server_id: "server-2".into(),
                store_id: "store-a".into(),
                scope_id: "g2".into(),
                resource_version: "15".into(),
            },
        );
        assert_eq!(status.server_scope_versions.len(), 2);
        let entry =
            get_server_scope_version(&status, "server-1", "store-a").expect("server-1 entry");
        assert_eq!(entry.scope_id, "g2");
        assert_eq!(entry.resource_version, "20");
    }

    #[test]
    fn remove_server_scope_version_only_touches_key() {
        let mut status = ScopeDefinitionStatus::default();
        for server in ["server-1", "server-2"] {
            set_server_scope_version(
                &mut status,
                ServerScopeVersion {
                    api_server_id: server.into(),
                    store_id: "store-a".into(),
                    scope_id: "g1".into(),
                    resource_version: "10".into(),
                },
            );
        }
        remove_server_scope_version(&mut status, "server-1", "store-a");
        assert_eq!(status.server_scope_versions.len(), 1);
        assert_eq!(status.server_scope_versions[0].api_server_id, "server-2");
    }

    #[test]
    fn parse_resource_version_accepts_decimal_only() {
        assert_eq!(parse_resource_version("100").expect("rv"), 100);
        assert!(parse_resource_version("").is_err());
        assert!(parse_resource_version("10a").is_err());
        assert!(parse_resource_version("-1").is_err());
    }

    #[test]
    fn normalized_namespaces_sorts_and_dedups() {
        let input = vec![
            "ns-b".to_string(),
            "ns-a".to_string(),
            "ns-b".to_string(),
            "ns-c".to_string(),
        ];
        assert_eq!(normalized_namespaces(&input), vec!["ns-a", "ns-b", "ns-c"]);
    }

    #[test]
    fn definition_serde_round_trip() {
        let def = ScopeDefinition {
            metadata: ObjectMeta {
                name: "workspace:alpha".into(),
                resource_version: 3,
            },
            spec: ScopeDefinitionSpec {
                namespaces: vec!["ns-b".into(), "ns-a".into()],
            },
            status: ScopeDefinitionStatus {
                scope_id: "g1".into(),
                namespaces: vec!["ns-a".into(), "ns-b".into()],
                ..Default::default()
            },
        };
        let encoded = serde_json::to_string(&def).expect("encode");
        let decoded: ScopeDefinition = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, def);
        assert_eq!(
            decoded.selector().expect("selector").definition_name(),
            "workspace:alpha"
        );
    }
}
