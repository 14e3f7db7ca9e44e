// Status mutation applied on every scope definition status write.
//
// Clients never set `status.scope_id` themselves: whenever the served
// namespace list changes, a fresh unique id is assigned here so that every
// revision of the mapping is distinguishable. The per-store minimum resource
// versions are recomputed from the recorded per-server progress on the same
// pass, so readers always observe a derivation consistent with
// `server_scope_versions`.
use crate::{
    MinimumResourceVersion, Result, ScopeDefinition, ServerScopeVersion, parse_resource_version,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Mutates an incoming status write the way the fleet's admission layer
/// does: reassign `scope_id` if the namespace set changed (or the object is
/// new), and rederive `minimum_resource_versions`.
pub fn admit_status_update(old: Option<&ScopeDefinition>, new: &mut ScopeDefinition) -> Result<()> {
    let namespaces_changed = match old {
        None => true,
        Some(old) => old.status.namespaces != new.status.namespaces,
    };
    if namespaces_changed {
        // Always override; user-supplied scope ids are never trusted.
        new.status.scope_id = Uuid::new_v4().to_string();
    }
    new.status.minimum_resource_versions =
        build_minimum_resource_versions(&new.status.server_scope_versions)?;
    Ok(())
}

/// Derives the per-store minimum resource versions: for each store, the
/// highest resource version any server recorded for it.
pub fn build_minimum_resource_versions(
    ssvs: &[ServerScopeVersion],
) -> Result<Vec<MinimumResourceVersion>> {
    let mut by_store: HashMap<&str, (u64, &str)> = HashMap::new();
    for ssv in ssvs {
        let rv = parse_resource_version(&ssv.resource_version)?;
        let entry = by_store
            .entry(ssv.store_id.as_str())
            .or_insert((rv, ssv.resource_version.as_str()));
        if rv > entry.0 {
            *entry = (rv, ssv.resource_version.as_str());
        }
    }
    let mut minimums: Vec<MinimumResourceVersion> = by_store
        .into_iter()
        .map(|(store_id, (_, rv))| MinimumResourceVersion {
            store_id: store_id.to_string(),
            resource_version: rv.to_string(),
        })
        .collect();
    // Sort by store id so repeated derivations produce identical objects.
    minimums.sort_by(|a, b| a.store_id.cmp(&b.store_id));
    Ok(minimums)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectMeta, ScopeDefinitionStatus};

    fn definition(namespaces: &[&str], scope_id: &str) -> ScopeDefinition {
        ScopeDefinition {
            metadata: ObjectMeta {
                name: "workspace:alpha".into(),
                resource_version: 1,
            },
            status: ScopeDefinitionStatus {
                scope_id: scope_id.into(),
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ssv(server: &str, store: &str, rv: &str) -> ServerScopeVersion {
        ServerScopeVersion {
            api_server_id: server.into(),
            store_id: store.into(),
            scope_id: "g1".into(),
            resource_version: rv.into(),
        }
    }

    #[test]
    fn new_object_gets_a_scope_id() {
        let mut def = definition(&["ns-a"], "");
        admit_status_update(None, &mut def).expect("admit");
        assert!(!def.status.scope_id.is_empty());
    }

    #[test]
    fn changed_namespaces_rotate_the_scope_id() {
        let old = definition(&["ns-a"], "g1");
        let mut new = definition(&["ns-a", "ns-b"], "g1");
        admit_status_update(Some(&old), &mut new).expect("admit");
        assert_ne!(new.status.scope_id, "g1");
    }

    #[test]
    fn unchanged_namespaces_keep_the_scope_id() {
        let old = definition(&["ns-a"], "g1");
        let mut new = definition(&["ns-a"], "g1");
        new.status.server_scope_versions = vec![ssv("server-1", "store-a", "10")];
        admit_status_update(Some(&old), &mut new).expect("admit");
        assert_eq!(new.status.scope_id, "g1");
        // minimums are still rederived
        assert_eq!(new.status.minimum_resource_versions.len(), 1);
    }

    #[test]
    fn minimums_take_the_max_per_store() {
        let minimums = build_minimum_resource_versions(&[
            ssv("server-1", "store-a", "100"),
            ssv("server-2", "store-a", "250"),
            ssv("server-1", "store-b", "7"),
        ])
        .expect("build");
        assert_eq!(
            minimums,
            vec![
                MinimumResourceVersion {
                    store_id: "store-a".into(),
                    resource_version: "250".into(),
                },
                MinimumResourceVersion {
                    store_id: "store-b".into(),
                    resource_version: "7".into(),
                },
            ]
        );
    }

    #[test]
    fn minimums_reject_malformed_resource_versions() {
        assert!(build_minimum_resource_versions(&[ssv("server-1", "store-a", "oops")]).is_err());
    }
}
