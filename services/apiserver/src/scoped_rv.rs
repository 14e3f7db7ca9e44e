// Scope-prefixed resource version rewrite for the write path.
//
// Writes from scoped clients carry a resource version of the form
// `0…9<rv>`: a leading zero marks the request as scoped, the first `9` ends
// the marker, and the remainder is the real resource version. The marker is
// stripped before the version reaches storage.
//
// This encoding is a transitional trick: create requests cannot carry label
// selectors today, so the marker is the only way to recognise a scoped
// write. It should be replaced by an explicit label selector on writes.

/// Rewrites a possibly scope-prefixed resource version into its storage
/// form. Returns the rewritten version and whether the value looked scoped
/// but was missing the marker (in which case it is passed through and a
/// warning logged).
pub fn rewrite_scoped_resource_version(resource_version: &str) -> (String, bool) {
    // Only values with a leading zero are scoped; plain versions never
    // start with one.
    if resource_version.is_empty() || !resource_version.starts_with('0') {
        return (resource_version.to_string(), false);
    }
    match resource_version.split_once('9') {
        Some((_, rest)) => (rest.to_string(), false),
        None => {
            tracing::warn!(
                resource_version,
                "object looks like a scoped write but carries no generation marker ('0…9<rv>'); passing the resource version through unchanged"
            );
            (resource_version.to_string(), true)
        }
    }
}
