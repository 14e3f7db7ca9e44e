// Validation for scope definitions and status updates.
use crate::{ScopeDefinition, ScopeSelector};

// Selector names and values are otherwise opaque strings; the limit matches
// what fits comfortably in an object name alongside the separator.
// todo: verify the selector name is valid as a label key when prefixed with 'scopes.k8s.io/'
const MAX_SELECTOR_PART_LEN: usize = 253;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("metadata.name: must be of the form '<scope-name>:<scope-value>': {0}")]
    MalformedName(String),
    #[error("metadata.name: {0} segment exceeds {MAX_SELECTOR_PART_LEN} characters")]
    SelectorTooLong(&'static str),
    #[error("status.scope_id: must change when status.namespaces changes")]
    StaleScopeId,
    #[error("status.namespaces: must be sorted and free of duplicates")]
    UnsortedNamespaces,
}

/// Validates the shape of a definition irrespective of any previous state.
pub fn validate_definition(def: &ScopeDefinition) -> Result<(), ValidationError> {
    let selector: ScopeSelector = def
        .metadata
        .name
        .parse()
        .map_err(|_| ValidationError::MalformedName(def.metadata.name.clone()))?;
    if selector.name().len() > MAX_SELECTOR_PART_LEN {
        return Err(ValidationError::SelectorTooLong("name"));
    }
    if selector.value().len() > MAX_SELECTOR_PART_LEN {
        return Err(ValidationError::SelectorTooLong("value"));
    }
    if !def
        .status
        .namespaces
        .windows(2)
        .all(|pair| pair[0] < pair[1])
    {
        return Err(ValidationError::UnsortedNamespaces);
    }
    Ok(())
}

/// Validates a status transition. Runs after the admission mutation, as a
/// backstop for the invariant that a changed namespace set always carries a
/// fresh scope id.
pub fn validate_status_update(
    old: &ScopeDefinition,
    new: &ScopeDefinition,
) -> Result<(), ValidationError> {
    validate_definition(new)?;
    if old.status.namespaces != new.status.namespaces && old.status.scope_id == new.status.scope_id
    {
        return Err(ValidationError::StaleScopeId);
    }
    Ok(())
}
