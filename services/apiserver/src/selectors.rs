// Field and label selector handling for scoped requests.
//
// The storage read path filters on label selectors only; scoped requests
// arrive with a field selector entry (or query/path selector) that is
// rewritten here into a label requirement over the mapping's namespaces.
use ambit_api::ScopeSelector;
use std::collections::BTreeMap;
use std::fmt;

/// Label automatically present on every namespaced object.
pub const NAMESPACE_LABEL: &str = "kubernetes.io/metadata.namespace";
/// Label automatically present on namespace objects themselves.
pub const NAME_LABEL: &str = "kubernetes.io/metadata.name";
/// Field selector prefix marking a scope selector entry.
pub const SCOPE_FIELD_PREFIX: &str = "scopes.k8s.io/";

pub type Result<T> = std::result::Result<T, SelectorError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("invalid field selector entry {0:?}")]
    InvalidFieldEntry(String),
    #[error("cannot specify more than one scopes.k8s.io field selector")]
    MultipleScopeEntries,
    #[error("invalid scope field selector {0:?}")]
    InvalidScopeEntry(String),
    #[error("invalid label selector {0:?}")]
    InvalidLabelSelector(String),
}

/// An ordered list of `key=value` field constraints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldSelector {
    entries: Vec<(String, String)>,
}

impl FieldSelector {
    pub fn parse(input: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for raw in input.split(',') {
            if raw.is_empty() {
                continue;
            }
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| SelectorError::InvalidFieldEntry(raw.to_string()))?;
            if key.is_empty() {
                return Err(SelectorError::InvalidFieldEntry(raw.to_string()));
            }
            entries.push((key.to_string(), value.to_string()));
        }
        Ok(Self { entries })
    }

    /// Removes the `scopes.k8s.io/<name>=<value>` entry, if present, and
    /// returns it as a scope selector. More than one such entry is an error.
    pub fn take_scope_selector(&mut self) -> Result<Option<ScopeSelector>> {
        let mut found: Option<(String, String)> = None;
        for (key, value) in &self.entries {
            if let Some(name) = key.strip_prefix(SCOPE_FIELD_PREFIX) {
                if found.is_some() {
                    return Err(SelectorError::MultipleScopeEntries);
                }
                found = Some((name.to_string(), value.clone()));
            }
        }
        let Some((name, value)) = found else {
            return Ok(None);
        };
        self.entries
            .retain(|(key, _)| !key.starts_with(SCOPE_FIELD_PREFIX));
        let selector = ScopeSelector::new(&name, &value)
            .map_err(|_| SelectorError::InvalidScopeEntry(format!("{name}={value}")))?;
        Ok(Some(selector))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self
            .entries
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        write!(f, "{}", joined.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Equals,
    In,
}

/// One label constraint; requirements in a selector are AND-ed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match labels.get(&self.key) {
            Some(value) => self.values.iter().any(|candidate| candidate == value),
            None => false,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, self.values.join("")),
            Operator::In => write!(f, "{} IN ({})", self.key, self.values.join(",")),
        }
    }
}

/// A conjunction of label requirements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Parses `app=foo,env in (a,b)` style selectors. Only equality and
    /// `in` are supported; that is all the read path emits or accepts.
    pub fn parse(input: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for raw in split_top_level(input) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if let Some((key, rest)) = raw.split_once(" in ") {
                let key = key.trim();
                let rest = rest.trim();
                let inner = rest
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| SelectorError::InvalidLabelSelector(raw.to_string()))?;
                let values: Vec<String> = inner
                    .split(',')
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .collect();
                if key.is_empty() || values.is_empty() {
                    return Err(SelectorError::InvalidLabelSelector(raw.to_string()));
                }
                requirements.push(Requirement {
                    key: key.to_string(),
                    operator: Operator::In,
                    values,
                });
            } else if let Some((key, value)) = raw.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    return Err(SelectorError::InvalidLabelSelector(raw.to_string()));
                }
                requirements.push(Requirement {
                    key: key.to_string(),
                    operator: Operator::Equals,
                    values: vec![value.trim().to_string()],
                });
            } else {
                return Err(SelectorError::InvalidLabelSelector(raw.to_string()));
            }
        }
        Ok(Self { requirements })
    }

    /// AND-s another requirement onto the selector.
    pub fn push(&mut self, requirement: Requirement) {
        self.requirements.push(requirement);
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.requirements.iter().map(|req| req.to_string()).collect();
        write!(f, "{}", joined.join(", "))
    }
}

// Splits on commas that are not inside parentheses.
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// The namespace requirement appended to every scoped read: namespaced
/// resources filter on the namespace label, the `namespaces` resource
/// itself filters on the name label.
pub fn scope_namespace_requirement(resource: &str, namespaces: &[String]) -> Requirement {
    let key = if resource == "namespaces" {
        NAME_LABEL
    } else {
        NAMESPACE_LABEL
    };
    Requirement {
        key: key.to_string(),
        operator: Operator::In,
        values: namespaces.to_vec(),
    }
}
