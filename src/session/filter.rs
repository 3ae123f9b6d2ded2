//! Selection of discovered resources for supervision

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::{VisaError, VisaResult};
use crate::resource::matches_pattern;

/// Decides which discovered resources get a session.
#[derive(Clone, Default)]
pub enum ResourceFilter {
    /// Accept everything
    #[default]
    All,
    /// VISA glob such as `USB?*::INSTR`
    Pattern(String),
    /// Regular expression over the canonical resource string
    Regex(Regex),
    /// Arbitrary predicate
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
    /// Accept when any member accepts; members are tried in order
    Any(Vec<ResourceFilter>),
}

impl ResourceFilter {
    /// Filter from a list of VISA globs; an empty list accepts everything.
    pub fn patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: Vec<ResourceFilter> = patterns
            .into_iter()
            .map(|p| ResourceFilter::Pattern(p.into()))
            .collect();
        if members.is_empty() {
            ResourceFilter::All
        } else {
            ResourceFilter::Any(members)
        }
    }

    /// # Errors
    /// [`VisaError::Validation`] for an invalid expression.
    pub fn regex(expression: &str) -> VisaResult<Self> {
        Regex::new(expression)
            .map(ResourceFilter::Regex)
            .map_err(|e| VisaError::Validation(format!("invalid resource filter: {}", e)))
    }

    /// Filter accepting resources for which `predicate` returns true.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        ResourceFilter::Predicate(Arc::new(predicate))
    }

    /// Whether `resource` passes the filter.
    pub fn matches(&self, resource: &str) -> bool {
        match self {
            ResourceFilter::All => true,
            ResourceFilter::Pattern(pattern) => matches_pattern(resource, pattern),
            ResourceFilter::Regex(regex) => regex.is_match(resource),
            ResourceFilter::Predicate(predicate) => predicate(resource),
            ResourceFilter::Any(members) => members.iter().any(|m| m.matches(resource)),
        }
    }
}

impl fmt::Debug for ResourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceFilter::All => f.write_str("All"),
            ResourceFilter::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            ResourceFilter::Regex(r) => f.debug_tuple("Regex").field(&r.as_str()).finish(),
            ResourceFilter::Predicate(_) => f.write_str("Predicate(..)"),
            ResourceFilter::Any(members) => f.debug_tuple("Any").field(members).finish(),
        }
    }
}
