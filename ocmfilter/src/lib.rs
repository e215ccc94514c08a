//! Filter Set (C4, spec.md §4.4): predicates over `(descriptor, resource)`.
//!
//! Every filter exposes `matches(descriptor, resource) -> bool`. A rule's
//! filter list is conjunctive — it matches iff every filter in the list
//! matches, and an empty list matches everything. Individual filters reject
//! an empty include-list at construction time (config-error), since a filter
//! that can never match is almost certainly a typo'd config.

use ocmoci::{Access, Descriptor, Resource};
use regex::RegexSet;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} requires a non-empty include list")]
    EmptyIncludeList(&'static str),
    #[error("invalid regex in componentNameFilter: {0}")]
    Regex(#[from] regex::Error),
}

/// A single `{ type, spec }` filter entry from config (spec.md §7).
#[derive(Debug, Clone)]
pub enum Filter {
    ComponentName(ComponentNameFilter),
    ResourceType(ResourceTypeFilter),
    AccessType(AccessTypeFilter),
}

impl Filter {
    pub fn matches(&self, descriptor: &Descriptor, resource: &Resource) -> bool {
        match self {
            Filter::ComponentName(f) => f.matches(descriptor),
            Filter::ResourceType(f) => f.matches(resource),
            Filter::AccessType(f) => f.matches(resource),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComponentNameFilter {
    include: RegexSet,
}

impl ComponentNameFilter {
    pub fn new(include_component_names: &[String]) -> Result<Self, Error> {
        if include_component_names.is_empty() {
            return Err(Error::EmptyIncludeList("ComponentNameFilter"));
        }
        Ok(Self {
            include: RegexSet::new(include_component_names)?,
        })
    }

    pub fn matches(&self, descriptor: &Descriptor) -> bool {
        self.include.is_match(&descriptor.name)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceTypeFilter {
    include: Vec<String>,
}

impl ResourceTypeFilter {
    pub fn new(include_resource_types: Vec<String>) -> Result<Self, Error> {
        if include_resource_types.is_empty() {
            return Err(Error::EmptyIncludeList("ResourceTypeFilter"));
        }
        Ok(Self { include: include_resource_types })
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.include.iter().any(|t| t == &resource.kind)
    }
}

#[derive(Debug, Clone)]
pub struct AccessTypeFilter {
    include: Vec<String>,
}

impl AccessTypeFilter {
    pub fn new(include_access_types: Vec<String>) -> Result<Self, Error> {
        if include_access_types.is_empty() {
            return Err(Error::EmptyIncludeList("AccessTypeFilter"));
        }
        Ok(Self { include: include_access_types })
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.include.iter().any(|t| t == resource.access.type_name())
    }
}

/// The `{ type, spec }` document shape a filter is parsed from.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum FilterSpec {
    ComponentNameFilter { #[serde(rename = "includeComponentNames")] include_component_names: Vec<String> },
    ResourceTypeFilter { #[serde(rename = "includeResourceTypes")] include_resource_types: Vec<String> },
    AccessTypeFilter { #[serde(rename = "includeAccessTypes")] include_access_types: Vec<String> },
}

impl FilterSpec {
    pub fn build(self) -> Result<Filter, Error> {
        Ok(match self {
            FilterSpec::ComponentNameFilter { include_component_names } => {
                Filter::ComponentName(ComponentNameFilter::new(&include_component_names)?)
            }
            FilterSpec::ResourceTypeFilter { include_resource_types } => {
                Filter::ResourceType(ResourceTypeFilter::new(include_resource_types)?)
            }
            FilterSpec::AccessTypeFilter { include_access_types } => {
                Filter::AccessType(AccessTypeFilter::new(include_access_types)?)
            }
        })
    }
}

/// An ordered, conjunctive list of filters; matches everything when empty.
#[derive(Debug, Clone, Default)]
pub struct FilterList(Vec<Filter>);

impl FilterList {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self(filters)
    }

    pub fn matches(&self, descriptor: &Descriptor, resource: &Resource) -> bool {
        self.0.iter().all(|f| f.matches(descriptor, resource))
    }
}

/// One `(component-name-filter, repository-context)` entry; per spec.md §3,
/// when several overrides match a component name the *last* one wins.
pub struct RepositoryContextOverride {
    filter: ComponentNameFilter,
    pub repository_context: ocmoci::RepositoryContext,
}

impl RepositoryContextOverride {
    pub fn new(filter: ComponentNameFilter, repository_context: ocmoci::RepositoryContext) -> Self {
        Self { filter, repository_context }
    }
}

/// Resolves the effective repository context for a component name: the
/// repository context of the *last* override whose filter matches, or
/// `default` if none match.
pub fn effective_repository_context<'a>(
    overrides: &'a [RepositoryContextOverride],
    component_name: &str,
    default: &'a ocmoci::RepositoryContext,
) -> &'a ocmoci::RepositoryContext {
    overrides
        .iter()
        .rev()
        .find(|o| o.filter.include.is_match(component_name))
        .map(|o| &o.repository_context)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmoci::model::Relation;
    use std::collections::BTreeMap;

    fn descriptor(name: &str) -> Descriptor {
        Descriptor {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            resources: vec![],
            sources: vec![],
            component_references: vec![],
            repository_contexts: vec![],
            signatures: vec![],
        }
    }

    fn resource(kind: &str, access: Access) -> Resource {
        Resource {
            name: "r".to_string(),
            version: "1.0.0".to_string(),
            kind: kind.to_string(),
            relation: Relation::External,
            digest: None,
            labels: None,
            extra_identity: BTreeMap::new(),
            access,
        }
    }

    #[test]
    fn empty_include_list_rejected() {
        assert!(matches!(
            ComponentNameFilter::new(&[]),
            Err(Error::EmptyIncludeList("ComponentNameFilter"))
        ));
    }

    #[test]
    fn conjunctive_rule_requires_all_filters() {
        let list = FilterList::new(vec![
            Filter::ResourceType(ResourceTypeFilter::new(vec!["ociImage".to_string()]).unwrap()),
            Filter::AccessType(AccessTypeFilter::new(vec!["ociRegistry".to_string()]).unwrap()),
        ]);
        let d = descriptor("github.com/acme/x");
        let matching = resource("ociImage", Access::OciRegistry { image_reference: "x/y:1".to_string() });
        let wrong_type = resource("helmChart", Access::OciRegistry { image_reference: "x/y:1".to_string() });

        assert!(list.matches(&d, &matching));
        assert!(!list.matches(&d, &wrong_type));
    }

    #[test]
    fn empty_filter_list_matches_everything() {
        let list = FilterList::default();
        let d = descriptor("github.com/acme/x");
        let r = resource("ociImage", Access::OciRegistry { image_reference: "x/y:1".to_string() });
        assert!(list.matches(&d, &r));
    }

    #[test]
    fn last_matching_override_wins() {
        let default = ocmoci::RepositoryContext {
            base_url: "default.example.com".to_string(),
            component_name_mapping: None,
            kind: "OCIRegistry".to_string(),
        };
        let overrides = vec![
            RepositoryContextOverride::new(
                ComponentNameFilter::new(&["github.com/acme/.*".to_string()]).unwrap(),
                ocmoci::RepositoryContext { base_url: "first.example.com".to_string(), component_name_mapping: None, kind: "OCIRegistry".to_string() },
            ),
            RepositoryContextOverride::new(
                ComponentNameFilter::new(&["github.com/acme/special".to_string()]).unwrap(),
                ocmoci::RepositoryContext { base_url: "second.example.com".to_string(), component_name_mapping: None, kind: "OCIRegistry".to_string() },
            ),
        ];

        let ctx = effective_repository_context(&overrides, "github.com/acme/special", &default);
        assert_eq!(ctx.base_url, "second.example.com");

        let ctx = effective_repository_context(&overrides, "github.com/acme/other", &default);
        assert_eq!(ctx.base_url, "first.example.com");

        let ctx = effective_repository_context(&overrides, "github.com/unrelated", &default);
        assert_eq!(ctx.base_url, "default.example.com");
    }
}
