//! Config Parser (C7, spec.md §4.7, §6): the four-section transport config
//! document and the separate repository-context override document.

use std::collections::HashSet;

use ocmfilter::{Filter, FilterList, FilterSpec, RepositoryContextOverride};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("duplicate {section} name: {name}")]
    DuplicateName { section: &'static str, name: String },
    #[error("rule {rule} references unknown processor {processor}")]
    UnknownProcessor { rule: String, processor: String },
    #[error("filter error: {0}")]
    Filter(#[from] ocmfilter::Error),
}

#[derive(Debug, Deserialize)]
struct Meta {
    version: String,
}

#[derive(Debug, Deserialize)]
struct RawStageEntry {
    name: String,
    #[serde(rename = "type")]
    type_tag: String,
    spec: serde_json::Value,
    #[serde(default)]
    filters: Vec<FilterSpec>,
}

#[derive(Debug, Deserialize)]
struct RawProcessorEntry {
    name: String,
    #[serde(rename = "type")]
    type_tag: String,
    spec: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawRuleProcessorRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawRuleEntry {
    name: String,
    #[serde(default)]
    filters: Vec<FilterSpec>,
    processors: Vec<RawRuleProcessorRef>,
}

#[derive(Debug, Deserialize)]
struct RawTransportConfig {
    meta: Meta,
    #[serde(default)]
    downloaders: Vec<RawStageEntry>,
    #[serde(default)]
    processors: Vec<RawProcessorEntry>,
    #[serde(default)]
    uploaders: Vec<RawStageEntry>,
    #[serde(default, rename = "processingRules")]
    processing_rules: Vec<RawRuleEntry>,
}

/// A fully parsed and validated `{name, type, spec, filters}` stage entry.
pub struct StageEntry {
    pub name: String,
    pub type_tag: String,
    pub spec: serde_json::Value,
    pub filters: FilterList,
}

/// A fully parsed `{name, type, spec}` processor entry (filter-less; rules
/// select processors by name, not by matching).
pub struct ProcessorEntry {
    pub name: String,
    pub type_tag: String,
    pub spec: serde_json::Value,
}

/// A fully parsed and validated `{name, filters, processors[]}` rule.
pub struct Rule {
    pub name: String,
    pub filters: FilterList,
    /// Names into [`TransportConfig::processors`], in rule-declared order.
    pub processor_names: Vec<String>,
}

pub struct TransportConfig {
    pub downloaders: Vec<StageEntry>,
    pub processors: Vec<ProcessorEntry>,
    pub uploaders: Vec<StageEntry>,
    pub processing_rules: Vec<Rule>,
}

fn build_filter_list(entries: Vec<FilterSpec>) -> Result<FilterList, Error> {
    let filters: Vec<Filter> = entries
        .into_iter()
        .map(|e| e.build().map_err(Error::from))
        .collect::<Result<_, _>>()?;
    Ok(FilterList::new(filters))
}

fn check_unique<'a>(section: &'static str, names: impl Iterator<Item = &'a str>) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::DuplicateName { section, name: name.to_string() });
        }
    }
    Ok(())
}

impl TransportConfig {
    pub fn parse(yaml: &str) -> Result<Self, Error> {
        let raw: RawTransportConfig = serde_yaml::from_str(yaml)?;
        let _ = &raw.meta.version; // validated structurally by successful parse

        check_unique("downloaders", raw.downloaders.iter().map(|d| d.name.as_str()))?;
        check_unique("uploaders", raw.uploaders.iter().map(|u| u.name.as_str()))?;
        check_unique("processors", raw.processors.iter().map(|p| p.name.as_str()))?;
        check_unique("processingRules", raw.processing_rules.iter().map(|r| r.name.as_str()))?;

        let downloaders = raw
            .downloaders
            .into_iter()
            .map(|d| {
                Ok(StageEntry {
                    name: d.name,
                    type_tag: d.type_tag,
                    spec: d.spec,
                    filters: build_filter_list(d.filters)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let uploaders = raw
            .uploaders
            .into_iter()
            .map(|u| {
                Ok(StageEntry {
                    name: u.name,
                    type_tag: u.type_tag,
                    spec: u.spec,
                    filters: build_filter_list(u.filters)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let processors: Vec<ProcessorEntry> = raw
            .processors
            .into_iter()
            .map(|p| ProcessorEntry { name: p.name, type_tag: p.type_tag, spec: p.spec })
            .collect();
        let processor_names: HashSet<&str> = processors.iter().map(|p| p.name.as_str()).collect();

        let processing_rules = raw
            .processing_rules
            .into_iter()
            .map(|r| {
                for p in &r.processors {
                    if !processor_names.contains(p.name.as_str()) {
                        return Err(Error::UnknownProcessor { rule: r.name.clone(), processor: p.name.clone() });
                    }
                }
                Ok(Rule {
                    name: r.name,
                    filters: build_filter_list(r.filters)?,
                    processor_names: r.processors.into_iter().map(|p| p.name).collect(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { downloaders, processors, uploaders, processing_rules })
    }
}

/// `{ componentNameFilterSpec, repositoryContext }` document (spec.md §6).
#[derive(Debug, Deserialize)]
struct RawOverrideEntry {
    #[serde(rename = "componentNameFilterSpec")]
    component_name_filter_spec: ComponentNameFilterSpec,
    #[serde(rename = "repositoryContext")]
    repository_context: ocmoci::RepositoryContext,
}

#[derive(Debug, Deserialize)]
struct ComponentNameFilterSpec {
    #[serde(rename = "includeComponentNames")]
    include_component_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawOverrideDocument {
    meta: Meta,
    #[serde(default)]
    overrides: Vec<RawOverrideEntry>,
}

pub fn parse_overrides(yaml: &str) -> Result<Vec<RepositoryContextOverride>, Error> {
    let raw: RawOverrideDocument = serde_yaml::from_str(yaml)?;
    let _ = &raw.meta.version;
    raw.overrides
        .into_iter()
        .map(|o| {
            let filter = ocmfilter::ComponentNameFilter::new(&o.component_name_filter_spec.include_component_names)?;
            Ok(RepositoryContextOverride::new(filter, o.repository_context))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
meta: { version: v1 }
downloaders:
  - name: dl-blob
    type: LocalOciBlobDownloader
    spec: {}
processors:
  - name: label
    type: ResourceLabeler
    spec: { labels: [{ name: ocm.software/copied, value: "true" }] }
uploaders:
  - name: up-artifact
    type: OciArtifactUploader
    spec: { baseUrl: target.example.com, keepSourceRepo: true }
processingRules:
  - name: label-images
    filters:
      - type: ResourceTypeFilter
        spec: { includeResourceTypes: [ociImage] }
    processors:
      - name: label
"#;

    #[test]
    fn parses_valid_config() {
        let cfg = TransportConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.downloaders.len(), 1);
        assert_eq!(cfg.processors.len(), 1);
        assert_eq!(cfg.uploaders.len(), 1);
        assert_eq!(cfg.processing_rules.len(), 1);
        assert_eq!(cfg.processing_rules[0].processor_names, vec!["label".to_string()]);
    }

    #[test]
    fn rejects_duplicate_downloader_names() {
        let yaml = SAMPLE.replacen(
            "downloaders:\n  - name: dl-blob\n    type: LocalOciBlobDownloader\n    spec: {}\n",
            "downloaders:\n  - name: dl-blob\n    type: LocalOciBlobDownloader\n    spec: {}\n  - name: dl-blob\n    type: LocalOciBlobDownloader\n    spec: {}\n",
            1,
        );
        let err = TransportConfig::parse(&yaml).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { section: "downloaders", .. }));
    }

    #[test]
    fn rejects_unresolvable_rule_processor() {
        let yaml = SAMPLE.replace("      - name: label\n", "      - name: does-not-exist\n");
        let err = TransportConfig::parse(&yaml).unwrap_err();
        assert!(matches!(err, Error::UnknownProcessor { .. }));
    }

    #[test]
    fn parses_overrides_document() {
        let yaml = r#"
meta: { version: v1 }
overrides:
  - componentNameFilterSpec: { includeComponentNames: ["github.com/acme/.*"] }
    repositoryContext: { baseUrl: mirror.example.com, type: ociRegistry }
"#;
        let overrides = parse_overrides(yaml).unwrap();
        assert_eq!(overrides.len(), 1);
    }
}
