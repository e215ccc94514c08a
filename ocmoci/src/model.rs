//! Shared data model (spec.md §3): component descriptors, resources,
//! accesses, component references, repository contexts, and the signing
//! digest/signature spec types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate resource identity in descriptor {name}:{version}")]
    DuplicateResourceIdentity { name: String, version: String },
    #[error("unsupported access type: {0}")]
    UnsupportedAccess(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryContext {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "componentNameMapping", default)]
    pub component_name_mapping: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSpec {
    #[serde(rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(rename = "normalisationAlgorithm")]
    pub normalisation_algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSpec {
    pub name: String,
    pub digest: DigestSpec,
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentReference {
    pub name: String,
    #[serde(rename = "componentName")]
    pub component_name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSpec>,
}

/// A tagged record telling how to fetch a resource's bytes (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Access {
    #[serde(rename = "ociRegistry")]
    OciRegistry {
        #[serde(rename = "imageReference")]
        image_reference: String,
    },
    #[serde(rename = "localOciBlob")]
    LocalOciBlob { digest: String },
    /// Any access type without a built-in handler. Kept as raw fields so
    /// round-tripping through an envelope never loses data; resolvers that
    /// need to act on it fail with `unsupported-access`.
    #[serde(untagged)]
    Other {
        #[serde(flatten)]
        fields: BTreeMap<String, serde_json::Value>,
    },
}

impl Access {
    pub fn type_name(&self) -> &str {
        match self {
            Access::OciRegistry { .. } => "ociRegistry",
            Access::LocalOciBlob { .. } => "localOciBlob",
            Access::Other { fields } => fields
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Local,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub relation: Relation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<DigestSpec>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub labels: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, rename = "extraIdentity")]
    pub extra_identity: BTreeMap<String, String>,
    pub access: Access,
}

impl Resource {
    /// `(name, version, type, extra-identity map)` per spec.md §3.
    pub fn identity(&self) -> (String, String, String, BTreeMap<String, String>) {
        (
            self.name.clone(),
            self.version.clone(),
            self.kind.clone(),
            self.extra_identity.clone(),
        )
    }

    pub fn set_label(&mut self, name: &str, value: serde_json::Value) {
        let labels = self.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(name.to_string(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub access: Access,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, rename = "componentReferences")]
    pub component_references: Vec<ComponentReference>,
    #[serde(rename = "repositoryContexts", default)]
    pub repository_contexts: Vec<RepositoryContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<SignatureSpec>,
}

impl Descriptor {
    /// The top of the repository-context stack is the effective one.
    pub fn effective_repository_context(&self) -> Option<&RepositoryContext> {
        self.repository_contexts.last()
    }

    /// Resource identity must be unique within a descriptor.
    pub fn validate_resource_identities(&self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();
        for r in &self.resources {
            if !seen.insert(r.identity()) {
                return Err(Error::DuplicateResourceIdentity {
                    name: self.name.clone(),
                    version: self.version.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn push_repository_context(&mut self, ctx: RepositoryContext) {
        self.repository_contexts.push(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_resource_identity_rejected() {
        let resource = |name: &str| Resource {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            kind: "ociImage".to_string(),
            relation: Relation::External,
            digest: None,
            labels: None,
            extra_identity: BTreeMap::new(),
            access: Access::OciRegistry {
                image_reference: "x.example/img:1".to_string(),
            },
        };
        let d = Descriptor {
            name: "c".to_string(),
            version: "1.0.0".to_string(),
            resources: vec![resource("r"), resource("r")],
            sources: vec![],
            component_references: vec![],
            repository_contexts: vec![],
            signatures: vec![],
        };
        assert!(d.validate_resource_identities().is_err());
    }

    #[test]
    fn access_roundtrips_through_yaml() {
        let a = Access::OciRegistry {
            image_reference: "example.com/foo:1".to_string(),
        };
        let s = serde_yaml::to_string(&a).unwrap();
        let back: Access = serde_yaml::from_str(&s).unwrap();
        assert_eq!(a, back);
    }
}
