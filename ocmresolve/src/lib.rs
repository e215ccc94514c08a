//! Descriptor Resolver (C10, spec.md §4.10): a depth-first traversal of a
//! component's closure, honouring per-component-name repository-context
//! overrides, parents preceding their children (pre-order) in the output.

use std::collections::HashSet;

use log::debug;
use ocmfilter::RepositoryContextOverride;
use ocmoci::{Access, Descriptor, RegistryClient, RepositoryContext};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cycle detected resolving {name}:{version}")]
    Cycle { name: String, version: String },
    #[error("registry error resolving {name}:{version}: {source}")]
    Registry { name: String, version: String, #[source] source: ocmoci::registry::Error },
}

/// Convention for locating a component descriptor's OCI manifest: component
/// descriptors are stored under a fixed `component-descriptors/` prefix,
/// tagged by version, per the teacher's own registry-path conventions.
fn descriptor_image_reference(ctx: &RepositoryContext, name: &str, version: &str) -> String {
    let base = ctx.base_url.trim_end_matches('/');
    match &ctx.component_name_mapping {
        Some(mapping) if mapping == "sha256-digest" => {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(name.as_bytes());
            format!("{base}/component-descriptors/{:x}:{version}", hasher.finalize())
        }
        _ => format!("{base}/component-descriptors/{name}:{version}"),
    }
}

/// Depth-first resolve of `(name, version)`'s closure. Parents precede
/// their children in the returned vec (pre-order); the signing phase
/// consumes it reversed for leaves-first traversal.
pub async fn resolve(
    registry: &dyn RegistryClient,
    default_repo_ctx: &RepositoryContext,
    overrides: &[RepositoryContextOverride],
    name: &str,
    version: &str,
) -> Result<Vec<Descriptor>, Error> {
    let mut out = Vec::new();
    let mut stack = HashSet::new();
    resolve_into(registry, default_repo_ctx, overrides, name, version, &mut stack, &mut out).await?;
    Ok(out)
}

// `async fn` can't recurse directly (it would need an infinitely-sized
// future); box the recursive call instead.
fn resolve_into<'a>(
    registry: &'a dyn RegistryClient,
    default_repo_ctx: &'a RepositoryContext,
    overrides: &'a [RepositoryContextOverride],
    name: &'a str,
    version: &'a str,
    stack: &'a mut HashSet<(String, String)>,
    out: &'a mut Vec<Descriptor>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(async move {
        let key = (name.to_string(), version.to_string());
        if !stack.insert(key.clone()) {
            return Err(Error::Cycle { name: name.to_string(), version: version.to_string() });
        }

        let repo_ctx = ocmfilter::effective_repository_context(overrides, name, default_repo_ctx);
        debug!("resolving {name}:{version} via {}", repo_ctx.base_url);

        let image_reference = descriptor_image_reference(repo_ctx, name, version);
        let access = Access::OciRegistry { image_reference };
        let descriptor = registry
            .resolve_descriptor(&access)
            .await
            .map_err(|source| Error::Registry { name: name.to_string(), version: version.to_string(), source })?;

        let references = descriptor.component_references.clone();
        out.push(descriptor);

        for reference in &references {
            resolve_into(registry, default_repo_ctx, overrides, &reference.component_name, &reference.version, stack, out).await?;
        }

        stack.remove(&key);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FakeRegistry {
        descriptors: Mutex<BTreeMap<String, Descriptor>>,
    }

    fn component_ref(name: &str, version: &str) -> ocmoci::ComponentReference {
        ocmoci::ComponentReference {
            name: name.to_string(),
            component_name: name.to_string(),
            version: version.to_string(),
            digest: None,
        }
    }

    fn descriptor(name: &str, version: &str, refs: Vec<ocmoci::ComponentReference>) -> Descriptor {
        Descriptor {
            name: name.to_string(),
            version: version.to_string(),
            resources: vec![],
            sources: vec![],
            component_references: refs,
            repository_contexts: vec![],
            signatures: vec![],
        }
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn resolve_descriptor(&self, access: &Access) -> Result<Descriptor, ocmoci::registry::Error> {
            let Access::OciRegistry { image_reference } = access else { unreachable!() };
            let tag = image_reference.rsplit_once(':').unwrap().1;
            let descriptors = self.descriptors.lock().unwrap();
            Ok(descriptors
                .iter()
                .find(|(_, d)| d.version == tag)
                .map(|(_, d)| d.clone())
                .expect("descriptor present in fake registry"))
        }
        async fn pull_manifest(&self, _reference: &str) -> Result<(Bytes, String), ocmoci::registry::Error> {
            unimplemented!()
        }
        async fn pull_blob(&self, _reference: &str, _digest: &str) -> Result<Bytes, ocmoci::registry::Error> {
            unimplemented!()
        }
        async fn push_blob(&self, _reference: &str, _digest: &str, _content: Bytes) -> Result<(), ocmoci::registry::Error> {
            unimplemented!()
        }
        async fn push_manifest(&self, _reference: &str, _manifest: Bytes, _media_type: &str) -> Result<String, ocmoci::registry::Error> {
            unimplemented!()
        }
    }

    fn default_ctx() -> RepositoryContext {
        RepositoryContext { base_url: "registry.example.com".to_string(), component_name_mapping: None, kind: "OCIRegistry".to_string() }
    }

    #[tokio::test]
    async fn resolves_parent_before_children_preorder() {
        let child = descriptor("github.com/acme/child", "1.0.0", vec![]);
        let parent = descriptor("github.com/acme/parent", "1.0.0", vec![component_ref("github.com/acme/child", "1.0.0")]);
        let mut map = BTreeMap::new();
        map.insert("github.com/acme/parent".to_string(), parent);
        map.insert("github.com/acme/child".to_string(), child);
        let registry = FakeRegistry { descriptors: Mutex::new(map) };

        let out = resolve(&registry, &default_ctx(), &[], "github.com/acme/parent", "1.0.0").await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "github.com/acme/parent");
        assert_eq!(out[1].name, "github.com/acme/child");
    }

    #[tokio::test]
    async fn detects_cycle() {
        let a = descriptor("a", "1.0.0", vec![component_ref("b", "1.0.0")]);
        let b = descriptor("b", "1.0.0", vec![component_ref("a", "1.0.0")]);
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), a);
        map.insert("b".to_string(), b);
        let registry = FakeRegistry { descriptors: Mutex::new(map) };

        let err = resolve(&registry, &default_ctx(), &[], "a", "1.0.0").await.unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
    }
}
