//! Signing Coordinator (C11, spec.md §4.11) and the top-level `Engine::copy`
//! entry point gluing every other crate together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use ocmcache::BlobCache;
use ocmconfig::TransportConfig;
use ocmfilter::RepositoryContextOverride;
use ocmoci::{DigestSpec, RepositoryContext, SharedRegistryClient, SignatureSpec};
use sha2::{Digest as _, Sha256};
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resolve error: {0}")]
    Resolve(#[from] ocmresolve::Error),
    #[error("processing error: {} job(s) failed:\n{}", .errors.len(), .errors.iter().map(|e| format!(" - {e}")).collect::<Vec<_>>().join("\n"))]
    Processing { errors: Vec<String> },
    #[error("sign error for {name}:{version}: {reason}")]
    Sign { name: String, version: String, reason: String },
    #[error("publish error: {} descriptor(s) failed to publish:\n{}", .errors.len(), .errors.iter().map(|e| format!(" - {e}")).collect::<Vec<_>>().join("\n"))]
    Publish { errors: Vec<String> },
    #[error("registry error: {0}")]
    Registry(#[from] ocmoci::registry::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    fn processing(errors: Vec<String>) -> Self {
        Error::Processing { errors }
    }
}

/// `Signer.Sign(descriptor, digestSpec) -> signatureSpec` (spec.md §6).
#[async_trait::async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, descriptor_digest: &DigestSpec) -> Result<SignatureSpec, Error>;
}

pub struct EngineConfig {
    pub transport_config: TransportConfig,
    pub default_repo_ctx: RepositoryContext,
    pub overrides: Vec<RepositoryContextOverride>,
    pub per_stage_timeout: Duration,
    /// `None` skips the signing phase entirely.
    pub signing_name: Option<String>,
    pub work_dir: PathBuf,
}

pub struct Engine {
    pub registry: SharedRegistryClient,
    pub cache: Arc<BlobCache>,
    pub digester: Arc<dyn ocmoci::Digester>,
    pub signer: Option<Arc<dyn Signer>>,
    pub config: EngineConfig,
}

/// A resource's matched stage names, surfaced verbatim in dry-run mode.
pub struct DryRunEntry {
    pub descriptor_name: String,
    pub descriptor_version: String,
    pub resource_name: String,
    pub matched: ocmjob::MatchedNames,
}

pub enum CopyOutcome {
    Copied,
    DryRun(Vec<DryRunEntry>),
}

impl Engine {
    /// Resolve `name:version`'s closure, copy every resource through its
    /// matched pipeline, optionally sign leaves-first, then publish.
    pub async fn copy(&self, name: &str, version: &str, dry_run: bool) -> Result<CopyOutcome, Error> {
        let descriptors = ocmresolve::resolve(
            self.registry.as_ref(),
            &self.config.default_repo_ctx,
            &self.config.overrides,
            name,
            version,
        )
        .await?;
        info!("resolved {} descriptor(s) for {name}:{version}", descriptors.len());

        if dry_run {
            return Ok(CopyOutcome::DryRun(self.dry_run_matches(&descriptors)?));
        }

        let mut descriptors = self.process_all(descriptors).await?;

        if let Some(signer) = &self.signer {
            self.sign_leaves_first(&mut descriptors, signer.as_ref()).await?;
        }

        self.publish_all(&descriptors).await?;
        Ok(CopyOutcome::Copied)
    }

    fn dry_run_matches(&self, descriptors: &[ocmoci::Descriptor]) -> Result<Vec<DryRunEntry>, Error> {
        let mut out = Vec::new();
        for descriptor in descriptors {
            for resource in &descriptor.resources {
                let job = ocmjob::build_job(&self.config.transport_config, descriptor, resource)
                    .map_err(|e| Error::processing(vec![format!("{}/{}: {e}", descriptor.name, resource.name)]))?;
                out.push(DryRunEntry {
                    descriptor_name: descriptor.name.clone(),
                    descriptor_version: descriptor.version.clone(),
                    resource_name: resource.name.clone(),
                    matched: job.matched,
                });
            }
        }
        Ok(out)
    }

    /// Fan out one job per `(descriptor, resource)`, descriptors and
    /// resources within a descriptor all running concurrently. All errors
    /// are collected; a non-empty set fails the whole invocation before any
    /// descriptor is mutated (no partial publish).
    async fn process_all(&self, descriptors: Vec<ocmoci::Descriptor>) -> Result<Vec<ocmoci::Descriptor>, Error> {
        let stage_ctx = Arc::new(ocmstage::StageContext {
            registry: self.registry.clone(),
            cache: self.cache.clone(),
            cancellation: tokio_util::sync::CancellationToken::new(),
            work_dir: self.config.work_dir.clone(),
        });

        let mut descriptor_set = JoinSet::new();
        let mut errors = Vec::new();
        for descriptor in descriptors {
            let stage_ctx = stage_ctx.clone();
            let timeout = self.config.per_stage_timeout;
            let transport_config = &self.config.transport_config;
            // `TransportConfig` isn't `Clone`; jobs are built up front (they
            // borrow it) before resources move into the per-resource tasks.
            // A match error on one resource doesn't stop siblings in the same
            // descriptor, nor any other descriptor, from being examined.
            let mut jobs = Vec::with_capacity(descriptor.resources.len());
            let mut descriptor_errors = Vec::new();
            for r in &descriptor.resources {
                match ocmjob::build_job(transport_config, &descriptor, r) {
                    Ok(job) => jobs.push(job),
                    Err(e) => descriptor_errors.push(format!("{}/{}: {e}", descriptor.name, r.name)),
                }
            }
            if !descriptor_errors.is_empty() {
                errors.extend(descriptor_errors);
                continue;
            }

            descriptor_set.spawn(run_descriptor_resources(descriptor, jobs, stage_ctx, timeout));
        }

        let mut processed = Vec::new();
        while let Some(result) = descriptor_set.join_next().await {
            match result {
                Ok(Ok(descriptor)) => processed.push(descriptor),
                Ok(Err(errs)) => errors.extend(errs),
                Err(join_err) => errors.push(format!("task panicked: {join_err}")),
            }
        }

        if !errors.is_empty() {
            warn!("{} job(s) failed during processing", errors.len());
            return Err(Error::processing(errors));
        }
        Ok(processed)
    }

    /// Iterate descriptors in reverse resolution order (leaves first):
    /// digest each resource, wire already-signed children's digests into
    /// component references, normalise and hash the descriptor, invoke the
    /// signer, and append the signature.
    async fn sign_leaves_first(&self, descriptors: &mut [ocmoci::Descriptor], signer: &dyn Signer) -> Result<(), Error> {
        let signing_name = self.config.signing_name.as_deref().unwrap_or("default");
        let mut signed: HashMap<(String, String), DigestSpec> = HashMap::new();

        for descriptor in descriptors.iter_mut().rev() {
            for resource in &mut descriptor.resources {
                let value = self
                    .digester
                    .digest(&resource.access)
                    .await
                    .map_err(|e| Error::Sign { name: descriptor.name.clone(), version: descriptor.version.clone(), reason: e.to_string() })?;
                resource.digest = Some(DigestSpec {
                    hash_algorithm: "SHA-256".to_string(),
                    normalisation_algorithm: "genericBlobDigest/v1".to_string(),
                    value,
                });
            }

            for reference in &mut descriptor.component_references {
                let key = (reference.component_name.clone(), reference.version.clone());
                let child_digest = signed.get(&key).ok_or_else(|| Error::Sign {
                    name: descriptor.name.clone(),
                    version: descriptor.version.clone(),
                    reason: format!("child {}:{} not yet signed", key.0, key.1),
                })?;
                reference.digest = Some(child_digest.clone());
            }

            let normalised = normalise_descriptor(descriptor)?;
            let mut hasher = Sha256::new();
            hasher.update(&normalised);
            let own_digest = DigestSpec {
                hash_algorithm: "SHA-256".to_string(),
                normalisation_algorithm: "jsonNormalisation/V1".to_string(),
                value: format!("{:x}", hasher.finalize()),
            };

            let signature = signer.sign(&own_digest).await?;
            info!("signed {}:{} as '{signing_name}'", descriptor.name, descriptor.version);
            signed.insert((descriptor.name.clone(), descriptor.version.clone()), signature.digest.clone());
            descriptor.signatures.retain(|s| s.name != signing_name);
            descriptor.signatures.push(signature);
        }

        Ok(())
    }

    /// Publish every descriptor concurrently; any failure fails the whole
    /// invocation (spec.md §4.11 step 5).
    async fn publish_all(&self, descriptors: &[ocmoci::Descriptor]) -> Result<(), Error> {
        let mut set = JoinSet::new();
        for descriptor in descriptors {
            let registry = self.registry.clone();
            let repo_ctx = ocmfilter::effective_repository_context(&self.config.overrides, &descriptor.name, &self.config.default_repo_ctx).clone();
            let descriptor_name = descriptor.name.clone();
            let descriptor_version = descriptor.version.clone();
            let bytes = serde_yaml::to_vec(descriptor).map_err(|e| Error::Sign {
                name: descriptor_name.clone(),
                version: descriptor_version.clone(),
                reason: e.to_string(),
            })?;
            set.spawn(async move {
                let reference = format!("{}/component-descriptors/{}:{}", repo_ctx.base_url.trim_end_matches('/'), descriptor_name, descriptor_version);
                registry
                    .push_manifest(&reference, bytes::Bytes::from(bytes), "application/vnd.ocm.software.component-descriptor.v2+yaml")
                    .await
                    .map_err(|e| format!("{descriptor_name}:{descriptor_version}: {e}"))
            });
        }

        let mut errors = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => errors.push(e),
                Err(join_err) => errors.push(format!("task panicked: {join_err}")),
            }
        }
        if !errors.is_empty() {
            error!("{} descriptor(s) failed to publish", errors.len());
            return Err(Error::Publish { errors });
        }
        Ok(())
    }
}

async fn run_descriptor_resources(
    mut descriptor: ocmoci::Descriptor,
    jobs: Vec<ocmjob::ProcessingJob>,
    ctx: Arc<ocmstage::StageContext>,
    timeout: Duration,
) -> Result<ocmoci::Descriptor, Vec<String>> {
    let mut set = JoinSet::new();
    for (index, (resource, job)) in descriptor.resources.clone().into_iter().zip(jobs).enumerate() {
        let ctx = ctx.clone();
        let descriptor_name = descriptor.name.clone();
        let descriptor_clone = descriptor.clone();
        set.spawn(async move {
            let result = ocmjob::run_job(&ctx, &job, &descriptor_clone, &resource, timeout).await;
            (index, result.map_err(|e| format!("{descriptor_name}/{}: {e}", resource.name)))
        });
    }

    let mut results: Vec<Option<ocmoci::Resource>> = vec![None; descriptor.resources.len()];
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Ok(resource))) => results[index] = Some(resource),
            Ok((_, Err(e))) => errors.push(e),
            Err(join_err) => errors.push(format!("task panicked: {join_err}")),
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    descriptor.resources = results.into_iter().map(|r| r.expect("every resource processed or an error was returned")).collect();
    Ok(descriptor)
}

/// Canonical JSON with lexicographically sorted object keys — the
/// `jsonNormalisation/V1` algorithm named in spec.md §4.11, excluding the
/// descriptor's own (possibly stale) signatures from the hashed form.
fn normalise_descriptor(descriptor: &ocmoci::Descriptor) -> Result<Vec<u8>, Error> {
    let mut unsigned = descriptor.clone();
    unsigned.signatures.clear();
    let value = serde_json::to_value(&unsigned)?;
    let sorted = sort_json(value);
    Ok(serde_json::to_vec(&sorted)?)
}

fn sort_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_json(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.into_iter().map(sort_json).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_is_deterministic_regardless_of_field_order() {
        let d1 = ocmoci::Descriptor {
            name: "a".to_string(),
            version: "1.0.0".to_string(),
            resources: vec![],
            sources: vec![],
            component_references: vec![],
            repository_contexts: vec![],
            signatures: vec![],
        };
        let bytes1 = normalise_descriptor(&d1).unwrap();
        let bytes2 = normalise_descriptor(&d1).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn normalise_excludes_signatures() {
        let mut d = ocmoci::Descriptor {
            name: "a".to_string(),
            version: "1.0.0".to_string(),
            resources: vec![],
            sources: vec![],
            component_references: vec![],
            repository_contexts: vec![],
            signatures: vec![],
        };
        let without = normalise_descriptor(&d).unwrap();
        d.signatures.push(SignatureSpec {
            name: "default".to_string(),
            digest: DigestSpec { hash_algorithm: "SHA-256".to_string(), normalisation_algorithm: "jsonNormalisation/V1".to_string(), value: "abc".to_string() },
            algorithm: "RSASSA-PSS".to_string(),
            value: "sig".to_string(),
        });
        let with = normalise_descriptor(&d).unwrap();
        assert_eq!(without, with);
    }
}
