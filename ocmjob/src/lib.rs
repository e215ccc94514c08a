//! Job Factory (C8, spec.md §4.8) and Job Runner (C9, spec.md §4.9).

use std::sync::Arc;
use std::time::Duration;

use ocmconfig::TransportConfig;
use ocmoci::{Descriptor, Resource};
use ocmstage::{ResourceStreamProcessor, StageContext};
use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("match error: expected exactly one downloader for resource {resource}, matched {matched}")]
    DownloaderMatch { resource: String, matched: usize },
    #[error("match error: no uploader matched resource {0}")]
    NoUploaderMatch(String),
    #[error("stage factory error: {0}")]
    Stage(#[from] ocmstage::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope error: {0}")]
    Envelope(#[from] ocmenvelope::Error),
    #[error("stage '{stage}' timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },
    #[error("stage '{stage}' failed: {source}")]
    StageFailed { stage: String, #[source] source: ocmstage::Error },
}

/// The set of matched stage names recorded by the job factory, per spec.md
/// §4.8 — surfaced as-is in dry-run mode.
#[derive(Debug, Clone, Default)]
pub struct MatchedNames {
    pub downloader: String,
    pub uploaders: Vec<String>,
    pub rules: Vec<String>,
}

/// A fully instantiated, ready-to-run pipeline for one `(descriptor,
/// resource)` pair.
pub struct ProcessingJob {
    downloader: Box<dyn ResourceStreamProcessor>,
    processors: Vec<Box<dyn ResourceStreamProcessor>>,
    uploaders: Vec<Box<dyn ResourceStreamProcessor>>,
    pub matched: MatchedNames,
}

/// Select exactly one downloader, at least one uploader, and every
/// processing rule whose filters match, in document order, then instantiate
/// each via [`ocmstage`]'s factories.
pub fn build_job(config: &TransportConfig, descriptor: &Descriptor, resource: &Resource) -> Result<ProcessingJob, Error> {
    let matching_downloaders: Vec<_> = config.downloaders.iter().filter(|d| d.filters.matches(descriptor, resource)).collect();
    if matching_downloaders.len() != 1 {
        return Err(Error::DownloaderMatch { resource: resource.name.clone(), matched: matching_downloaders.len() });
    }
    let downloader_entry = matching_downloaders[0];
    let downloader = ocmstage::build_downloader(&downloader_entry.type_tag, &downloader_entry.spec)?;

    let matching_uploaders: Vec<_> = config.uploaders.iter().filter(|u| u.filters.matches(descriptor, resource)).collect();
    if matching_uploaders.is_empty() {
        return Err(Error::NoUploaderMatch(resource.name.clone()));
    }
    let uploaders = matching_uploaders
        .iter()
        .map(|u| ocmstage::build_uploader(&u.type_tag, &u.spec).map_err(Error::from))
        .collect::<Result<Vec<_>, _>>()?;

    let mut processor_names = Vec::new();
    let mut matched_rules = Vec::new();
    for rule in &config.processing_rules {
        if rule.filters.matches(descriptor, resource) {
            matched_rules.push(rule.name.clone());
            processor_names.extend(rule.processor_names.iter().cloned());
        }
    }

    let mut processors = Vec::new();
    for name in &processor_names {
        let entry = config
            .processors
            .iter()
            .find(|p| &p.name == name)
            .expect("rule processor names are validated to resolve at config-parse time");
        processors.push(ocmstage::build_processor(&entry.type_tag, &entry.spec)?);
    }

    Ok(ProcessingJob {
        downloader,
        processors,
        uploaders,
        matched: MatchedNames {
            downloader: downloader_entry.name.clone(),
            uploaders: matching_uploaders.iter().map(|u| u.name.clone()).collect(),
            rules: matched_rules,
        },
    })
}

/// A fresh, already-unlinked temp file: the directory entry is removed as
/// soon as it's created, per spec.md §5's "closed and unlinked" ownership
/// rule — the content stays reachable through the open file descriptor
/// until it (and every clone of it) is dropped.
async fn fresh_temp_file() -> Result<tokio::fs::File, Error> {
    let named = tempfile::NamedTempFile::new()?;
    let std_file = named.into_file();
    Ok(tokio::fs::File::from_std(std_file))
}

async fn materialise(descriptor: &Descriptor, resource: &Resource) -> Result<tokio::fs::File, Error> {
    let mut file = fresh_temp_file().await?;
    let mut buf = Vec::new();
    ocmenvelope::write(descriptor, resource, None::<&mut &[u8]>, &mut buf)?;
    use tokio::io::AsyncWriteExt;
    file.write_all(&buf).await?;
    file.flush().await?;
    file.rewind().await?;
    Ok(file)
}

async fn run_stage(
    ctx: &StageContext,
    stage: &dyn ResourceStreamProcessor,
    stage_name: &str,
    timeout: Duration,
    input: &mut tokio::fs::File,
    output: &mut tokio::fs::File,
) -> Result<(), Error> {
    let child_token = ctx.cancellation.child_token();
    let stage_ctx = StageContext {
        registry: ctx.registry.clone(),
        cache: ctx.cache.clone(),
        cancellation: child_token.clone(),
        work_dir: ctx.work_dir.clone(),
    };

    let result = tokio::time::timeout(timeout, stage.process(&stage_ctx, input, output)).await;
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(Error::StageFailed { stage: stage_name.to_string(), source }),
        Err(_) => {
            child_token.cancel();
            Err(Error::Timeout { stage: stage_name.to_string(), timeout })
        }
    }
}

/// Runs `job`'s stages in sequence — `[downloader] · processors ·
/// uploaders` — materialising the envelope to a fresh temp file between
/// each, per spec.md §4.9. Returns the processed `(descriptor, resource)`
/// recorded from the final uploader's output; the blob is discarded.
pub async fn run_job(
    ctx: &StageContext,
    job: &ProcessingJob,
    descriptor: &Descriptor,
    resource: &Resource,
    per_stage_timeout: Duration,
) -> Result<Resource, Error> {
    let mut current = materialise(descriptor, resource).await?;

    let stages: Vec<(&str, &dyn ResourceStreamProcessor)> = std::iter::once(("downloader", job.downloader.as_ref()))
        .chain(job.processors.iter().map(|p| ("processor", p.as_ref())))
        .chain(job.uploaders.iter().map(|u| ("uploader", u.as_ref())))
        .collect();

    for (stage_name, stage) in stages {
        let mut next = fresh_temp_file().await?;
        run_stage(ctx, stage, stage_name, per_stage_timeout, &mut current, &mut next).await?;
        current = next;
    }

    current.rewind().await?;
    let mut buf = Vec::new();
    use tokio::io::AsyncReadExt;
    current.read_to_end(&mut buf).await?;
    let envelope = ocmenvelope::read(std::io::Cursor::new(buf))?;
    Ok(envelope.resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmcache::BlobCache;
    use ocmconfig::TransportConfig;
    use ocmoci::model::{Access, Relation};
    use std::collections::BTreeMap;

    const SAMPLE: &str = r#"
meta: { version: v1 }
downloaders:
  - name: dl
    type: LocalOciBlobDownloader
    spec: {}
processors:
  - name: label
    type: ResourceLabeler
    spec: { labels: [{ name: ocm.software/copied, value: "true" }] }
uploaders:
  - name: up
    type: LocalOciBlobUploader
    spec: {}
processingRules:
  - name: label-all
    filters: []
    processors:
      - name: label
"#;

    fn resource(digest: &str) -> Resource {
        Resource {
            name: "r".to_string(),
            version: "1.0.0".to_string(),
            kind: "blob".to_string(),
            relation: Relation::Local,
            digest: None,
            labels: None,
            extra_identity: BTreeMap::new(),
            access: Access::LocalOciBlob { digest: digest.to_string() },
        }
    }

    fn descriptor(resource: Resource) -> Descriptor {
        Descriptor {
            name: "github.com/acme/x".to_string(),
            version: "1.0.0".to_string(),
            resources: vec![resource],
            sources: vec![],
            component_references: vec![],
            repository_contexts: vec![],
            signatures: vec![],
        }
    }

    struct NoopRegistry;
    #[async_trait::async_trait]
    impl ocmoci::RegistryClient for NoopRegistry {
        async fn resolve_descriptor(&self, _access: &Access) -> Result<Descriptor, ocmoci::registry::Error> {
            unimplemented!()
        }
        async fn pull_manifest(&self, _reference: &str) -> Result<(bytes::Bytes, String), ocmoci::registry::Error> {
            unimplemented!()
        }
        async fn pull_blob(&self, _reference: &str, _digest: &str) -> Result<bytes::Bytes, ocmoci::registry::Error> {
            unimplemented!()
        }
        async fn push_blob(&self, _reference: &str, _digest: &str, _content: bytes::Bytes) -> Result<(), ocmoci::registry::Error> {
            Ok(())
        }
        async fn push_manifest(&self, _reference: &str, _manifest: bytes::Bytes, _media_type: &str) -> Result<String, ocmoci::registry::Error> {
            Ok("sha256:deadbeef".to_string())
        }
    }

    #[tokio::test]
    async fn runs_download_label_upload_chain() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BlobCache::open(dir.path(), 10_000_000).unwrap());

        let digest = {
            use sha2::Digest as _;
            let mut hasher = sha2::Sha256::new();
            hasher.update(b"payload");
            format!("sha256:{:x}", hasher.finalize())
        };
        let key = ocmcache::BlobKey::new(digest.clone()).unwrap();
        cache.add(&key, std::io::Cursor::new(b"payload".to_vec())).await.unwrap();

        let resource = resource(&digest);
        let descriptor = descriptor(resource.clone());

        let config = TransportConfig::parse(SAMPLE).unwrap();
        let job = build_job(&config, &descriptor, &resource).unwrap();
        assert_eq!(job.matched.downloader, "dl");
        assert_eq!(job.matched.uploaders, vec!["up".to_string()]);
        assert_eq!(job.matched.rules, vec!["label-all".to_string()]);

        let ctx = StageContext {
            registry: Arc::new(NoopRegistry),
            cache,
            cancellation: CancellationToken::new(),
            work_dir: dir.path().to_path_buf(),
        };

        let processed = run_job(&ctx, &job, &descriptor, &resource, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            processed.labels.as_ref().unwrap().get("ocm.software/copied").unwrap(),
            &serde_json::json!("true")
        );
    }

    #[test]
    fn zero_downloaders_is_match_error() {
        let yaml = SAMPLE.replace("type: LocalOciBlobDownloader", "type: OciArtifactDownloader");
        let config = TransportConfig::parse(&yaml).unwrap();
        let resource = resource("sha256:aaaa");
        let descriptor = descriptor(resource.clone());
        let err = build_job(&config, &descriptor, &resource).unwrap_err();
        assert!(matches!(err, Error::DownloaderMatch { matched: 0, .. }));
    }
}
