//! Stage Factories (C6, spec.md §4.6): given `(type-tag, raw-spec)`, produce
//! a [`ResourceStreamProcessor`]. Built-ins: local-oci-blob downloader and
//! uploader, oci-artifact downloader and uploader, resource-labeler,
//! oci-layer-filter, and an `Executable` stage bridged to an external
//! process (C5).

mod downloader;
mod processor;
mod uploader;

pub use downloader::{LocalOciBlobDownloader, LocalOciBlobDownloaderSpec, OciArtifactDownloader, OciArtifactDownloaderSpec};
pub use processor::{
    ExecutableProcessor, ExecutableSpec, OciArtifactFilter, OciArtifactFilterSpec, ResourceLabeler, ResourceLabelerSpec,
};
pub use uploader::{LocalOciBlobUploader, LocalOciBlobUploaderSpec, OciArtifactUploader, OciArtifactUploaderSpec};

use std::sync::Arc;

use async_trait::async_trait;
use ocmcache::BlobCache;
use ocmoci::SharedRegistryClient;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope error: {0}")]
    Envelope(#[from] ocmenvelope::Error),
    #[error("artifact error: {0}")]
    Artifact(#[from] ocmoci::artifact::Error),
    #[error("registry error: {0}")]
    Registry(#[from] ocmoci::registry::Error),
    #[error("model error: {0}")]
    Model(#[from] ocmoci::model::Error),
    #[error("cache error: {0}")]
    Cache(#[from] ocmcache::Error),
    #[error("bridge error: {0}")]
    Bridge(#[from] ocmbridge::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),
    #[error("unsupported access type: {0}")]
    UnsupportedAccess(String),
    #[error("stage cancelled")]
    Cancelled,
}

/// Shared services a stage needs to do its work; constructed once per job
/// runner and handed to every stage in the chain.
pub struct StageContext {
    pub registry: SharedRegistryClient,
    pub cache: Arc<BlobCache>,
    pub cancellation: CancellationToken,
    pub work_dir: std::path::PathBuf,
}

/// A single process-boundary-crossing step that consumes and produces a
/// processor envelope, materialised to disk on both sides (spec.md §4.9).
#[async_trait]
pub trait ResourceStreamProcessor: Send + Sync {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error>;
}

/// Recognised downloader/uploader/processor type tags (spec.md §4.6, §7).
pub const LOCAL_OCI_BLOB_DOWNLOADER: &str = "LocalOciBlobDownloader";
pub const OCI_ARTIFACT_DOWNLOADER: &str = "OciArtifactDownloader";
pub const LOCAL_OCI_BLOB_UPLOADER: &str = "LocalOciBlobUploader";
pub const OCI_ARTIFACT_UPLOADER: &str = "OciArtifactUploader";
pub const RESOURCE_LABELER: &str = "ResourceLabeler";
pub const OCI_ARTIFACT_FILTER: &str = "OciArtifactFilter";
pub const EXECUTABLE: &str = "Executable";

/// Instantiate a downloader from its `(type-tag, raw-spec)`. Unknown fields
/// and missing required fields surface as `config-error` from the spec's own
/// `#[serde(deny_unknown_fields)]` deserialisation.
pub fn build_downloader(type_tag: &str, raw_spec: &serde_json::Value) -> Result<Box<dyn ResourceStreamProcessor>, Error> {
    match type_tag {
        LOCAL_OCI_BLOB_DOWNLOADER => Ok(Box::new(LocalOciBlobDownloader::from_spec(raw_spec)?)),
        OCI_ARTIFACT_DOWNLOADER => Ok(Box::new(OciArtifactDownloader::from_spec(raw_spec)?)),
        EXECUTABLE => Ok(Box::new(ExecutableProcessor::from_spec(raw_spec)?)),
        other => Err(Error::Config(format!("unrecognised downloader type {other}"))),
    }
}

pub fn build_uploader(type_tag: &str, raw_spec: &serde_json::Value) -> Result<Box<dyn ResourceStreamProcessor>, Error> {
    match type_tag {
        LOCAL_OCI_BLOB_UPLOADER => Ok(Box::new(LocalOciBlobUploader::from_spec(raw_spec)?)),
        OCI_ARTIFACT_UPLOADER => Ok(Box::new(OciArtifactUploader::from_spec(raw_spec)?)),
        EXECUTABLE => Ok(Box::new(ExecutableProcessor::from_spec(raw_spec)?)),
        other => Err(Error::Config(format!("unrecognised uploader type {other}"))),
    }
}

pub fn build_processor(type_tag: &str, raw_spec: &serde_json::Value) -> Result<Box<dyn ResourceStreamProcessor>, Error> {
    match type_tag {
        RESOURCE_LABELER => Ok(Box::new(ResourceLabeler::from_spec(raw_spec)?)),
        OCI_ARTIFACT_FILTER => Ok(Box::new(OciArtifactFilter::from_spec(raw_spec)?)),
        EXECUTABLE => Ok(Box::new(ExecutableProcessor::from_spec(raw_spec)?)),
        other => Err(Error::Config(format!("unrecognised processor type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_carries_message() {
        let e = Error::Config("missing field".to_string());
        assert_eq!(e.to_string(), "config error: missing field");
    }

    #[test]
    fn unknown_downloader_type_is_config_error() {
        let raw = serde_json::json!({});
        let err = build_downloader("NoSuchThing", &raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn local_oci_blob_downloader_rejects_unknown_fields() {
        let raw = serde_json::json!({ "unexpected": true });
        let err = build_downloader(LOCAL_OCI_BLOB_DOWNLOADER, &raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
