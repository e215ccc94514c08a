use std::io::Cursor;

use async_trait::async_trait;
use ocmoci::{Access, Artifact};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{Error, ResourceStreamProcessor, StageContext};

/// `local-oci-blob` downloader: reads the bytes of a `localOciBlob` access
/// out of the blob cache and attaches them to the envelope.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalOciBlobDownloaderSpec {}

pub struct LocalOciBlobDownloader;

impl LocalOciBlobDownloader {
    pub fn from_spec(raw: &serde_json::Value) -> Result<Self, Error> {
        let _spec: LocalOciBlobDownloaderSpec =
            serde_json::from_value(raw.clone()).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self)
    }
}

#[async_trait]
impl ResourceStreamProcessor for LocalOciBlobDownloader {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).await?;
        let envelope = ocmenvelope::read(Cursor::new(buf))?;

        let Access::LocalOciBlob { digest } = &envelope.resource.access else {
            return Err(Error::UnsupportedAccess(envelope.resource.access.type_name().to_string()));
        };
        let key = ocmcache::BlobKey::new(digest.clone())
            .ok_or_else(|| Error::Config(format!("invalid blob digest {digest}")))?;
        let mut reader = ctx
            .cache
            .get(&key)
            .await?
            .ok_or_else(|| Error::Config(format!("blob {digest} not present in cache")))?;

        let mut blob = Vec::new();
        reader.read_to_end(&mut blob).await?;

        let mut out_buf = Vec::new();
        let mut blob_slice: &[u8] = &blob;
        ocmenvelope::write(&envelope.descriptor, &envelope.resource, Some(&mut blob_slice), &mut out_buf)?;
        output.write_all(&out_buf).await?;
        output.flush().await?;
        output.rewind().await?;
        Ok(())
    }
}

/// `oci-artifact` downloader: pulls the full manifest-or-index artifact
/// (config, layers, sub-manifests) from the registry and attaches its
/// portable tar serialisation as the envelope's blob.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OciArtifactDownloaderSpec {}

pub struct OciArtifactDownloader;

impl OciArtifactDownloader {
    pub fn from_spec(raw: &serde_json::Value) -> Result<Self, Error> {
        let _spec: OciArtifactDownloaderSpec =
            serde_json::from_value(raw.clone()).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self)
    }
}

#[async_trait]
impl ResourceStreamProcessor for OciArtifactDownloader {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).await?;
        let envelope = ocmenvelope::read(Cursor::new(buf))?;

        let Access::OciRegistry { image_reference } = &envelope.resource.access else {
            return Err(Error::UnsupportedAccess(envelope.resource.access.type_name().to_string()));
        };

        let (manifest_bytes, media_type) = ctx.registry.pull_manifest(image_reference).await?;
        if media_type.contains("image.index") {
            return Err(Error::Config("oci-artifact downloader does not support index artifacts".to_string()));
        }
        let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&manifest_bytes)?;

        let mut layer_blobs = Vec::new();
        layer_blobs.push((manifest.config().digest().to_string(), ctx.registry.pull_blob(image_reference, &manifest.config().digest().to_string()).await?));
        for layer in manifest.layers() {
            let digest = layer.digest().to_string();
            let bytes = ctx.registry.pull_blob(image_reference, &digest).await?;
            layer_blobs.push((digest, bytes));
        }
        let artifact = Artifact::Manifest(manifest);
        let artifact_tar = artifact.serialise(&ctx.cache, &layer_blobs).await?;

        let mut artifact_tar_slice: &[u8] = &artifact_tar;
        let mut out_buf = Vec::new();
        ocmenvelope::write(&envelope.descriptor, &envelope.resource, Some(&mut artifact_tar_slice), &mut out_buf)?;
        output.write_all(&out_buf).await?;
        output.flush().await?;
        output.rewind().await?;
        Ok(())
    }
}
