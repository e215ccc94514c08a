use std::io::Cursor;

use async_trait::async_trait;
use ocmoci::{Access, Artifact};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{Error, ResourceStreamProcessor, StageContext};

/// `local-oci-blob` uploader: writes the envelope's blob into the blob cache
/// and rewrites the resource's access to point at it.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalOciBlobUploaderSpec {}

pub struct LocalOciBlobUploader;

impl LocalOciBlobUploader {
    pub fn from_spec(raw: &serde_json::Value) -> Result<Self, Error> {
        let _spec: LocalOciBlobUploaderSpec =
            serde_json::from_value(raw.clone()).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self)
    }
}

#[async_trait]
impl ResourceStreamProcessor for LocalOciBlobUploader {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).await?;
        let mut envelope = ocmenvelope::read(Cursor::new(buf))?;

        let blob_file = envelope
            .blob
            .as_mut()
            .ok_or_else(|| Error::Config("local-oci-blob uploader requires a blob".to_string()))?;
        let mut data = Vec::new();
        std::io::Read::read_to_end(blob_file, &mut data)?;

        use sha2::Digest as _;
        let mut hasher = sha2::Sha256::new();
        hasher.update(&data);
        let digest = format!("sha256:{:x}", hasher.finalize());
        let key = ocmcache::BlobKey::new(digest.clone()).ok_or_else(|| Error::Config(format!("invalid digest {digest}")))?;
        ctx.cache.add(&key, Cursor::new(data.clone())).await?;

        envelope.resource.access = Access::LocalOciBlob { digest };

        let mut out_buf = Vec::new();
        let mut slice: &[u8] = &data;
        ocmenvelope::write(&envelope.descriptor, &envelope.resource, Some(&mut slice), &mut out_buf)?;
        output.write_all(&out_buf).await?;
        output.flush().await?;
        output.rewind().await?;
        Ok(())
    }
}

/// `{ baseUrl, keepSourceRepo }` per spec.md §4.6: the target reference is
/// `{targetBase}/{sourceRepoPath or none}/{tagOrDigest}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OciArtifactUploaderSpec {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "keepSourceRepo")]
    pub keep_source_repo: bool,
}

pub struct OciArtifactUploader {
    spec: OciArtifactUploaderSpec,
}

impl OciArtifactUploader {
    pub fn from_spec(raw: &serde_json::Value) -> Result<Self, Error> {
        let spec: OciArtifactUploaderSpec = serde_json::from_value(raw.clone()).map_err(|e| Error::Config(e.to_string()))?;
        if spec.base_url.is_empty() {
            return Err(Error::Config("OciArtifactUploader requires a non-empty baseUrl".to_string()));
        }
        Ok(Self { spec })
    }

    /// `{targetBase}/{sourceRepoPath or none}/{tagOrDigest}`.
    fn target_reference(&self, source_image_reference: &str) -> String {
        let (repo_and_host, tag_or_digest) = split_reference(source_image_reference);
        let source_repo_path = repo_and_host.splitn(2, '/').nth(1).unwrap_or("");

        if self.spec.keep_source_repo && !source_repo_path.is_empty() {
            format!("{}/{}/{}", self.spec.base_url.trim_end_matches('/'), source_repo_path, tag_or_digest)
        } else {
            format!("{}/{}", self.spec.base_url.trim_end_matches('/'), tag_or_digest)
        }
    }
}

/// Splits `host/repo/path:tag` (or `@digest`) into `(host/repo/path, tag-or-digest)`.
fn split_reference(reference: &str) -> (&str, &str) {
    if let Some(at) = reference.rfind('@') {
        return (&reference[..at], &reference[at + 1..]);
    }
    match reference.rfind(':') {
        // only treat the last `:` as a tag separator if it comes after the last `/`
        Some(colon) if reference[colon..].find('/').is_none() => (&reference[..colon], &reference[colon + 1..]),
        _ => (reference, "latest"),
    }
}

#[async_trait]
impl ResourceStreamProcessor for OciArtifactUploader {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).await?;
        let mut envelope = ocmenvelope::read(Cursor::new(buf))?;

        let Access::OciRegistry { image_reference } = &envelope.resource.access else {
            return Err(Error::UnsupportedAccess(envelope.resource.access.type_name().to_string()));
        };
        let target_reference = self.target_reference(image_reference);

        let blob_file = envelope
            .blob
            .as_mut()
            .ok_or_else(|| Error::Config("oci-artifact uploader requires a blob".to_string()))?;
        let mut artifact_tar = Vec::new();
        std::io::Read::read_to_end(blob_file, &mut artifact_tar)?;

        let artifact = Artifact::deserialise(&artifact_tar, &ctx.cache).await?;
        let Artifact::Manifest(manifest) = &artifact else {
            return Err(Error::Config("oci-artifact uploader does not support index artifacts".to_string()));
        };

        let config_digest = manifest.config().digest().to_string();
        if let Some(mut reader) = ctx.cache.get(&ocmcache::BlobKey::new(config_digest.clone()).unwrap()).await? {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            ctx.registry.push_blob(&target_reference, &config_digest, bytes::Bytes::from(data)).await?;
        }
        for layer in manifest.layers() {
            let digest = layer.digest().to_string();
            if let Some(mut reader) = ctx.cache.get(&ocmcache::BlobKey::new(digest.clone()).unwrap()).await? {
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await?;
                ctx.registry.push_blob(&target_reference, &digest, bytes::Bytes::from(data)).await?;
            }
        }

        let manifest_bytes = serde_json::to_vec(manifest)?;
        let media_type = artifact
            .media_type()
            .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string());
        ctx.registry
            .push_manifest(&target_reference, bytes::Bytes::from(manifest_bytes), &media_type)
            .await?;

        envelope.resource.access = Access::OciRegistry { image_reference: target_reference };

        let mut out_buf = Vec::new();
        let mut slice: &[u8] = &artifact_tar;
        ocmenvelope::write(&envelope.descriptor, &envelope.resource, Some(&mut slice), &mut out_buf)?;
        output.write_all(&out_buf).await?;
        output.flush().await?;
        output.rewind().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploader(base_url: &str, keep_source_repo: bool) -> OciArtifactUploader {
        OciArtifactUploader {
            spec: OciArtifactUploaderSpec { base_url: base_url.to_string(), keep_source_repo },
        }
    }

    #[test]
    fn target_reference_keeps_source_repo() {
        let u = uploader("target.example.com", true);
        assert_eq!(u.target_reference("source.example.com/foo/bar:1.0"), "target.example.com/foo/bar:1.0");
    }

    #[test]
    fn target_reference_drops_source_repo() {
        let u = uploader("target.example.com/mirror", false);
        assert_eq!(u.target_reference("source.example.com/foo/bar:1.0"), "target.example.com/mirror/1.0");
    }

    #[test]
    fn target_reference_handles_digest() {
        let u = uploader("target.example.com", true);
        assert_eq!(
            u.target_reference("source.example.com/foo/bar@sha256:abc"),
            "target.example.com/foo/bar/sha256:abc"
        );
    }

    #[test]
    fn empty_base_url_rejected() {
        let raw = serde_json::json!({ "baseUrl": "", "keepSourceRepo": false });
        assert!(OciArtifactUploader::from_spec(&raw).is_err());
    }
}
