use std::io::Cursor;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use glob::Pattern;
use oci_spec::image::ImageConfiguration;
use ocmoci::Artifact;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{Error, ResourceStreamProcessor, StageContext};

fn write_envelope_with_optional_blob(
    descriptor: &ocmoci::Descriptor,
    resource: &ocmoci::Resource,
    blob: Option<Vec<u8>>,
) -> Result<Vec<u8>, Error> {
    let mut out_buf = Vec::new();
    match blob {
        Some(data) => {
            let mut slice: &[u8] = data.as_slice();
            ocmenvelope::write(descriptor, resource, Some(&mut slice), &mut out_buf)?;
        }
        None => {
            ocmenvelope::write(descriptor, resource, None::<&mut &[u8]>, &mut out_buf)?;
        }
    }
    Ok(out_buf)
}

async fn read_envelope(input: &mut tokio::fs::File) -> Result<ocmenvelope::Envelope, Error> {
    let mut buf = Vec::new();
    input.read_to_end(&mut buf).await?;
    Ok(ocmenvelope::read(Cursor::new(buf))?)
}

async fn write_output(output: &mut tokio::fs::File, bytes: Vec<u8>) -> Result<(), Error> {
    output.write_all(&bytes).await?;
    output.flush().await?;
    output.rewind().await?;
    Ok(())
}

fn read_blob(envelope: &mut ocmenvelope::Envelope) -> Result<Option<Vec<u8>>, Error> {
    match envelope.blob.as_mut() {
        Some(f) => {
            let mut data = Vec::new();
            std::io::Read::read_to_end(f, &mut data)?;
            Ok(Some(data))
        }
        None => Ok(None),
    }
}

/// `resource-labeler` processor: appends a fixed list of labels to
/// `resource.labels`; an existing label with the same name is replaced.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLabelerSpec {
    pub labels: Vec<LabelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelEntry {
    pub name: String,
    pub value: serde_json::Value,
}

pub struct ResourceLabeler {
    spec: ResourceLabelerSpec,
}

impl ResourceLabeler {
    pub fn from_spec(raw: &serde_json::Value) -> Result<Self, Error> {
        let spec: ResourceLabelerSpec = serde_json::from_value(raw.clone()).map_err(|e| Error::Config(e.to_string()))?;
        if spec.labels.is_empty() {
            return Err(Error::Config("ResourceLabeler requires at least one label".to_string()));
        }
        Ok(Self { spec })
    }
}

#[async_trait]
impl ResourceStreamProcessor for ResourceLabeler {
    async fn process(
        &self,
        _ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error> {
        let mut envelope = read_envelope(input).await?;
        for label in &self.spec.labels {
            envelope.resource.set_label(&label.name, label.value.clone());
        }
        let blob = read_blob(&mut envelope)?;
        let out_buf = write_envelope_with_optional_blob(&envelope.descriptor, &envelope.resource, blob)?;
        write_output(output, out_buf).await
    }
}

/// `oci-layer-filter` (`OciArtifactFilter`) processor: for each layer,
/// transparently decompress if gzipped, drop tar entries matching any
/// remove-pattern, recompress in the original encoding, and recompute the
/// layer digest/size, the manifest digest, and the image config's
/// `rootfs.diff_ids` (spec.md §4.6, §9 resolves the ambiguous commented-out
/// variant in favour of recomputing).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OciArtifactFilterSpec {
    #[serde(rename = "removePatterns")]
    pub remove_patterns: Vec<String>,
}

pub struct OciArtifactFilter {
    patterns: Vec<Pattern>,
}

impl OciArtifactFilter {
    pub fn from_spec(raw: &serde_json::Value) -> Result<Self, Error> {
        let spec: OciArtifactFilterSpec = serde_json::from_value(raw.clone()).map_err(|e| Error::Config(e.to_string()))?;
        if spec.remove_patterns.is_empty() {
            return Err(Error::Config("OciArtifactFilter requires at least one removePattern".to_string()));
        }
        let patterns = spec
            .remove_patterns
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::Config(format!("invalid glob pattern {p}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    fn should_remove(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    /// Drop matching entries from a tar byte stream, preserving the rest.
    fn filter_tar(&self, tar_bytes: &[u8]) -> Result<Vec<u8>, Error> {
        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        let mut builder = tar::Builder::new(Vec::new());
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            if self.should_remove(&path) {
                continue;
            }
            let header = entry.header().clone();
            builder.append(&header, &mut entry)?;
        }
        Ok(builder.into_inner()?)
    }
}

#[async_trait]
impl ResourceStreamProcessor for OciArtifactFilter {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error> {
        let mut envelope = read_envelope(input).await?;
        let blob = read_blob(&mut envelope)?.ok_or_else(|| Error::Config("oci-layer-filter requires a blob".to_string()))?;

        let mut artifact = Artifact::deserialise(&blob, &ctx.cache).await?;
        let Artifact::Manifest(manifest) = &mut artifact else {
            return Err(Error::Config("oci-layer-filter does not support index artifacts".to_string()));
        };

        let mut diff_ids = Vec::new();
        let mut layer_blobs = Vec::new();
        let mut new_layers = Vec::new();

        for layer in manifest.layers() {
            let key = ocmcache::BlobKey::new(layer.digest().to_string())
                .ok_or_else(|| Error::Config(format!("invalid layer digest {}", layer.digest())))?;
            let mut reader = ctx
                .cache
                .get(&key)
                .await?
                .ok_or_else(|| Error::Config(format!("layer blob {} missing from cache", layer.digest())))?;
            let mut compressed = Vec::new();
            reader.read_to_end(&mut compressed).await?;

            let is_gzip = layer.media_type().to_string().contains("gzip");
            let tar_plain = if is_gzip {
                let mut decoder = GzDecoder::new(compressed.as_slice());
                let mut plain = Vec::new();
                decoder.read_to_end(&mut plain)?;
                plain
            } else {
                compressed
            };

            let filtered = self.filter_tar(&tar_plain)?;

            let mut diff_hasher = Sha256::new();
            diff_hasher.update(&filtered);
            let diff_id = format!("sha256:{:x}", diff_hasher.finalize());
            diff_ids.push(diff_id);

            let recompressed = if is_gzip {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&filtered)?;
                encoder.finish()?
            } else {
                filtered
            };

            let mut layer_hasher = Sha256::new();
            layer_hasher.update(&recompressed);
            let new_digest = format!("sha256:{:x}", layer_hasher.finalize());
            let new_size = recompressed.len() as u64;

            let mut new_layer = layer.clone();
            new_layer.set_digest(new_digest.parse().map_err(oci_spec::OciSpecError::from)?);
            new_layer.set_size(new_size);
            new_layers.push(new_layer);

            layer_blobs.push((new_digest, bytes::Bytes::from(recompressed)));
        }
        manifest.set_layers(new_layers);

        let config_digest = manifest.config().digest().to_string();
        let config_key = ocmcache::BlobKey::new(config_digest.clone())
            .ok_or_else(|| Error::Config(format!("invalid config digest {config_digest}")))?;
        let mut config_reader = ctx
            .cache
            .get(&config_key)
            .await?
            .ok_or_else(|| Error::Config("image config missing from cache".to_string()))?;
        let mut config_bytes = Vec::new();
        config_reader.read_to_end(&mut config_bytes).await?;
        let mut config: ImageConfiguration = serde_json::from_slice(&config_bytes)?;
        config.set_rootfs(
            oci_spec::image::RootFsBuilder::default()
                .typ("layers")
                .diff_ids(diff_ids)
                .build()
                .map_err(oci_spec::OciSpecError::from)?,
        );
        let new_config_bytes = serde_json::to_vec(&config)?;
        let mut config_hasher = Sha256::new();
        config_hasher.update(&new_config_bytes);
        let new_config_digest = format!("sha256:{:x}", config_hasher.finalize());
        let mut new_config = manifest.config().clone();
        new_config.set_digest(new_config_digest.clone().parse().map_err(oci_spec::OciSpecError::from)?);
        new_config.set_size(new_config_bytes.len() as u64);
        manifest.set_config(new_config);
        layer_blobs.push((new_config_digest, bytes::Bytes::from(new_config_bytes)));

        let artifact_tar = artifact.serialise(&ctx.cache, &layer_blobs).await?;

        let out_buf = write_envelope_with_optional_blob(&envelope.descriptor, &envelope.resource, Some(artifact_tar))?;
        write_output(output, out_buf).await
    }
}

/// `Executable` stage: delegates to the extension bridge (C5) over whichever
/// transport the stage config selects.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutableTransport {
    #[default]
    Stdio,
    Uds,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutableSpec {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub transport: ExecutableTransport,
}

pub struct ExecutableProcessor {
    spec: ocmbridge::ExtensionSpec,
    transport: ExecutableTransport,
}

impl ExecutableProcessor {
    pub fn from_spec(raw: &serde_json::Value) -> Result<Self, Error> {
        let spec: ExecutableSpec = serde_json::from_value(raw.clone()).map_err(|e| Error::Config(e.to_string()))?;
        if spec.bin.is_empty() {
            return Err(Error::Config("Executable requires a non-empty bin".to_string()));
        }
        Ok(Self {
            spec: ocmbridge::ExtensionSpec { bin: spec.bin, args: spec.args, env: spec.env },
            transport: spec.transport,
        })
    }
}

#[async_trait]
impl ResourceStreamProcessor for ExecutableProcessor {
    async fn process(
        &self,
        ctx: &StageContext,
        input: &mut tokio::fs::File,
        output: &mut tokio::fs::File,
    ) -> Result<(), Error> {
        input.rewind().await?;
        match self.transport {
            ExecutableTransport::Stdio => ocmbridge::run_stdio(&self.spec, input, output).await?,
            ExecutableTransport::Uds => ocmbridge::run_uds(&self.spec, &ctx.work_dir, input, output).await?,
        }
        output.flush().await?;
        output.rewind().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_drops_matching_entries() {
        let filter = OciArtifactFilter {
            patterns: vec![Pattern::new("etc/*").unwrap()],
        };

        let mut builder = tar::Builder::new(Vec::new());
        let mut add = |path: &str, content: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, path, content).unwrap();
        };
        add("usr/bin/x", b"binary");
        add("etc/passwd", b"root:x:0:0");
        let tar_bytes = builder.into_inner().unwrap();

        let filtered = filter.filter_tar(&tar_bytes).unwrap();
        let mut archive = tar::Archive::new(Cursor::new(filtered));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["usr/bin/x".to_string()]);
    }

    #[test]
    fn empty_remove_patterns_rejected() {
        let raw = serde_json::json!({ "removePatterns": [] });
        assert!(OciArtifactFilter::from_spec(&raw).is_err());
    }
}
