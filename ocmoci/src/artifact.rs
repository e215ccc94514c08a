//! OCI artifact codec (C3, spec.md §4.3): `Artifact = Manifest | Index`,
//! serialised to and from the fixed tar shape backed by [`ocmcache::BlobCache`]:
//! `manifest.json` or `index.json` at the root plus `blobs/<algo>/<hex>` entries.

use std::io::Cursor;

use bytes::Bytes;
use oci_spec::image::{ImageIndex, ImageManifest};
use ocmcache::{BlobCache, BlobKey};
use sha2::{Digest as _, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cache error: {0}")]
    Cache(#[from] ocmcache::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),
    #[error("tar archive missing required entry: {0}")]
    MissingEntry(&'static str),
    #[error("digest mismatch for blob {expected}: computed {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("unrecognised artifact root entry: {0}")]
    UnrecognisedRoot(String),
}

#[derive(Debug, Clone)]
pub enum Artifact {
    Manifest(ImageManifest),
    Index(ImageIndex),
}

impl Artifact {
    pub fn media_type(&self) -> Option<String> {
        match self {
            Artifact::Manifest(m) => m.media_type().as_ref().map(|mt| mt.to_string()),
            Artifact::Index(i) => i.media_type().as_ref().map(|mt| mt.to_string()),
        }
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, Error> {
        let v = match self {
            Artifact::Manifest(m) => serde_json::to_vec(m)?,
            Artifact::Index(i) => serde_json::to_vec(i)?,
        };
        Ok(v)
    }

    /// The digest of the manifest/index document itself, recomputed from its
    /// canonical JSON bytes rather than trusted from an input field.
    pub fn digest(&self) -> Result<String, Error> {
        let bytes = self.canonical_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Write this artifact plus every blob it references into `cache`, then
    /// return a tar stream of the fixed envelope shape.
    pub async fn serialise(&self, cache: &BlobCache, layer_blobs: &[(String, Bytes)]) -> Result<Vec<u8>, Error> {
        let bytes = self.canonical_bytes()?;
        let root_name = match self {
            Artifact::Manifest(_) => "manifest.json",
            Artifact::Index(_) => "index.json",
        };

        let mut builder = tar::Builder::new(Vec::new());
        append_bytes(&mut builder, root_name, &bytes)?;

        for (digest, blob) in layer_blobs {
            let key = BlobKey::new(digest.clone()).ok_or_else(|| Error::UnrecognisedRoot(digest.clone()))?;
            cache.add(&key, Cursor::new(blob.to_vec())).await?;
            let path = format!("blobs/{}", key.encoded().replacen(':', "/", 1));
            append_bytes(&mut builder, &path, blob)?;
        }

        Ok(builder.into_inner()?)
    }

    /// Parse the fixed envelope shape, verifying every `blobs/<algo>/<hex>`
    /// entry's content against its filename digest and seeding `cache` with it.
    pub async fn deserialise(tar_bytes: &[u8], cache: &BlobCache) -> Result<Self, Error> {
        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        let mut root: Option<(String, Vec<u8>)> = None;
        let mut blobs = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut buf)?;

            if path == "manifest.json" || path == "index.json" {
                root = Some((path, buf));
            } else if let Some(rest) = path.strip_prefix("blobs/") {
                let digest = rest.replacen('/', ":", 1);
                verify_digest(&digest, &buf)?;
                blobs.push((digest, buf));
            }
        }

        let (root_name, root_bytes) = root.ok_or(Error::MissingEntry("manifest.json or index.json"))?;

        for (digest, content) in blobs {
            let key = BlobKey::new(digest.clone()).ok_or_else(|| Error::UnrecognisedRoot(digest))?;
            cache.add(&key, Cursor::new(content)).await?;
        }

        match root_name.as_str() {
            "manifest.json" => Ok(Artifact::Manifest(serde_json::from_slice(&root_bytes)?)),
            "index.json" => Ok(Artifact::Index(serde_json::from_slice(&root_bytes)?)),
            other => Err(Error::UnrecognisedRoot(other.to_string())),
        }
    }
}

fn verify_digest(expected: &str, content: &[u8]) -> Result<(), Error> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let actual = format!("sha256:{:x}", hasher.finalize());
    if actual != expected {
        return Err(Error::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn append_bytes(builder: &mut tar::Builder<Vec<u8>>, path: &str, bytes: &[u8]) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::ImageManifestBuilder;

    #[tokio::test]
    async fn manifest_roundtrips_through_tar() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 10_000_000).unwrap();

        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .config(oci_spec::image::DescriptorBuilder::default()
                .media_type(oci_spec::image::MediaType::ImageConfig)
                .digest("sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".parse::<oci_spec::image::Digest>().unwrap())
                .size(0u64)
                .build()
                .unwrap())
            .layers(Vec::<oci_spec::image::Descriptor>::new())
            .build()
            .unwrap();
        let artifact = Artifact::Manifest(manifest);

        let tar_bytes = artifact.serialise(&cache, &[]).await.unwrap();
        let back = Artifact::deserialise(&tar_bytes, &cache).await.unwrap();
        assert_eq!(artifact.digest().unwrap(), back.digest().unwrap());
    }

    #[tokio::test]
    async fn deserialise_rejects_tampered_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 10_000_000).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        append_bytes(&mut builder, "manifest.json", b"{}").unwrap();
        append_bytes(&mut builder, "blobs/sha256/deadbeef", b"not the right content").unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let err = Artifact::deserialise(&tar_bytes, &cache).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }
}
