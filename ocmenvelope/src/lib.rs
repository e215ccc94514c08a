//! Processor Envelope Codec (C2, spec.md §4.2): the tar-framed wire format
//! stages exchange. Three well-known entries, in any order:
//! `component-descriptor.yaml`, `resource.yaml`, optional `resource-blob`.
//!
//! Encoding/decoding is synchronous (`tar` builds on `std::io`); callers that
//! need to stream to/from an async child process materialise the envelope to
//! a temp file first, per spec.md §4.6's "between stages the envelope is
//! materialised to a fresh temp file" rule.

use std::io::{Read, Write};

use ocmoci::{Descriptor, Resource};

const DESCRIPTOR_ENTRY: &str = "component-descriptor.yaml";
const RESOURCE_ENTRY: &str = "resource.yaml";
const BLOB_ENTRY: &str = "resource-blob";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("envelope missing required entry: {0}")]
    MissingEntry(&'static str),
}

/// A decoded envelope. `blob` is materialised to a seekable, independently
/// closable temp file rather than held in memory.
pub struct Envelope {
    pub descriptor: Descriptor,
    pub resource: Resource,
    pub blob: Option<tempfile::NamedTempFile>,
}

/// Write the three fixed entries to `writer`, in that order. `blob_reader`
/// is omitted entirely (no `resource-blob` entry) when `None`.
pub fn write(
    descriptor: &Descriptor,
    resource: &Resource,
    blob_reader: Option<&mut (impl Read + ?Sized)>,
    writer: impl Write,
) -> Result<(), Error> {
    let mut builder = tar::Builder::new(writer);

    let descriptor_yaml = serde_yaml::to_vec(descriptor)?;
    append(&mut builder, DESCRIPTOR_ENTRY, &descriptor_yaml)?;

    let resource_yaml = serde_yaml::to_vec(resource)?;
    append(&mut builder, RESOURCE_ENTRY, &resource_yaml)?;

    if let Some(reader) = blob_reader {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        append(&mut builder, BLOB_ENTRY, &buf)?;
    }

    builder.finish()?;
    Ok(())
}

/// Parse an envelope from `reader`. Entries other than the three fixed names
/// are ignored, per spec.md §4.2. The blob, if present, is materialised to a
/// temp file.
pub fn read(reader: impl Read) -> Result<Envelope, Error> {
    let mut archive = tar::Archive::new(reader);
    let mut descriptor: Option<Descriptor> = None;
    let mut resource: Option<Resource> = None;
    let mut blob: Option<tempfile::NamedTempFile> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        match path.as_str() {
            DESCRIPTOR_ENTRY => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                descriptor = Some(serde_yaml::from_slice(&buf)?);
            }
            RESOURCE_ENTRY => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                resource = Some(serde_yaml::from_slice(&buf)?);
            }
            BLOB_ENTRY => {
                let mut file = tempfile::NamedTempFile::new()?;
                std::io::copy(&mut entry, &mut file)?;
                file.flush()?;
                blob = Some(file);
            }
            _ => {
                log::debug!("ignoring unknown envelope entry {path}");
            }
        }
    }

    Ok(Envelope {
        descriptor: descriptor.ok_or(Error::MissingEntry(DESCRIPTOR_ENTRY))?,
        resource: resource.ok_or(Error::MissingEntry(RESOURCE_ENTRY))?,
        blob,
    })
}

fn append(builder: &mut tar::Builder<impl Write>, name: &str, bytes: &[u8]) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmoci::model::{Access, Relation};
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn sample() -> (Descriptor, Resource) {
        let resource = Resource {
            name: "image".to_string(),
            version: "1.0.0".to_string(),
            kind: "ociImage".to_string(),
            relation: Relation::External,
            digest: None,
            labels: None,
            extra_identity: BTreeMap::new(),
            access: Access::OciRegistry {
                image_reference: "example.com/foo:1.0.0".to_string(),
            },
        };
        let descriptor = Descriptor {
            name: "github.com/acme/component".to_string(),
            version: "1.0.0".to_string(),
            resources: vec![resource.clone()],
            sources: vec![],
            component_references: vec![],
            repository_contexts: vec![],
            signatures: vec![],
        };
        (descriptor, resource)
    }

    #[test]
    fn roundtrips_without_blob() {
        let (descriptor, resource) = sample();
        let mut buf = Vec::new();
        write(&descriptor, &resource, None::<&mut &[u8]>, &mut buf).unwrap();

        let envelope = read(Cursor::new(buf)).unwrap();
        assert_eq!(envelope.descriptor.name, descriptor.name);
        assert_eq!(envelope.resource.name, resource.name);
        assert!(envelope.blob.is_none());
    }

    #[test]
    fn roundtrips_with_blob() {
        let (descriptor, resource) = sample();
        let mut buf = Vec::new();
        let mut blob: &[u8] = b"binary payload";
        write(&descriptor, &resource, Some(&mut blob), &mut buf).unwrap();

        let mut envelope = read(Cursor::new(buf)).unwrap();
        let mut out = Vec::new();
        envelope.blob.as_mut().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"binary payload");
    }

    #[test]
    fn unknown_entries_are_ignored() {
        let (descriptor, resource) = sample();
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, DESCRIPTOR_ENTRY, &serde_yaml::to_vec(&descriptor).unwrap()).unwrap();
        append(&mut builder, RESOURCE_ENTRY, &serde_yaml::to_vec(&resource).unwrap()).unwrap();
        append(&mut builder, "extra-metadata.json", b"{}").unwrap();
        let buf = builder.into_inner().unwrap();

        let envelope = read(Cursor::new(buf)).unwrap();
        assert_eq!(envelope.descriptor.name, descriptor.name);
    }

    #[test]
    fn missing_resource_entry_is_an_error() {
        let (descriptor, _resource) = sample();
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, DESCRIPTOR_ENTRY, &serde_yaml::to_vec(&descriptor).unwrap()).unwrap();
        let buf = builder.into_inner().unwrap();

        let err = read(Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::MissingEntry(RESOURCE_ENTRY)));
    }
}
