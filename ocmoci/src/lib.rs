//! Component descriptor data model, OCI artifact codec, and registry client
//! (spec.md §3, §4.3, §6).

pub mod artifact;
pub mod model;
pub mod registry;

pub use artifact::Artifact;
pub use model::{Access, ComponentReference, Descriptor, DigestSpec, RepositoryContext, Resource, SignatureSpec};
pub use registry::{Digester, HttpRegistryClient, RegistryClient, SharedRegistryClient};
