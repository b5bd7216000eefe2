//! Add-on packages on disk: manifests, checksums and tarballs

pub mod checksum;
pub mod manifest;
pub mod package;

pub use manifest::{AddonRecord, LoadedManifest, ManifestContext, ManifestError, load_manifest};
pub use package::{FileFetcher, HttpFetcher, PackageFetcher};
