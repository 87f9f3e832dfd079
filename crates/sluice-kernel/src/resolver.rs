//! Virtual path to object-store key resolution.
//!
//! Both the object-store backend and the path-translation operation go
//! through [`resolve_key`], so confinement under the key prefix is checked
//! the same way on every call path.

use serde::Serialize;

use crate::config::{FilesystemConfig, FilesystemProvider};
use crate::vfs::path::clean_path;
use crate::vfs::{VfsError, VfsResult};

/// Where a virtual path lives on an object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedObject {
    pub provider: FilesystemProvider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub bucket: String,
    pub key: String,
}

/// The directory every key for `key_prefix` must lie under, as an
/// absolute cleaned path.
pub fn prefix_root(key_prefix: &str) -> String {
    clean_path(&format!("/{key_prefix}"))
}

/// Join `file_path` under `key_prefix` and reject anything that does not
/// stay strictly inside it.
///
/// The prefix is compared as `clean(prefix) + "/"`, so `users/test1`
/// never matches `users/test12/x`, and the prefix directory itself is not
/// a valid key.
pub fn resolve_key(key_prefix: &str, file_path: &str) -> VfsResult<String> {
    // `..` is resolved against the prefix, never against `/`.
    let key = clean_path(&format!("/{key_prefix}/{file_path}"));
    let root = prefix_root(key_prefix);
    let boundary = if root == "/" { root } else { format!("{root}/") };
    if key.len() <= boundary.len() || !key.starts_with(&boundary) {
        return Err(VfsError::path_invalid(file_path));
    }
    Ok(key)
}

/// Resolve a user path to bucket, key and region for the configured
/// object-store provider.
pub fn resolve_object_path(fs: &FilesystemConfig, file_path: &str) -> VfsResult<ResolvedObject> {
    let (bucket, key_prefix, region) = match fs.provider {
        FilesystemProvider::S3 => (&fs.s3.bucket, &fs.s3.key_prefix, fs.s3.region.as_str()),
        FilesystemProvider::Gcs => (&fs.gcs.bucket, &fs.gcs.key_prefix, fs.gcs.region.as_str()),
        FilesystemProvider::Azure => (&fs.azure.container, &fs.azure.key_prefix, ""),
        other => {
            return Err(VfsError::unsupported(format!(
                "path resolution for provider {:?}",
                other
            )));
        }
    };
    let key = resolve_key(key_prefix, file_path)?;
    Ok(ResolvedObject {
        provider: fs.provider,
        region: (!region.is_empty()).then(|| region.to_string()),
        bucket: bucket.clone(),
        key,
    })
}
