//! In-process object storage for development and tests.

use std::sync::Arc;

use dashmap::DashMap;

use sluice_kernel::config::FilesystemConfig;
use sluice_kernel::{FilesystemProvider, MemoryObjectClient, ObjectClient, ObjectClientFactory, VfsError, VfsResult};

/// Hands out one [`MemoryObjectClient`] per bucket, shared by every session.
#[derive(Debug, Default)]
pub struct MemoryObjects {
    buckets: DashMap<String, Arc<MemoryObjectClient>>,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client behind `provider`'s `bucket`, if any session created it.
    pub fn bucket(&self, provider: FilesystemProvider, bucket: &str) -> Option<Arc<MemoryObjectClient>> {
        self.buckets
            .get(&format!("{provider}/{bucket}"))
            .map(|c| c.value().clone())
    }
}

fn bucket_name(fs: &FilesystemConfig) -> Option<&str> {
    let name = match fs.provider {
        FilesystemProvider::S3 => &fs.s3.bucket,
        FilesystemProvider::Gcs => &fs.gcs.bucket,
        FilesystemProvider::Azure => &fs.azure.container,
        _ => return None,
    };
    (!name.is_empty()).then_some(name.as_str())
}

impl ObjectClientFactory for MemoryObjects {
    fn client(&self, fs: &FilesystemConfig) -> VfsResult<Arc<dyn ObjectClient>> {
        let bucket = bucket_name(fs)
            .ok_or_else(|| VfsError::unsupported(format!("{} filesystem without a bucket", fs.provider)))?;
        let client: Arc<dyn ObjectClient> = self
            .buckets
            .entry(format!("{}/{bucket}", fs.provider))
            .or_insert_with(|| Arc::new(MemoryObjectClient::new()))
            .clone();
        Ok(client)
    }
}
