//! In-memory object store.
//!
//! Implements [`ObjectClient`] over a sorted map so the object-store
//! backend can be exercised without a network. Faults can be injected per
//! operation name to drive the retry and abort paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use super::object::{ObjectClient, ObjectError, ObjectListing, ObjectMeta, UploadOptions};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: SystemTime,
    custom_time: Option<SystemTime>,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: self.data.len() as u64,
            last_modified: self.last_modified,
            custom_time: self.custom_time,
        }
    }
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
    custom_time: Option<SystemTime>,
}

#[derive(Debug)]
struct Fault {
    operation: String,
    remaining: u32,
    error: ObjectError,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    faults: Vec<Fault>,
    calls: HashMap<String, u32>,
    next_upload: u64,
}

/// Thread-safe in-memory [`ObjectClient`].
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    state: Mutex<State>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing the upload path.
    pub fn insert(&self, key: &str, data: impl Into<Vec<u8>>, custom_time: Option<SystemTime>) {
        self.state.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified: SystemTime::now(),
                custom_time,
            },
        );
    }

    /// Contents of an object, if present.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(key).map(|o| o.data.clone())
    }

    /// Custom time recorded on an object.
    pub fn custom_time(&self, key: &str) -> Option<SystemTime> {
        self.state.lock().objects.get(key).and_then(|o| o.custom_time)
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Fail the next `times` calls of `operation` with `error`.
    pub fn inject_fault(&self, operation: &str, times: u32, error: ObjectError) {
        self.state.lock().faults.push(Fault {
            operation: operation.to_string(),
            remaining: times,
            error,
        });
    }

    /// How many times `operation` has been called.
    pub fn call_count(&self, operation: &str) -> u32 {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Record the call and consume a pending fault for it.
    fn enter(&self, state: &mut State, operation: &str) -> Result<(), ObjectError> {
        *state.calls.entry(operation.to_string()).or_default() += 1;
        let Some(pos) = state
            .faults
            .iter()
            .position(|f| f.operation == operation && f.remaining > 0)
        else {
            return Ok(());
        };
        let fault = &mut state.faults[pos];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            state.faults.remove(pos);
        }
        Err(error)
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn head_object(&self, key: &str) -> Result<ObjectMeta, ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "HeadObject")?;
        state
            .objects
            .get(key)
            .map(|o| o.meta(key))
            .ok_or_else(|| ObjectError::NotFound(key.to_string()))
    }

    async fn get_object_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>, ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "GetObject")?;
        let object = state
            .objects
            .get(key)
            .ok_or_else(|| ObjectError::NotFound(key.to_string()))?;
        let start = (offset as usize).min(object.data.len());
        let end = start.saturating_add(len as usize).min(object.data.len());
        Ok(object.data[start..end].to_vec())
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<(), ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "PutObject")?;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: SystemTime::now(),
                custom_time: None,
            },
        );
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        key: &str,
        options: &UploadOptions,
    ) -> Result<String, ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "CreateMultipartUpload")?;
        state.next_upload += 1;
        let id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
                custom_time: options.custom_time,
            },
        );
        Ok(id)
    }

    async fn upload_part(&self, upload_id: &str, part_number: u32, data: Vec<u8>) -> Result<(), ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "UploadPart")?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectError::service("NoSuchUpload", upload_id))?;
        upload.parts.insert(part_number, data);
        Ok(())
    }

    async fn complete_multipart_upload(&self, upload_id: &str) -> Result<(), ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "CompleteMultipartUpload")?;
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| ObjectError::service("NoSuchUpload", upload_id))?;
        let data = upload.parts.into_values().flatten().collect();
        state.objects.insert(
            upload.key,
            StoredObject {
                data,
                last_modified: SystemTime::now(),
                custom_time: upload.custom_time,
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<(), ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "AbortMultipartUpload")?;
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        max_keys: Option<usize>,
    ) -> Result<ObjectListing, ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "ListObjectsV2")?;
        let limit = max_keys.unwrap_or(usize::MAX);
        let mut listing = ObjectListing::default();
        for (key, object) in state.objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if listing.objects.len() + listing.prefixes.len() >= limit {
                break;
            }
            let rest = &key[prefix.len()..];
            match delimiter.and_then(|d| rest.find(d).map(|i| (d, i))) {
                Some((d, i)) => {
                    let common = format!("{prefix}{}{d}", &rest[..i]);
                    if listing.prefixes.last() != Some(&common) {
                        listing.prefixes.push(common);
                    }
                }
                None => listing.objects.push(object.meta(key)),
            }
        }
        Ok(listing)
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "DeleteObject")?;
        state.objects.remove(key);
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), ObjectError> {
        let mut state = self.state.lock();
        self.enter(&mut state, "CopyObject")?;
        let object = state
            .objects
            .get(from)
            .cloned()
            .ok_or_else(|| ObjectError::NotFound(from.to_string()))?;
        state.objects.insert(to.to_string(), object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delimited_listing() {
        let client = MemoryObjectClient::new();
        client.insert("users/a/", Vec::new(), None);
        client.insert("users/a/one.txt", b"1".to_vec(), None);
        client.insert("users/a/sub/two.txt", b"22".to_vec(), None);
        client.insert("users/a/sub/three.txt", b"333".to_vec(), None);
        client.insert("users/ab/x", b"x".to_vec(), None);

        let listing = client.list_objects("users/a/", Some('/'), None).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["users/a/", "users/a/one.txt"]);
        assert_eq!(listing.prefixes, vec!["users/a/sub/".to_string()]);
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let client = MemoryObjectClient::new();
        let id = client
            .create_multipart_upload("k", &UploadOptions::default())
            .await
            .unwrap();
        client.upload_part(&id, 2, b"world".to_vec()).await.unwrap();
        client.upload_part(&id, 1, b"hello ".to_vec()).await.unwrap();
        assert_eq!(client.pending_uploads(), 1);
        client.complete_multipart_upload(&id).await.unwrap();
        assert_eq!(client.object("k").unwrap(), b"hello world");
        assert_eq!(client.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let client = MemoryObjectClient::new();
        client.insert("k", b"v".to_vec(), None);
        client.inject_fault("HeadObject", 2, ObjectError::service("SlowDown", "slow"));

        assert!(client.head_object("k").await.is_err());
        assert!(client.head_object("k").await.is_err());
        assert!(client.head_object("k").await.is_ok());
        assert_eq!(client.call_count("HeadObject"), 3);
    }
}
