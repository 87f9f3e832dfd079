//! VFS backends.
//!
//! Backends implement [`Fs`] for different storage types. [`build_fs`]
//! picks one from a user's filesystem configuration.

mod local;
mod memory;
mod object;

pub use local::LocalBackend;
pub use memory::MemoryObjectClient;
pub use object::{
    DEFAULT_PART_SIZE, ObjectClient, ObjectError, ObjectListing, ObjectMeta, ObjectStoreBackend, UploadOptions,
};

use std::sync::Arc;

use super::{Fs, VfsError, VfsResult};
use crate::config::{FilesystemConfig, FilesystemProvider, Settings};
use crate::retry::ObjectStoreRetryer;
use crate::user::User;

/// Produces a storage client for an object-store configuration.
///
/// The server owns credentials and SDK wiring; the kernel only needs
/// something that speaks [`ObjectClient`].
pub trait ObjectClientFactory: Send + Sync {
    fn client(&self, fs: &FilesystemConfig) -> VfsResult<Arc<dyn ObjectClient>>;
}

/// Build the backend serving `user`'s files.
pub fn build_fs(
    user: &User,
    settings: &Settings,
    objects: Option<&dyn ObjectClientFactory>,
) -> VfsResult<Arc<dyn Fs>> {
    let config = &user.filesystem;
    match config.provider {
        FilesystemProvider::Local => {
            let backend = user
                .virtual_folders
                .iter()
                .fold(LocalBackend::new(&user.home_dir), |backend, folder| {
                    backend.with_folder(&folder.virtual_path, &folder.mapped_path)
                });
            Ok(Arc::new(backend))
        }
        provider if provider.is_object_store() => {
            let factory = objects.ok_or_else(|| {
                VfsError::unsupported(format!("no {provider} client configured"))
            })?;
            let client = factory.client(config)?;
            let retry = Arc::new(ObjectStoreRetryer::from_config(&settings.retry));
            Ok(Arc::new(ObjectStoreBackend::new(config, client, retry)?))
        }
        FilesystemProvider::Invalid => Err(VfsError::unsupported("invalid filesystem provider")),
        provider => Err(VfsError::unsupported(format!("{provider} filesystem"))),
    }
}
