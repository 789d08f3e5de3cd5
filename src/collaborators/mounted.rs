//! Remote storage backed by a mounted or synced directory.
//!
//! Folder ids are `/`-separated paths relative to the mount root; the empty
//! id is the root itself.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::collaborators::{RemoteFile, RemoteStorage};
use crate::error::CollaboratorError;
use crate::pipeline::layout::sanitize_name;

#[derive(Debug, Clone)]
pub struct MountedStorage {
    root: PathBuf,
}

impl MountedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CollaboratorError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CollaboratorError::NotFound(format!(
                "remote storage root {} is not a directory",
                root.display()
            )));
        }
        info!(root = %root.display(), "Using mounted remote storage");
        Ok(Self { root })
    }

    /// Resolve a folder id to a path under the root, rejecting ids that
    /// would escape it.
    fn resolve(&self, id: &str) -> Result<PathBuf, CollaboratorError> {
        let relative = Path::new(id.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CollaboratorError::Validation(format!("invalid folder id '{id}'")));
        }
        Ok(self.root.join(relative))
    }

    fn join_id(parent: &str, name: &str) -> String {
        let parent = parent.trim_matches('/');
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }
}

impl RemoteStorage for MountedStorage {
    fn create_folder(&self, name: &str, parent: &str) -> Result<String, CollaboratorError> {
        let name = sanitize_name(name);
        let id = Self::join_id(parent, &name);
        let path = self.resolve(&id)?;
        fs::create_dir_all(&path)?;
        debug!(folder = %id, "Created remote folder");
        Ok(id)
    }

    fn upload_file(&self, path: &Path, folder_id: &str) -> Result<(), CollaboratorError> {
        let folder = self.resolve(folder_id)?;
        if !folder.is_dir() {
            return Err(CollaboratorError::NotFound(format!(
                "remote folder '{folder_id}' does not exist"
            )));
        }
        let file_name = path.file_name().ok_or_else(|| {
            CollaboratorError::Validation(format!("{} has no file name", path.display()))
        })?;
        fs::copy(path, folder.join(file_name))?;
        debug!(file = %path.display(), folder = %folder_id, "Uploaded file");
        Ok(())
    }

    fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, CollaboratorError> {
        let folder = self.resolve(folder_id)?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&folder)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            files.push(RemoteFile {
                id: Self::join_id(folder_id, &name),
                name,
                mime_type: None,
            });
        }
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    fn fetch_file(&self, file: &RemoteFile, dest_dir: &Path) -> Result<PathBuf, CollaboratorError> {
        let source = self.resolve(&file.id)?;
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(&file.name);
        fs::copy(&source, &dest)?;
        Ok(dest)
    }

    fn folder_url(&self, folder_id: &str) -> Option<String> {
        self.resolve(folder_id)
            .ok()
            .map(|p| format!("file://{}", p.display()))
    }
}
