//! Atomic file system primitives.
//!
//! Files and artifact directories are staged under a hidden temporary name in their final parent
//! directory and renamed into place, so readers see either the previous or the new content.

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::storage::StorageError;

fn staging_path(parent: &Path) -> PathBuf {
    parent.join(format!(".tmp-{}", Uuid::new_v4()))
}

fn parent_of(path: &Path) -> Result<&Path, StorageError> {
    path.parent().ok_or_else(|| StorageError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"),
    })
}

/// Maps an I/O error on `path` to a [`StorageError`].
pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            StorageError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Writes `bytes` to `path` by writing a temporary sibling and renaming it.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = parent_of(path)?;
    fs::create_dir_all(parent).await.map_err(io_error(parent))?;

    let tmp = staging_path(parent);
    if let Err(err) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_error(&tmp)(err));
    }
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_error(path)(err));
    }
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically to `path`.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await
}

/// Reads and deserializes the JSON file at `path`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let bytes = fs::read(path).await.map_err(io_error(path))?;
    serde_json::from_slice(&bytes).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// A directory swapped into place by [`swap_dir()`].
///
/// The replaced directory is kept aside until the swap is either committed or rolled back.
#[must_use]
#[derive(Debug)]
pub struct DirSwap {
    dir: PathBuf,
    aside: Option<PathBuf>,
}

impl DirSwap {
    /// Removes the replaced directory.
    pub async fn commit(self) {
        if let Some(aside) = self.aside {
            if let Err(err) = fs::remove_dir_all(&aside).await {
                warn!("failed to remove replaced artifact directory {:?}: {}", aside, err);
            }
        }
    }

    /// Removes the new directory and restores the replaced one, if any.
    pub async fn rollback(self) -> Result<(), StorageError> {
        fs::remove_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;
        if let Some(aside) = &self.aside {
            fs::rename(aside, &self.dir)
                .await
                .map_err(io_error(&self.dir))?;
        }
        Ok(())
    }
}

/// Creates the directory `dir` with the given files, replacing an existing directory.
///
/// The files are written into a staging directory next to `dir` which is then renamed to `dir`.
/// An existing `dir` is first moved aside and stays there until the returned [`DirSwap`] is
/// committed or rolled back.
pub async fn swap_dir(dir: &Path, files: &[(&str, Vec<u8>)]) -> Result<DirSwap, StorageError> {
    let parent = parent_of(dir)?;
    fs::create_dir_all(parent).await.map_err(io_error(parent))?;

    let staging = staging_path(parent);
    if let Err(err) = stage_files(&staging, files).await {
        let _ = fs::remove_dir_all(&staging).await;
        return Err(err);
    }

    let aside = match fs::metadata(dir).await {
        Ok(_) => {
            let aside = staging_path(parent);
            if let Err(err) = fs::rename(dir, &aside).await {
                let _ = fs::remove_dir_all(&staging).await;
                return Err(io_error(dir)(err));
            }
            Some(aside)
        }
        Err(_) => None,
    };

    if let Err(err) = fs::rename(&staging, dir).await {
        if let Some(aside) = &aside {
            let _ = fs::rename(aside, dir).await;
        }
        let _ = fs::remove_dir_all(&staging).await;
        return Err(io_error(dir)(err));
    }

    Ok(DirSwap {
        dir: dir.to_path_buf(),
        aside,
    })
}

async fn stage_files(staging: &Path, files: &[(&str, Vec<u8>)]) -> Result<(), StorageError> {
    fs::create_dir(staging).await.map_err(io_error(staging))?;
    for (name, bytes) in files {
        let path = staging.join(name);
        fs::write(&path, bytes).await.map_err(io_error(&path))?;
    }
    Ok(())
}

/// Lists the names of the sub-directories of `dir`. A missing `dir` has no sub-directories.
pub async fn list_dirs(dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(dir)(err)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error(dir))? {
        let is_dir = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}
