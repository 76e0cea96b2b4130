//! File-backed content-addressed repository.
//!
//! Objects live at `<root>/<first two hex digits>/<rest>`; writes go
//! through a temporary file and are renamed into place, so a
//! half-written object is never visible under its digest. The same
//! type serves as the transfer executor's staging area: staged
//! objects are *promoted* into the main repository by hard link
//! (falling back to copy across filesystems).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use flow_core::{Digest, Error, ErrorKind, Repository};

#[derive(Debug, Clone)]
pub struct FileRepository {
    root: PathBuf,
}

impl FileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileRepository { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &Digest) -> PathBuf {
        let hex = id.hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn io_err(op: &str, e: std::io::Error) -> Error {
        let kind = if e.kind() == std::io::ErrorKind::NotFound {
            ErrorKind::NotExist
        } else {
            ErrorKind::Temporary
        };
        Error::new(kind, op, e.to_string())
    }

    /// Every digest currently stored.
    pub async fn objects(&self) -> Result<Vec<Digest>, Error> {
        let mut out = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Self::io_err("repository list", e)),
        };
        while let Some(dir) = dirs
            .next_entry()
            .await
            .map_err(|e| Self::io_err("repository list", e))?
        {
            let prefix = dir.file_name().to_string_lossy().to_string();
            if prefix.len() != 2 || !dir.path().is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(dir.path())
                .await
                .map_err(|e| Self::io_err("repository list", e))?;
            while let Some(f) = files
                .next_entry()
                .await
                .map_err(|e| Self::io_err("repository list", e))?
            {
                let rest = f.file_name().to_string_lossy().to_string();
                if let Ok(id) = Digest::parse(&format!("{prefix}{rest}")) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    /// Install an object from `other` into this repository under the
    /// same digest. Hard links when possible, copies otherwise. A
    /// no-op when the object is already present.
    pub async fn install_from(&self, other: &FileRepository, id: &Digest) -> Result<(), Error> {
        let dst = self.object_path(id);
        if tokio::fs::metadata(&dst).await.is_ok() {
            return Ok(());
        }
        let src = other.object_path(id);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err("repository install", e))?;
        }
        match tokio::fs::hard_link(&src, &dst).await {
            Ok(()) => Ok(()),
            // Already racing another install, or a cross-device link.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(_) => {
                tokio::fs::copy(&src, &dst)
                    .await
                    .map_err(|e| Self::io_err("repository install", e))?;
                Ok(())
            }
        }
    }

    /// Promote every object from `staging` into this repository, then
    /// clear the staging area.
    pub async fn promote_from(&self, staging: &FileRepository) -> Result<(), Error> {
        for id in staging.objects().await? {
            self.install_from(staging, &id).await?;
        }
        staging.clear().await
    }

    /// Remove all stored objects.
    pub async fn clear(&self) -> Result<(), Error> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err("repository clear", e)),
        }
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn contains(&self, id: &Digest) -> Result<bool, Error> {
        Ok(tokio::fs::metadata(self.object_path(id)).await.is_ok())
    }

    async fn get(&self, id: &Digest) -> Result<Bytes, Error> {
        match tokio::fs::read(self.object_path(id)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_exist(
                "repository get",
                format!("{id} not in repository"),
            )),
            Err(e) => Err(Self::io_err("repository get", e)),
        }
    }

    async fn put(&self, data: Bytes) -> Result<Digest, Error> {
        let id = Digest::from_bytes(&data);
        let dst = self.object_path(&id);
        if tokio::fs::metadata(&dst).await.is_ok() {
            return Ok(id);
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err("repository put", e))?;
        }
        let tmp = self.root.join(format!("tmp.{}", id.hex_n(16)));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Self::io_err("repository put", e))?;
        tokio::fs::rename(&tmp, &dst)
            .await
            .map_err(|e| Self::io_err("repository put", e))?;
        Ok(id)
    }
}
