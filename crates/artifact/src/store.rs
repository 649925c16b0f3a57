use std::path::{Path, PathBuf};

use crate::{Artifact, ArtifactError};

/// File name used when every request maps to the same artifact.
pub const DEFAULT_ARTIFACT_NAME: &str = "backup.dump";

/// Longest accepted backup identifier when identifiers select files.
const MAX_BACKUP_ID_LEN: usize = 128;

/// How a backup identifier maps to a file in the storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactNaming {
    /// One well-known file; the identifier is accepted but not used.
    Fixed(String),
    /// One file per identifier: `<backup_id>.<extension>`.
    PerBackupId { extension: String },
}

impl Default for ArtifactNaming {
    fn default() -> Self {
        Self::Fixed(DEFAULT_ARTIFACT_NAME.into())
    }
}

/// Resolves artifact locations inside the backup storage directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    naming: ArtifactNaming,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, naming: ArtifactNaming) -> Self {
        Self {
            dir: dir.into(),
            naming,
        }
    }

    /// The storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the canonical artifact path for `backup_id`.
    pub fn path_for(&self, backup_id: &str) -> Result<PathBuf, ArtifactError> {
        match &self.naming {
            ArtifactNaming::Fixed(name) => Ok(self.dir.join(name)),
            ArtifactNaming::PerBackupId { extension } => {
                validate_backup_id(backup_id)?;
                let name = if extension.is_empty() {
                    backup_id.to_string()
                } else {
                    format!("{backup_id}.{extension}")
                };
                Ok(self.dir.join(name))
            }
        }
    }

    /// Returns the artifact at `path` if a regular file exists there.
    pub async fn existing(&self, path: &Path) -> Result<Option<Artifact>, ArtifactError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(Artifact::stat(path).await?)),
            Ok(_) => Err(ArtifactError::Io(std::io::Error::other(format!(
                "{} is not a regular file",
                path.display()
            )))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validates an identifier that will become a file name.
///
/// Only ASCII letters, digits, `.`, `_` and `-` are accepted, so no
/// identifier can name a directory or escape the storage directory.
pub fn validate_backup_id(id: &str) -> Result<(), ArtifactError> {
    if id.is_empty() {
        return Err(ArtifactError::InvalidId("empty backup id".into()));
    }

    if id.len() > MAX_BACKUP_ID_LEN {
        return Err(ArtifactError::InvalidId(format!(
            "backup id too long: {} bytes (max {MAX_BACKUP_ID_LEN})",
            id.len()
        )));
    }

    if id == "." || id == ".." {
        return Err(ArtifactError::InvalidId(format!(
            "reserved name not allowed: {id}"
        )));
    }

    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ArtifactError::InvalidId(format!(
            "character {c:?} not allowed in {id:?}"
        )));
    }

    Ok(())
}
