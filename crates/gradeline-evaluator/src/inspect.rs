use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gradeline_types::ArtifactReference;

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("artifact not available: {0}")]
    NotFound(String),

    #[error("path escapes the artifact: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const LICENSE_FILES: [&str; 5] = ["LICENSE", "LICENSE.md", "LICENSE.txt", "LICENCE", "COPYING"];

/// Read-only view of a submitted artifact's metadata and files.
#[async_trait]
pub trait ArtifactInspector: Send + Sync {
    /// SPDX-like identifier of the license, `None` when no license file exists.
    async fn license(&self, artifact: &ArtifactReference) -> Result<Option<String>, InspectError>;

    async fn created_at(
        &self,
        artifact: &ArtifactReference,
    ) -> Result<Option<DateTime<Utc>>, InspectError>;

    async fn file_exists(&self, artifact: &ArtifactReference, path: &str)
    -> Result<bool, InspectError>;

    async fn read_file(&self, artifact: &ArtifactReference, path: &str)
    -> Result<String, InspectError>;
}

/// Inspects local checkouts at `<root>/<repository name>`.
#[derive(Debug, Clone)]
pub struct LocalCheckoutInspector {
    root: PathBuf,
}

impl LocalCheckoutInspector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn checkout(&self, artifact: &ArtifactReference) -> Result<PathBuf, InspectError> {
        let name = artifact
            .repository_name()
            .ok_or_else(|| InspectError::NotFound(artifact.repo_url.clone()))?;
        let mut components = Path::new(name).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single || name.contains('\\') {
            return Err(InspectError::InvalidPath(name.to_string()));
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(InspectError::NotFound(dir.display().to_string()));
        }
        Ok(dir)
    }

    fn resolve(&self, artifact: &ArtifactReference, path: &str) -> Result<PathBuf, InspectError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(InspectError::InvalidPath(path.to_string()));
        }
        Ok(self.checkout(artifact)?.join(relative))
    }
}

#[async_trait]
impl ArtifactInspector for LocalCheckoutInspector {
    async fn license(&self, artifact: &ArtifactReference) -> Result<Option<String>, InspectError> {
        let dir = self.checkout(artifact)?;
        for name in LICENSE_FILES {
            let path = dir.join(name);
            if tokio::fs::try_exists(&path).await? {
                let text = tokio::fs::read_to_string(&path).await?;
                return Ok(Some(classify_license(&text).to_string()));
            }
        }
        Ok(None)
    }

    async fn created_at(
        &self,
        artifact: &ArtifactReference,
    ) -> Result<Option<DateTime<Utc>>, InspectError> {
        let dir = self.checkout(artifact)?;
        let meta = tokio::fs::metadata(&dir).await?;
        // Not every filesystem records birth time.
        let time = meta.created().or_else(|_| meta.modified()).ok();
        Ok(time.map(DateTime::<Utc>::from))
    }

    async fn file_exists(
        &self,
        artifact: &ArtifactReference,
        path: &str,
    ) -> Result<bool, InspectError> {
        let path = self.resolve(artifact, path)?;
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn read_file(
        &self,
        artifact: &ArtifactReference,
        path: &str,
    ) -> Result<String, InspectError> {
        let full = self.resolve(artifact, path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(InspectError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `MIT`, `Apache-2.0` or `other`.
pub fn classify_license(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if lower.contains("mit license") || lower.contains("permission is hereby granted, free of charge")
    {
        "MIT"
    } else if lower.contains("apache license") {
        "Apache-2.0"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn artifact() -> ArtifactReference {
        ArtifactReference::new("https://github.com/a/sales-summary.git")
    }

    #[tokio::test]
    async fn test_local_checkout_license_and_files() {
        let root = tempdir().unwrap();
        let repo = root.path().join("sales-summary");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("LICENSE"), "MIT License\n\nCopyright (c) 2025").unwrap();
        std::fs::write(repo.join("README.md"), "# Sales summary").unwrap();

        let inspector = LocalCheckoutInspector::new(root.path());
        assert_eq!(inspector.license(&artifact()).await.unwrap().as_deref(), Some("MIT"));
        assert!(inspector.file_exists(&artifact(), "README.md").await.unwrap());
        assert!(!inspector.file_exists(&artifact(), "index.html").await.unwrap());
        assert_eq!(
            inspector.read_file(&artifact(), "README.md").await.unwrap(),
            "# Sales summary"
        );
        assert!(inspector.created_at(&artifact()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_license_and_checkout() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("sales-summary")).unwrap();
        let inspector = LocalCheckoutInspector::new(root.path());
        assert_eq!(inspector.license(&artifact()).await.unwrap(), None);

        let other = ArtifactReference::new("https://github.com/a/missing");
        assert!(matches!(
            inspector.license(&other).await,
            Err(InspectError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_checkout() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("sales-summary")).unwrap();
        let inspector = LocalCheckoutInspector::new(root.path());
        assert!(matches!(
            inspector.read_file(&artifact(), "../secret").await,
            Err(InspectError::InvalidPath(_))
        ));
        assert!(matches!(
            inspector.file_exists(&artifact(), "/etc/passwd").await,
            Err(InspectError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_repository_name_cannot_escape_root() {
        let state = tempdir().unwrap();
        let root = state.path().join("checkouts");
        std::fs::create_dir_all(root.join("sales-summary")).unwrap();
        std::fs::write(state.path().join("LICENSE"), "MIT License").unwrap();
        std::fs::write(state.path().join("config.toml"), "secret = \"operator-only\"").unwrap();
        let inspector = LocalCheckoutInspector::new(&root);

        for url in ["https://github.com/a/..", "https://github.com/a/.", "https://github.com/a/..\\x"] {
            let escaping = ArtifactReference::new(url);
            assert!(matches!(
                inspector.license(&escaping).await,
                Err(InspectError::InvalidPath(_))
            ));
            assert!(matches!(
                inspector.read_file(&escaping, "config.toml").await,
                Err(InspectError::InvalidPath(_))
            ));
            assert!(matches!(
                inspector.created_at(&escaping).await,
                Err(InspectError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn test_classify_license() {
        assert_eq!(classify_license("Apache License\nVersion 2.0"), "Apache-2.0");
        assert_eq!(classify_license("Permission is hereby granted, free of charge, to any"), "MIT");
        assert_eq!(classify_license("All rights reserved"), "other");
    }
}
