// Resource providers: sources of readable data served over resources/*

use crate::workspace::Workspace;
use anyhow::{bail, Context, Result};
use base64::Engine;
use tether_core::protocol::{ReadResourceResult, Resource, ResourceContents};
use walkdir::{DirEntry, WalkDir};

/// Something that can enumerate and read resources under one URI scheme.
#[async_trait::async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Whether this provider owns `uri`.
    fn handles(&self, uri: &str) -> bool;

    async fn list(&self) -> Result<Vec<Resource>>;

    async fn read(&self, uri: &str) -> Result<ReadResourceResult>;
}

/// Directories never descended into while listing.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

/// Files under the workspace root, exposed as `file://` resources.
pub struct WorkspaceResources {
    workspace: Workspace,
    max_depth: usize,
    max_resources: usize,
}

impl WorkspaceResources {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            max_depth: 8,
            max_resources: 500,
        }
    }

    pub fn with_limits(mut self, max_depth: usize, max_resources: usize) -> Self {
        self.max_depth = max_depth;
        self.max_resources = max_resources;
        self
    }

    fn is_skipped(entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .map(|name| SKIPPED_DIRS.contains(&name))
                .unwrap_or(false)
    }

    fn scan(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let walker = WalkDir::new(self.workspace.root())
            .max_depth(self.max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !Self::is_skipped(e));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = self.workspace.relative(entry.path());
            if Workspace::is_denied(&relative) {
                continue;
            }
            if resources.len() == self.max_resources {
                break;
            }

            let mime = mime_guess::from_path(entry.path()).first_or_octet_stream();
            resources.push(Resource {
                uri: self.workspace.uri_for(entry.path())?,
                name: relative,
                title: None,
                description: None,
                mime_type: Some(mime.essence_str().to_string()),
                size: entry.metadata().ok().map(|m| m.len()),
            });
        }
        Ok(resources)
    }
}

#[async_trait::async_trait]
impl ResourceProvider for WorkspaceResources {
    fn handles(&self, uri: &str) -> bool {
        uri.starts_with("file://")
    }

    async fn list(&self) -> Result<Vec<Resource>> {
        let scanner = Self {
            workspace: self.workspace.clone(),
            max_depth: self.max_depth,
            max_resources: self.max_resources,
        };
        tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .context("Workspace scan task failed")?
    }

    async fn read(&self, uri: &str) -> Result<ReadResourceResult> {
        let path = self.workspace.path_for_uri(uri)?;
        if path.is_dir() {
            bail!("{} is a directory", uri);
        }

        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", self.workspace.relative(&path)))?;
        let mime = mime_guess::from_path(&path).first_or_octet_stream();

        let contents = match String::from_utf8(bytes) {
            Ok(text) => ResourceContents::text(uri, Some(mime.essence_str().to_string()), text),
            Err(e) => ResourceContents {
                uri: uri.to_string(),
                mime_type: Some(mime.essence_str().to_string()),
                text: None,
                blob: Some(base64::engine::general_purpose::STANDARD.encode(e.as_bytes())),
            },
        };
        Ok(ReadResourceResult {
            contents: vec![contents],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, WorkspaceResources) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("docs/guide.md"), "# Guide").unwrap();
        std::fs::write(root.join("logo.png"), [0x89, 0x50, 0x4e, 0x47, 0xff, 0xfe]).unwrap();
        std::fs::write(root.join(".env"), "SECRET=1").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        let provider = WorkspaceResources::new(Workspace::open(root).unwrap());
        (temp_dir, provider)
    }

    #[tokio::test]
    async fn test_list_skips_secrets_and_vcs() {
        let (_dir, provider) = fixture();

        let resources = provider.list().await.unwrap();
        let names: Vec<_> = resources.iter().map(|r| r.name.as_str()).collect();

        assert_eq!(names, vec!["docs/guide.md", "logo.png"]);
        assert!(resources[0].mime_type.as_deref().unwrap().starts_with("text/"));
        assert_eq!(resources[0].size, Some(7));
        assert!(provider.handles(&resources[0].uri));
    }

    #[tokio::test]
    async fn test_read_text_and_binary() {
        let (_dir, provider) = fixture();
        let resources = provider.list().await.unwrap();

        let guide = provider.read(&resources[0].uri).await.unwrap();
        assert_eq!(guide.contents[0].text.as_deref(), Some("# Guide"));

        let logo = provider.read(&resources[1].uri).await.unwrap();
        assert!(logo.contents[0].text.is_none());
        assert_eq!(logo.contents[0].mime_type.as_deref(), Some("image/png"));
        assert!(logo.contents[0].blob.is_some());
    }

    #[tokio::test]
    async fn test_read_outside_workspace_fails() {
        let (_dir, provider) = fixture();
        let other = TempDir::new().unwrap();
        std::fs::write(other.path().join("x.txt"), "x").unwrap();
        let uri = url::Url::from_file_path(other.path().join("x.txt").canonicalize().unwrap())
            .unwrap()
            .to_string();

        assert!(provider.read(&uri).await.is_err());
    }

    #[tokio::test]
    async fn test_limits_cap_listing() {
        let (_dir, provider) = fixture();
        let provider = provider.with_limits(8, 1);

        assert_eq!(provider.list().await.unwrap().len(), 1);
    }
}
