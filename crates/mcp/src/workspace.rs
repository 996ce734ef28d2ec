// Confinement of file access to one workspace directory

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};
use url::Url;

/// Path fragments that mark a file as secret. Matched case-insensitively
/// anywhere in the workspace-relative path.
const DENY_PATTERNS: &[&str] = &[
    ".env",
    "credentials",
    "secrets",
    "private",
    "id_rsa",
    "id_ed25519",
    ".pem",
    ".key",
    "password",
    "token",
    "api_key",
    ".aws",
    ".ssh",
    ".git/config",
];

/// Root directory that file tools and resources are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .with_context(|| format!("Workspace root {} is not accessible", root.display()))?;
        if !root.is_dir() {
            bail!("Workspace root {} is not a directory", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `relative` names a secret file.
    pub fn is_denied(relative: &str) -> bool {
        let lowered = relative.replace('\\', "/").to_lowercase();
        DENY_PATTERNS.iter().any(|pattern| lowered.contains(pattern))
    }

    /// Resolve a workspace-relative path, refusing secrets and escapes.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let requested = Path::new(relative);
        if requested.is_absolute()
            || requested
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            bail!("Access denied: {} is outside the workspace", relative);
        }
        if Self::is_denied(relative) {
            bail!("Access denied: {} appears to be a secret file", relative);
        }

        let path = self.root.join(requested);
        self.confine(&path)
    }

    /// Resolve a path that may not exist yet. Its parent directory must exist
    /// inside the workspace; an existing target is checked like [`Self::resolve`].
    pub fn resolve_for_write(&self, relative: &str) -> Result<PathBuf> {
        let requested = Path::new(relative);
        if requested.is_absolute()
            || requested
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            bail!("Access denied: {} is outside the workspace", relative);
        }
        if Self::is_denied(relative) {
            bail!("Access denied: {} appears to be a secret file", relative);
        }

        let path = self.root.join(requested);
        if path.symlink_metadata().is_ok() {
            return self.confine(&path);
        }

        let name = path
            .file_name()
            .with_context(|| format!("{} does not name a file", relative))?;
        let parent = path.parent().unwrap_or(&self.root);
        Ok(self.confine(parent)?.join(name))
    }

    /// Check that an absolute path stays inside the root once symlinks resolve.
    pub fn confine(&self, path: &Path) -> Result<PathBuf> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("Not found: {}", self.relative(path)))?;
        if !canonical.starts_with(&self.root) {
            bail!("Access denied: {} is outside the workspace", path.display());
        }
        if Self::is_denied(&self.relative(&canonical)) {
            bail!("Access denied: {} appears to be a secret file", self.relative(&canonical));
        }
        Ok(canonical)
    }

    /// Path relative to the root, `/`-separated.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let text = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if text.is_empty() {
            ".".to_string()
        } else {
            text
        }
    }

    pub fn uri_for(&self, path: &Path) -> Result<String> {
        Url::from_file_path(path)
            .map(String::from)
            .map_err(|_| anyhow::anyhow!("Cannot build a file URI for {}", path.display()))
    }

    /// Map a `file://` URI back to a confined path.
    pub fn path_for_uri(&self, uri: &str) -> Result<PathBuf> {
        let url = Url::parse(uri).with_context(|| format!("Invalid resource URI: {}", uri))?;
        if url.scheme() != "file" {
            bail!("Unsupported resource URI scheme: {}", url.scheme());
        }
        let path = url
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("Invalid file URI: {}", uri))?;
        self.confine(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_secret_paths_denied() {
        assert!(!Workspace::is_denied("README.md"));
        assert!(!Workspace::is_denied("src/main.rs"));

        assert!(Workspace::is_denied(".env"));
        assert!(Workspace::is_denied("config/credentials.json"));
        assert!(Workspace::is_denied("secret.key"));
        assert!(Workspace::is_denied(".git/config"));
        assert!(Workspace::is_denied("deploy\\ID_RSA"));
    }

    #[test]
    fn test_resolve_confines_to_root() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("notes.md"), "hi").unwrap();
        let workspace = Workspace::open(temp_dir.path()).unwrap();

        let resolved = workspace.resolve("notes.md").unwrap();
        assert!(resolved.starts_with(workspace.root()));

        assert!(workspace.resolve("../outside.txt").is_err());
        assert!(workspace.resolve("/etc/passwd").is_err());
        assert!(workspace.resolve("missing.md").is_err());
    }

    #[test]
    fn test_resolve_for_write() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("docs")).unwrap();
        let workspace = Workspace::open(temp_dir.path()).unwrap();

        let new_file = workspace.resolve_for_write("docs/new.md").unwrap();
        assert_eq!(new_file, workspace.root().join("docs/new.md"));

        assert!(workspace.resolve_for_write(".env").is_err());
        assert!(workspace.resolve_for_write("../escape.txt").is_err());
        assert!(workspace.resolve_for_write("/tmp/escape.txt").is_err());
        assert!(workspace.resolve_for_write("missing/dir/file.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("data.txt"), "outside").unwrap();
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("data.txt"), temp_dir.path().join("link.txt"))
            .unwrap();
        let workspace = Workspace::open(temp_dir.path()).unwrap();

        assert!(workspace.resolve("link.txt").is_err());
    }

    #[test]
    fn test_uri_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("docs")).unwrap();
        std::fs::write(temp_dir.path().join("docs/guide.md"), "# Guide").unwrap();
        let workspace = Workspace::open(temp_dir.path()).unwrap();

        let path = workspace.resolve("docs/guide.md").unwrap();
        let uri = workspace.uri_for(&path).unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(workspace.path_for_uri(&uri).unwrap(), path);
        assert_eq!(workspace.relative(&path), "docs/guide.md");

        assert!(workspace.path_for_uri("https://example.com/x").is_err());
    }
}
