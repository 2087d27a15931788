//! Component C — the virtual filesystem.
//!
//! Every agent gets a home directory under a single real root; all paths an
//! agent supplies are virtual (`/` is the agent's home, not the host's) and
//! must resolve underneath that root after `..`/symlink-style traversal is
//! collapsed. Shared mounts let multiple agents see one real subtree under
//! a named virtual path. Mirrors the donor's repo-analysis file walking in
//! spirit (path confinement, `ignore`-free manual traversal) but scoped to a
//! single-tenant-per-home model instead of a whole git checkout.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::config::VfsConfig;

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("access denied: path escapes home")]
    AccessDenied,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid mount name: {0}")]
    InvalidMountName(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VfsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => VfsError::NotFound(e.to_string()),
            _ => VfsError::Io(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stat {
    pub is_dir: bool,
    pub size_bytes: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
}

/// Collapses `.`/`..` components purely lexically (no syscalls), so a path
/// can be validated before anything on disk is touched. Tracks how many
/// `Normal` components are currently pushed; a `..` encountered with none
/// pushed would climb above the base it's about to be joined onto, so that
/// is rejected outright rather than silently treated as a no-op (a bare
/// `PathBuf::pop()` on an empty buffer succeeds and does nothing, which
/// would let `../../etc/passwd` normalize to `etc/passwd` *under* the base
/// instead of escaping it).
fn lexical_normalize(path: &Path) -> Result<PathBuf, VfsError> {
    let mut out = PathBuf::new();
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if depth == 0 {
                    return Err(VfsError::AccessDenied);
                }
                depth -= 1;
                out.pop();
            }
            Component::Normal(part) => {
                depth += 1;
                out.push(part);
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

fn validate_mount_name(name: &str) -> Result<(), VfsError> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(VfsError::InvalidMountName(name.to_string()))
    }
}

pub struct Vfs {
    real_root: PathBuf,
}

impl Vfs {
    pub fn new(config: VfsConfig) -> Self {
        Self { real_root: config.real_root }
    }

    /// §4.7 `init`: ensure the root's top-level layout exists before any
    /// agent home or shared mount is provisioned.
    pub async fn init(&self) -> Result<(), VfsError> {
        tokio::fs::create_dir_all(&self.real_root).await?;
        tokio::fs::create_dir_all(self.real_root.join("home")).await?;
        tokio::fs::create_dir_all(self.real_root.join("tmp")).await?;
        tokio::fs::create_dir_all(self.real_root.join("etc")).await?;
        Ok(())
    }

    fn home_root(&self, uid: &str) -> PathBuf {
        self.real_root.join("home").join(uid)
    }

    /// Real filesystem path of `uid`'s home, for callers (the subprocess
    /// supervisor) that need to hand the agent runtime a working directory
    /// outside the virtual-path API.
    pub fn home_dir_path(&self, uid: &str) -> PathBuf {
        self.home_root(uid)
    }

    fn shared_root(&self, mount_name: &str) -> PathBuf {
        self.real_root.join("shared").join(mount_name)
    }

    /// Resolves a virtual path under `base` (a home or shared-mount root),
    /// rejecting anything that lexically escapes `base`.
    fn resolve(&self, base: &Path, virtual_path: &str) -> Result<PathBuf, VfsError> {
        let relative = lexical_normalize(Path::new(virtual_path.trim_start_matches('/')))?;
        let resolved = base.join(&relative);
        if !resolved.starts_with(base) {
            return Err(VfsError::AccessDenied);
        }
        Ok(resolved)
    }

    /// §4.7 `createHome`: the home directory plus the standard desktop-like
    /// subdirectories and a `.profile`, so a freshly spawned agent has a
    /// workspace that looks lived-in rather than an empty directory.
    pub async fn create_home(&self, uid: &str) -> Result<(), VfsError> {
        let home = self.home_root(uid);
        tokio::fs::create_dir_all(&home).await?;
        for sub in ["Desktop", "Documents", "Downloads", "Projects", ".config"] {
            tokio::fs::create_dir_all(home.join(sub)).await?;
        }
        let profile = format!("# profile for {uid}\nexport HOME=/home/{uid}\n");
        tokio::fs::write(home.join(".profile"), profile).await?;
        Ok(())
    }

    pub async fn read_file(&self, uid: &str, virtual_path: &str) -> Result<String, VfsError> {
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    pub async fn read_file_raw(&self, uid: &str, virtual_path: &str) -> Result<Vec<u8>, VfsError> {
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        Ok(tokio::fs::read(path).await?)
    }

    /// Byte-range read for large-file streaming; `start` inclusive, `end`
    /// exclusive. A range fully beyond EOF returns an empty slice rather
    /// than an error, matching how most read-stream APIs behave at EOF.
    pub async fn read_range(
        &self,
        uid: &str,
        virtual_path: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, VfsError> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let len = end.saturating_sub(start) as usize;
        let mut buf = vec![0u8; len];
        let read = file.read(&mut buf).await?;
        buf.truncate(read);
        Ok(buf)
    }

    pub async fn write_file(
        &self,
        uid: &str,
        virtual_path: &str,
        contents: &[u8],
    ) -> Result<(), VfsError> {
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    pub async fn mkdir(&self, uid: &str, virtual_path: &str) -> Result<(), VfsError> {
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    pub async fn rm(&self, uid: &str, virtual_path: &str) -> Result<(), VfsError> {
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    pub async fn mv(&self, uid: &str, from: &str, to: &str) -> Result<(), VfsError> {
        let home = self.home_root(uid);
        let from_path = self.resolve(&home, from)?;
        let to_path = self.resolve(&home, to)?;
        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from_path, to_path).await?;
        Ok(())
    }

    pub async fn cp(&self, uid: &str, from: &str, to: &str) -> Result<(), VfsError> {
        let home = self.home_root(uid);
        let from_path = self.resolve(&home, from)?;
        let to_path = self.resolve(&home, to)?;
        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(from_path, to_path).await?;
        Ok(())
    }

    /// Directories sort before files, then alphabetically within each
    /// group; dotfiles are included (the "hidden" convention is a display
    /// concern for clients, not an access-control one).
    pub async fn ls(&self, uid: &str, virtual_path: &str) -> Result<Vec<DirEntryInfo>, VfsError> {
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            out.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: meta.is_dir(),
                size_bytes: meta.len(),
            });
        }
        out.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        Ok(out)
    }

    pub async fn stat(&self, uid: &str, virtual_path: &str) -> Result<Stat, VfsError> {
        let path = self.resolve(&self.home_root(uid), virtual_path)?;
        let meta = tokio::fs::metadata(path).await?;
        let modified = meta
            .modified()
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(|_| chrono::Utc::now());
        Ok(Stat { is_dir: meta.is_dir(), size_bytes: meta.len(), modified })
    }

    // ── shared mounts ────────────────────────────────────────────────────

    pub async fn create_shared_mount(&self, mount_name: &str) -> Result<(), VfsError> {
        validate_mount_name(mount_name)?;
        tokio::fs::create_dir_all(self.shared_root(mount_name)).await?;
        Ok(())
    }

    /// Symlinks `mount_name` into `uid`'s home at `virtual_path`, so reads
    /// through the home root transparently reach the shared tree.
    pub async fn mount_shared(
        &self,
        uid: &str,
        mount_name: &str,
        virtual_path: &str,
    ) -> Result<(), VfsError> {
        validate_mount_name(mount_name)?;
        let target = self.shared_root(mount_name);
        if tokio::fs::metadata(&target).await.is_err() {
            return Err(VfsError::NotFound(format!("no shared mount named {mount_name}")));
        }
        let link = self.resolve(&self.home_root(uid), virtual_path)?;
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        #[cfg(unix)]
        {
            tokio::fs::symlink(&target, &link).await?;
        }
        #[cfg(not(unix))]
        {
            tokio::fs::create_dir_all(&link).await?;
        }
        Ok(())
    }

    pub async fn unmount_shared(&self, uid: &str, virtual_path: &str) -> Result<(), VfsError> {
        let link = self.resolve(&self.home_root(uid), virtual_path)?;
        let meta = tokio::fs::symlink_metadata(&link).await?;
        if meta.is_dir() && !meta.file_type().is_symlink() {
            tokio::fs::remove_dir_all(link).await?;
        } else {
            tokio::fs::remove_file(link).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn vfs() -> (Vfs, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new(VfsConfig { real_root: dir.path().to_path_buf() });
        vfs.init().await.unwrap();
        (vfs, dir)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (vfs, _dir) = vfs().await;
        vfs.create_home("agent_1").await.unwrap();
        vfs.write_file("agent_1", "/notes.txt", b"hello").await.unwrap();
        let content = vfs.read_file("agent_1", "/notes.txt").await.unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn traversal_outside_home_is_denied() {
        let (vfs, _dir) = vfs().await;
        vfs.create_home("agent_1").await.unwrap();
        let err = vfs.write_file("agent_1", "../../etc/passwd", b"x").await.unwrap_err();
        assert!(matches!(err, VfsError::AccessDenied));
    }

    #[tokio::test]
    async fn ls_lists_dirs_before_files() {
        let (vfs, _dir) = vfs().await;
        vfs.create_home("agent_1").await.unwrap();
        vfs.mkdir("agent_1", "/zzz_dir").await.unwrap();
        vfs.write_file("agent_1", "/aaa_file.txt", b"x").await.unwrap();
        let entries = vfs.ls("agent_1", "/").await.unwrap();
        assert_eq!(entries[0].name, "zzz_dir");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "aaa_file.txt");
    }

    #[tokio::test]
    async fn rm_missing_file_is_not_found() {
        let (vfs, _dir) = vfs().await;
        vfs.create_home("agent_1").await.unwrap();
        let err = vfs.rm("agent_1", "/nope.txt").await.unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
    }

    #[tokio::test]
    async fn shared_mount_is_visible_under_home() {
        let (vfs, _dir) = vfs().await;
        vfs.create_home("agent_1").await.unwrap();
        vfs.create_shared_mount("team-notes").await.unwrap();
        tokio::fs::write(vfs.shared_root("team-notes").join("shared.txt"), b"shared")
            .await
            .unwrap();
        vfs.mount_shared("agent_1", "team-notes", "/shared").await.unwrap();
        let content = vfs.read_file("agent_1", "/shared/shared.txt").await.unwrap();
        assert_eq!(content, "shared");
    }

    #[tokio::test]
    async fn invalid_mount_name_rejected() {
        let (vfs, _dir) = vfs().await;
        let err = vfs.create_shared_mount("has a space").await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidMountName(_)));
    }
}
