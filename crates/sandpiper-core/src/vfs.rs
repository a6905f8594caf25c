//! Virtual file system the protocol front-ends operate on.
//!
//! Every path a client sends is virtual: absolute, POSIX-style, rooted at
//! the user's storage root. [`Vfs::resolve`] maps it onto the backing
//! storage and is the only place that mapping happens, so a traversal
//! attempt can never escape the jail.

use std::fs::Metadata;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Normalise a client-supplied path to a clean absolute POSIX path.
///
/// `.` and empty segments are dropped, `..` pops the previous segment and
/// saturates at the root.
pub fn clean_virtual_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Open disposition for [`Vfs::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenParams {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub create_new: bool,
}

/// A directory listing entry.
#[derive(Debug)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

/// File system statistics in `statvfs(3)` shape.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

#[async_trait]
pub trait Vfs: Send + Sync {
    /// Backend name used in logs.
    fn name(&self) -> &str;

    /// Map a virtual path onto the backing storage.
    fn resolve(&self, virtual_path: &str) -> Result<PathBuf>;

    async fn metadata(&self, virtual_path: &str) -> Result<Metadata>;
    async fn symlink_metadata(&self, virtual_path: &str) -> Result<Metadata>;
    async fn open(&self, virtual_path: &str, params: OpenParams) -> Result<tokio::fs::File>;
    async fn read_dir(&self, virtual_path: &str) -> Result<Vec<DirEntry>>;
    async fn create_dir(&self, virtual_path: &str) -> Result<()>;
    async fn create_dir_all(&self, virtual_path: &str) -> Result<()>;
    async fn remove_dir(&self, virtual_path: &str) -> Result<()>;
    async fn remove_file(&self, virtual_path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn read_link(&self, virtual_path: &str) -> Result<PathBuf>;
    async fn symlink(&self, link: &str, target: &str) -> Result<()>;
    async fn set_permissions(&self, virtual_path: &str, mode: u32) -> Result<()>;
    async fn set_size(&self, virtual_path: &str, size: u64) -> Result<()>;
    async fn statvfs(&self, virtual_path: &str) -> Result<StatVfs>;
}

/// Local file system backend, jailed under a root directory.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[async_trait]
impl Vfs for LocalFs {
    fn name(&self) -> &str {
        "osfs"
    }

    fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        if virtual_path.contains('\0') {
            return Err(Error::Validation("path contains NUL".to_string()));
        }
        let cleaned = clean_virtual_path(virtual_path);
        let resolved = if cleaned == "/" {
            self.root.clone()
        } else {
            self.root.join(&cleaned[1..])
        };
        debug!(virtual_path, resolved = %resolved.display(), "path resolved");
        Ok(resolved)
    }

    async fn metadata(&self, virtual_path: &str) -> Result<Metadata> {
        Ok(tokio::fs::metadata(self.resolve(virtual_path)?).await?)
    }

    async fn symlink_metadata(&self, virtual_path: &str) -> Result<Metadata> {
        Ok(tokio::fs::symlink_metadata(self.resolve(virtual_path)?).await?)
    }

    async fn open(&self, virtual_path: &str, params: OpenParams) -> Result<tokio::fs::File> {
        let path = self.resolve(virtual_path)?;
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(params.read)
            .write(params.write)
            .append(params.append)
            .create(params.create)
            .truncate(params.truncate)
            .create_new(params.create_new);
        Ok(options.open(path).await?)
    }

    async fn read_dir(&self, virtual_path: &str) -> Result<Vec<DirEntry>> {
        let mut rd = tokio::fs::read_dir(self.resolve(virtual_path)?).await?;
        let mut entries = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // the entry may vanish between listing and stat
                Err(_) => continue,
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                metadata,
            });
        }
        Ok(entries)
    }

    async fn create_dir(&self, virtual_path: &str) -> Result<()> {
        Ok(tokio::fs::create_dir(self.resolve(virtual_path)?).await?)
    }

    async fn create_dir_all(&self, virtual_path: &str) -> Result<()> {
        Ok(tokio::fs::create_dir_all(self.resolve(virtual_path)?).await?)
    }

    async fn remove_dir(&self, virtual_path: &str) -> Result<()> {
        Ok(tokio::fs::remove_dir(self.resolve(virtual_path)?).await?)
    }

    async fn remove_file(&self, virtual_path: &str) -> Result<()> {
        Ok(tokio::fs::remove_file(self.resolve(virtual_path)?).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        Ok(tokio::fs::rename(self.resolve(from)?, self.resolve(to)?).await?)
    }

    async fn read_link(&self, virtual_path: &str) -> Result<PathBuf> {
        Ok(tokio::fs::read_link(self.resolve(virtual_path)?).await?)
    }

    #[cfg(unix)]
    async fn symlink(&self, link: &str, target: &str) -> Result<()> {
        // the target is stored verbatim but must stay inside the jail
        let link_path = self.resolve(link)?;
        let target_path = self.resolve(target)?;
        Ok(tokio::fs::symlink(target_path, link_path).await?)
    }

    #[cfg(not(unix))]
    async fn symlink(&self, _link: &str, _target: &str) -> Result<()> {
        Err(Error::Generic(
            "symlinks are not supported on this platform".to_string(),
        ))
    }

    #[cfg(unix)]
    async fn set_permissions(&self, virtual_path: &str, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        Ok(tokio::fs::set_permissions(self.resolve(virtual_path)?, perms).await?)
    }

    #[cfg(not(unix))]
    async fn set_permissions(&self, _virtual_path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }

    async fn set_size(&self, virtual_path: &str, size: u64) -> Result<()> {
        let file = self
            .open(
                virtual_path,
                OpenParams {
                    write: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(file.set_len(size).await?)
    }

    #[cfg(unix)]
    async fn statvfs(&self, virtual_path: &str) -> Result<StatVfs> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = self.resolve(virtual_path)?;
        tokio::task::spawn_blocking(move || {
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|_| Error::Validation("path contains NUL".to_string()))?;
            let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
            if unsafe { libc::statvfs(c_path.as_ptr(), &mut st) } != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(StatVfs {
                bsize: st.f_bsize as u64,
                frsize: st.f_frsize as u64,
                blocks: st.f_blocks as u64,
                bfree: st.f_bfree as u64,
                bavail: st.f_bavail as u64,
                files: st.f_files as u64,
                ffree: st.f_ffree as u64,
                favail: st.f_favail as u64,
                fsid: st.f_fsid as u64,
                flag: st.f_flag as u64,
                namemax: st.f_namemax as u64,
            })
        })
        .await
        .map_err(|e| Error::Generic(format!("statvfs task failed: {e}")))?
    }

    #[cfg(not(unix))]
    async fn statvfs(&self, _virtual_path: &str) -> Result<StatVfs> {
        Err(Error::Generic(
            "statvfs is not supported on this platform".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_virtual_path() {
        assert_eq!(clean_virtual_path(""), "/");
        assert_eq!(clean_virtual_path("/"), "/");
        assert_eq!(clean_virtual_path("."), "/");
        assert_eq!(clean_virtual_path("a/b"), "/a/b");
        assert_eq!(clean_virtual_path("/a//b/./c"), "/a/b/c");
        assert_eq!(clean_virtual_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_virtual_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(clean_virtual_path(".."), "/");
    }

    #[test]
    fn test_resolve_stays_in_jail() {
        let fs = LocalFs::new("/srv/data/alice");
        let resolved = fs.resolve("/../../../etc/shadow").unwrap();
        assert!(resolved.starts_with("/srv/data/alice"));
        assert_eq!(fs.resolve("/").unwrap(), PathBuf::from("/srv/data/alice"));
        assert!(fs.resolve("a\0b").is_err());
    }

    #[tokio::test]
    async fn test_local_fs_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());

        fs.create_dir("/sub").await.unwrap();
        let mut file = fs
            .open(
                "/sub/hello.txt",
                OpenParams {
                    write: true,
                    create: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        file.write_all(b"hello").await.unwrap();
        drop(file);

        let meta = fs.metadata("/sub/hello.txt").await.unwrap();
        assert_eq!(meta.len(), 5);

        let entries = fs.read_dir("/sub").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.txt");

        fs.rename("/sub/hello.txt", "/sub/renamed.txt").await.unwrap();
        let mut file = fs
            .open(
                "/sub/renamed.txt",
                OpenParams {
                    read: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "hello");

        fs.remove_file("/sub/renamed.txt").await.unwrap();
        fs.remove_dir("/sub").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_statvfs_reports_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        let st = fs.statvfs("/").await.unwrap();
        assert!(st.blocks > 0);
        assert!(st.bsize > 0);
    }
}
