//! Virtual-root prefix middleware.
//!
//! When a folder prefix is configured, every path received from the
//! client gets the prefix prepended before it reaches the real handler,
//! and every absolute path sent back (realpath, readlink) has it
//! stripped again. The prefix is invisible to the client. Configuring a
//! prefix disables the SSH exec commands.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Local};
use russh_sftp::protocol::{
    Attrs, Data, FileAttributes, Handle, Name, OpenFlags, Packet, Status, Version,
};
use sandpiper_core::clean_virtual_path;
use tracing::debug;

/// Normalise a configured prefix to an absolute POSIX path.
/// A prefix that normalises to `/` is equivalent to no prefix.
pub fn normalize_folder_prefix(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let cleaned = clean_virtual_path(raw);
    if cleaned == "/" {
        None
    } else {
        Some(cleaned)
    }
}

/// Insert a date-formatted sub-prefix immediately before the last path
/// segment: `a/b/file.pdf` with layout `%Y/%m/%d` becomes
/// `a/b/2023/01/01/file.pdf`.
pub fn insert_date_prefix(path: &str, when: DateTime<Local>, layout: &str) -> String {
    let formatted = when.format(layout).to_string();
    match path.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/{formatted}/{file}"),
        None => format!("{formatted}/{path}"),
    }
}

/// SFTP handler wrapper applying the folder prefix.
pub struct PrefixedHandler<H> {
    prefix: String,
    date_layout: Option<String>,
    inner: H,
}

impl<H> PrefixedHandler<H> {
    pub fn new(prefix: String, date_layout: Option<String>, inner: H) -> Self {
        Self {
            prefix,
            date_layout,
            inner,
        }
    }

    fn add_prefix(&self, path: &str) -> String {
        let cleaned = clean_virtual_path(path);
        let mapped = if cleaned == "/" {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, cleaned)
        };
        debug!(from = path, to = %mapped, "prefix applied");
        mapped
    }

    /// Map an upload path: the date sub-prefix, when configured, lands
    /// between the client path and the file name.
    fn add_write_prefix(&self, path: &str) -> String {
        match &self.date_layout {
            Some(layout) => {
                let cleaned = clean_virtual_path(path);
                let dated = insert_date_prefix(cleaned.trim_start_matches('/'), Local::now(), layout);
                self.add_prefix(&dated)
            }
            None => self.add_prefix(path),
        }
    }

    fn strip_prefix(&self, path: &str) -> String {
        if path == self.prefix {
            return "/".to_string();
        }
        match path.strip_prefix(&format!("{}/", self.prefix)) {
            Some(rest) => format!("/{rest}"),
            None => path.to_string(),
        }
    }

    fn strip_name(&self, mut name: Name) -> Name {
        for file in name.files.iter_mut() {
            if file.filename.starts_with('/') {
                file.filename = self.strip_prefix(&file.filename);
            }
        }
        name
    }
}

impl<H> russh_sftp::server::Handler for PrefixedHandler<H>
where
    H: russh_sftp::server::Handler + Send,
    H::Error: Send,
{
    type Error = H::Error;

    fn unimplemented(&self) -> Self::Error {
        self.inner.unimplemented()
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        self.inner.init(version, extensions).await
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mapped = if pflags.contains(OpenFlags::WRITE) {
            self.add_write_prefix(&filename)
        } else {
            self.add_prefix(&filename)
        };
        self.inner.open(id, mapped, pflags, attrs).await
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.inner.close(id, handle).await
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        self.inner.read(id, handle, offset, len).await
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        self.inner.write(id, handle, offset, data).await
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let mapped = self.add_prefix(&path);
        self.inner.lstat(id, mapped).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        self.inner.fstat(id, handle).await
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let mapped = self.add_prefix(&path);
        self.inner.setstat(id, mapped, attrs).await
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.inner.fsetstat(id, handle, attrs).await
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let mapped = self.add_prefix(&path);
        self.inner.opendir(id, mapped).await
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        // entries carry bare file names, nothing to strip
        self.inner.readdir(id, handle).await
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let mapped = self.add_prefix(&filename);
        self.inner.remove(id, mapped).await
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let mapped = self.add_prefix(&path);
        self.inner.mkdir(id, mapped, attrs).await
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let mapped = self.add_prefix(&path);
        self.inner.rmdir(id, mapped).await
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let mapped = self.add_prefix(&path);
        let name = self.inner.realpath(id, mapped).await?;
        Ok(self.strip_name(name))
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let mapped = self.add_prefix(&path);
        self.inner.stat(id, mapped).await
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let old_mapped = self.add_prefix(&oldpath);
        let new_mapped = self.add_prefix(&newpath);
        self.inner.rename(id, old_mapped, new_mapped).await
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let mapped = self.add_prefix(&path);
        let name = self.inner.readlink(id, mapped).await?;
        Ok(self.strip_name(name))
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        let link_mapped = self.add_prefix(&linkpath);
        let target_mapped = self.add_prefix(&targetpath);
        self.inner.symlink(id, link_mapped, target_mapped).await
    }

    async fn extended(
        &mut self,
        id: u32,
        request: String,
        data: Vec<u8>,
    ) -> Result<Packet, Self::Error> {
        // statvfs carries its path inside the payload
        if request == "statvfs@openssh.com" {
            if let Some(path) = decode_path_payload(&data) {
                let mapped = self.add_prefix(&path);
                return self.inner.extended(id, request, encode_path_payload(&mapped)).await;
            }
        }
        self.inner.extended(id, request, data).await
    }
}

/// Decode a single length-prefixed UTF-8 string payload.
pub(crate) fn decode_path_payload(data: &[u8]) -> Option<String> {
    let mut buf = Bytes::copy_from_slice(data);
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    String::from_utf8(buf.slice(..len).to_vec()).ok()
}

pub(crate) fn encode_path_payload(path: &str) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + path.len());
    buf.put_u32(path.len() as u32);
    buf.put_slice(path.as_bytes());
    buf.to_vec()
}
