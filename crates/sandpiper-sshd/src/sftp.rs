//! SFTP subsystem handler.
//!
//! Implements the server side of the SFTP protocol (the wire codec is
//! the SFTP library's concern) on top of the user's virtual file
//! system. Within a channel, requests are served sequentially in
//! arrival order. The `statvfs@openssh.com` extension is advertised and
//! served.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use russh_sftp::protocol::{
    Attrs, Data, ExtendedReply, File, FileAttributes, Handle, Name, OpenFlags, Packet, Status,
    StatusCode, Version,
};
use sandpiper_core::{clean_virtual_path, OpenParams, StatVfs, Vfs};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, warn};

pub const STATVFS_EXTENSION: &str = "statvfs@openssh.com";

/// How many directory entries go out per READDIR reply.
const READDIR_BATCH: usize = 128;

enum HandleEntry {
    File { file: tokio::fs::File, path: String },
    Dir { entries: Vec<File> },
}

/// Per-channel SFTP state.
pub struct SftpHandler {
    connection_id: String,
    username: String,
    vfs: Arc<dyn Vfs>,
    start_directory: String,
    /// Create missing parent directories on upload. Set when the
    /// date-layout prefix rewrites upload paths.
    create_parents: bool,
    handles: HashMap<String, HandleEntry>,
    next_handle: u64,
    version: Option<u32>,
}

impl SftpHandler {
    pub fn new(
        connection_id: String,
        username: String,
        vfs: Arc<dyn Vfs>,
        start_directory: String,
        create_parents: bool,
    ) -> Self {
        Self {
            connection_id,
            username,
            vfs,
            start_directory,
            create_parents,
            handles: HashMap::new(),
            next_handle: 0,
            version: None,
        }
    }

    fn allocate_handle(&mut self, entry: HandleEntry) -> String {
        let id = self.next_handle.to_string();
        self.next_handle += 1;
        self.handles.insert(id.clone(), entry);
        id
    }

    fn status_ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    fn map_err(&self, err: &sandpiper_core::Error) -> StatusCode {
        match err {
            sandpiper_core::Error::Io(io) => match io.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
            sandpiper_core::Error::Validation(_) => StatusCode::BadMessage,
            _ => StatusCode::Failure,
        }
    }

    fn entry_to_file(entry: &sandpiper_core::DirEntry) -> File {
        File::new(&entry.name, FileAttributes::from(&entry.metadata))
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            error!(
                connection_id = %self.connection_id,
                "duplicate SFTP init packet"
            );
            return Err(StatusCode::ConnectionLost);
        }
        self.version = Some(version);
        debug!(
            connection_id = %self.connection_id,
            username = %self.username,
            version,
            ?extensions,
            "sftp session initialized"
        );
        let mut reply = Version::new();
        reply
            .extensions
            .insert(STATVFS_EXTENSION.to_string(), "2".to_string());
        Ok(reply)
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let params = OpenParams {
            read: pflags.contains(OpenFlags::READ),
            write: pflags.contains(OpenFlags::WRITE),
            append: pflags.contains(OpenFlags::APPEND),
            create: pflags.contains(OpenFlags::CREATE),
            truncate: pflags.contains(OpenFlags::TRUNCATE),
            create_new: pflags.contains(OpenFlags::EXCLUDE),
        };
        let path = clean_virtual_path(&filename);
        if self.create_parents && params.create {
            if let Some((parent, _)) = path.rsplit_once('/') {
                if !parent.is_empty() {
                    if let Err(e) = self.vfs.create_dir_all(parent).await {
                        warn!(
                            connection_id = %self.connection_id,
                            parent,
                            error = %e,
                            "unable to create parent directories"
                        );
                        return Err(self.map_err(&e));
                    }
                }
            }
        }
        match self.vfs.open(&path, params).await {
            Ok(file) => {
                debug!(connection_id = %self.connection_id, path, "file opened");
                let handle = self.allocate_handle(HandleEntry::File { file, path });
                Ok(Handle { id, handle })
            }
            Err(e) => {
                debug!(connection_id = %self.connection_id, path, error = %e, "open failed");
                Err(self.map_err(&e))
            }
        }
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(_) => Ok(Self::status_ok(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let Some(HandleEntry::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|_| StatusCode::Failure)?;
        let mut buffer = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file
                .read(&mut buffer[filled..])
                .await
                .map_err(|_| StatusCode::Failure)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        buffer.truncate(filled);
        Ok(Data { id, data: buffer })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(HandleEntry::File { file, .. }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|_| StatusCode::Failure)?;
        file.write_all(&data).await.map_err(|_| StatusCode::Failure)?;
        Ok(Self::status_ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        match self.vfs.symlink_metadata(&path).await {
            Ok(metadata) => Ok(Attrs {
                id,
                attrs: FileAttributes::from(&metadata),
            }),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let Some(HandleEntry::File { file, .. }) = self.handles.get(&handle) else {
            return Err(StatusCode::Failure);
        };
        match file.metadata().await {
            Ok(metadata) => Ok(Attrs {
                id,
                attrs: FileAttributes::from(&metadata),
            }),
            Err(_) => Err(StatusCode::Failure),
        }
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        if let Some(permissions) = attrs.permissions {
            if let Err(e) = self.vfs.set_permissions(&path, permissions & 0o7777).await {
                return Err(self.map_err(&e));
            }
        }
        if let Some(size) = attrs.size {
            if let Err(e) = self.vfs.set_size(&path, size).await {
                return Err(self.map_err(&e));
            }
        }
        if attrs.atime.is_some() || attrs.mtime.is_some() {
            debug!(
                connection_id = %self.connection_id,
                path,
                "timestamp changes are ignored"
            );
        }
        Ok(Self::status_ok(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let Some(HandleEntry::File { path, .. }) = self.handles.get(&handle) else {
            return Err(StatusCode::Failure);
        };
        let path = path.clone();
        self.setstat(id, path, attrs).await
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        match self.vfs.read_dir(&path).await {
            Ok(mut entries) => {
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                let files = entries.iter().map(Self::entry_to_file).collect();
                debug!(connection_id = %self.connection_id, path, "directory opened");
                let handle = self.allocate_handle(HandleEntry::Dir { entries: files });
                Ok(Handle { id, handle })
            }
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(HandleEntry::Dir { entries }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        if entries.is_empty() {
            return Err(StatusCode::Eof);
        }
        let batch = entries.len().min(READDIR_BATCH);
        let files: Vec<File> = entries.drain(..batch).collect();
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        match self.vfs.remove_file(&filename).await {
            Ok(()) => Ok(Self::status_ok(id)),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        match self.vfs.create_dir(&path).await {
            Ok(()) => Ok(Self::status_ok(id)),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        match self.vfs.remove_dir(&path).await {
            Ok(()) => Ok(Self::status_ok(id)),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = if path.is_empty() || path == "." {
            if self.start_directory.is_empty() {
                "/".to_string()
            } else {
                clean_virtual_path(&self.start_directory)
            }
        } else {
            clean_virtual_path(&path)
        };
        Ok(Name {
            id,
            files: vec![File::dummy(&resolved)],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        match self.vfs.metadata(&path).await {
            Ok(metadata) => Ok(Attrs {
                id,
                attrs: FileAttributes::from(&metadata),
            }),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        match self.vfs.rename(&oldpath, &newpath).await {
            Ok(()) => Ok(Self::status_ok(id)),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        match self.vfs.read_link(&path).await {
            Ok(target) => Ok(Name {
                id,
                files: vec![File::dummy(target.to_string_lossy().as_ref())],
            }),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        match self.vfs.symlink(&linkpath, &targetpath).await {
            Ok(()) => Ok(Self::status_ok(id)),
            Err(e) => Err(self.map_err(&e)),
        }
    }

    async fn extended(
        &mut self,
        id: u32,
        request: String,
        data: Vec<u8>,
    ) -> Result<Packet, Self::Error> {
        if request != STATVFS_EXTENSION {
            warn!(
                connection_id = %self.connection_id,
                request,
                "unsupported extended request"
            );
            return Err(self.unimplemented());
        }
        let Some(path) = crate::prefix::decode_path_payload(&data) else {
            return Err(StatusCode::BadMessage);
        };
        match self.vfs.statvfs(&path).await {
            Ok(st) => Ok(Packet::ExtendedReply(ExtendedReply {
                id,
                data: encode_statvfs(&st),
            })),
            Err(e) => Err(self.map_err(&e)),
        }
    }
}

/// Encode a statvfs reply as eleven big-endian u64 fields, the layout
/// the OpenSSH extension defines.
fn encode_statvfs(st: &StatVfs) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(11 * 8);
    buf.put_u64(st.bsize);
    buf.put_u64(st.frsize);
    buf.put_u64(st.blocks);
    buf.put_u64(st.bfree);
    buf.put_u64(st.bavail);
    buf.put_u64(st.files);
    buf.put_u64(st.ffree);
    buf.put_u64(st.favail);
    buf.put_u64(st.fsid);
    buf.put_u64(st.flag);
    buf.put_u64(st.namemax);
    buf.to_vec()
}
