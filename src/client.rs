//! The POSIX-like filesystem surface
//!
//! Application-facing operations on a gateway.  Every mutating data
//! operation goes through the coordinator dispatch: run locally when we
//! coordinate the file, forward to the coordinator otherwise, and take
//! the file over when the coordinator is gone.  Errors map to POSIX errno
//! values via [`crate::error::Error::to_errno`].

use std::sync::Arc;

use tracing::{debug, info};

use crate::dispatch::try_or_coordinate;
use crate::error::{Error, Result};
use crate::fs::handle::{DirHandle, FileHandle};
use crate::fs::inode::{Inode, InodeType};
use crate::fs::now_timespec;
use crate::fs::path::{basename, normalize, parent_of};
use crate::gateway::Gateway;
use crate::ms::MdEntry;
use crate::network::protocol::{
    AcceptedMsg, DetachMsg, ErrorMsg, Message, TruncateMsg, WriteMsg,
};
use crate::network::peer_request;
use crate::storage::dirty::DirtyBlock;
use crate::sync::fsync_ex;

/// access() mask bits
pub const R_OK: u32 = 4;
pub const W_OK: u32 = 2;
pub const X_OK: u32 = 1;

/// setxattr flags
pub const XATTR_CREATE: u32 = 1;
pub const XATTR_REPLACE: u32 = 2;

impl Gateway {
    // --- metadata surface ---

    /// stat: current metadata of a path
    pub fn stat(&self, path: &str) -> Result<MdEntry> {
        self.resolve(path)?;
        let (arc, parent_id, parent_name) = self.namespace().resolve_with_parent(path)?;
        let inode = arc.read().unwrap();
        Ok(inode.export(parent_id, &parent_name))
    }

    /// fstat: metadata through an open handle
    pub fn fstat(&self, handle: &FileHandle) -> Result<MdEntry> {
        self.stat(handle.path())
    }

    /// access: permission probe against the mode bits
    pub fn access(&self, path: &str, mask: u32) -> Result<()> {
        let arc = self.resolve(path)?;
        let inode = arc.read().unwrap();
        let owner_bits = (inode.mode() >> 6) & 0o7;
        if owner_bits & mask == mask {
            Ok(())
        } else {
            Err(Error::PermissionDenied(path.to_string()))
        }
    }

    /// mkdir: register a directory with the MS and attach it
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let path = normalize(path);
        let parent = self.resolve(&parent_of(&path))?;
        if parent.read().unwrap().itype() != InodeType::Dir {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                parent_of(&path)
            )));
        }

        let entry = self.new_entry_record(InodeType::Dir, &path, mode);
        let created = self.ms().create(&path, entry)?;
        self.namespace().insert(&path, Inode::from_entry(&created))?;
        Ok(())
    }

    /// rmdir: detach an empty directory
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let arc = self.resolve(path)?;
        {
            let inode = arc.read().unwrap();
            if inode.itype() != InodeType::Dir {
                return Err(Error::InvalidArgument(format!("{} is not a directory", path)));
            }
        }
        if !self.namespace().list_children(path).is_empty() {
            return Err(Error::InvalidArgument(format!("{} is not empty", path)));
        }

        let entry = self.stat(path)?;
        self.ms().delete(&normalize(path), &entry)?;
        self.namespace().remove(path)?;
        Ok(())
    }

    /// rename: move an entry on the MS and in the namespace
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        self.resolve(&from)?;
        self.resolve(&parent_of(&to))?;

        self.ms().rename(&from, &to)?;
        self.namespace().rename(&from, &to)?;

        if let Some(arc) = self.namespace().get(&to) {
            let mut inode = arc.write().unwrap();
            inode.set_name(basename(&to));
            inode.set_metadata_stale(true);
        }
        Ok(())
    }

    /// chmod: update mode bits and publish
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let arc = self.resolve(path)?;
        let (parent_id, parent_name) = self.parent_identity(path)?;
        let mut inode = arc.write().unwrap();
        inode.set_mode(mode);
        self.publish_inode(path, &mut inode, parent_id, &parent_name)
    }

    /// chown: update ownership and publish
    pub fn chown(&self, path: &str, new_owner: u64) -> Result<()> {
        let arc = self.resolve(path)?;
        let (parent_id, parent_name) = self.parent_identity(path)?;
        let mut inode = arc.write().unwrap();
        inode.set_owner(new_owner);
        self.publish_inode(path, &mut inode, parent_id, &parent_name)
    }

    // --- file lifecycle ---

    /// create: register a file coordinated by this gateway and open it
    pub fn create(&self, path: &str, mode: u32) -> Result<FileHandle> {
        let path = normalize(path);
        let parent = self.resolve(&parent_of(&path))?;
        if parent.read().unwrap().itype() != InodeType::Dir {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                parent_of(&path)
            )));
        }

        let entry = self.new_entry_record(InodeType::File, &path, mode);
        let created = self.ms().create(&path, entry)?;
        let arc = self
            .namespace()
            .insert(&path, Inode::from_entry(&created))?;
        arc.write().unwrap().opened();

        Ok(FileHandle::new(arc, &path, crate::fs::handle::O_RDWR))
    }

    /// open: attach and reference an existing file
    pub fn open(&self, path: &str, flags: u32) -> Result<FileHandle> {
        let path = normalize(path);
        let arc = self.resolve(&path)?;
        {
            let mut inode = arc.write().unwrap();
            if inode.itype() != InodeType::File {
                return Err(Error::InvalidArgument(format!("{} is a directory", path)));
            }
            inode.opened();
        }
        Ok(FileHandle::new(arc, &path, flags))
    }

    /// close: apply deferred eviction hints and drop the reference
    pub fn close(&self, handle: FileHandle) -> Result<()> {
        let arc = Arc::clone(handle.inode());
        let mut inode = arc.write().unwrap();
        inode.evict_hinted_blocks(handle.evict_hints());
        inode.closed();

        if inode.can_destroy() {
            let file_id = inode.file_id();
            let file_version = inode.file_version();
            drop(inode);
            self.cache().evict_file(file_id, file_version);
        }
        Ok(())
    }

    /// unlink: detach a file through its coordinator
    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let arc = self.resolve(&path)?;
        let (coordinator, file_version) = {
            let inode = arc.read().unwrap();
            if inode.itype() != InodeType::File {
                return Err(Error::InvalidArgument(format!("{} is a directory", path)));
            }
            (inode.coordinator(), inode.file_version())
        };

        try_or_coordinate(
            self,
            &path,
            coordinator,
            || self.detach_local(&path),
            |coord| {
                self.remote_request(
                    coord,
                    &Message::Detach(DetachMsg {
                        fs_path: path.clone(),
                        file_version,
                    }),
                )
                .map(|_| ())
            },
        )
    }

    /// The local half of unlink: MS delete, namespace detach, cache drop
    fn detach_local(&self, path: &str) -> Result<()> {
        let entry = self.stat(path)?;
        self.ms().delete(path, &entry)?;

        let arc = self.namespace().remove(path)?;
        let mut inode = arc.write().unwrap();
        inode.unlinked();
        let file_id = inode.file_id();
        let file_version = inode.file_version();
        if inode.can_destroy() {
            drop(inode);
            self.cache().evict_file(file_id, file_version);
        }
        info!("Detached {}", path);
        Ok(())
    }

    // --- data path ---

    /// read: from the dirty map, the staging cache, or the RGs
    pub fn read(&self, handle: &mut FileHandle, size: usize) -> Result<Vec<u8>> {
        let arc = Arc::clone(handle.inode());
        let offset = handle.offset();
        let block_size = self.block_size();

        let mut inode = arc.write().unwrap();
        let file_size = inode.size();
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let end = (offset + size as u64).min(file_size);

        let mut out = Vec::with_capacity((end - offset) as usize);
        let start_block = offset / block_size;
        let end_block = (end - 1) / block_size;

        for block_id in start_block..=end_block {
            let (payload, fetched_version) = self.read_block_payload(&mut inode, block_id)?;
            if let Some(version) = fetched_version {
                handle.add_evict_hint(block_id, version);
            }

            let block_start = block_id * block_size;
            let copy_from = offset.max(block_start) - block_start;
            let copy_until = (end.min(block_start + block_size) - block_start) as usize;
            let copy_from = copy_from as usize;

            if copy_from < payload.len() {
                out.extend_from_slice(&payload[copy_from..copy_until.min(payload.len())]);
            }
            // A short or absent payload is a write hole; it reads as zeros
            if copy_until > payload.len().max(copy_from) {
                out.resize(out.len() + copy_until - payload.len().max(copy_from), 0);
            }
        }

        drop(inode);
        handle.set_offset(end);
        Ok(out)
    }

    /// write: buffer into dirty blocks through the file's coordinator
    pub fn write(&self, handle: &mut FileHandle, data: &[u8]) -> Result<usize> {
        if !handle.writable() {
            return Err(Error::PermissionDenied("read-only handle".to_string()));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let path = handle.path().to_string();
        let offset = handle.offset();
        let (coordinator, file_version) = {
            let inode = handle.inode().read().unwrap();
            (inode.coordinator(), inode.file_version())
        };

        try_or_coordinate(
            self,
            &path,
            coordinator,
            || self.write_local(&path, offset, data),
            |coord| {
                self.remote_request(
                    coord,
                    &Message::Write(WriteMsg {
                        fs_path: path.clone(),
                        file_version,
                        offset,
                        data: data.to_vec(),
                    }),
                )
                .map(|_| ())
            },
        )?;

        // Blocks this write re-dirtied must survive the handle's close
        let start_block = offset / self.block_size();
        let end_block = (offset + data.len() as u64 - 1) / self.block_size();
        for block_id in start_block..=end_block {
            handle.drop_evict_hint(block_id);
        }

        handle.set_offset(offset + data.len() as u64);
        Ok(data.len())
    }

    /// The local half of write: read-modify-write each touched block and
    /// commit it dirty.  Caller holds no inode lock.
    pub(crate) fn write_local(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let arc = self.resolve(path)?;
        let block_size = self.block_size();
        let mut inode = arc.write().unwrap();

        let end = offset + data.len() as u64;
        let start_block = offset / block_size;
        let end_block = (end - 1) / block_size;

        for block_id in start_block..=end_block {
            let block_start = block_id * block_size;
            let copy_from = offset.max(block_start);
            let copy_until = end.min(block_start + block_size);
            let dst_from = (copy_from - block_start) as usize;
            let dst_until = (copy_until - block_start) as usize;
            let src_from = (copy_from - offset) as usize;
            let src_until = (copy_until - offset) as usize;

            let whole_block = dst_from == 0 && dst_until == block_size as usize;
            let buf = if whole_block {
                data[src_from..src_until].to_vec()
            } else {
                // Partial overwrite: splice into the current payload
                let (mut base, _) = self.read_block_payload(&mut inode, block_id)?;
                if base.len() < dst_until {
                    base.resize(dst_until, 0);
                }
                base[dst_from..dst_until].copy_from_slice(&data[src_from..src_until]);
                base
            };

            let version = inode.next_block_version(block_id);
            let block = DirtyBlock::new_dirty(block_id, version, buf);
            inode.commit_dirty_block(self.cache(), block)?;
            debug!("Committed dirty block {}[{}.{}]", path, block_id, version);
        }

        if end > inode.size() {
            inode.manifest_mut().set_size(end);
        }
        self.advance_modtime(&mut inode);
        Ok(())
    }

    /// seek: adjust a handle's offset
    pub fn seek(&self, handle: &mut FileHandle, pos: i64, whence: i32) -> Result<u64> {
        let base = match whence {
            libc::SEEK_SET => 0i64,
            libc::SEEK_CUR => handle.offset() as i64,
            libc::SEEK_END => handle.inode().read().unwrap().size() as i64,
            _ => return Err(Error::InvalidArgument(format!("whence {}", whence))),
        };
        let target = base + pos;
        if target < 0 {
            return Err(Error::InvalidArgument(format!("offset {}", target)));
        }
        handle.set_offset(target as u64);
        Ok(target as u64)
    }

    /// fsync: run the ordered replicate/publish/vacuum pipeline
    pub fn fsync(&self, handle: &FileHandle) -> Result<()> {
        fsync_ex(self, handle.path())
    }

    /// fsync by path
    pub fn fsync_path(&self, path: &str) -> Result<()> {
        fsync_ex(self, path)
    }

    /// truncate: resize through the file's coordinator
    pub fn truncate(&self, path: &str, new_size: u64) -> Result<()> {
        let path = normalize(path);
        let arc = self.resolve(&path)?;
        let (coordinator, file_version) = {
            let inode = arc.read().unwrap();
            if inode.itype() != InodeType::File {
                return Err(Error::InvalidArgument(format!("{} is a directory", path)));
            }
            (inode.coordinator(), inode.file_version())
        };

        try_or_coordinate(
            self,
            &path,
            coordinator,
            || self.truncate_local(&path, new_size),
            |coord| {
                let surviving = {
                    let inode = arc.read().unwrap();
                    let drop_id = new_size.div_ceil(self.block_size());
                    inode
                        .manifest()
                        .iter()
                        .filter(|(id, _)| **id < drop_id)
                        .map(|(_, info)| info.version)
                        .collect()
                };
                self.remote_request(
                    coord,
                    &Message::Truncate(TruncateMsg {
                        fs_path: path.clone(),
                        file_version,
                        size: new_size,
                        block_versions: surviving,
                    }),
                )
                .map(|_| ())
            },
        )
    }

    /// ftruncate: truncate through an open handle
    pub fn ftruncate(&self, handle: &FileHandle, new_size: u64) -> Result<()> {
        self.truncate(handle.path(), new_size)
    }

    /// The local half of truncate: zero-fill the straddling tail block,
    /// drop whole blocks past the boundary, reversion, and publish.
    pub(crate) fn truncate_local(&self, path: &str, new_size: u64) -> Result<()> {
        let arc = self.resolve(path)?;
        let (parent_id, parent_name) = self.parent_identity(path)?;
        let block_size = self.block_size();
        let mut inode = arc.write().unwrap();

        let old_size = inode.size();
        if new_size == old_size {
            return Ok(());
        }

        // The tail block that straddles the new boundary is re-read,
        // zeroed past it, and committed as a fresh dirty block
        if new_size < old_size && new_size % block_size != 0 {
            let tail_id = new_size / block_size;
            if inode.manifest().lookup(tail_id).is_some()
                || inode.dirty_blocks().contains_key(&tail_id)
            {
                let (mut buf, _) = self.read_block_payload(&mut inode, tail_id)?;
                buf.resize(block_size as usize, 0);
                let keep = (new_size % block_size) as usize;
                buf[keep..].fill(0);

                let version = inode.next_block_version(tail_id);
                let block = DirtyBlock::new_dirty(tail_id, version, buf);
                inode.commit_dirty_block(self.cache(), block)?;
            }
        }

        let new_version = inode.file_version() + 1;
        inode.truncate(self.cache(), block_size, new_size, new_version);
        self.advance_modtime(&mut inode);

        self.publish_inode(path, &mut inode, parent_id, &parent_name)
    }

    // --- directory handles ---

    /// opendir: snapshot a directory's children
    pub fn opendir(&self, path: &str) -> Result<DirHandle> {
        let arc = self.resolve(path)?;
        if arc.read().unwrap().itype() != InodeType::Dir {
            return Err(Error::InvalidArgument(format!("{} is not a directory", path)));
        }
        Ok(DirHandle::new(path, self.namespace().list_children(path)))
    }

    /// readdir: next `count` names
    pub fn readdir(&self, handle: &mut DirHandle, count: usize) -> Vec<String> {
        handle.read(count).to_vec()
    }

    pub fn rewinddir(&self, handle: &mut DirHandle) {
        handle.rewind()
    }

    pub fn telldir(&self, handle: &DirHandle) -> usize {
        handle.tell()
    }

    pub fn seekdir(&self, handle: &mut DirHandle, loc: usize) {
        handle.seek(loc)
    }

    pub fn closedir(&self, handle: DirHandle) {
        drop(handle);
    }

    // --- extended attributes ---

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: u32) -> Result<()> {
        let arc = self.resolve(path)?;
        let mut inode = arc.write().unwrap();

        let exists = inode.xattrs().contains_key(name);
        if flags & XATTR_CREATE != 0 && exists {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if flags & XATTR_REPLACE != 0 && !exists {
            return Err(Error::NotFound(name.to_string()));
        }

        inode.set_xattr(name, value.to_vec());
        Ok(())
    }

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let arc = self.resolve(path)?;
        let inode = arc.read().unwrap();
        inode
            .xattrs()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        let arc = self.resolve(path)?;
        let inode = arc.read().unwrap();
        Ok(inode.xattrs().keys().cloned().collect())
    }

    pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        let arc = self.resolve(path)?;
        let result = arc.write().unwrap().remove_xattr(name);
        result
    }

    // --- peer request handling ---

    /// Handle one message from a peer gateway (the listener side of the
    /// coordinator dispatch)
    pub fn handle_peer_message(&self, msg: Message) -> Message {
        let result = match msg {
            Message::Write(w) => self.write_local(&w.fs_path, w.offset, &w.data),
            Message::Truncate(t) => self.truncate_local(&t.fs_path, t.size),
            Message::Detach(d) => self.detach_local(&normalize(&d.fs_path)),
            _ => Err(Error::InvalidArgument("unexpected message kind".to_string())),
        };

        match result {
            Ok(()) => Message::Accepted(AcceptedMsg { write_nonce: 0 }),
            Err(e) => Message::Error(ErrorMsg {
                code: e.to_errno(),
                text: e.to_string(),
            }),
        }
    }

    // --- helpers ---

    fn new_entry_record(&self, itype: InodeType, path: &str, mode: u32) -> MdEntry {
        let now = now_timespec();
        MdEntry {
            entry_type: itype.as_md_type(),
            name: basename(path).to_string(),
            volume: self.ms().volume().volume_id,
            coordinator: self.id(),
            owner: self.id(),
            mode,
            version: 1,
            ctime_sec: now.0,
            ctime_nsec: now.1,
            mtime_sec: now.0,
            mtime_nsec: now.1,
            max_read_freshness: self.config().max_read_freshness_ms,
            max_write_freshness: self.config().max_write_freshness_ms,
            ..Default::default()
        }
    }

    fn parent_identity(&self, path: &str) -> Result<(u64, String)> {
        let (_, parent_id, parent_name) = self.namespace().resolve_with_parent(path)?;
        Ok((parent_id, parent_name))
    }

    /// Fetch a block's payload from the dirty map, the staging cache, or
    /// the RGs.  Returns the fetched version when the payload came off an
    /// RG (so the caller can hint its eviction); fetched clean blocks are
    /// cached in the dirty map.
    fn read_block_payload(
        &self,
        inode: &mut Inode,
        block_id: u64,
    ) -> Result<(Vec<u8>, Option<i64>)> {
        if let Some(block) = inode.dirty_blocks().get(&block_id) {
            let payload =
                block.read_payload(self.cache(), inode.file_id(), inode.file_version())?;
            return Ok((payload, None));
        }

        let Some(info) = inode.manifest().lookup(block_id).cloned() else {
            // Write hole
            return Ok((Vec::new(), None));
        };

        let file_id = inode.file_id();
        let file_version = inode.file_version();
        if self
            .cache()
            .contains_block(file_id, file_version, block_id, info.version)
        {
            let payload = self
                .cache()
                .read_block(file_id, file_version, block_id, info.version)?;
            return Ok((payload, None));
        }

        let payload = self
            .rg()
            .get_block(file_id, file_version, block_id, info.version)?;
        let version = info.version;
        inode.cache_clean_block(DirtyBlock::new_clean(info, payload.clone()))?;
        Ok((payload, Some(version)))
    }

    /// Send a framed request to a peer gateway and unwrap the response
    fn remote_request(&self, coordinator: u64, msg: &Message) -> Result<AcceptedMsg> {
        let url = self
            .ms()
            .gateway_url(coordinator)
            .map_err(|_| Error::RemoteUnavailable(format!("gateway {} unknown", coordinator)))?;

        match peer_request(&url, msg)? {
            Message::Accepted(a) => Ok(a),
            Message::Error(e) => Err(remote_error(e)),
            _ => Err(Error::Corrupt("unexpected peer response".to_string())),
        }
    }

    /// Advance the manifest modtime, keeping it strictly increasing even
    /// under bursts faster than the clock
    fn advance_modtime(&self, inode: &mut Inode) {
        let now = now_timespec();
        let prev = inode.manifest().modtime();
        let next = if now > prev { now } else { (prev.0, prev.1 + 1) };
        inode.manifest_mut().set_modtime(next.0, next.1);
        inode.set_mtime(next);
    }

    /// Publish an inode's metadata, refreshing once on a stale nonce.
    /// A second rejection surfaces as `InvalidArgument`.
    fn publish_inode(
        &self,
        path: &str,
        inode: &mut Inode,
        parent_id: u64,
        parent_name: &str,
    ) -> Result<()> {
        let entry = inode.export(parent_id, parent_name);
        match self.ms().update(path, &entry) {
            Ok(updated) => {
                inode.note_published(updated.write_nonce, updated.generation);
                Ok(())
            }
            Err(Error::StaleVersion(_)) => {
                let fresh = self.ms().lookup(path)?;
                let mut retry = entry;
                retry.write_nonce = fresh.write_nonce;
                match self.ms().update(path, &retry) {
                    Ok(updated) => {
                        inode.note_published(updated.write_nonce, updated.generation);
                        Ok(())
                    }
                    Err(Error::StaleVersion(s)) => {
                        inode.set_metadata_stale(true);
                        Err(Error::InvalidArgument(format!(
                            "persistent version mismatch on {}: {}",
                            path, s
                        )))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Map a peer error response back to a local error kind
fn remote_error(e: ErrorMsg) -> Error {
    match e.code {
        libc::ENOENT => Error::NotFound(e.text),
        libc::EACCES => Error::PermissionDenied(e.text),
        libc::EEXIST => Error::AlreadyExists(e.text),
        libc::ESTALE => Error::StaleVersion(e.text),
        libc::ENETDOWN => Error::RemoteUnavailable(e.text),
        libc::EINVAL => Error::InvalidArgument(e.text),
        _ => Error::Io(std::io::Error::other(e.text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{test_env, TestEnv};
    use crate::ms::{MsClient, CAP_COORDINATE};
    use std::time::Duration;

    const BS: u64 = 4096;

    fn written_file(env: &TestEnv, path: &str, data: &[u8]) -> FileHandle {
        let mut fh = env.gateway.create(path, 0o644).unwrap();
        env.gateway.write(&mut fh, data).unwrap();
        fh
    }

    #[test]
    fn test_single_write_and_fsync() {
        let env = test_env(10);
        let fh = written_file(&env, "/x", &[b'A'; BS as usize]);
        let gen_before = env.ms.generation_of("/x").unwrap();

        env.gateway.fsync(&fh).unwrap();

        let arc = env.gateway.namespace().get("/x").unwrap();
        {
            let inode = arc.read().unwrap();
            assert_eq!(inode.size(), BS);
            let info = inode.manifest().lookup(0).unwrap();
            assert_eq!(info.version, 1);
            assert!(!info.dirty);
        }
        assert!(env.rg.has_block(
            arc.read().unwrap().file_id(),
            1,
            0,
            1
        ));
        assert_eq!(env.ms.generation_of("/x").unwrap(), gen_before + 1);

        env.gateway.close(fh).unwrap();
        env.gateway.shutdown();
    }

    #[test]
    fn test_read_back_through_cache_and_rg() {
        let env = test_env(10);
        let mut fh = written_file(&env, "/x", b"hello, volume");
        env.gateway.fsync(&fh).unwrap();

        env.gateway.seek(&mut fh, 0, libc::SEEK_SET).unwrap();
        let data = env.gateway.read(&mut fh, 64).unwrap();
        assert_eq!(data, b"hello, volume");

        // Drop the local staging copy; the next read must hit the RG
        let file_id = fh.inode().read().unwrap().file_id();
        env.gateway.cache().evict_block(file_id, 1, 0, 1);
        {
            let mut inode = fh.inode().write().unwrap();
            let hints: std::collections::BTreeMap<u64, i64> =
                [(0u64, 1i64)].into_iter().collect();
            inode.evict_hinted_blocks(&hints);
        }

        env.gateway.seek(&mut fh, 7, libc::SEEK_SET).unwrap();
        let data = env.gateway.read(&mut fh, 64).unwrap();
        assert_eq!(data, b"volume");

        env.gateway.close(fh).unwrap();
        env.gateway.shutdown();
    }

    #[test]
    fn test_truncate_down_zero_fills_tail() {
        let env = test_env(10);
        let mut fh = env.gateway.create("/x", 0o644).unwrap();
        let payload: Vec<u8> = (0..4 * BS).map(|i| (i % 251) as u8 + 1).collect();
        env.gateway.write(&mut fh, &payload).unwrap();
        env.gateway.fsync(&fh).unwrap();

        env.gateway.truncate("/x", 6000).unwrap();

        let arc = env.gateway.namespace().get("/x").unwrap();
        {
            let inode = arc.read().unwrap();
            assert_eq!(inode.size(), 6000);
            assert_eq!(inode.file_version(), 2);
            assert_eq!(inode.manifest().lookup(0).unwrap().version, 1);
            assert_eq!(inode.manifest().lookup(1).unwrap().version, 2);
            assert!(inode.manifest().lookup(2).is_none());
            assert!(inode.manifest().lookup(3).is_none());
        }

        // Tail block is zero past the boundary
        env.gateway.seek(&mut fh, 4096, libc::SEEK_SET).unwrap();
        let tail = env.gateway.read(&mut fh, BS as usize).unwrap();
        assert_eq!(tail.len(), 6000 - 4096);
        assert_eq!(&tail[..100], &payload[4096..4196]);

        env.gateway.seek(&mut fh, 0, libc::SEEK_END).unwrap();
        assert_eq!(fh.offset(), 6000);

        env.gateway.close(fh).unwrap();
        env.gateway.shutdown();
    }

    #[test]
    fn test_coordinator_takeover_on_write() {
        let env = test_env(10);
        env.ms.grant_caps(10, CAP_COORDINATE);

        // /x is coordinated by unreachable gateway 20
        env.ms
            .create("/x", MdEntry {
                entry_type: crate::ms::MD_ENTRY_FILE,
                name: "x".to_string(),
                coordinator: 20,
                version: 1,
                ..Default::default()
            })
            .unwrap();
        env.ms.register_gateway(20, "127.0.0.1:1");

        let mut fh = env.gateway.open("/x", crate::fs::handle::O_RDWR).unwrap();
        env.gateway.write(&mut fh, &[b'B'; 512]).unwrap();

        // The takeover flipped the coordinator and the write ran locally
        assert_eq!(env.ms.lookup("/x").unwrap().coordinator, 10);
        {
            let inode = fh.inode().read().unwrap();
            assert_eq!(inode.coordinator(), 10);
            assert!(inode.manifest().lookup(0).unwrap().dirty);
        }

        env.gateway.fsync(&fh).unwrap();
        let file_id = fh.inode().read().unwrap().file_id();
        assert!(env.rg.has_block(file_id, 1, 0, 1));

        env.gateway.close(fh).unwrap();
        env.gateway.shutdown();
    }

    #[test]
    fn test_fsync_failure_restores_and_retry_succeeds() {
        let env = test_env(10);
        let fh = written_file(&env, "/x", &[b'C'; BS as usize]);

        env.rg.set_fail_puts(true);
        let err = env.gateway.fsync(&fh).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);

        {
            let inode = fh.inode().read().unwrap();
            let info = inode.manifest().lookup(0).unwrap();
            assert!(info.dirty, "restore must re-set the manifest dirty bit");
            assert!(inode.dirty_blocks().get(&0).unwrap().dirty());
        }

        env.rg.set_fail_puts(false);
        env.gateway.fsync(&fh).unwrap();
        let file_id = fh.inode().read().unwrap().file_id();
        assert!(env.rg.has_block(file_id, 1, 0, 1));

        env.gateway.close(fh).unwrap();
        env.gateway.shutdown();
    }

    #[test]
    fn test_ordered_fsyncs_fifo() {
        let env = test_env(10);
        let mut fh = env.gateway.create("/x", 0o644).unwrap();
        env.gateway.write(&mut fh, &[1u8; BS as usize]).unwrap();
        let gen_before = env.ms.generation_of("/x").unwrap();

        // Hold the first fsync inside replication long enough for the
        // second to queue behind it
        env.rg.set_put_delay(Duration::from_millis(300));

        let gateway = &env.gateway;
        let first_result = std::thread::scope(|s| {
            let t1 = s.spawn(|| gateway.fsync_path("/x"));

            std::thread::sleep(Duration::from_millis(100));
            env.gateway.write(&mut fh, &[2u8; BS as usize]).unwrap();
            env.rg.set_put_delay(Duration::ZERO);
            gateway.fsync_path("/x").unwrap();

            t1.join().unwrap()
        });
        first_result.unwrap();

        let log = env.rg.manifest_log();
        assert_eq!(log.len(), 2, "both fsyncs published a manifest");
        assert!(
            log[0].2 < log[1].2,
            "the first snapshot's modtime reached the RG first"
        );
        assert_eq!(env.ms.generation_of("/x").unwrap(), gen_before + 2);

        env.gateway.close(fh).unwrap();
        env.gateway.shutdown();
    }

    #[test]
    fn test_unlink_detaches_everywhere() {
        let env = test_env(10);
        let fh = written_file(&env, "/x", b"bye");
        env.gateway.fsync(&fh).unwrap();
        env.gateway.close(fh).unwrap();

        env.gateway.unlink("/x").unwrap();
        assert!(env.gateway.namespace().get("/x").is_none());
        assert!(matches!(env.ms.lookup("/x"), Err(Error::NotFound(_))));
        assert!(matches!(
            env.gateway.stat("/x"),
            Err(Error::NotFound(_))
        ));
        env.gateway.shutdown();
    }

    #[test]
    fn test_mkdir_readdir_rmdir() {
        let env = test_env(10);
        env.gateway.mkdir("/d", 0o755).unwrap();
        env.gateway.create("/d/a", 0o644).map(|fh| env.gateway.close(fh).unwrap()).unwrap();
        env.gateway.create("/d/b", 0o644).map(|fh| env.gateway.close(fh).unwrap()).unwrap();

        let mut dh = env.gateway.opendir("/d").unwrap();
        assert_eq!(env.gateway.readdir(&mut dh, 10), vec!["a", "b"]);
        env.gateway.rewinddir(&mut dh);
        assert_eq!(env.gateway.readdir(&mut dh, 1), vec!["a"]);
        assert_eq!(env.gateway.telldir(&dh), 1);
        env.gateway.closedir(dh);

        assert!(env.gateway.rmdir("/d").is_err());
        env.gateway.unlink("/d/a").unwrap();
        env.gateway.unlink("/d/b").unwrap();
        env.gateway.rmdir("/d").unwrap();
        env.gateway.shutdown();
    }

    #[test]
    fn test_xattr_surface() {
        let env = test_env(10);
        let fh = written_file(&env, "/x", b"data");
        env.gateway.close(fh).unwrap();

        env.gateway
            .setxattr("/x", "user.tag", b"blue", XATTR_CREATE)
            .unwrap();
        assert!(env
            .gateway
            .setxattr("/x", "user.tag", b"red", XATTR_CREATE)
            .is_err());
        env.gateway
            .setxattr("/x", "user.tag", b"red", XATTR_REPLACE)
            .unwrap();

        assert_eq!(env.gateway.getxattr("/x", "user.tag").unwrap(), b"red");
        assert_eq!(env.gateway.listxattr("/x").unwrap(), vec!["user.tag"]);
        env.gateway.removexattr("/x", "user.tag").unwrap();
        assert!(env.gateway.getxattr("/x", "user.tag").is_err());
        env.gateway.shutdown();
    }

    #[test]
    fn test_rename_moves_entry() {
        let env = test_env(10);
        let fh = written_file(&env, "/x", b"data");
        env.gateway.close(fh).unwrap();

        env.gateway.rename("/x", "/y").unwrap();
        assert!(env.gateway.namespace().get("/y").is_some());
        assert!(env.gateway.namespace().get("/x").is_none());
        assert!(env.ms.lookup("/y").is_ok());
        env.gateway.shutdown();
    }
}
