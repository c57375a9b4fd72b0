//! File/collection surface: a path-centric handle over one connection,
//! with a lazy stat cache and an open-descriptor lifecycle.

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::error::{IrodsError, Result};
use crate::packinstr::{
    api, obj_type, opr, CollEntList, CollEntry, CollInp, DataObjCopyInp, DataObjInp, FileLseekOut,
    OpenedDataObjInp, RodsObjStat, StrInfo, kw,
};
use crate::path::IrodsPath;
use crate::session::ConnRef;
use crate::uri::IrodsUri;

/// POSIX-style open flags carried in DataObjInp.openFlags
pub mod open_flags {
    pub const O_RDONLY: i32 = 0;
    pub const O_WRONLY: i32 = 1;
    pub const O_RDWR: i32 = 2;
    pub const O_TRUNC: i32 = 512;
}

/// What a path points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    DataObject,
    Collection,
    Unknown,
}

#[derive(Debug, Clone, Default)]
struct StatCache {
    /// None = not yet queried; Some(Unknown) = queried, absent
    kind: Option<ObjKind>,
    length: Option<i64>,
    modified: Option<i64>,
    owner: Option<String>,
    resource: Option<String>,
}

/// A data object or collection addressed by canonical path.
///
/// Exclusively owned by the thread that created it and tied to the
/// connection it references. A positive descriptor means a server-side
/// stream is open and will be closed exactly once.
pub struct IrodsFile {
    conn: ConnRef,
    path: IrodsPath,
    cache: StatCache,
    resource_override: Option<String>,
    fd: Option<i32>,
}

impl IrodsFile {
    /// Resolve `raw_path` (absolute, or relative to the account home)
    /// into a handle.
    pub fn new(conn: ConnRef, raw_path: &str) -> IrodsFile {
        let home = conn.borrow().account().home.clone();
        let path = IrodsPath::resolve(raw_path, &home);
        IrodsFile::at(conn, path)
    }

    pub fn at(conn: ConnRef, path: IrodsPath) -> IrodsFile {
        IrodsFile {
            conn,
            path,
            cache: StatCache::default(),
            resource_override: None,
            fd: None,
        }
    }

    pub fn path(&self) -> &IrodsPath {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn uri(&self) -> String {
        IrodsUri::render(self.conn.borrow().account(), &self.path)
    }

    /// Drop the stat cache; the next query goes back to the server
    pub fn reset(&mut self) {
        self.cache = StatCache::default();
    }

    fn stat_raw(&mut self) -> Result<Option<RodsObjStat>> {
        let inp = DataObjInp::at(self.path.to_string());
        let reply = self
            .conn
            .borrow_mut()
            .send(api::OBJ_STAT_AN, Some(&inp.to_tag()));
        let frame = match reply {
            Ok(frame) => frame,
            Err(IrodsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body = frame
            .body
            .as_ref()
            .ok_or_else(|| IrodsError::Protocol("stat reply with no body".into()))?;
        Ok(Some(RodsObjStat::from_tag(body)?))
    }

    /// Populate the cache from one stat round trip
    fn ensure_stat(&mut self) -> Result<()> {
        if self.cache.kind.is_some() {
            return Ok(());
        }
        match self.stat_raw()? {
            Some(stat) => {
                self.cache.kind = Some(match stat.obj_type {
                    obj_type::DATA_OBJ_T => ObjKind::DataObject,
                    obj_type::COLL_OBJ_T => ObjKind::Collection,
                    _ => ObjKind::Unknown,
                });
                self.cache.length = Some(stat.obj_size);
                self.cache.modified = Some(stat.modify_time);
                self.cache.owner = Some(stat.owner_name);
                self.cache.resource = Some(stat.resc_name);
            }
            None => {
                self.cache.kind = Some(ObjKind::Unknown);
                self.cache.length = Some(0);
            }
        }
        Ok(())
    }

    /// Absence reads as `false`, never as an error
    pub fn exists(&mut self) -> Result<bool> {
        self.ensure_stat()?;
        Ok(!matches!(self.cache.kind, Some(ObjKind::Unknown)))
    }

    pub fn is_file(&mut self) -> Result<bool> {
        self.ensure_stat()?;
        Ok(matches!(self.cache.kind, Some(ObjKind::DataObject)))
    }

    pub fn is_dir(&mut self) -> Result<bool> {
        self.ensure_stat()?;
        Ok(matches!(self.cache.kind, Some(ObjKind::Collection)))
    }

    /// Length in bytes; 0 when the path does not exist
    pub fn length(&mut self) -> Result<u64> {
        self.ensure_stat()?;
        Ok(self.cache.length.unwrap_or(0).max(0) as u64)
    }

    pub fn last_modified(&mut self) -> Result<Option<DateTime<Utc>>> {
        self.ensure_stat()?;
        Ok(self
            .cache
            .modified
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
    }

    pub fn owner(&mut self) -> Result<Option<String>> {
        self.ensure_stat()?;
        Ok(self.cache.owner.clone())
    }

    /// Children of this collection
    pub fn list_children(&mut self) -> Result<Vec<CollEntry>> {
        let inp = CollInp::at(self.path.to_string());
        let frame = self
            .conn
            .borrow_mut()
            .send(api::COLL_LIST_AN, Some(&inp.to_tag()))?;
        let body = frame
            .body
            .as_ref()
            .ok_or_else(|| IrodsError::Protocol("listing reply with no body".into()))?;
        Ok(CollEntList::from_tag(body)?.entries)
    }

    pub fn child_names(&mut self) -> Result<Vec<String>> {
        Ok(self
            .list_children()?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Create this collection. `false` when it already exists.
    pub fn mkdir(&mut self) -> Result<bool> {
        self.mkdir_inner(false)
    }

    /// Create this collection and any missing parents. `false` when it
    /// already exists.
    pub fn mkdirs(&mut self) -> Result<bool> {
        self.mkdir_inner(true)
    }

    fn mkdir_inner(&mut self, parents: bool) -> Result<bool> {
        let mut inp = CollInp::at(self.path.to_string());
        if parents {
            inp.cond_input.set(kw::RECURSIVE_OPR, "");
        }
        let result = self
            .conn
            .borrow_mut()
            .send(api::COLL_CREATE_AN, Some(&inp.to_tag()));
        self.reset();
        match result {
            Ok(_) => Ok(true),
            Err(IrodsError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete this entry; collections are removed recursively.
    /// `false` when nothing existed to delete.
    pub fn delete(&mut self, force: bool) -> Result<bool> {
        self.ensure_stat()?;
        let kind = self.cache.kind.unwrap_or(ObjKind::Unknown);
        let result = match kind {
            ObjKind::Unknown => return Ok(false),
            ObjKind::Collection => {
                let mut inp = CollInp::at(self.path.to_string());
                inp.cond_input.set(kw::RECURSIVE_OPR, "");
                if force {
                    inp.cond_input.set(kw::FORCE_FLAG, "");
                }
                self.conn
                    .borrow_mut()
                    .send(api::RM_COLL_AN, Some(&inp.to_tag()))
            }
            ObjKind::DataObject => {
                let mut inp = DataObjInp::at(self.path.to_string());
                if force {
                    inp.cond_input.set(kw::FORCE_FLAG, "");
                }
                self.conn
                    .borrow_mut()
                    .send(api::DATA_OBJ_UNLINK_AN, Some(&inp.to_tag()))
            }
        };
        self.reset();
        match result {
            Ok(_) => Ok(true),
            Err(IrodsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Rename/move within the zone. Renaming to the identical path is
    /// a no-op that succeeds.
    pub fn rename(&mut self, target: &IrodsPath) -> Result<()> {
        if *target == self.path {
            return Ok(());
        }
        self.ensure_stat()?;
        let opr_type = match self.cache.kind.unwrap_or(ObjKind::Unknown) {
            ObjKind::DataObject => opr::RENAME_DATA_OBJ,
            ObjKind::Collection => opr::RENAME_COLL,
            ObjKind::Unknown => {
                return Err(IrodsError::NotFound(self.path.to_string()));
            }
        };
        let mut src = DataObjInp::at(self.path.to_string());
        src.opr_type = opr_type;
        let mut dst = DataObjInp::at(target.to_string());
        dst.opr_type = opr_type;
        let inp = DataObjCopyInp { src, dst };
        self.conn
            .borrow_mut()
            .send(api::DATA_OBJ_RENAME_AN, Some(&inp.to_tag()))?;
        debug!(from = %self.path, to = %target, "renamed");
        self.path = target.clone();
        self.reset();
        Ok(())
    }

    /// Move the physical replica to another resource; the logical path
    /// does not change.
    pub fn physical_move(&mut self, resource: &str) -> Result<()> {
        let mut inp = DataObjInp::at(self.path.to_string());
        inp.opr_type = opr::PHYMV_OPR;
        inp.cond_input.set(kw::DEST_RESC_NAME, resource);
        self.conn
            .borrow_mut()
            .send(api::DATA_OBJ_PHYMV_AN, Some(&inp.to_tag()))?;
        self.reset();
        Ok(())
    }

    /// Open the data object; the descriptor stays with this handle
    /// until `close`.
    pub fn open(&mut self, flags: i32) -> Result<()> {
        if self.fd.is_some() {
            return Err(IrodsError::Internal(format!(
                "{} is already open",
                self.path
            )));
        }
        let mut inp = DataObjInp::at(self.path.to_string());
        inp.open_flags = flags;
        if let Some(resc) = &self.resource_override {
            inp.cond_input.set(kw::DEST_RESC_NAME, resc);
        }
        let frame = self
            .conn
            .borrow_mut()
            .send(api::DATA_OBJ_OPEN_AN, Some(&inp.to_tag()))?;
        if frame.int_info <= 0 {
            return Err(IrodsError::Protocol(format!(
                "open returned descriptor {}",
                frame.int_info
            )));
        }
        self.fd = Some(frame.int_info);
        Ok(())
    }

    /// Create (or truncate) the data object and open it for writing
    pub fn create(&mut self) -> Result<()> {
        if self.fd.is_some() {
            return Err(IrodsError::Internal(format!(
                "{} is already open",
                self.path
            )));
        }
        let mut inp = DataObjInp::at(self.path.to_string());
        inp.create_mode = 0o600;
        inp.open_flags = open_flags::O_WRONLY | open_flags::O_TRUNC;
        if let Some(resc) = &self.resource_override {
            inp.cond_input.set(kw::DEST_RESC_NAME, resc);
        }
        let frame = self
            .conn
            .borrow_mut()
            .send(api::DATA_OBJ_CREATE_AN, Some(&inp.to_tag()))?;
        if frame.int_info <= 0 {
            return Err(IrodsError::Protocol(format!(
                "create returned descriptor {}",
                frame.int_info
            )));
        }
        self.fd = Some(frame.int_info);
        self.reset();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn descriptor(&self) -> Option<i32> {
        self.fd
    }

    /// Read up to `len` bytes from the open stream
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let fd = self.require_open()?;
        let mut inp = OpenedDataObjInp::for_fd(fd);
        inp.len = len as i64;
        let frame = self
            .conn
            .borrow_mut()
            .send(api::DATA_OBJ_READ_AN, Some(&inp.to_tag()))?;
        Ok(frame.bs)
    }

    /// Write bytes to the open stream, returning the count accepted
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let fd = self.require_open()?;
        let mut inp = OpenedDataObjInp::for_fd(fd);
        inp.len = data.len() as i64;
        let frame = self
            .conn
            .borrow_mut()
            .send_with_blob(api::DATA_OBJ_WRITE_AN, Some(&inp.to_tag()), data)?;
        self.cache.length = None;
        Ok(frame.int_info.max(0) as usize)
    }

    /// Reposition the open stream; returns the resulting offset
    pub fn seek(&mut self, offset: i64, whence_flag: i32) -> Result<i64> {
        let fd = self.require_open()?;
        let mut inp = OpenedDataObjInp::for_fd(fd);
        inp.offset = offset;
        inp.whence = whence_flag;
        let frame = self
            .conn
            .borrow_mut()
            .send(api::DATA_OBJ_LSEEK_AN, Some(&inp.to_tag()))?;
        let body = frame
            .body
            .as_ref()
            .ok_or_else(|| IrodsError::Protocol("seek reply with no body".into()))?;
        Ok(FileLseekOut::from_tag(body)?.offset)
    }

    /// Close the open stream. Safe to call repeatedly; only the first
    /// call reaches the wire.
    pub fn close(&mut self) -> Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let inp = OpenedDataObjInp::for_fd(fd);
        self.conn
            .borrow_mut()
            .send(api::DATA_OBJ_CLOSE_AN, Some(&inp.to_tag()))?;
        self.reset();
        Ok(())
    }

    /// Server-computed checksum of the data object
    pub fn checksum(&mut self) -> Result<String> {
        let inp = DataObjInp::at(self.path.to_string());
        let frame = self
            .conn
            .borrow_mut()
            .send(api::DATA_OBJ_CHKSUM_AN, Some(&inp.to_tag()))?;
        let body = frame
            .body
            .as_ref()
            .ok_or_else(|| IrodsError::Protocol("checksum reply with no body".into()))?;
        Ok(StrInfo::from_tag(body)?.value)
    }

    /// The caller-set resource override. This never consults the
    /// catalog; for the resource a replica actually lives on, use the
    /// stat owner/resource fields.
    pub fn resource(&self) -> Option<&str> {
        self.resource_override.as_deref()
    }

    pub fn set_resource(&mut self, resource: impl Into<String>) {
        self.resource_override = Some(resource.into());
    }

    // Host-filesystem operations that have no iRODS representation

    pub fn set_executable(&mut self, _flag: bool) -> Result<()> {
        Err(IrodsError::NotSupported("setExecutable on an iRODS path"))
    }

    pub fn set_readable(&mut self, _flag: bool) -> Result<()> {
        Err(IrodsError::NotSupported("setReadable on an iRODS path"))
    }

    pub fn set_writable(&mut self, _flag: bool) -> Result<()> {
        Err(IrodsError::NotSupported("setWritable on an iRODS path"))
    }

    pub fn set_last_modified(&mut self, _when: DateTime<Utc>) -> Result<()> {
        Err(IrodsError::NotSupported("setLastModified on an iRODS path"))
    }

    pub fn delete_on_exit(&mut self) -> Result<()> {
        Err(IrodsError::NotSupported("deleteOnExit on an iRODS path"))
    }

    pub fn free_space(&self) -> Result<u64> {
        Err(IrodsError::NotSupported("getFreeSpace on an iRODS path"))
    }

    pub fn total_space(&self) -> Result<u64> {
        Err(IrodsError::NotSupported("getTotalSpace on an iRODS path"))
    }

    pub fn usable_space(&self) -> Result<u64> {
        Err(IrodsError::NotSupported("getUsableSpace on an iRODS path"))
    }

    fn require_open(&self) -> Result<i32> {
        self.fd
            .ok_or_else(|| IrodsError::Internal(format!("{} is not open", self.path)))
    }
}

impl Drop for IrodsFile {
    fn drop(&mut self) {
        if self.fd.is_some() {
            if let Err(e) = self.close() {
                warn!(path = %self.path, "descriptor leaked at drop: {}", e);
            }
        }
    }
}
