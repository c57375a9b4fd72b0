//! Transfer orchestrator: put, get, replicate, copy, and move, with
//! directory recursion, pre-counts, status events, and per-file error
//! policy.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::checksum::{self, ChecksumType};
use crate::connection::IrodsConnection;
use crate::control::{
    ErrorPolicy, ListenerRef, TransferControlBlock, TransferKind, TransferPhase, TransferStatus,
};
use crate::error::{IrodsError, Result};
use crate::file::IrodsFile;
use crate::packinstr::{
    api, kw, obj_type, opr, DataObjCopyInp, DataObjInp, IntInfo, PortalOprOut,
};
use crate::parallel;
use crate::path::IrodsPath;
use crate::restart::{RestartLog, RestartStatus, JOURNAL_FILE_NAME};
use crate::session::ConnRef;

/// Bulk data movement over one connection handle. Parallel phases open
/// their own data sockets; all control traffic stays serialized on the
/// handle.
pub struct DataTransfer {
    conn: ConnRef,
}

struct TransferCtx {
    kind: TransferKind,
    listener: Option<ListenerRef>,
    tcb: Arc<TransferControlBlock>,
    host: String,
    zone: String,
    resource: String,
}

impl TransferCtx {
    fn template(&self, source: &str, target: &str) -> TransferStatus {
        TransferStatus {
            kind: self.kind,
            source: source.to_string(),
            target: target.to_string(),
            target_resource: self.resource.clone(),
            bytes_transferred: self.tcb.bytes_transferred(),
            bytes_total: self.tcb.bytes_total(),
            files_transferred: self.tcb.files_transferred(),
            files_total: self.tcb.files_total(),
            phase: TransferPhase::InProgress,
            host: self.host.clone(),
            zone: self.zone.clone(),
            failure: None,
        }
    }

    fn emit(&self, phase: TransferPhase, source: &str, target: &str, failure: Option<&IrodsError>) {
        if let Some(listener) = &self.listener {
            let mut status = self.template(source, target);
            status.phase = phase;
            status.failure = failure.map(|e| e.to_string());
            listener.status(&status);
        }
    }

    /// Cancellation checkpoint: emits the terminal status when tripped
    fn checkpoint(&self, source: &str, target: &str) -> Result<()> {
        if self.tcb.is_cancelled() {
            self.emit(TransferPhase::Cancelled, source, target, None);
            return Err(IrodsError::Cancelled);
        }
        Ok(())
    }

    /// Per-file failure handling: record, report, and decide whether
    /// the transfer continues.
    fn file_failed(&self, source: &str, target: &str, err: IrodsError) -> Result<()> {
        self.tcb.record_error(&err.to_string());
        self.emit(TransferPhase::Failure, source, target, Some(&err));
        let fail_fast = self.tcb.options().error_policy == ErrorPolicy::FailFast;
        if self.listener.is_none() || fail_fast {
            return Err(err);
        }
        warn!(source, target, "continuing past per-file failure: {}", err);
        Ok(())
    }
}

impl DataTransfer {
    pub fn new(conn: ConnRef) -> DataTransfer {
        DataTransfer { conn }
    }

    fn make_ctx(
        &self,
        kind: TransferKind,
        resource: &str,
        listener: Option<ListenerRef>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> TransferCtx {
        let conn = self.conn.borrow();
        let tcb =
            control.unwrap_or_else(|| TransferControlBlock::defaults(conn.config()));
        TransferCtx {
            kind,
            listener,
            tcb,
            host: conn.account().host.clone(),
            zone: conn.account().zone.clone(),
            resource: resource.to_string(),
        }
    }

    fn home(&self) -> String {
        self.conn.borrow().account().home.clone()
    }

    fn default_resource(&self) -> String {
        self.conn.borrow().account().default_resource.clone()
    }

    /// Replace a dead handle with a fresh authenticated connection
    fn reconnect(&self) -> Result<()> {
        let (account, config) = {
            let conn = self.conn.borrow();
            (conn.account().clone(), conn.config().clone())
        };
        debug!(account = %account, "reconnecting after transient failure");
        let fresh = IrodsConnection::connect(&account, &config)?;
        *self.conn.borrow_mut() = fresh;
        Ok(())
    }

    /// Upload a local file or directory tree to an iRODS path.
    pub fn put(
        &self,
        local: &Path,
        remote: &str,
        listener: Option<ListenerRef>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<()> {
        let resource = self.default_resource();
        let ctx = self.make_ctx(TransferKind::Put, &resource, listener, control);
        let remote_path = IrodsPath::resolve(remote, &self.home());
        let local_display = local.display().to_string();

        if !local.exists() {
            let err = IrodsError::NotFound(local_display.clone());
            ctx.emit(TransferPhase::Failure, &local_display, &remote_path.to_string(), Some(&err));
            return Err(err);
        }

        if local.is_dir() {
            self.put_directory(&ctx, local, &remote_path)
        } else {
            self.put_one_file_transfer(&ctx, local, &remote_path)
        }
    }

    fn put_one_file_transfer(
        &self,
        ctx: &TransferCtx,
        local: &Path,
        remote_path: &IrodsPath,
    ) -> Result<()> {
        let local_display = local.display().to_string();
        let size = std::fs::metadata(local)?.len();

        // Put onto an existing collection drops the file inside it
        let mut target = remote_path.clone();
        {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), target.clone());
            if entity.is_dir()? {
                let leaf = local
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| IrodsError::NotFound(local_display.clone()))?;
                target = target.join(&leaf);
            }
        }
        let target_display = target.to_string();

        ctx.tcb.set_totals(1, size);
        ctx.emit(TransferPhase::OverallInitiation, &local_display, &target_display, None);
        ctx.checkpoint(&local_display, &target_display)?;

        match self.put_single_with_retry(ctx, local, &target, size) {
            Ok(()) => {
                ctx.tcb.add_file();
                ctx.emit(TransferPhase::Success, &local_display, &target_display, None);
                ctx.emit(
                    TransferPhase::OverallCompletion,
                    &local_display,
                    &target_display,
                    None,
                );
                Ok(())
            }
            Err(IrodsError::Cancelled) => {
                ctx.emit(TransferPhase::Cancelled, &local_display, &target_display, None);
                Err(IrodsError::Cancelled)
            }
            Err(e) => {
                ctx.tcb.record_error(&e.to_string());
                ctx.emit(TransferPhase::Failure, &local_display, &target_display, Some(&e));
                if ctx.listener.is_some()
                    && ctx.tcb.options().error_policy == ErrorPolicy::ContinueOnError
                {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn put_directory(&self, ctx: &TransferCtx, local: &Path, remote_parent: &IrodsPath) -> Result<()> {
        let local_display = local.display().to_string();

        // Put of a tree requires the target to be an existing
        // collection or absent
        {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), remote_parent.clone());
            if entity.exists()? && !entity.is_dir()? {
                return Err(IrodsError::AlreadyExists(format!(
                    "{} is a data object, not a collection",
                    remote_parent
                )));
            }
        }

        let leaf = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| IrodsError::NotFound(local_display.clone()))?;
        let target_root = remote_parent.join(&leaf);
        let target_display = target_root.to_string();

        let (files, bytes) = precount_local(local)?;
        ctx.tcb.set_totals(files, bytes);
        debug!(files, bytes, "pre-counted local tree for put");
        ctx.emit(TransferPhase::OverallInitiation, &local_display, &target_display, None);

        let journal = ctx
            .tcb
            .options()
            .restartable
            .then(|| RestartLog::for_local_root(local));
        let completed = match &journal {
            Some(journal) => journal.completed()?,
            None => Default::default(),
        };

        {
            let mut root = IrodsFile::at(Rc::clone(&self.conn), target_root.clone());
            root.mkdirs()?;
        }

        for entry in WalkDir::new(local)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let rel = match entry.path().strip_prefix(local) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };
            let target = join_relative(&target_root, &rel);
            let source_display = entry.path().display().to_string();
            ctx.checkpoint(&source_display, &target.to_string())?;

            if entry.file_type().is_dir() {
                let mut coll = IrodsFile::at(Rc::clone(&self.conn), target);
                coll.mkdirs()?;
                continue;
            }
            if !entry.file_type().is_file() || entry.file_name() == JOURNAL_FILE_NAME {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if completed.get(&source_display) == Some(&size) {
                // Finished in an earlier run of this transfer
                ctx.tcb.add_skipped_file();
                ctx.tcb.add_file();
                ctx.tcb.add_bytes(size);
                ctx.emit(TransferPhase::Restarting, &source_display, &target.to_string(), None);
                continue;
            }

            if let Some(journal) = &journal {
                journal.record("put", &source_display, &target.to_string(), RestartStatus::InProgress, 0)?;
            }
            match self.put_single_with_retry(ctx, entry.path(), &target, size) {
                Ok(()) => {
                    ctx.tcb.add_file();
                    if let Some(journal) = &journal {
                        journal.record(
                            "put",
                            &source_display,
                            &target.to_string(),
                            RestartStatus::Completed,
                            size,
                        )?;
                    }
                    ctx.emit(TransferPhase::Success, &source_display, &target.to_string(), None);
                }
                Err(IrodsError::Cancelled) => {
                    ctx.emit(TransferPhase::Cancelled, &source_display, &target.to_string(), None);
                    return Err(IrodsError::Cancelled);
                }
                Err(e) => {
                    if let Some(journal) = &journal {
                        journal.record(
                            "put",
                            &source_display,
                            &target.to_string(),
                            RestartStatus::Failed,
                            0,
                        )?;
                    }
                    ctx.file_failed(&source_display, &target.to_string(), e)?;
                }
            }
        }

        ctx.emit(TransferPhase::OverallCompletion, &local_display, &target_display, None);
        if let Some(journal) = &journal {
            journal.clear();
        }
        Ok(())
    }

    fn put_single_with_retry(
        &self,
        ctx: &TransferCtx,
        local: &Path,
        remote: &IrodsPath,
        size: u64,
    ) -> Result<()> {
        match self.put_single(ctx, local, remote, size) {
            Err(e) if e.is_recoverable() && !ctx.tcb.is_cancelled() => {
                warn!(remote = %remote, "put failed ({}), reconnecting for one retry", e);
                self.reconnect()?;
                self.put_single(ctx, local, remote, size)
            }
            other => other,
        }
    }

    fn put_single(&self, ctx: &TransferCtx, local: &Path, remote: &IrodsPath, size: u64) -> Result<()> {
        let options = ctx.tcb.options().clone();
        let config = self.conn.borrow().config().clone();

        let mut inp = DataObjInp::at(remote.to_string());
        inp.data_size = size as i64;
        inp.opr_type = opr::PUT_OPR;
        inp.create_mode = 0o600;
        if options.force_overwrite {
            inp.cond_input.set(kw::FORCE_FLAG, "");
        }
        if !ctx.resource.is_empty() {
            inp.cond_input.set(kw::DEST_RESC_NAME, &ctx.resource);
        }
        if options.compute_checksum {
            inp.cond_input.set(kw::REG_CHKSUM, "");
        }

        let parallel_wanted =
            options.parallel_threads > 1 && size > config.parallel_threshold && options.allow_redirect;
        if !parallel_wanted {
            inp.num_threads = 0;
            let mut f = File::open(local)?;
            self.conn.borrow_mut().send_streaming_blob(
                api::DATA_OBJ_PUT_AN,
                Some(&inp.to_tag()),
                size,
                &mut f,
            )?;
            ctx.tcb.add_bytes(size);
        } else {
            inp.num_threads = options.parallel_threads as i32;
            let portal = {
                let frame = self
                    .conn
                    .borrow_mut()
                    .send(api::DATA_OBJ_PUT_AN, Some(&inp.to_tag()))?;
                let body = frame
                    .body
                    .as_ref()
                    .ok_or_else(|| IrodsError::Protocol("put reply with no portal".into()))?;
                PortalOprOut::from_tag(body)?
            };
            let session = self.conn.borrow().session().clone();
            let template = ctx.template(&local.display().to_string(), &remote.to_string());
            let result = parallel::parallel_put(
                &config,
                &session,
                &portal,
                local,
                size,
                &ctx.tcb,
                ctx.listener.as_ref(),
                &template,
            );
            self.opr_complete(portal.l1desc_inx, result)?;
        }

        if options.verify_checksum {
            self.verify_checksum(local, remote)?;
        }
        Ok(())
    }

    /// The handshake the server needs to release the originating
    /// operation. Sent on success and failure alike; losing it leaves
    /// server-side rules stuck, so a send failure is loud.
    fn opr_complete(&self, l1desc_inx: i32, transfer_result: Result<()>) -> Result<()> {
        let complete = IntInfo { value: l1desc_inx };
        let sent = self
            .conn
            .borrow_mut()
            .send(api::OPR_COMPLETE_AN, Some(&complete.to_tag()));
        match (transfer_result, sent) {
            (Ok(()), Ok(_)) => Ok(()),
            (Ok(()), Err(e)) => {
                warn!("OprComplete could not be delivered: {}", e);
                Err(e)
            }
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(complete_err)) => {
                warn!(
                    "OprComplete could not be delivered after failed transfer: {}",
                    complete_err
                );
                Err(e)
            }
        }
    }

    fn verify_checksum(&self, local: &Path, remote: &IrodsPath) -> Result<()> {
        let server = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), remote.clone());
            entity.checksum()?
        };
        let local_digest = checksum::digest_file(local, ChecksumType::Md5)?;
        if server != local_digest {
            return Err(IrodsError::Protocol(format!(
                "checksum mismatch for {}: server {} local {}",
                remote, server, local_digest
            )));
        }
        Ok(())
    }

    /// Download an iRODS data object or collection tree to a local
    /// path.
    pub fn get(
        &self,
        remote: &str,
        local: &Path,
        listener: Option<ListenerRef>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<()> {
        let resource = self.default_resource();
        let ctx = self.make_ctx(TransferKind::Get, &resource, listener, control);
        let remote_path = IrodsPath::resolve(remote, &self.home());
        let remote_display = remote_path.to_string();

        let (exists, is_dir, size) = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), remote_path.clone());
            (entity.exists()?, entity.is_dir()?, entity.length()?)
        };
        if !exists {
            let err = IrodsError::NotFound(remote_display.clone());
            ctx.emit(TransferPhase::Failure, &remote_display, &local.display().to_string(), Some(&err));
            return Err(err);
        }

        if is_dir {
            self.get_directory(&ctx, &remote_path, local)
        } else {
            self.get_one_file_transfer(&ctx, &remote_path, local, size)
        }
    }

    fn get_one_file_transfer(
        &self,
        ctx: &TransferCtx,
        remote_path: &IrodsPath,
        local: &Path,
        size: u64,
    ) -> Result<()> {
        let remote_display = remote_path.to_string();
        let mut local_target = local.to_path_buf();
        if local_target.is_dir() {
            local_target = local_target.join(remote_path.name());
        }
        let local_display = local_target.display().to_string();

        ctx.tcb.set_totals(1, size);
        ctx.emit(TransferPhase::OverallInitiation, &remote_display, &local_display, None);
        ctx.checkpoint(&remote_display, &local_display)?;

        match self.get_single_with_retry(ctx, remote_path, &local_target, size) {
            Ok(()) => {
                ctx.tcb.add_file();
                ctx.emit(TransferPhase::Success, &remote_display, &local_display, None);
                ctx.emit(TransferPhase::OverallCompletion, &remote_display, &local_display, None);
                Ok(())
            }
            Err(IrodsError::Cancelled) => {
                ctx.emit(TransferPhase::Cancelled, &remote_display, &local_display, None);
                Err(IrodsError::Cancelled)
            }
            Err(e) => {
                ctx.tcb.record_error(&e.to_string());
                ctx.emit(TransferPhase::Failure, &remote_display, &local_display, Some(&e));
                if ctx.listener.is_some()
                    && ctx.tcb.options().error_policy == ErrorPolicy::ContinueOnError
                {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn get_directory(&self, ctx: &TransferCtx, remote_root: &IrodsPath, local: &Path) -> Result<()> {
        let remote_display = remote_root.to_string();
        let local_root = local.join(remote_root.name());

        let (files, bytes) = self.precount_remote(remote_root)?;
        ctx.tcb.set_totals(files, bytes);
        debug!(files, bytes, "pre-counted collection for get");
        ctx.emit(
            TransferPhase::OverallInitiation,
            &remote_display,
            &local_root.display().to_string(),
            None,
        );

        std::fs::create_dir_all(&local_root)?;
        let journal = ctx
            .tcb
            .options()
            .restartable
            .then(|| RestartLog::for_local_root(&local_root));
        let completed = match &journal {
            Some(journal) => journal.completed()?,
            None => Default::default(),
        };
        self.get_tree(ctx, remote_root, &local_root, journal.as_ref(), &completed)?;

        ctx.emit(
            TransferPhase::OverallCompletion,
            &remote_display,
            &local_root.display().to_string(),
            None,
        );
        if let Some(journal) = &journal {
            journal.clear();
        }
        Ok(())
    }

    fn get_tree(
        &self,
        ctx: &TransferCtx,
        remote_dir: &IrodsPath,
        local_dir: &Path,
        journal: Option<&RestartLog>,
        completed: &std::collections::HashMap<String, u64>,
    ) -> Result<()> {
        let entries = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), remote_dir.clone());
            entity.list_children()?
        };
        for entry in entries {
            let remote_child = remote_dir.join(&entry.name);
            let local_child = local_dir.join(&entry.name);
            let source_display = remote_child.to_string();
            let target_display = local_child.display().to_string();
            ctx.checkpoint(&source_display, &target_display)?;

            if entry.obj_type == obj_type::COLL_OBJ_T {
                std::fs::create_dir_all(&local_child)?;
                self.get_tree(ctx, &remote_child, &local_child, journal, completed)?;
                continue;
            }

            let size = entry.data_size.max(0) as u64;
            if completed.get(&source_display) == Some(&size) {
                ctx.tcb.add_skipped_file();
                ctx.tcb.add_file();
                ctx.tcb.add_bytes(size);
                ctx.emit(TransferPhase::Restarting, &source_display, &target_display, None);
                continue;
            }
            if let Some(journal) = journal {
                journal.record("get", &source_display, &target_display, RestartStatus::InProgress, 0)?;
            }
            match self.get_single_with_retry(ctx, &remote_child, &local_child, size) {
                Ok(()) => {
                    ctx.tcb.add_file();
                    if let Some(journal) = journal {
                        journal.record(
                            "get",
                            &source_display,
                            &target_display,
                            RestartStatus::Completed,
                            size,
                        )?;
                    }
                    ctx.emit(TransferPhase::Success, &source_display, &target_display, None);
                }
                Err(IrodsError::Cancelled) => {
                    ctx.emit(TransferPhase::Cancelled, &source_display, &target_display, None);
                    return Err(IrodsError::Cancelled);
                }
                Err(e) => {
                    if let Some(journal) = journal {
                        journal.record("get", &source_display, &target_display, RestartStatus::Failed, 0)?;
                    }
                    ctx.file_failed(&source_display, &target_display, e)?;
                }
            }
        }
        Ok(())
    }

    fn get_single_with_retry(
        &self,
        ctx: &TransferCtx,
        remote: &IrodsPath,
        local: &Path,
        size: u64,
    ) -> Result<()> {
        match self.get_single(ctx, remote, local, size) {
            Err(e) if e.is_recoverable() && !ctx.tcb.is_cancelled() => {
                warn!(remote = %remote, "get failed ({}), reconnecting for one retry", e);
                self.reconnect()?;
                self.get_single(ctx, remote, local, size)
            }
            other => other,
        }
    }

    fn get_single(&self, ctx: &TransferCtx, remote: &IrodsPath, local: &Path, size: u64) -> Result<()> {
        let options = ctx.tcb.options().clone();
        let config = self.conn.borrow().config().clone();
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut inp = DataObjInp::at(remote.to_string());
        inp.opr_type = opr::GET_OPR;
        let parallel_wanted =
            options.parallel_threads > 1 && size > config.parallel_threshold && options.allow_redirect;
        if !parallel_wanted {
            inp.num_threads = 0;
            let mut out = File::create(local)?;
            let (_frame, received) = self.conn.borrow_mut().send_recv_blob(
                api::DATA_OBJ_GET_AN,
                Some(&inp.to_tag()),
                &mut out,
            )?;
            out.flush()?;
            ctx.tcb.add_bytes(received);
        } else {
            inp.num_threads = options.parallel_threads as i32;
            let portal = {
                let frame = self
                    .conn
                    .borrow_mut()
                    .send(api::DATA_OBJ_GET_AN, Some(&inp.to_tag()))?;
                let body = frame
                    .body
                    .as_ref()
                    .ok_or_else(|| IrodsError::Protocol("get reply with no portal".into()))?;
                PortalOprOut::from_tag(body)?
            };
            let session = self.conn.borrow().session().clone();
            let template = ctx.template(&remote.to_string(), &local.display().to_string());
            let result = parallel::parallel_get(
                &config,
                &session,
                &portal,
                local,
                size,
                &ctx.tcb,
                ctx.listener.as_ref(),
                &template,
            );
            self.opr_complete(portal.l1desc_inx, result)?;
        }
        Ok(())
    }

    /// Replicate a data object (or every object under a collection)
    /// onto another resource.
    pub fn replicate(
        &self,
        remote: &str,
        resource: &str,
        listener: Option<ListenerRef>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<()> {
        let ctx = self.make_ctx(TransferKind::Replicate, resource, listener, control);
        let remote_path = IrodsPath::resolve(remote, &self.home());
        let remote_display = remote_path.to_string();

        let (exists, is_dir, size) = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), remote_path.clone());
            (entity.exists()?, entity.is_dir()?, entity.length()?)
        };
        if !exists {
            return Err(IrodsError::NotFound(remote_display));
        }

        if !is_dir {
            ctx.tcb.set_totals(1, size);
            ctx.emit(TransferPhase::OverallInitiation, &remote_display, &remote_display, None);
            ctx.checkpoint(&remote_display, &remote_display)?;
            match self.replicate_single(&ctx, &remote_path, size) {
                Ok(()) => {
                    ctx.tcb.add_file();
                    ctx.emit(TransferPhase::Success, &remote_display, &remote_display, None);
                    ctx.emit(TransferPhase::OverallCompletion, &remote_display, &remote_display, None);
                    Ok(())
                }
                Err(e) => {
                    ctx.tcb.record_error(&e.to_string());
                    ctx.emit(TransferPhase::Failure, &remote_display, &remote_display, Some(&e));
                    if ctx.listener.is_some() { Ok(()) } else { Err(e) }
                }
            }
        } else {
            let (files, bytes) = self.precount_remote(&remote_path)?;
            ctx.tcb.set_totals(files, bytes);
            ctx.emit(TransferPhase::OverallInitiation, &remote_display, &remote_display, None);
            self.replicate_tree(&ctx, &remote_path)?;
            ctx.emit(TransferPhase::OverallCompletion, &remote_display, &remote_display, None);
            Ok(())
        }
    }

    fn replicate_tree(&self, ctx: &TransferCtx, remote_dir: &IrodsPath) -> Result<()> {
        let entries = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), remote_dir.clone());
            entity.list_children()?
        };
        for entry in entries {
            let remote_child = remote_dir.join(&entry.name);
            let display = remote_child.to_string();
            ctx.checkpoint(&display, &display)?;
            if entry.obj_type == obj_type::COLL_OBJ_T {
                self.replicate_tree(ctx, &remote_child)?;
                continue;
            }
            let size = entry.data_size.max(0) as u64;
            match self.replicate_single(ctx, &remote_child, size) {
                Ok(()) => {
                    ctx.tcb.add_file();
                    ctx.emit(TransferPhase::Success, &display, &display, None);
                }
                Err(e) => ctx.file_failed(&display, &display, e)?,
            }
        }
        Ok(())
    }

    fn replicate_single(&self, ctx: &TransferCtx, remote: &IrodsPath, size: u64) -> Result<()> {
        let mut inp = DataObjInp::at(remote.to_string());
        inp.opr_type = opr::REPLICATE_OPR;
        inp.cond_input.set(kw::DEST_RESC_NAME, &ctx.resource);
        self.conn
            .borrow_mut()
            .send(api::DATA_OBJ_REPL_AN, Some(&inp.to_tag()))?;
        ctx.tcb.add_bytes(size);
        Ok(())
    }

    /// Server-side copy of a data object or collection tree.
    pub fn copy(
        &self,
        source: &str,
        resource: &str,
        destination: &str,
        force: bool,
        listener: Option<ListenerRef>,
        control: Option<Arc<TransferControlBlock>>,
    ) -> Result<()> {
        let ctx = self.make_ctx(TransferKind::Copy, resource, listener, control);
        let home = self.home();
        let src_path = IrodsPath::resolve(source, &home);
        let mut dst_path = IrodsPath::resolve(destination, &home);

        let (src_exists, src_is_dir, src_size) = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), src_path.clone());
            (entity.exists()?, entity.is_dir()?, entity.length()?)
        };
        if !src_exists {
            return Err(IrodsError::NotFound(src_path.to_string()));
        }

        // Copy onto an existing collection drops the source inside it
        {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), dst_path.clone());
            if entity.is_dir()? && !src_is_dir {
                dst_path = dst_path.join(src_path.name());
            }
        }
        // Copy into the source's own parent resolves back onto itself
        if dst_path == src_path {
            return Err(IrodsError::DuplicateData(format!(
                "copy of {} onto itself",
                src_path
            )));
        }

        let src_display = src_path.to_string();
        let dst_display = dst_path.to_string();

        if src_is_dir {
            let (files, bytes) = self.precount_remote(&src_path)?;
            ctx.tcb.set_totals(files, bytes);
            ctx.emit(TransferPhase::OverallInitiation, &src_display, &dst_display, None);
            {
                let mut root = IrodsFile::at(Rc::clone(&self.conn), dst_path.clone());
                root.mkdirs()?;
            }
            self.copy_tree(&ctx, &src_path, &dst_path, force)?;
            ctx.emit(TransferPhase::OverallCompletion, &src_display, &dst_display, None);
            Ok(())
        } else {
            ctx.tcb.set_totals(1, src_size);
            ctx.emit(TransferPhase::OverallInitiation, &src_display, &dst_display, None);
            ctx.checkpoint(&src_display, &dst_display)?;
            match self.copy_single(&ctx, &src_path, &dst_path, force, src_size) {
                Ok(()) => {
                    ctx.tcb.add_file();
                    ctx.emit(TransferPhase::Success, &src_display, &dst_display, None);
                    ctx.emit(TransferPhase::OverallCompletion, &src_display, &dst_display, None);
                    Ok(())
                }
                Err(e) => {
                    ctx.tcb.record_error(&e.to_string());
                    ctx.emit(TransferPhase::Failure, &src_display, &dst_display, Some(&e));
                    if ctx.listener.is_some() { Ok(()) } else { Err(e) }
                }
            }
        }
    }

    fn copy_tree(
        &self,
        ctx: &TransferCtx,
        src_dir: &IrodsPath,
        dst_dir: &IrodsPath,
        force: bool,
    ) -> Result<()> {
        let entries = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), src_dir.clone());
            entity.list_children()?
        };
        for entry in entries {
            let src_child = src_dir.join(&entry.name);
            let dst_child = dst_dir.join(&entry.name);
            ctx.checkpoint(&src_child.to_string(), &dst_child.to_string())?;
            if entry.obj_type == obj_type::COLL_OBJ_T {
                let mut coll = IrodsFile::at(Rc::clone(&self.conn), dst_child.clone());
                coll.mkdirs()?;
                self.copy_tree(ctx, &src_child, &dst_child, force)?;
                continue;
            }
            let size = entry.data_size.max(0) as u64;
            match self.copy_single(ctx, &src_child, &dst_child, force, size) {
                Ok(()) => {
                    ctx.tcb.add_file();
                    ctx.emit(TransferPhase::Success, &src_child.to_string(), &dst_child.to_string(), None);
                }
                Err(e) => ctx.file_failed(&src_child.to_string(), &dst_child.to_string(), e)?,
            }
        }
        Ok(())
    }

    fn copy_single(
        &self,
        ctx: &TransferCtx,
        src: &IrodsPath,
        dst: &IrodsPath,
        force: bool,
        size: u64,
    ) -> Result<()> {
        let mut src_inp = DataObjInp::at(src.to_string());
        src_inp.opr_type = opr::COPY_SRC;
        let mut dst_inp = DataObjInp::at(dst.to_string());
        dst_inp.opr_type = opr::COPY_DEST;
        if force {
            dst_inp.cond_input.set(kw::FORCE_FLAG, "");
        }
        if !ctx.resource.is_empty() {
            dst_inp.cond_input.set(kw::DEST_RESC_NAME, &ctx.resource);
        }
        let inp = DataObjCopyInp {
            src: src_inp,
            dst: dst_inp,
        };
        self.conn
            .borrow_mut()
            .send(api::DATA_OBJ_COPY_AN, Some(&inp.to_tag()))?;
        ctx.tcb.add_bytes(size);
        Ok(())
    }

    /// Rename/move within the zone. Moving to the identical path is a
    /// silent no-op; resolving onto the source via its own parent is a
    /// collision.
    pub fn move_path(&self, source: &str, destination: &str) -> Result<()> {
        let home = self.home();
        let src_path = IrodsPath::resolve(source, &home);
        let mut dst_path = IrodsPath::resolve(destination, &home);

        if dst_path == src_path {
            return Ok(());
        }
        let appended = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), dst_path.clone());
            if entity.is_dir()? {
                dst_path = dst_path.join(src_path.name());
                true
            } else {
                false
            }
        };
        if dst_path == src_path {
            debug_assert!(appended);
            return Err(IrodsError::DuplicateData(format!(
                "move of {} into its own parent",
                src_path
            )));
        }

        let mut entity = IrodsFile::at(Rc::clone(&self.conn), src_path);
        entity.rename(&dst_path)
    }

    /// Count files and bytes under a collection before transferring it
    fn precount_remote(&self, remote_dir: &IrodsPath) -> Result<(u64, u64)> {
        let entries = {
            let mut entity = IrodsFile::at(Rc::clone(&self.conn), remote_dir.clone());
            entity.list_children()?
        };
        let mut files = 0u64;
        let mut bytes = 0u64;
        for entry in entries {
            if entry.obj_type == obj_type::COLL_OBJ_T {
                let (f, b) = self.precount_remote(&remote_dir.join(&entry.name))?;
                files += f;
                bytes += b;
            } else {
                files += 1;
                bytes += entry.data_size.max(0) as u64;
            }
        }
        Ok((files, bytes))
    }
}

/// Count files and bytes under a local tree before a put
fn precount_local(root: &Path) -> Result<(u64, u64)> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && entry.file_name() != JOURNAL_FILE_NAME {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((files, bytes))
}

/// Append a local relative path onto an iRODS path, segment by segment
fn join_relative(base: &IrodsPath, rel: &Path) -> IrodsPath {
    let mut out = base.clone();
    for component in rel.components() {
        if let std::path::Component::Normal(part) = component {
            out = out.join(&part.to_string_lossy());
        }
    }
    out
}
