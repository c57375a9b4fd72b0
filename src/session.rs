//! Session registry: hands out one live connection per
//! (account, thread) pair and takes it back when the caller is done.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::account::IrodsAccount;
use crate::config::PipelineConfiguration;
use crate::connection::IrodsConnection;
use crate::error::Result;

/// Shared handle for single-threaded collaborators (file entities,
/// the transfer orchestrator). `Rc` keeps it pinned to the thread
/// that acquired it.
pub type ConnRef = Rc<RefCell<IrodsConnection>>;

thread_local! {
    // Connections this thread has parked for reuse. Keyed by account,
    // so each (account, thread) pair owns a distinct handle and a
    // handle is never visible to two threads.
    static PARKED: RefCell<HashMap<IrodsAccount, IrodsConnection>> =
        RefCell::new(HashMap::new());
}

/// Process-wide entry point holding the pipeline configuration that
/// every connection it opens snapshots.
pub struct IrodsSession {
    config: PipelineConfiguration,
}

impl IrodsSession {
    pub fn new() -> IrodsSession {
        IrodsSession {
            config: PipelineConfiguration::default(),
        }
    }

    pub fn with_config(config: PipelineConfiguration) -> IrodsSession {
        IrodsSession { config }
    }

    pub fn config(&self) -> &PipelineConfiguration {
        &self.config
    }

    /// Take this thread's parked connection for the account, or open a
    /// fresh one. The caller owns the handle until it is returned or
    /// closed.
    pub fn connection(&self, account: &IrodsAccount) -> Result<IrodsConnection> {
        let parked = PARKED.with(|m| m.borrow_mut().remove(account));
        if let Some(conn) = parked {
            if conn.is_connected() {
                debug!(account = %account, "reusing parked connection");
                return Ok(conn);
            }
            // Stale handle: fall through and replace it
        }
        IrodsConnection::connect(account, &self.config)
    }

    /// Shared-handle variant for the file surface and the transfer
    /// orchestrator.
    pub fn connection_ref(&self, account: &IrodsAccount) -> Result<ConnRef> {
        Ok(Rc::new(RefCell::new(self.connection(account)?)))
    }

    /// Park a live connection for reuse by this thread; closed handles
    /// are discarded.
    pub fn return_connection(&self, conn: IrodsConnection) {
        if conn.is_connected() {
            PARKED.with(|m| m.borrow_mut().insert(conn.account().clone(), conn));
        }
    }

    /// Return a shared handle. Parked only if the caller was the last
    /// holder; otherwise it stays with the remaining holders.
    pub fn return_connection_ref(&self, conn: ConnRef) {
        if let Ok(cell) = Rc::try_unwrap(conn) {
            self.return_connection(cell.into_inner());
        }
    }

    /// Disconnect and drop this thread's parked connection for one
    /// account, if any.
    pub fn close_connection(&self, account: &IrodsAccount) {
        if let Some(mut conn) = PARKED.with(|m| m.borrow_mut().remove(account)) {
            let _ = conn.disconnect();
        }
    }

    /// Disconnect every connection parked by the calling thread.
    pub fn close_session(&self) {
        let all: Vec<IrodsConnection> =
            PARKED.with(|m| m.borrow_mut().drain().map(|(_, c)| c).collect());
        for mut conn in all {
            let _ = conn.disconnect();
        }
    }
}

impl Default for IrodsSession {
    fn default() -> Self {
        Self::new()
    }
}
