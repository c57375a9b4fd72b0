//! iRODS client library
//!
//! Speaks the iRODS data-grid wire protocol: authentication and
//! capability negotiation, navigation of the virtual filesystem of
//! collections and data objects, and bulk data movement over single or
//! parallel streams with optional transport encryption.
//!
//! ```no_run
//! use irods_client::{DataTransfer, IrodsAccount, IrodsFile, IrodsSession};
//!
//! let session = IrodsSession::new();
//! let account = IrodsAccount::new("irods.example", 1247, "rods", "rods", "tempZone");
//! let conn = session.connection_ref(&account)?;
//!
//! let mut home = IrodsFile::new(conn.clone(), "/tempZone/home/rods");
//! for child in home.child_names()? {
//!     println!("{}", child);
//! }
//!
//! let transfer = DataTransfer::new(conn);
//! transfer.put(std::path::Path::new("hello.txt"), "hello.txt", None, None)?;
//! # Ok::<(), irods_client::IrodsError>(())
//! ```

pub mod account;
pub mod auth;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod file;
pub mod negotiation;
pub mod packinstr;
pub mod parallel;
pub mod path;
pub mod restart;
pub mod secure;
pub mod session;
pub mod tag;
pub mod transfer;
pub mod uri;

pub use account::{AuthScheme, CsNegPolicy, IrodsAccount};
pub use config::{EncryptionAlgorithm, PipelineConfiguration};
pub use connection::{ConnState, IrodsConnection};
pub use control::{
    ErrorPolicy, ListenerRef, NoopListener, RecordingListener, TransferControlBlock, TransferKind,
    TransferOptions, TransferPhase, TransferStatus, TransferStatusListener,
};
pub use error::{IrodsError, Result};
pub use file::{IrodsFile, ObjKind};
pub use path::IrodsPath;
pub use session::{ConnRef, IrodsSession};
pub use transfer::DataTransfer;
pub use uri::IrodsUri;
