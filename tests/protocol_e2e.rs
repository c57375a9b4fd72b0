//! End-to-end protocol tests against the in-process mock server:
//! authentication, negotiation, and the file/collection surface.

mod common;

use common::{MiniRods, ServerOptions};
use irods_client::file::{open_flags, IrodsFile};
use irods_client::packinstr::whence;
use irods_client::{
    AuthScheme, ConnState, CsNegPolicy, IrodsAccount, IrodsConnection, IrodsError, IrodsSession,
    PipelineConfiguration,
};

fn account_for(server: &MiniRods) -> IrodsAccount {
    IrodsAccount::new("127.0.0.1", server.port, "rods", "rods", "tempZone")
}

#[test]
fn connect_authenticate_and_list() {
    let server = MiniRods::start(ServerOptions::default());
    server.insert_object("/tempZone/home/rods/hello.txt", b"hello, world");
    server.insert_collection("/tempZone/home/rods/subdir");

    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();
    assert_eq!(conn.borrow().state(), ConnState::Ready);
    assert_eq!(conn.borrow().server_version(), "rods4.2.8");

    let mut home = IrodsFile::new(conn.clone(), "/tempZone/home/rods");
    assert!(home.exists().unwrap());
    assert!(home.is_dir().unwrap());
    let names = home.child_names().unwrap();
    assert_eq!(names, vec!["hello.txt".to_string(), "subdir".to_string()]);

    let mut missing = IrodsFile::new(conn.clone(), "/tempZone/home/rods/does_not_exist");
    assert!(!missing.exists().unwrap());

    // Relative paths resolve against the account home
    let mut relative = IrodsFile::new(conn.clone(), "hello.txt");
    assert!(relative.is_file().unwrap());
    assert_eq!(relative.length().unwrap(), 12);

    session.return_connection_ref(conn);
    session.close_session();
}

#[test]
fn wrong_password_fails_authentication() {
    let server = MiniRods::start(ServerOptions::default());
    let mut account = account_for(&server);
    account.password = "wrong".to_string();

    let err = IrodsConnection::connect(&account, &PipelineConfiguration::default()).unwrap_err();
    assert!(matches!(err, IrodsError::AuthFailed(_)), "got {:?}", err);
}

#[test]
fn negotiation_matrix_on_the_wire() {
    // REQUIRE vs REFUSE fails outright
    let refusing = MiniRods::start(ServerOptions {
        neg_policy: CsNegPolicy::Refuse,
        ..Default::default()
    });
    let account = account_for(&refusing).with_cs_neg_policy(CsNegPolicy::Require);
    let err = IrodsConnection::connect(&account, &PipelineConfiguration::default()).unwrap_err();
    assert!(matches!(err, IrodsError::Negotiation(_)), "got {:?}", err);

    // REQUIRE vs DONT_CARE lands on an encrypted session
    let agreeable = MiniRods::start(ServerOptions::default());
    let account = account_for(&agreeable).with_cs_neg_policy(CsNegPolicy::Require);
    let conn = IrodsConnection::connect(&account, &PipelineConfiguration::default()).unwrap();
    assert!(conn.session().use_ssl);
    assert!(!conn.session().shared_secret.is_empty());

    // REFUSE vs DONT_CARE stays plaintext
    let account = account_for(&agreeable).with_cs_neg_policy(CsNegPolicy::Refuse);
    let conn = IrodsConnection::connect(&account, &PipelineConfiguration::default()).unwrap();
    assert!(!conn.session().use_ssl);
}

#[test]
fn pam_authentication_mints_a_native_password() {
    let server = MiniRods::start(ServerOptions {
        neg_policy: CsNegPolicy::Require,
        pam_password: Some("pam-secret".to_string()),
        ..Default::default()
    });
    let mut account = account_for(&server).with_scheme(AuthScheme::Pam);
    account.password = "pam-secret".to_string();

    let conn = IrodsConnection::connect(&account, &PipelineConfiguration::default()).unwrap();
    assert_eq!(conn.state(), ConnState::Ready);
    // The short-lived password replaced the PAM login transparently
    assert_eq!(conn.account().password, "minted-rods");
}

#[test]
fn pam_over_plaintext_brackets_with_ssl_start_and_end() {
    let server = MiniRods::start(ServerOptions {
        neg_policy: CsNegPolicy::DontCare,
        pam_password: Some("pam-secret".to_string()),
        ..Default::default()
    });
    let mut account = account_for(&server).with_scheme(AuthScheme::Pam);
    account.password = "pam-secret".to_string();

    let mut conn = IrodsConnection::connect(&account, &PipelineConfiguration::default()).unwrap();
    assert_eq!(conn.state(), ConnState::Ready);
    // Only the PAM login itself rode the encrypted channel; after
    // SslEnd the session is plaintext again
    assert!(!conn.session().use_ssl);
    assert_eq!(conn.account().password, "minted-rods");

    // The downgraded socket still carries ordinary traffic
    let stat_inp = irods_client::packinstr::DataObjInp::at("/tempZone/home/rods");
    let frame = conn
        .send(irods_client::packinstr::api::OBJ_STAT_AN, Some(&stat_inp.to_tag()))
        .unwrap();
    assert!(frame.body.is_some());
    conn.disconnect().unwrap();
}

#[test]
fn gsi_is_rejected_at_the_dispatch_boundary() {
    let server = MiniRods::start(ServerOptions::default());
    let account = account_for(&server).with_scheme(AuthScheme::Gsi);
    let err = IrodsConnection::connect(&account, &PipelineConfiguration::default()).unwrap_err();
    assert!(matches!(err, IrodsError::NotSupported(_)));
}

#[test]
fn mkdir_semantics() {
    let server = MiniRods::start(ServerOptions::default());
    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();

    // mkdir of an existing path reports false
    let mut existing = IrodsFile::new(conn.clone(), "/tempZone/home/rods");
    assert!(!existing.mkdir().unwrap());

    // mkdirs of a nested new path reports true and creates the chain
    let mut nested = IrodsFile::new(conn.clone(), "/tempZone/home/rods/x/y/z");
    assert!(nested.mkdirs().unwrap());
    assert!(server.has_collection("/tempZone/home/rods/x/y/z"));
    assert!(server.has_collection("/tempZone/home/rods/x/y"));

    // plain mkdir under a missing parent fails
    let mut orphan = IrodsFile::new(conn.clone(), "/tempZone/home/rods/no/parent");
    assert!(orphan.mkdir().is_err());
}

#[test]
fn rename_and_delete() {
    let server = MiniRods::start(ServerOptions::default());
    server.insert_object("/tempZone/home/rods/a.txt", b"abc");
    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();

    let mut entity = IrodsFile::new(conn.clone(), "/tempZone/home/rods/a.txt");

    // Rename to the identical path is a no-op that succeeds
    let same = entity.path().clone();
    entity.rename(&same).unwrap();

    let target = irods_client::IrodsPath::absolute("/tempZone/home/rods/b.txt");
    entity.rename(&target).unwrap();
    assert_eq!(server.object_len("/tempZone/home/rods/a.txt"), None);
    assert_eq!(server.object_len("/tempZone/home/rods/b.txt"), Some(3));

    assert!(entity.delete(true).unwrap());
    assert_eq!(server.object_len("/tempZone/home/rods/b.txt"), None);
    // Deleting what is already gone reports false
    entity.reset();
    assert!(!entity.delete(true).unwrap());
}

#[test]
fn open_read_write_seek_close() {
    let server = MiniRods::start(ServerOptions::default());
    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();

    let mut f = IrodsFile::new(conn.clone(), "/tempZone/home/rods/stream.bin");
    f.create().unwrap();
    assert!(f.is_open());
    assert_eq!(f.write(b"0123456789").unwrap(), 10);

    assert_eq!(f.seek(2, whence::SEEK_SET).unwrap(), 2);
    assert_eq!(f.read(4).unwrap(), b"2345");

    assert_eq!(f.seek(-3, whence::SEEK_END).unwrap(), 7);
    assert_eq!(f.read(16).unwrap(), b"789");

    f.close().unwrap();
    assert!(!f.is_open());
    // Close past the first call is a no-op at the API
    f.close().unwrap();
    f.close().unwrap();

    let mut reopened = IrodsFile::new(conn.clone(), "/tempZone/home/rods/stream.bin");
    reopened.open(open_flags::O_RDONLY).unwrap();
    assert_eq!(reopened.read(10).unwrap(), b"0123456789");
    reopened.close().unwrap();
}

#[test]
fn stat_cache_is_invalidated_by_reset() {
    let server = MiniRods::start(ServerOptions::default());
    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();

    let mut entity = IrodsFile::new(conn.clone(), "/tempZone/home/rods/late.txt");
    assert!(!entity.exists().unwrap());

    // Appears on the server behind the cache's back
    server.insert_object("/tempZone/home/rods/late.txt", b"xyz");
    assert!(!entity.exists().unwrap());

    entity.reset();
    assert!(entity.exists().unwrap());
    assert_eq!(entity.length().unwrap(), 3);
}

#[test]
fn unsupported_host_operations() {
    let server = MiniRods::start(ServerOptions::default());
    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();

    let mut entity = IrodsFile::new(conn.clone(), "/tempZone/home/rods");
    assert!(matches!(entity.set_executable(true), Err(IrodsError::NotSupported(_))));
    assert!(matches!(entity.set_readable(true), Err(IrodsError::NotSupported(_))));
    assert!(matches!(entity.set_writable(true), Err(IrodsError::NotSupported(_))));
    assert!(matches!(entity.delete_on_exit(), Err(IrodsError::NotSupported(_))));
    assert!(matches!(entity.free_space(), Err(IrodsError::NotSupported(_))));
    assert!(matches!(entity.total_space(), Err(IrodsError::NotSupported(_))));
    assert!(matches!(entity.usable_space(), Err(IrodsError::NotSupported(_))));
}

#[test]
fn resource_override_is_local_only() {
    let server = MiniRods::start(ServerOptions::default());
    server.insert_object("/tempZone/home/rods/r.txt", b"data");
    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();

    let mut entity = IrodsFile::new(conn.clone(), "/tempZone/home/rods/r.txt");
    assert_eq!(entity.resource(), None);
    entity.set_resource("archiveResc");
    assert_eq!(entity.resource(), Some("archiveResc"));
    // The override never reflects the replica's catalog resource
    assert!(entity.exists().unwrap());
    assert_eq!(entity.resource(), Some("archiveResc"));
}

#[test]
fn uri_rendering() {
    let server = MiniRods::start(ServerOptions::default());
    let session = IrodsSession::new();
    let conn = session.connection_ref(&account_for(&server)).unwrap();

    let entity = IrodsFile::new(conn.clone(), "/tempZone/home/rods/u.txt");
    assert_eq!(
        entity.uri(),
        format!("irods://rods@127.0.0.1:{}/tempZone/home/rods/u.txt", server.port)
    );
}

#[test]
fn disconnect_is_idempotent_and_counts_balance() {
    let server = MiniRods::start(ServerOptions::default());
    let mut conn =
        IrodsConnection::connect(&account_for(&server), &PipelineConfiguration::default()).unwrap();

    let (issued, consumed) = conn.exchange_counts();
    assert_eq!(issued, consumed);

    conn.disconnect().unwrap();
    assert_eq!(conn.state(), ConnState::Closed);
    conn.disconnect().unwrap();
    assert_eq!(conn.state(), ConnState::Closed);
}
