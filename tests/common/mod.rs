//! In-process iRODS server used by the integration tests.
//!
//! Speaks the same wire dialect as the client: startup pack,
//! capability negotiation with a configurable stance, native and PAM
//! authentication, stat/list/mkdir/remove/rename/copy, in-band and
//! portal put/get (with per-stream AES when the session negotiated
//! SSL), and OprComplete accounting.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use irods_client::account::CsNegPolicy;
use irods_client::auth::{challenge_response, encode_hex};
use irods_client::checksum::{digest_bytes, ChecksumType};
use irods_client::codec::{self, msg_type, Frame};
use irods_client::config::PipelineConfiguration;
use irods_client::error::IrodsError;
use irods_client::negotiation::{EncryptEnvelope, CS_NEG_USE_SSL};
use irods_client::packinstr::{
    api, obj_type, opr, AuthChallenge, CollEntList, CollEntry, CollInp, CsNeg, DataObjCopyInp,
    DataObjInp, FileLseekOut, IntInfo, OpenedDataObjInp, PamAuthRequest, PamAuthResponse,
    PortalEndpoint, PortalOprOut, RodsObjStat, StartupPack, StrInfo, Version, kw, whence,
};
use irods_client::secure::AesCipher;
use irods_client::tag::Tag;

const STATUS_AUTH_FAILED: i32 = -826000;
const STATUS_NOT_FOUND: i32 = -310000;
const STATUS_ALREADY_EXISTS: i32 = -809000;
const FIXED_TIME: i64 = 1_700_000_000;
const CHUNK: usize = 256 * 1024;

#[derive(Clone)]
pub struct ServerOptions {
    pub neg_policy: CsNegPolicy,
    pub password: String,
    pub pam_password: Option<String>,
    pub zone: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            neg_policy: CsNegPolicy::DontCare,
            password: "rods".to_string(),
            pam_password: None,
            zone: "tempZone".to_string(),
        }
    }
}

#[derive(Clone)]
enum Node {
    Coll,
    Obj(Vec<u8>),
}

struct Shared {
    options: ServerOptions,
    fs: Mutex<HashMap<String, Node>>,
    accepted_password: Mutex<String>,
    opr_completes: AtomicU64,
    shutdown: AtomicBool,
    tls: Arc<rustls::ServerConfig>,
}

pub struct MiniRods {
    pub port: u16,
    shared: Arc<Shared>,
}

impl MiniRods {
    pub fn start(options: ServerOptions) -> MiniRods {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();

        let mut fs = HashMap::new();
        for coll in [
            "/".to_string(),
            format!("/{}", options.zone),
            format!("/{}/home", options.zone),
            format!("/{}/home/rods", options.zone),
        ] {
            fs.insert(coll, Node::Coll);
        }

        let shared = Arc::new(Shared {
            accepted_password: Mutex::new(options.password.clone()),
            options,
            fs: Mutex::new(fs),
            opr_completes: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            tls: Arc::new(make_tls_config()),
        });

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            while !accept_shared.shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let conn_shared = Arc::clone(&accept_shared);
                        thread::spawn(move || {
                            let _ = serve_connection(stream, conn_shared);
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        MiniRods { port, shared }
    }

    pub fn opr_completes(&self) -> u64 {
        self.shared.opr_completes.load(Ordering::SeqCst)
    }

    /// Length of a stored data object, if present
    pub fn object_len(&self, path: &str) -> Option<u64> {
        match self.shared.fs.lock().unwrap().get(path) {
            Some(Node::Obj(data)) => Some(data.len() as u64),
            _ => None,
        }
    }

    pub fn object_bytes(&self, path: &str) -> Option<Vec<u8>> {
        match self.shared.fs.lock().unwrap().get(path) {
            Some(Node::Obj(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn has_collection(&self, path: &str) -> bool {
        matches!(self.shared.fs.lock().unwrap().get(path), Some(Node::Coll))
    }

    pub fn insert_object(&self, path: &str, data: &[u8]) {
        self.shared
            .fs
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::Obj(data.to_vec()));
    }

    pub fn insert_collection(&self, path: &str) {
        self.shared
            .fs
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::Coll);
    }
}

impl Drop for MiniRods {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }
}

fn make_tls_config() -> rustls::ServerConfig {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed cert");
    let cert_der = certified.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    );
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .expect("server tls config")
}

enum SrvTransport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
    Empty,
}

impl Read for SrvTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SrvTransport::Plain(s) => s.read(buf),
            SrvTransport::Tls(s) => s.read(buf),
            SrvTransport::Empty => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport taken",
            )),
        }
    }
}

impl Write for SrvTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            SrvTransport::Plain(s) => s.write(buf),
            SrvTransport::Tls(s) => s.write(buf),
            SrvTransport::Empty => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport taken",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SrvTransport::Plain(s) => s.flush(),
            SrvTransport::Tls(s) => s.flush(),
            SrvTransport::Empty => Ok(()),
        }
    }
}

/// Per-connection session material captured from the encrypt envelope
struct CipherMaterial {
    envelope: EncryptEnvelope,
    salt: Vec<u8>,
    secret: Vec<u8>,
}

impl CipherMaterial {
    fn cipher(&self) -> AesCipher {
        let mut config = PipelineConfiguration::default();
        config.encryption_key_size = self.envelope.key_size as usize;
        config.encryption_salt_size = self.envelope.salt_size as usize;
        config.encryption_hash_rounds = self.envelope.hash_rounds as u32;
        AesCipher::new(&config, &self.secret, &self.salt).expect("server cipher")
    }
}

struct Conn {
    transport: SrvTransport,
    shared: Arc<Shared>,
    challenge: Vec<u8>,
    cipher: Option<Arc<CipherMaterial>>,
    descriptors: HashMap<i32, (String, u64)>,
    next_fd: i32,
    /// Portal operations waiting for OprComplete
    pending: Vec<thread::JoinHandle<()>>,
}

fn serve_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<(), IrodsError> {
    stream.set_nodelay(true).ok();
    let mut conn = Conn {
        transport: SrvTransport::Plain(stream),
        shared,
        challenge: Vec::new(),
        cipher: None,
        descriptors: HashMap::new(),
        next_fd: 3,
        pending: Vec::new(),
    };

    // Startup pack
    let frame = codec::read_frame(&mut conn.transport)?;
    if frame.msg_type != msg_type::RODS_CONNECT {
        return Err(IrodsError::Protocol("expected startup pack".into()));
    }
    let startup = StartupPack::from_tag(frame.body.as_ref().unwrap())?;
    let mut use_ssl = false;
    if startup.option.contains("request_server_negotiation") {
        let stance = CsNeg {
            status: 1,
            result: conn.shared.options.neg_policy.token().to_string(),
        };
        codec::write_frame(&mut conn.transport, msg_type::RODS_CS_NEG, 0, Some(&stance.to_tag()), &[])?;
        let reply = codec::read_frame(&mut conn.transport)?;
        let outcome = CsNeg::from_tag(reply.body.as_ref().unwrap())?;
        if outcome.status == 0 {
            return Ok(());
        }
        use_ssl = outcome.result == CS_NEG_USE_SSL;
    }
    let version = Version {
        status: 0,
        rel_version: "rods4.2.8".to_string(),
        api_version: "d".to_string(),
    };
    codec::write_frame(&mut conn.transport, msg_type::RODS_VERSION, 0, Some(&version.to_tag()), &[])?;

    if use_ssl {
        conn.accept_tls()?;
        conn.read_encrypt_envelope()?;
    }

    // Request loop
    loop {
        let frame = match codec::read_frame(&mut conn.transport) {
            Ok(frame) => frame,
            Err(_) => return Ok(()), // peer went away
        };
        match frame.msg_type.as_str() {
            msg_type::RODS_DISCONNECT => return Ok(()),
            msg_type::RODS_API_REQ => conn.handle_api(frame)?,
            other => {
                return Err(IrodsError::Protocol(format!(
                    "unexpected frame type {:?}",
                    other
                )))
            }
        }
    }
}

impl Conn {
    fn accept_tls(&mut self) -> Result<(), IrodsError> {
        let plain = match std::mem::replace(&mut self.transport, SrvTransport::Empty) {
            SrvTransport::Plain(s) => s,
            other => {
                self.transport = other;
                return Err(IrodsError::Protocol("double TLS accept".into()));
            }
        };
        let server = rustls::ServerConnection::new(Arc::clone(&self.shared.tls))
            .map_err(|e| IrodsError::Protocol(format!("tls accept: {}", e)))?;
        self.transport = SrvTransport::Tls(Box::new(rustls::StreamOwned::new(server, plain)));
        Ok(())
    }

    fn downgrade_tls(&mut self) -> Result<(), IrodsError> {
        match std::mem::replace(&mut self.transport, SrvTransport::Empty) {
            SrvTransport::Tls(stream) => {
                let rustls::StreamOwned { sock, .. } = *stream;
                self.transport = SrvTransport::Plain(sock);
                // Key material from the bracketed session is void now
                self.cipher = None;
                Ok(())
            }
            other => {
                self.transport = other;
                Err(IrodsError::Protocol("SSL end on a plaintext connection".into()))
            }
        }
    }

    fn read_encrypt_envelope(&mut self) -> Result<(), IrodsError> {
        let frame = codec::read_frame(&mut self.transport)?;
        if frame.msg_type != msg_type::RODS_ENCRYPT {
            return Err(IrodsError::Protocol("expected encrypt envelope".into()));
        }
        let envelope = EncryptEnvelope::from_tag(frame.body.as_ref().unwrap())?;
        let salt_len = envelope.salt_size as usize;
        if frame.bs.len() < salt_len {
            return Err(IrodsError::Protocol("encrypt envelope material too short".into()));
        }
        let salt = frame.bs[..salt_len].to_vec();
        let secret = frame.bs[salt_len..].to_vec();
        self.cipher = Some(Arc::new(CipherMaterial {
            envelope,
            salt,
            secret,
        }));
        Ok(())
    }

    fn reply_status(&mut self, status: i32) -> Result<(), IrodsError> {
        codec::write_frame(&mut self.transport, msg_type::RODS_API_REPLY, status, None, &[])
    }

    fn reply_body(&mut self, body: &Tag) -> Result<(), IrodsError> {
        codec::write_frame(&mut self.transport, msg_type::RODS_API_REPLY, 0, Some(body), &[])
    }

    fn handle_api(&mut self, frame: Frame) -> Result<(), IrodsError> {
        match frame.int_info {
            api::AUTH_REQUEST_AN => {
                self.challenge = (0..64u8).collect();
                let out = AuthChallenge {
                    challenge: encode_hex(&self.challenge),
                };
                self.reply_body(&out.to_tag())
            }
            api::AUTH_RESPONSE_AN => {
                let body = frame.body.as_ref().unwrap();
                let response = body.str_child("response")?.to_string();
                let expected =
                    challenge_response(&self.challenge, &self.shared.accepted_password.lock().unwrap());
                if response == expected {
                    self.reply_status(0)
                } else {
                    self.reply_status(STATUS_AUTH_FAILED)
                }
            }
            api::PAM_AUTH_REQUEST_AN => {
                let body = frame.body.as_ref().unwrap();
                let request = PamAuthRequest::from_tag(body)?;
                match &self.shared.options.pam_password {
                    Some(expected) if *expected == request.password => {
                        let minted = format!("minted-{}", request.user);
                        *self.shared.accepted_password.lock().unwrap() = minted.clone();
                        let out = PamAuthResponse {
                            generated_password: minted,
                        };
                        self.reply_body(&out.to_tag())
                    }
                    _ => self.reply_status(STATUS_AUTH_FAILED),
                }
            }
            api::SSL_START_AN => {
                self.reply_status(0)?;
                self.accept_tls()?;
                self.read_encrypt_envelope()
            }
            api::SSL_END_AN => {
                self.reply_status(0)?;
                self.downgrade_tls()
            }
            api::OBJ_STAT_AN => {
                let inp = DataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let fs = self.shared.fs.lock().unwrap();
                match fs.get(&inp.obj_path) {
                    Some(node) => {
                        let stat = RodsObjStat {
                            obj_size: match node {
                                Node::Obj(data) => data.len() as i64,
                                Node::Coll => 0,
                            },
                            obj_type: match node {
                                Node::Obj(_) => obj_type::DATA_OBJ_T,
                                Node::Coll => obj_type::COLL_OBJ_T,
                            },
                            create_time: FIXED_TIME,
                            modify_time: FIXED_TIME,
                            owner_name: "rods".to_string(),
                            owner_zone: self.shared.options.zone.clone(),
                            resc_name: "demoResc".to_string(),
                        };
                        drop(fs);
                        self.reply_body(&stat.to_tag())
                    }
                    None => {
                        drop(fs);
                        self.reply_status(STATUS_NOT_FOUND)
                    }
                }
            }
            api::COLL_LIST_AN => {
                let inp = CollInp::from_tag(frame.body.as_ref().unwrap())?;
                let fs = self.shared.fs.lock().unwrap();
                match fs.get(&inp.coll_name) {
                    Some(Node::Coll) => {
                        let prefix = if inp.coll_name == "/" {
                            "/".to_string()
                        } else {
                            format!("{}/", inp.coll_name)
                        };
                        let mut entries: Vec<CollEntry> = fs
                            .iter()
                            .filter(|(path, _)| {
                                path.starts_with(&prefix)
                                    && path.len() > prefix.len()
                                    && !path[prefix.len()..].contains('/')
                            })
                            .map(|(path, node)| CollEntry {
                                obj_type: match node {
                                    Node::Obj(_) => obj_type::DATA_OBJ_T,
                                    Node::Coll => obj_type::COLL_OBJ_T,
                                },
                                name: path[prefix.len()..].to_string(),
                                data_size: match node {
                                    Node::Obj(data) => data.len() as i64,
                                    Node::Coll => 0,
                                },
                                modify_time: FIXED_TIME,
                            })
                            .collect();
                        entries.sort_by(|a, b| a.name.cmp(&b.name));
                        drop(fs);
                        self.reply_body(&CollEntList { entries }.to_tag())
                    }
                    _ => {
                        drop(fs);
                        self.reply_status(STATUS_NOT_FOUND)
                    }
                }
            }
            api::COLL_CREATE_AN => {
                let inp = CollInp::from_tag(frame.body.as_ref().unwrap())?;
                let recursive = inp.cond_input.contains(kw::RECURSIVE_OPR);
                let mut fs = self.shared.fs.lock().unwrap();
                if fs.contains_key(&inp.coll_name) {
                    drop(fs);
                    return self.reply_status(STATUS_ALREADY_EXISTS);
                }
                let parent = parent_of(&inp.coll_name);
                if !recursive && !matches!(fs.get(&parent), Some(Node::Coll)) {
                    drop(fs);
                    return self.reply_status(STATUS_NOT_FOUND);
                }
                if recursive {
                    let mut path = String::new();
                    for segment in inp.coll_name.split('/').filter(|s| !s.is_empty()) {
                        path = format!("{}/{}", path, segment);
                        fs.entry(path.clone()).or_insert(Node::Coll);
                    }
                } else {
                    fs.insert(inp.coll_name.clone(), Node::Coll);
                }
                drop(fs);
                self.reply_status(0)
            }
            api::RM_COLL_AN => {
                let inp = CollInp::from_tag(frame.body.as_ref().unwrap())?;
                let mut fs = self.shared.fs.lock().unwrap();
                if !matches!(fs.get(&inp.coll_name), Some(Node::Coll)) {
                    drop(fs);
                    return self.reply_status(STATUS_NOT_FOUND);
                }
                let prefix = format!("{}/", inp.coll_name);
                fs.retain(|path, _| path != &inp.coll_name && !path.starts_with(&prefix));
                drop(fs);
                self.reply_status(0)
            }
            api::DATA_OBJ_UNLINK_AN => {
                let inp = DataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let mut fs = self.shared.fs.lock().unwrap();
                match fs.remove(&inp.obj_path) {
                    Some(Node::Obj(_)) => {
                        drop(fs);
                        self.reply_status(0)
                    }
                    Some(node) => {
                        fs.insert(inp.obj_path.clone(), node);
                        drop(fs);
                        self.reply_status(STATUS_NOT_FOUND)
                    }
                    None => {
                        drop(fs);
                        self.reply_status(STATUS_NOT_FOUND)
                    }
                }
            }
            api::DATA_OBJ_RENAME_AN => {
                let inp = DataObjCopyInp::from_tag(frame.body.as_ref().unwrap())?;
                let mut fs = self.shared.fs.lock().unwrap();
                if inp.src.opr_type == opr::RENAME_COLL {
                    if !matches!(fs.get(&inp.src.obj_path), Some(Node::Coll)) {
                        drop(fs);
                        return self.reply_status(STATUS_NOT_FOUND);
                    }
                    let src_prefix = format!("{}/", inp.src.obj_path);
                    let moves: Vec<(String, String)> = fs
                        .keys()
                        .filter(|p| *p == &inp.src.obj_path || p.starts_with(&src_prefix))
                        .map(|p| {
                            let suffix = &p[inp.src.obj_path.len()..];
                            (p.clone(), format!("{}{}", inp.dst.obj_path, suffix))
                        })
                        .collect();
                    for (from, to) in moves {
                        if let Some(node) = fs.remove(&from) {
                            fs.insert(to, node);
                        }
                    }
                } else {
                    match fs.remove(&inp.src.obj_path) {
                        Some(node @ Node::Obj(_)) => {
                            fs.insert(inp.dst.obj_path.clone(), node);
                        }
                        Some(node) => {
                            fs.insert(inp.src.obj_path.clone(), node);
                            drop(fs);
                            return self.reply_status(STATUS_NOT_FOUND);
                        }
                        None => {
                            drop(fs);
                            return self.reply_status(STATUS_NOT_FOUND);
                        }
                    }
                }
                drop(fs);
                self.reply_status(0)
            }
            api::DATA_OBJ_COPY_AN => {
                let inp = DataObjCopyInp::from_tag(frame.body.as_ref().unwrap())?;
                let force = inp.dst.cond_input.contains(kw::FORCE_FLAG);
                let mut fs = self.shared.fs.lock().unwrap();
                let data = match fs.get(&inp.src.obj_path) {
                    Some(Node::Obj(data)) => data.clone(),
                    _ => {
                        drop(fs);
                        return self.reply_status(STATUS_NOT_FOUND);
                    }
                };
                if fs.contains_key(&inp.dst.obj_path) && !force {
                    drop(fs);
                    return self.reply_status(STATUS_ALREADY_EXISTS);
                }
                fs.insert(inp.dst.obj_path.clone(), Node::Obj(data));
                drop(fs);
                self.reply_status(0)
            }
            api::DATA_OBJ_REPL_AN | api::DATA_OBJ_PHYMV_AN => {
                let inp = DataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let fs = self.shared.fs.lock().unwrap();
                let found = matches!(fs.get(&inp.obj_path), Some(Node::Obj(_)));
                drop(fs);
                if found {
                    self.reply_status(0)
                } else {
                    self.reply_status(STATUS_NOT_FOUND)
                }
            }
            api::DATA_OBJ_CHKSUM_AN => {
                let inp = DataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let fs = self.shared.fs.lock().unwrap();
                match fs.get(&inp.obj_path) {
                    Some(Node::Obj(data)) => {
                        let digest = digest_bytes(data, ChecksumType::Md5);
                        drop(fs);
                        self.reply_body(&StrInfo { value: digest }.to_tag())
                    }
                    _ => {
                        drop(fs);
                        self.reply_status(STATUS_NOT_FOUND)
                    }
                }
            }
            api::DATA_OBJ_PUT_AN => self.handle_put(frame),
            api::DATA_OBJ_GET_AN => self.handle_get(frame),
            api::DATA_OBJ_CREATE_AN | api::DATA_OBJ_OPEN_AN => {
                let inp = DataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let creating = frame.int_info == api::DATA_OBJ_CREATE_AN;
                let mut fs = self.shared.fs.lock().unwrap();
                let exists = matches!(fs.get(&inp.obj_path), Some(Node::Obj(_)));
                if creating {
                    fs.insert(inp.obj_path.clone(), Node::Obj(Vec::new()));
                } else if !exists {
                    drop(fs);
                    return self.reply_status(STATUS_NOT_FOUND);
                }
                drop(fs);
                let fd = self.next_fd;
                self.next_fd += 1;
                self.descriptors.insert(fd, (inp.obj_path, 0));
                self.reply_status(fd)
            }
            api::DATA_OBJ_READ_AN => {
                let inp = OpenedDataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let Some((path, pos)) = self.descriptors.get(&inp.fd).cloned() else {
                    return self.reply_status(STATUS_NOT_FOUND);
                };
                let fs = self.shared.fs.lock().unwrap();
                let data = match fs.get(&path) {
                    Some(Node::Obj(data)) => data.clone(),
                    _ => Vec::new(),
                };
                drop(fs);
                let start = (pos as usize).min(data.len());
                let end = (start + inp.len.max(0) as usize).min(data.len());
                let slice = data[start..end].to_vec();
                self.descriptors.insert(inp.fd, (path, end as u64));
                codec::write_frame(
                    &mut self.transport,
                    msg_type::RODS_API_REPLY,
                    slice.len() as i32,
                    None,
                    &slice,
                )
            }
            api::DATA_OBJ_WRITE_AN => {
                let inp = OpenedDataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let Some((path, pos)) = self.descriptors.get(&inp.fd).cloned() else {
                    return self.reply_status(STATUS_NOT_FOUND);
                };
                let written = frame.bs.len();
                let mut fs = self.shared.fs.lock().unwrap();
                if let Some(Node::Obj(data)) = fs.get_mut(&path) {
                    let pos = pos as usize;
                    if data.len() < pos + written {
                        data.resize(pos + written, 0);
                    }
                    data[pos..pos + written].copy_from_slice(&frame.bs);
                }
                drop(fs);
                self.descriptors.insert(inp.fd, (path, (pos as usize + written) as u64));
                self.reply_status(written as i32)
            }
            api::DATA_OBJ_LSEEK_AN => {
                let inp = OpenedDataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                let Some((path, pos)) = self.descriptors.get(&inp.fd).cloned() else {
                    return self.reply_status(STATUS_NOT_FOUND);
                };
                let len = {
                    let fs = self.shared.fs.lock().unwrap();
                    match fs.get(&path) {
                        Some(Node::Obj(data)) => data.len() as i64,
                        _ => 0,
                    }
                };
                let new_pos = match inp.whence {
                    whence::SEEK_SET => inp.offset,
                    whence::SEEK_CUR => pos as i64 + inp.offset,
                    whence::SEEK_END => len + inp.offset,
                    _ => inp.offset,
                }
                .max(0);
                self.descriptors.insert(inp.fd, (path, new_pos as u64));
                self.reply_body(&FileLseekOut { offset: new_pos }.to_tag())
            }
            api::DATA_OBJ_CLOSE_AN => {
                let inp = OpenedDataObjInp::from_tag(frame.body.as_ref().unwrap())?;
                self.descriptors.remove(&inp.fd);
                self.reply_status(0)
            }
            api::OPR_COMPLETE_AN => {
                let _ = IntInfo::from_tag(frame.body.as_ref().unwrap())?;
                for handle in self.pending.drain(..) {
                    let _ = handle.join();
                }
                self.shared.opr_completes.fetch_add(1, Ordering::SeqCst);
                self.reply_status(0)
            }
            api::END_TRANSACTION_AN => self.reply_status(0),
            other => self.reply_status_unknown(other),
        }
    }

    fn reply_status_unknown(&mut self, api_number: i32) -> Result<(), IrodsError> {
        eprintln!("mock server: unhandled api {}", api_number);
        self.reply_status(-1)
    }

    fn handle_put(&mut self, frame: Frame) -> Result<(), IrodsError> {
        let inp = DataObjInp::from_tag(frame.body.as_ref().unwrap())?;
        let force = inp.cond_input.contains(kw::FORCE_FLAG);
        {
            let fs = self.shared.fs.lock().unwrap();
            if fs.contains_key(&inp.obj_path) && !force {
                drop(fs);
                return self.reply_status(STATUS_ALREADY_EXISTS);
            }
            if !matches!(fs.get(&parent_of(&inp.obj_path)), Some(Node::Coll)) {
                drop(fs);
                return self.reply_status(STATUS_NOT_FOUND);
            }
        }

        if inp.num_threads < 1 {
            // In-band: the blob arrived with the request
            self.shared
                .fs
                .lock()
                .unwrap()
                .insert(inp.obj_path.clone(), Node::Obj(frame.bs));
            return self.reply_status(0);
        }

        // Portal path: accept N data streams and reassemble by offset
        let streams = inp.num_threads as usize;
        let size = inp.data_size.max(0) as usize;
        let cookie = 0x5f3a_2b1c_i32;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let data_port = listener.local_addr()?.port();
        let shared = Arc::clone(&self.shared);
        let cipher = self.cipher.clone();
        let target = inp.obj_path.clone();

        let handle = thread::spawn(move || {
            let buffer = Arc::new(Mutex::new(vec![0u8; size]));
            let fill = Arc::new(AtomicU64::new(0));
            let mut workers = Vec::new();
            for stream in accept_n(&listener, streams) {
                let buffer = Arc::clone(&buffer);
                let fill = Arc::clone(&fill);
                let cipher = cipher.as_ref().map(|m| m.cipher());
                workers.push(thread::spawn(move || {
                    let _ = portal_recv_stream(stream, cookie, cipher, &buffer, &fill);
                }));
            }
            for worker in workers {
                let _ = worker.join();
            }
            let complete = fill.load(Ordering::SeqCst) as usize == size;
            if complete {
                let data = buffer.lock().unwrap().clone();
                shared.fs.lock().unwrap().insert(target, Node::Obj(data));
            }
        });
        self.pending.push(handle);

        let portal = PortalOprOut {
            status: 0,
            l1desc_inx: self.next_fd,
            num_threads: streams as i32,
            ports: (0..streams)
                .map(|_| PortalEndpoint {
                    host: "127.0.0.1".to_string(),
                    port: data_port,
                    cookie,
                })
                .collect(),
        };
        self.next_fd += 1;
        self.reply_body(&portal.to_tag())
    }

    fn handle_get(&mut self, frame: Frame) -> Result<(), IrodsError> {
        let inp = DataObjInp::from_tag(frame.body.as_ref().unwrap())?;
        let data = {
            let fs = self.shared.fs.lock().unwrap();
            match fs.get(&inp.obj_path) {
                Some(Node::Obj(data)) => data.clone(),
                _ => {
                    drop(fs);
                    return self.reply_status(STATUS_NOT_FOUND);
                }
            }
        };

        if inp.num_threads < 1 {
            return codec::write_frame(
                &mut self.transport,
                msg_type::RODS_API_REPLY,
                0,
                None,
                &data,
            );
        }

        let streams = inp.num_threads as usize;
        let cookie = 0x1c2b_3a5f_i32;
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let data_port = listener.local_addr()?.port();
        let cipher = self.cipher.clone();

        let handle = thread::spawn(move || {
            let data = Arc::new(data);
            let spans = span_partition(data.len() as u64, streams);
            let mut workers = Vec::new();
            for (i, stream) in accept_n(&listener, streams).into_iter().enumerate() {
                let data = Arc::clone(&data);
                let cipher = cipher.as_ref().map(|m| m.cipher());
                let (offset, length) = spans[i];
                workers.push(thread::spawn(move || {
                    let _ = portal_send_stream(stream, cookie, cipher, &data, offset, length);
                }));
            }
            for worker in workers {
                let _ = worker.join();
            }
        });
        self.pending.push(handle);

        let portal = PortalOprOut {
            status: 0,
            l1desc_inx: self.next_fd,
            num_threads: streams as i32,
            ports: (0..streams)
                .map(|_| PortalEndpoint {
                    host: "127.0.0.1".to_string(),
                    port: data_port,
                    cookie,
                })
                .collect(),
        };
        self.next_fd += 1;
        self.reply_body(&portal.to_tag())
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

fn span_partition(size: u64, n: usize) -> Vec<(u64, u64)> {
    let n64 = n as u64;
    let base = size / n64;
    (0..n64)
        .map(|i| {
            let offset = i * base;
            let length = if i == n64 - 1 { size - offset } else { base };
            (offset, length)
        })
        .collect()
}

fn accept_n(listener: &TcpListener, n: usize) -> Vec<TcpStream> {
    listener.set_nonblocking(true).ok();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut streams = Vec::new();
    while streams.len() < n && Instant::now() < deadline {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nodelay(true).ok();
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .ok();
                stream
                    .set_write_timeout(Some(Duration::from_secs(10)))
                    .ok();
                streams.push(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2));
            }
            Err(_) => break,
        }
    }
    streams
}

fn read_hello(stream: &mut TcpStream, cookie: i32) -> std::io::Result<i32> {
    let mut hello = [0u8; 8];
    stream.read_exact(&mut hello)?;
    let got = i32::from_be_bytes(hello[0..4].try_into().unwrap());
    if got != cookie {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad cookie",
        ));
    }
    Ok(i32::from_be_bytes(hello[4..8].try_into().unwrap()))
}

/// Receive framed chunks from one put stream into the shared buffer
fn portal_recv_stream(
    mut stream: TcpStream,
    cookie: i32,
    cipher: Option<AesCipher>,
    buffer: &Arc<Mutex<Vec<u8>>>,
    fill: &Arc<AtomicU64>,
) -> std::io::Result<()> {
    read_hello(&mut stream, cookie)?;
    loop {
        let (oprn, offset, payload) = match &cipher {
            Some(cipher) => {
                let plain = cipher
                    .read_frame(&mut stream)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
                if plain.len() < 24 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "short chunk frame",
                    ));
                }
                let oprn = i32::from_be_bytes(plain[0..4].try_into().unwrap());
                let offset = i64::from_be_bytes(plain[8..16].try_into().unwrap());
                (oprn, offset, plain[24..].to_vec())
            }
            None => {
                let mut header = [0u8; 24];
                stream.read_exact(&mut header)?;
                let oprn = i32::from_be_bytes(header[0..4].try_into().unwrap());
                let offset = i64::from_be_bytes(header[8..16].try_into().unwrap());
                let length = i64::from_be_bytes(header[16..24].try_into().unwrap());
                if oprn == opr::DONE_OPR {
                    (oprn, 0, Vec::new())
                } else {
                    let mut payload = vec![0u8; length.max(0) as usize];
                    stream.read_exact(&mut payload)?;
                    (oprn, offset, payload)
                }
            }
        };
        if oprn == opr::DONE_OPR {
            return Ok(());
        }
        let mut buf = buffer.lock().unwrap();
        let start = offset.max(0) as usize;
        let end = (start + payload.len()).min(buf.len());
        if end > start {
            buf[start..end].copy_from_slice(&payload[..end - start]);
        }
        drop(buf);
        fill.fetch_add(payload.len() as u64, Ordering::SeqCst);
    }
}

/// Send one span of the object down a get stream as framed chunks
fn portal_send_stream(
    mut stream: TcpStream,
    cookie: i32,
    cipher: Option<AesCipher>,
    data: &Arc<Vec<u8>>,
    offset: u64,
    length: u64,
) -> std::io::Result<()> {
    read_hello(&mut stream, cookie)?;
    let mut sent = 0u64;
    while sent < length {
        let chunk = (length - sent).min(CHUNK as u64) as usize;
        let at = (offset + sent) as usize;
        let payload = &data[at..at + chunk];
        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&opr::GET_OPR.to_be_bytes());
        header[8..16].copy_from_slice(&((offset + sent) as i64).to_be_bytes());
        header[16..24].copy_from_slice(&(chunk as i64).to_be_bytes());
        match &cipher {
            Some(cipher) => {
                let mut plain = Vec::with_capacity(24 + chunk);
                plain.extend_from_slice(&header);
                plain.extend_from_slice(payload);
                cipher
                    .write_frame(&mut stream, &plain)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            }
            None => {
                stream.write_all(&header)?;
                stream.write_all(payload)?;
            }
        }
        sent += chunk as u64;
    }
    let mut done = [0u8; 24];
    done[0..4].copy_from_slice(&opr::DONE_OPR.to_be_bytes());
    match &cipher {
        Some(cipher) => cipher
            .write_frame(&mut stream, &done)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?,
        None => stream.write_all(&done)?,
    }
    stream.flush()
}
