//! Connection engine: one TCP socket, strict request/response cadence,
//! negotiation and authentication at startup, explicit state machine.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::account::{CsNegPolicy, IrodsAccount};
use crate::auth;
use crate::codec::{self, msg_type, Frame};
use crate::config::PipelineConfiguration;
use crate::error::{IrodsError, Result};
use crate::negotiation::{
    self, EncryptEnvelope, NegotiatedSession, CS_NEG_FAILURE, CS_NEG_USE_SSL, CS_NEG_USE_TCP,
};
use crate::packinstr::{CsNeg, StartupPack, Version, REQUEST_NEGOTIATION_OPTION};
use crate::secure;
use crate::tag::Tag;

pub const CLIENT_REL_VERSION: &str = "rods4.2.8";
pub const CLIENT_API_VERSION: &str = "d";

/// Connection lifecycle. `send` is accepted only in Ready; any I/O
/// fault moves the handle through Closing to Closed, after which it
/// must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Negotiating,
    Authenticating,
    Ready,
    InUse,
    Closing,
    Closed,
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    Closed,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(s) => f.debug_tuple("Plain").field(s).finish(),
            Transport::Tls(s) => f.debug_tuple("Tls").field(&s.sock).finish(),
            Transport::Closed => write!(f, "Closed"),
        }
    }
}

impl Transport {
    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Transport::Plain(s) => Some(s),
            Transport::Tls(s) => Some(&s.sock),
            Transport::Closed => None,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
            Transport::Closed => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
            Transport::Closed => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
            Transport::Closed => Ok(()),
        }
    }
}

/// A live, authenticated connection to an iRODS server. Exclusively
/// owned: acquired from the session registry, used by one thread,
/// returned or closed on every exit path.
#[derive(Debug)]
pub struct IrodsConnection {
    account: IrodsAccount,
    config: PipelineConfiguration,
    transport: Transport,
    state: ConnState,
    session: NegotiatedSession,
    server_version: String,
    requests_issued: u64,
    responses_consumed: u64,
}

impl IrodsConnection {
    /// Open a socket, exchange the startup pack, negotiate encryption,
    /// authenticate, and land in Ready.
    pub fn connect(account: &IrodsAccount, config: &PipelineConfiguration) -> Result<IrodsConnection> {
        let addr = (account.host.as_str(), account.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                IrodsError::NetworkFailure(format!("cannot resolve {}:{}", account.host, account.port))
            })?;
        let connect_timeout = config
            .socket_timeout_duration()
            .unwrap_or(Duration::from_secs(30));
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(config.socket_timeout_duration())?;
        stream.set_write_timeout(config.socket_timeout_duration())?;
        debug!(host = %account.host, port = account.port, "connected");

        let mut conn = IrodsConnection {
            account: account.clone(),
            config: config.clone(),
            transport: Transport::Plain(stream),
            state: ConnState::New,
            session: NegotiatedSession::plaintext(config),
            server_version: String::new(),
            requests_issued: 0,
            responses_consumed: 0,
        };

        conn.state = ConnState::Negotiating;
        if let Err(e) = conn.startup_and_negotiate() {
            conn.close_now();
            return Err(e);
        }

        conn.state = ConnState::Authenticating;
        if let Err(e) = auth::authenticate(&mut conn) {
            conn.close_now();
            return Err(e);
        }

        conn.state = ConnState::Ready;
        debug!(account = %conn.account, version = %conn.server_version, "session ready");
        Ok(conn)
    }

    fn startup_and_negotiate(&mut self) -> Result<()> {
        let startup = StartupPack {
            irods_prot: 1,
            connect_cnt: 0,
            proxy_user: self.account.effective_proxy_user().to_string(),
            proxy_zone: self.account.effective_proxy_zone().to_string(),
            client_user: self.account.user.clone(),
            client_zone: self.account.zone.clone(),
            rel_version: CLIENT_REL_VERSION.to_string(),
            api_version: CLIENT_API_VERSION.to_string(),
            option: REQUEST_NEGOTIATION_OPTION.to_string(),
        };
        codec::write_frame(
            &mut self.transport,
            msg_type::RODS_CONNECT,
            0,
            Some(&startup.to_tag()),
            &[],
        )?;

        let reply = codec::read_frame(&mut self.transport)?;
        let use_ssl = match reply.msg_type.as_str() {
            msg_type::RODS_CS_NEG => {
                let body = reply
                    .body
                    .as_ref()
                    .ok_or_else(|| IrodsError::Protocol("negotiation frame with no body".into()))?;
                let server_neg = CsNeg::from_tag(body)?;
                let server_policy = CsNegPolicy::from_token(server_neg.result.trim())
                    .ok_or_else(|| {
                        IrodsError::Protocol(format!(
                            "unknown server negotiation stance {:?}",
                            server_neg.result
                        ))
                    })?;
                match negotiation::decide(self.account.cs_neg_policy, server_policy) {
                    Ok(use_ssl) => {
                        let outcome = CsNeg {
                            status: 1,
                            result: if use_ssl { CS_NEG_USE_SSL } else { CS_NEG_USE_TCP }
                                .to_string(),
                        };
                        codec::write_frame(
                            &mut self.transport,
                            msg_type::RODS_CS_NEG,
                            0,
                            Some(&outcome.to_tag()),
                            &[],
                        )?;
                        self.read_version()?;
                        use_ssl
                    }
                    Err(e) => {
                        let refusal = CsNeg {
                            status: 0,
                            result: CS_NEG_FAILURE.to_string(),
                        };
                        let _ = codec::write_frame(
                            &mut self.transport,
                            msg_type::RODS_CS_NEG,
                            0,
                            Some(&refusal.to_tag()),
                            &[],
                        );
                        return Err(e);
                    }
                }
            }
            msg_type::RODS_VERSION => {
                // Server skipped negotiation entirely: plaintext only
                if self.account.cs_neg_policy == CsNegPolicy::Require {
                    return Err(IrodsError::Negotiation(
                        "client requires SSL but server did not negotiate".into(),
                    ));
                }
                self.take_version(reply)?;
                false
            }
            other => {
                return Err(IrodsError::Protocol(format!(
                    "unexpected startup reply type {:?}",
                    other
                )))
            }
        };

        if use_ssl {
            self.upgrade_tls()?;
            self.session = NegotiatedSession::for_ssl(&self.config);
            self.send_encrypt_envelope()?;
        }
        Ok(())
    }

    fn read_version(&mut self) -> Result<()> {
        let reply = codec::read_frame(&mut self.transport)?;
        if reply.msg_type != msg_type::RODS_VERSION {
            return Err(IrodsError::Protocol(format!(
                "expected version frame, got {:?}",
                reply.msg_type
            )));
        }
        self.take_version(reply)
    }

    fn take_version(&mut self, frame: Frame) -> Result<()> {
        if frame.int_info < 0 {
            return Err(IrodsError::from_status(frame.int_info, "startup"));
        }
        let body = frame
            .body
            .as_ref()
            .ok_or_else(|| IrodsError::Protocol("version frame with no body".into()))?;
        let version = Version::from_tag(body)?;
        if version.status < 0 {
            return Err(IrodsError::from_status(version.status, "startup"));
        }
        self.server_version = version.rel_version;
        Ok(())
    }

    /// Replace the plain socket with a TLS client stream; the
    /// handshake completes on the next read or write.
    pub(crate) fn upgrade_tls(&mut self) -> Result<()> {
        let transport = std::mem::replace(&mut self.transport, Transport::Closed);
        match transport {
            Transport::Plain(tcp) => {
                let tls_config = Arc::new(secure::build_client_config_tofu(
                    &self.account.host,
                    self.account.port,
                ));
                let name = secure::server_name_for(&self.account.host);
                let client = rustls::ClientConnection::new(tls_config, name)
                    .map_err(|e| IrodsError::Negotiation(format!("TLS setup: {}", e)))?;
                self.transport = Transport::Tls(Box::new(rustls::StreamOwned::new(client, tcp)));
                Ok(())
            }
            other => {
                self.transport = other;
                Err(IrodsError::Internal("TLS upgrade on a non-plain transport".into()))
            }
        }
    }

    /// Drop back to the plain socket after an SslEnd exchange. The
    /// cadence is lockstep, so no peer bytes are in flight when the
    /// TLS state is discarded.
    pub(crate) fn downgrade_tls(&mut self) -> Result<()> {
        let transport = std::mem::replace(&mut self.transport, Transport::Closed);
        match transport {
            Transport::Tls(stream) => {
                let rustls::StreamOwned { sock, .. } = *stream;
                self.transport = Transport::Plain(sock);
                Ok(())
            }
            other => {
                self.transport = other;
                Err(IrodsError::Internal("TLS downgrade on a non-TLS transport".into()))
            }
        }
    }

    /// Ship the cipher parameters and key material to the server on
    /// the freshly encrypted channel. One-way, no reply.
    pub(crate) fn send_encrypt_envelope(&mut self) -> Result<()> {
        let envelope = EncryptEnvelope::from_config(&self.config);
        let mut material =
            Vec::with_capacity(self.session.salt.len() + self.session.shared_secret.len());
        material.extend_from_slice(&self.session.salt);
        material.extend_from_slice(&self.session.shared_secret);
        codec::write_frame(
            &mut self.transport,
            msg_type::RODS_ENCRYPT,
            0,
            Some(&envelope.to_tag()),
            &material,
        )
    }

    pub(crate) fn replace_session(&mut self, session: NegotiatedSession) {
        debug_assert!(self.state != ConnState::Ready, "session is immutable once Ready");
        self.session = session;
    }

    pub(crate) fn set_password(&mut self, password: String) {
        self.account.password = password;
    }

    /// Issue one API request and consume its full reply. Fails unless
    /// the handle is Ready (internal startup phases are also allowed).
    pub fn send(&mut self, api_number: i32, body: Option<&Tag>) -> Result<Frame> {
        self.send_with_blob(api_number, body, &[])
    }

    pub fn send_with_blob(&mut self, api_number: i32, body: Option<&Tag>, bs: &[u8]) -> Result<Frame> {
        self.enter_exchange()?;
        let result = self.exchange_inner(api_number, body, bs);
        self.leave_exchange(result.as_ref().err());
        result
    }

    /// Request whose binary blob streams from `reader`; used for
    /// in-band puts so the file never sits in memory.
    pub fn send_streaming_blob<R: Read>(
        &mut self,
        api_number: i32,
        body: Option<&Tag>,
        bs_len: u64,
        reader: &mut R,
    ) -> Result<Frame> {
        self.enter_exchange()?;
        let mut copy_buf = vec![0u8; self.config.send_input_stream_buffer_size.max(4096)];
        let result = (|| {
            self.requests_issued += 1;
            codec::write_frame_streaming(
                &mut self.transport,
                msg_type::RODS_API_REQ,
                api_number,
                body,
                bs_len,
                reader,
                &mut copy_buf,
            )?;
            let reply = codec::read_frame(&mut self.transport)?;
            self.responses_consumed += 1;
            check_reply_status(&reply, api_number)?;
            Ok(reply)
        })();
        self.leave_exchange(result.as_ref().err());
        result
    }

    /// Request whose reply blob is streamed into `writer`; used for
    /// in-band gets. Returns the reply frame and the blob length.
    pub fn send_recv_blob<W: Write>(
        &mut self,
        api_number: i32,
        body: Option<&Tag>,
        writer: &mut W,
    ) -> Result<(Frame, u64)> {
        self.enter_exchange()?;
        let mut copy_buf = vec![0u8; self.config.internal_cache_buffer_size.max(4096)];
        let result = (|| {
            self.requests_issued += 1;
            codec::write_frame(&mut self.transport, msg_type::RODS_API_REQ, api_number, body, &[])?;
            let (reply, bs_len) = codec::read_frame_streaming(&mut self.transport)?;
            // Drain the blob before surfacing any status error so the
            // cadence stays intact
            let copy_result = if bs_len > 0 {
                codec::copy_blob(&mut self.transport, writer, bs_len, &mut copy_buf).map(|_| ())
            } else {
                Ok(())
            };
            self.responses_consumed += 1;
            copy_result?;
            check_reply_status(&reply, api_number)?;
            Ok((reply, bs_len))
        })();
        self.leave_exchange(result.as_ref().err());
        result
    }

    fn exchange_inner(&mut self, api_number: i32, body: Option<&Tag>, bs: &[u8]) -> Result<Frame> {
        self.requests_issued += 1;
        codec::write_frame(&mut self.transport, msg_type::RODS_API_REQ, api_number, body, bs)?;
        let reply = codec::read_frame(&mut self.transport)?;
        self.responses_consumed += 1;
        check_reply_status(&reply, api_number)?;
        Ok(reply)
    }

    fn enter_exchange(&mut self) -> Result<()> {
        match self.state {
            ConnState::Ready | ConnState::Authenticating => {
                if self.state == ConnState::Ready {
                    self.state = ConnState::InUse;
                }
                Ok(())
            }
            other => Err(IrodsError::Internal(format!(
                "send on a connection in state {:?}",
                other
            ))),
        }
    }

    /// Transport faults are fatal for the handle; server status errors
    /// leave it usable.
    fn leave_exchange(&mut self, err: Option<&IrodsError>) {
        match err {
            Some(
                IrodsError::NetworkTimeout(_)
                | IrodsError::NetworkFailure(_)
                | IrodsError::WireFormat(_),
            ) => {
                self.state = ConnState::Closing;
                self.close_now();
            }
            _ => {
                if self.state == ConnState::InUse {
                    self.state = ConnState::Ready;
                }
            }
        }
    }

    /// Send the disconnect message and close the socket. Idempotent.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.state = ConnState::Closing;
        let _ = codec::write_frame(&mut self.transport, msg_type::RODS_DISCONNECT, 0, None, &[]);
        self.close_now();
        Ok(())
    }

    pub(crate) fn close_now(&mut self) {
        if let Some(tcp) = self.transport.tcp() {
            let _ = tcp.shutdown(Shutdown::Both);
        }
        self.transport = Transport::Closed;
        self.state = ConnState::Closed;
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnState::Ready | ConnState::InUse)
    }

    pub fn account(&self) -> &IrodsAccount {
        &self.account
    }

    pub fn config(&self) -> &PipelineConfiguration {
        &self.config
    }

    pub fn session(&self) -> &NegotiatedSession {
        &self.session
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Requests issued and responses fully consumed; equal on a
    /// healthy handle between exchanges.
    pub fn exchange_counts(&self) -> (u64, u64) {
        (self.requests_issued, self.responses_consumed)
    }
}

fn check_reply_status(reply: &Frame, api_number: i32) -> Result<()> {
    if reply.int_info < 0 {
        return Err(IrodsError::from_status(
            reply.int_info,
            &format!("api {}", api_number),
        ));
    }
    Ok(())
}

impl Drop for IrodsConnection {
    fn drop(&mut self) {
        if self.state != ConnState::Closed {
            if self.is_connected() {
                let _ = self.disconnect();
            } else {
                self.close_now();
            }
            if self.requests_issued != self.responses_consumed {
                warn!(
                    issued = self.requests_issued,
                    consumed = self.responses_consumed,
                    "connection dropped with unbalanced exchanges"
                );
            }
        }
    }
}
