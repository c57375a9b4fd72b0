//! Authentication schemes, dispatched by the account's configured
//! scheme during connection startup.

use tracing::debug;

use crate::account::AuthScheme;
use crate::connection::IrodsConnection;
use crate::error::{IrodsError, Result};
use crate::negotiation::NegotiatedSession;
use crate::packinstr::{
    api, AuthChallenge, AuthResponse, PamAuthRequest, PamAuthResponse, SslToggle,
};

/// Passwords are zero-padded to this length before digesting
pub const MAX_PASSWORD_LENGTH: usize = 50;
/// Lifetime requested for PAM-minted native passwords
const PAM_TTL_SECONDS: i32 = 3600;

pub(crate) fn authenticate(conn: &mut IrodsConnection) -> Result<()> {
    match conn.account().scheme {
        AuthScheme::Anonymous => Ok(()),
        AuthScheme::Native => {
            let password = conn.account().password.clone();
            native_auth(conn, &password)
        }
        AuthScheme::Pam => pam_auth(conn),
        AuthScheme::Gsi | AuthScheme::Kerberos => Err(IrodsError::NotSupported(
            "GSI/Kerberos context exchange requires an external credential provider",
        )),
    }
}

/// MD5 challenge-response against the catalog password
fn native_auth(conn: &mut IrodsConnection, password: &str) -> Result<()> {
    let reply = conn.send(api::AUTH_REQUEST_AN, None)?;
    let body = reply
        .body
        .as_ref()
        .ok_or_else(|| IrodsError::Protocol("auth challenge with no body".into()))?;
    let challenge = AuthChallenge::from_tag(body)?;
    let challenge_bytes = decode_hex(&challenge.challenge)
        .ok_or_else(|| IrodsError::Protocol("challenge is not valid hex".into()))?;

    let response = AuthResponse {
        response: challenge_response(&challenge_bytes, password),
        username: format!(
            "{}#{}",
            conn.account().effective_proxy_user(),
            conn.account().effective_proxy_zone()
        ),
    };
    conn.send(api::AUTH_RESPONSE_AN, Some(&response.to_tag()))
        .map_err(|e| match e {
            IrodsError::AuthFailed(_) => e,
            IrodsError::PermissionDenied(msg) | IrodsError::Protocol(msg) => {
                IrodsError::AuthFailed(msg)
            }
            other => other,
        })?;
    debug!(user = %conn.account().user, "native authentication complete");
    Ok(())
}

/// PAM: forward the login over an encrypted channel, receive a
/// short-lived native password, store it in the account, then run the
/// native exchange with it.
///
/// On a session that did not negotiate SSL the exchange is bracketed
/// with SslStart/SslEnd, so only the PAM login itself rides the
/// encrypted channel.
fn pam_auth(conn: &mut IrodsConnection) -> Result<()> {
    let bracketed = !conn.session().use_ssl;
    if bracketed {
        let toggle = SslToggle { arg: String::new() };
        conn.send(api::SSL_START_AN, Some(&toggle.to_tag(false)))?;
        conn.upgrade_tls()?;
        let config = conn.config().clone();
        conn.replace_session(NegotiatedSession::for_ssl(&config));
        conn.send_encrypt_envelope()?;
    }

    let request = PamAuthRequest {
        user: conn.account().user.clone(),
        password: conn.account().password.clone(),
        ttl_seconds: PAM_TTL_SECONDS,
    };
    let reply = conn
        .send(api::PAM_AUTH_REQUEST_AN, Some(&request.to_tag()))
        .map_err(|e| match e {
            IrodsError::AuthFailed(_) => e,
            IrodsError::PermissionDenied(msg) => IrodsError::AuthFailed(msg),
            other => other,
        })?;
    let body = reply
        .body
        .as_ref()
        .ok_or_else(|| IrodsError::Protocol("PAM reply with no body".into()))?;
    let minted = PamAuthResponse::from_tag(body)?;
    debug!(user = %conn.account().user, "PAM issued a short-lived native password");

    if bracketed {
        let toggle = SslToggle { arg: String::new() };
        conn.send(api::SSL_END_AN, Some(&toggle.to_tag(true)))?;
        conn.downgrade_tls()?;
        let config = conn.config().clone();
        conn.replace_session(NegotiatedSession::plaintext(&config));
    }

    conn.set_password(minted.generated_password.clone());
    native_auth(conn, &minted.generated_password)
}

/// Digest of challenge bytes followed by the password zero-padded to
/// its maximum length, rendered as lowercase hex
pub fn challenge_response(challenge: &[u8], password: &str) -> String {
    let mut input = Vec::with_capacity(challenge.len() + MAX_PASSWORD_LENGTH);
    input.extend_from_slice(challenge);
    let mut padded = [0u8; MAX_PASSWORD_LENGTH];
    let pw = password.as_bytes();
    let take = pw.len().min(MAX_PASSWORD_LENGTH);
    padded[..take].copy_from_slice(&pw[..take]);
    input.extend_from_slice(&padded);
    let digest = md5::compute(&input);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
