//! URI rendering and parsing for the `irods://` scheme

use crate::account::IrodsAccount;
use crate::error::{IrodsError, Result};
use crate::path::IrodsPath;

pub const DEFAULT_PORT: u16 = 1247;

/// The pieces of an `irods://user@host:port/absolute/path` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrodsUri {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: IrodsPath,
}

impl IrodsUri {
    pub fn render(account: &IrodsAccount, path: &IrodsPath) -> String {
        format!(
            "irods://{}@{}:{}{}",
            account.user, account.host, account.port, path
        )
    }

    pub fn parse(uri: &str) -> Result<IrodsUri> {
        let rest = uri
            .strip_prefix("irods://")
            .ok_or_else(|| IrodsError::NotSupported("only irods:// URIs are recognized"))?;
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(IrodsError::Protocol(format!("URI {:?} has no host", uri)));
        }
        let (user, hostport) = match authority.split_once('@') {
            Some((u, hp)) => ((!u.is_empty()).then(|| u.to_string()), hp),
            None => (None, authority),
        };
        let (host, port) = match hostport.split_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| {
                    IrodsError::Protocol(format!("URI {:?} has a bad port", uri))
                })?;
                (h.to_string(), port)
            }
            None => (hostport.to_string(), DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(IrodsError::Protocol(format!("URI {:?} has no host", uri)));
        }
        Ok(IrodsUri {
            user,
            host,
            port,
            path: IrodsPath::absolute(&format!("/{}", path)),
        })
    }
}
