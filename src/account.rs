//! Account identity and connection target

use std::fmt;
use std::hash::{Hash, Hasher};

/// Authentication scheme selected per account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// MD5 challenge-response against the catalog password
    Native,
    /// PAM login over an encrypted channel, yielding a short-lived
    /// native password
    Pam,
    /// GSI context exchange (external credential, not driven in-core)
    Gsi,
    /// Kerberos context exchange (external credential, not driven in-core)
    Kerberos,
    /// No challenge at all
    Anonymous,
}

/// Client stance for client-server encryption negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsNegPolicy {
    Require,
    DontCare,
    Refuse,
}

impl CsNegPolicy {
    pub fn token(self) -> &'static str {
        match self {
            CsNegPolicy::Require => "CS_NEG_REQUIRE",
            CsNegPolicy::DontCare => "CS_NEG_DONT_CARE",
            CsNegPolicy::Refuse => "CS_NEG_REFUSE",
        }
    }

    pub fn from_token(s: &str) -> Option<CsNegPolicy> {
        match s {
            "CS_NEG_REQUIRE" => Some(CsNegPolicy::Require),
            "CS_NEG_DONT_CARE" => Some(CsNegPolicy::DontCare),
            "CS_NEG_REFUSE" => Some(CsNegPolicy::Refuse),
            _ => None,
        }
    }
}

pub const ANONYMOUS_USER: &str = "anonymous";

/// Immutable credentials and target for one iRODS identity.
///
/// Equality and hashing cover (host, port, zone, user, proxy_user) so
/// the session registry can key live connections by account; password,
/// home, default resource and scheme do not participate.
#[derive(Debug, Clone)]
pub struct IrodsAccount {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub zone: String,
    /// Home collection, `/{zone}/home/{user}` unless overridden
    pub home: String,
    /// Default storage resource; empty lets the server pick
    pub default_resource: String,
    pub scheme: AuthScheme,
    pub proxy_user: Option<String>,
    pub proxy_zone: Option<String>,
    pub cs_neg_policy: CsNegPolicy,
}

impl IrodsAccount {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        zone: impl Into<String>,
    ) -> IrodsAccount {
        let user = user.into();
        let zone = zone.into();
        let home = format!("/{}/home/{}", zone, user);
        IrodsAccount {
            host: host.into(),
            port,
            user,
            password: password.into(),
            zone,
            home,
            default_resource: String::new(),
            scheme: AuthScheme::Native,
            proxy_user: None,
            proxy_zone: None,
            cs_neg_policy: CsNegPolicy::DontCare,
        }
    }

    /// Account acting for `user` through proxy credentials
    pub fn with_proxy(
        mut self,
        proxy_user: impl Into<String>,
        proxy_zone: impl Into<String>,
    ) -> IrodsAccount {
        self.proxy_user = Some(proxy_user.into());
        self.proxy_zone = Some(proxy_zone.into());
        self
    }

    /// Anonymous access to a zone; no password, no challenge
    pub fn anonymous(host: impl Into<String>, port: u16, zone: impl Into<String>) -> IrodsAccount {
        let mut acct = IrodsAccount::new(host, port, ANONYMOUS_USER, "", zone);
        acct.scheme = AuthScheme::Anonymous;
        acct
    }

    pub fn with_default_resource(mut self, resource: impl Into<String>) -> IrodsAccount {
        self.default_resource = resource.into();
        self
    }

    pub fn with_scheme(mut self, scheme: AuthScheme) -> IrodsAccount {
        self.scheme = scheme;
        self
    }

    pub fn with_cs_neg_policy(mut self, policy: CsNegPolicy) -> IrodsAccount {
        self.cs_neg_policy = policy;
        self
    }

    /// User actually presented on the wire: proxy when set, else login
    pub fn effective_proxy_user(&self) -> &str {
        self.proxy_user.as_deref().unwrap_or(&self.user)
    }

    pub fn effective_proxy_zone(&self) -> &str {
        self.proxy_zone.as_deref().unwrap_or(&self.zone)
    }
}

impl PartialEq for IrodsAccount {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.zone == other.zone
            && self.user == other.user
            && self.proxy_user == other.proxy_user
    }
}

impl Eq for IrodsAccount {}

impl Hash for IrodsAccount {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.zone.hash(state);
        self.user.hash(state);
        self.proxy_user.hash(state);
    }
}

impl fmt::Display for IrodsAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}:{}", self.user, self.zone, self.host, self.port)
    }
}
