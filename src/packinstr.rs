//! Pack-instruction schemas: the named, versioned structured messages
//! exchanged with the server, and the registry that drives decode
//! validation.

use crate::error::{IrodsError, Result};
use crate::tag::Tag;

/// API numbers carried in the frame header's intInfo on requests
pub mod api {
    pub const DATA_OBJ_CREATE_AN: i32 = 601;
    pub const DATA_OBJ_OPEN_AN: i32 = 602;
    pub const DATA_OBJ_READ_AN: i32 = 603;
    pub const DATA_OBJ_WRITE_AN: i32 = 604;
    pub const DATA_OBJ_CLOSE_AN: i32 = 605;
    pub const DATA_OBJ_PUT_AN: i32 = 606;
    pub const DATA_OBJ_GET_AN: i32 = 608;
    pub const DATA_OBJ_REPL_AN: i32 = 610;
    pub const DATA_OBJ_COPY_AN: i32 = 613;
    pub const DATA_OBJ_UNLINK_AN: i32 = 615;
    pub const OPR_COMPLETE_AN: i32 = 626;
    pub const DATA_OBJ_RENAME_AN: i32 = 627;
    pub const DATA_OBJ_CHKSUM_AN: i32 = 629;
    pub const DATA_OBJ_PHYMV_AN: i32 = 631;
    pub const OBJ_STAT_AN: i32 = 633;
    pub const DATA_OBJ_LSEEK_AN: i32 = 674;
    pub const RM_COLL_AN: i32 = 679;
    pub const COLL_CREATE_AN: i32 = 681;
    pub const COLL_LIST_AN: i32 = 682;
    pub const END_TRANSACTION_AN: i32 = 698;
    pub const AUTH_REQUEST_AN: i32 = 703;
    pub const AUTH_RESPONSE_AN: i32 = 704;
    pub const PAM_AUTH_REQUEST_AN: i32 = 725;
    pub const SSL_START_AN: i32 = 1100;
    pub const SSL_END_AN: i32 = 1101;
}

/// Operation type stamped into DataObjInp
pub mod opr {
    pub const NO_OPR: i32 = 0;
    pub const PUT_OPR: i32 = 1;
    pub const GET_OPR: i32 = 2;
    pub const REPLICATE_OPR: i32 = 6;
    pub const COPY_DEST: i32 = 9;
    pub const COPY_SRC: i32 = 10;
    pub const RENAME_DATA_OBJ: i32 = 11;
    pub const RENAME_COLL: i32 = 12;
    pub const PHYMV_OPR: i32 = 15;
    /// Chunk-header terminator on a parallel data stream
    pub const DONE_OPR: i32 = 9999;
}

/// Object kinds reported by ObjStat
pub mod obj_type {
    pub const UNKNOWN_T: i32 = 0;
    pub const DATA_OBJ_T: i32 = 1;
    pub const COLL_OBJ_T: i32 = 2;
}

/// Seek origins for DataObjLseek
pub mod whence {
    pub const SEEK_SET: i32 = 0;
    pub const SEEK_CUR: i32 = 1;
    pub const SEEK_END: i32 = 2;
}

/// condInput keywords
pub mod kw {
    pub const FORCE_FLAG: &str = "forceFlag";
    pub const DEST_RESC_NAME: &str = "destRescName";
    pub const RESC_NAME: &str = "rescName";
    pub const VERIFY_CHKSUM: &str = "verifyChksum";
    pub const REG_CHKSUM: &str = "regChksum";
    pub const RECURSIVE_OPR: &str = "recursiveOpr";
    pub const DATA_TYPE: &str = "dataType";
}

/// Schema registry: (name, version) → required leaf fields. Decode
/// validation consults this before field extraction so an unknown
/// message or a missing required tag fails as WireFormat uniformly.
pub struct Schema {
    pub name: &'static str,
    pub version: &'static str,
    pub required: &'static [&'static str],
}

pub static REGISTRY: &[Schema] = &[
    Schema { name: "StartupPack_PI", version: "1.0", required: &["irodsProt", "connectCnt", "proxyUser", "proxyRcatZone", "clientUser", "clientRcatZone", "relVersion", "apiVersion", "option"] },
    Schema { name: "CS_NEG_PI", version: "1.0", required: &["status", "result"] },
    Schema { name: "Version_PI", version: "1.0", required: &["status", "relVersion", "apiVersion"] },
    Schema { name: "authRequestOut_PI", version: "1.0", required: &["challenge"] },
    Schema { name: "authResponseInp_PI", version: "1.0", required: &["response", "username"] },
    Schema { name: "pamAuthRequestInp_PI", version: "1.0", required: &["pamUser", "pamPassword", "timeToLive"] },
    Schema { name: "pamAuthRequestOut_PI", version: "1.0", required: &["irodsPamPassword"] },
    Schema { name: "sslStartInp_PI", version: "1.0", required: &["arg0"] },
    Schema { name: "EncryptEnvelope_PI", version: "1.0", required: &["algorithm", "keySize", "saltSize", "hashRounds"] },
    Schema { name: "sslEndInp_PI", version: "1.0", required: &["arg0"] },
    Schema { name: "DataObjInp_PI", version: "1.0", required: &["objPath", "createMode", "openFlags", "offset", "dataSize", "numThreads", "oprType"] },
    Schema { name: "OpenedDataObjInp_PI", version: "1.0", required: &["l1descInx", "len", "whence", "oprType", "offset", "bytesWritten"] },
    Schema { name: "DataObjCopyInp_PI", version: "1.0", required: &[] },
    Schema { name: "CollInp_PI", version: "1.0", required: &["collName", "flags", "oprType"] },
    Schema { name: "RodsObjStat_PI", version: "1.0", required: &["objSize", "objType", "modifyTime", "createTime", "ownerName", "ownerZone"] },
    Schema { name: "CollEnt_PI", version: "1.0", required: &["objType", "entryName", "dataSize", "modifyTime"] },
    Schema { name: "CollEntList_PI", version: "1.0", required: &["rowCnt"] },
    Schema { name: "PortalOprOut_PI", version: "1.0", required: &["status", "l1descInx", "numThreads"] },
    Schema { name: "PortList_PI", version: "1.0", required: &["portNum", "cookie", "hostAddr"] },
    Schema { name: "fileLseekOut_PI", version: "1.0", required: &["offset"] },
    Schema { name: "INT_PI", version: "1.0", required: &["myInt"] },
    Schema { name: "STR_PI", version: "1.0", required: &["myStr"] },
    Schema { name: "KeyValPair_PI", version: "1.0", required: &["ssLen"] },
];

/// Look up a schema and verify the tag satisfies it
pub fn validate(tag: &Tag) -> Result<&'static Schema> {
    let schema = REGISTRY
        .iter()
        .find(|s| s.name == tag.name)
        .ok_or_else(|| IrodsError::WireFormat(format!("unknown pack instruction <{}>", tag.name)))?;
    for field in schema.required {
        if tag.child(field).is_none() {
            return Err(IrodsError::WireFormat(format!(
                "<{}> missing required tag <{}>",
                tag.name, field
            )));
        }
    }
    Ok(schema)
}

/// Key-value condInput pairs. Unknown keys round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondInput(pub Vec<(String, String)>);

impl CondInput {
    pub fn new() -> CondInput {
        CondInput(Vec::new())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(pair) = self.0.iter_mut().find(|(k, _)| k == key) {
            pair.1 = value.to_string();
        } else {
            self.0.push((key.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn to_tag(&self) -> Tag {
        let mut kids = vec![Tag::int("ssLen", self.0.len() as i64)];
        for (k, _) in &self.0 {
            kids.push(Tag::leaf("keyWord", k.clone()));
        }
        for (_, v) in &self.0 {
            kids.push(Tag::leaf("svalue", v.clone()));
        }
        Tag::node("KeyValPair_PI", kids)
    }

    pub fn from_tag(tag: &Tag) -> Result<CondInput> {
        validate(tag)?;
        let len = tag.int_child("ssLen")? as usize;
        let keys: Vec<_> = tag
            .children_named("keyWord")
            .filter_map(|t| t.text().map(str::to_string))
            .collect();
        let values: Vec<_> = tag
            .children_named("svalue")
            .filter_map(|t| t.text().map(str::to_string))
            .collect();
        if keys.len() != len || values.len() != len {
            return Err(IrodsError::WireFormat(format!(
                "KeyValPair_PI ssLen {} does not match {} keys / {} values",
                len,
                keys.len(),
                values.len()
            )));
        }
        Ok(CondInput(keys.into_iter().zip(values).collect()))
    }
}

/// Startup banner sent under the RODS_CONNECT header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPack {
    pub irods_prot: i32,
    pub connect_cnt: i32,
    pub proxy_user: String,
    pub proxy_zone: String,
    pub client_user: String,
    pub client_zone: String,
    pub rel_version: String,
    pub api_version: String,
    pub option: String,
}

/// Option string that asks the server to run capability negotiation
pub const REQUEST_NEGOTIATION_OPTION: &str = "request_server_negotiation";

impl StartupPack {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "StartupPack_PI",
            vec![
                Tag::int("irodsProt", i64::from(self.irods_prot)),
                Tag::int("connectCnt", i64::from(self.connect_cnt)),
                Tag::leaf("proxyUser", self.proxy_user.clone()),
                Tag::leaf("proxyRcatZone", self.proxy_zone.clone()),
                Tag::leaf("clientUser", self.client_user.clone()),
                Tag::leaf("clientRcatZone", self.client_zone.clone()),
                Tag::leaf("relVersion", self.rel_version.clone()),
                Tag::leaf("apiVersion", self.api_version.clone()),
                Tag::leaf("option", self.option.clone()),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<StartupPack> {
        validate(tag)?;
        Ok(StartupPack {
            irods_prot: tag.int_child("irodsProt")? as i32,
            connect_cnt: tag.int_child("connectCnt")? as i32,
            proxy_user: tag.str_child("proxyUser")?.to_string(),
            proxy_zone: tag.str_child("proxyRcatZone")?.to_string(),
            client_user: tag.str_child("clientUser")?.to_string(),
            client_zone: tag.str_child("clientRcatZone")?.to_string(),
            rel_version: tag.str_child("relVersion")?.to_string(),
            api_version: tag.str_child("apiVersion")?.to_string(),
            option: tag.str_child("option")?.to_string(),
        })
    }
}

/// Capability negotiation message, both directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsNeg {
    pub status: i32,
    pub result: String,
}

impl CsNeg {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "CS_NEG_PI",
            vec![
                Tag::int("status", i64::from(self.status)),
                Tag::leaf("result", self.result.clone()),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<CsNeg> {
        validate(tag)?;
        Ok(CsNeg {
            status: tag.int_child("status")? as i32,
            result: tag.str_child("result")?.to_string(),
        })
    }
}

/// Server version reply, ends the startup/auth sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub status: i32,
    pub rel_version: String,
    pub api_version: String,
}

impl Version {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "Version_PI",
            vec![
                Tag::int("status", i64::from(self.status)),
                Tag::leaf("relVersion", self.rel_version.clone()),
                Tag::leaf("apiVersion", self.api_version.clone()),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<Version> {
        validate(tag)?;
        Ok(Version {
            status: tag.int_child("status")? as i32,
            rel_version: tag.str_child("relVersion")?.to_string(),
            api_version: tag.str_child("apiVersion")?.to_string(),
        })
    }
}

/// Challenge bytes handed back for native authentication, hex-encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub challenge: String,
}

impl AuthChallenge {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "authRequestOut_PI",
            vec![Tag::leaf("challenge", self.challenge.clone())],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<AuthChallenge> {
        validate(tag)?;
        Ok(AuthChallenge {
            challenge: tag.str_child("challenge")?.to_string(),
        })
    }
}

/// Native auth response: digest plus `user#zone`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub response: String,
    pub username: String,
}

impl AuthResponse {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "authResponseInp_PI",
            vec![
                Tag::leaf("response", self.response.clone()),
                Tag::leaf("username", self.username.clone()),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<AuthResponse> {
        validate(tag)?;
        Ok(AuthResponse {
            response: tag.str_child("response")?.to_string(),
            username: tag.str_child("username")?.to_string(),
        })
    }
}

/// PAM login forwarded to the server over an encrypted channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamAuthRequest {
    pub user: String,
    pub password: String,
    pub ttl_seconds: i32,
}

impl PamAuthRequest {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "pamAuthRequestInp_PI",
            vec![
                Tag::leaf("pamUser", self.user.clone()),
                Tag::leaf("pamPassword", self.password.clone()),
                Tag::int("timeToLive", i64::from(self.ttl_seconds)),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<PamAuthRequest> {
        validate(tag)?;
        Ok(PamAuthRequest {
            user: tag.str_child("pamUser")?.to_string(),
            password: tag.str_child("pamPassword")?.to_string(),
            ttl_seconds: tag.int_child("timeToLive")? as i32,
        })
    }
}

/// Short-lived native password minted by PAM auth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamAuthResponse {
    pub generated_password: String,
}

impl PamAuthResponse {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "pamAuthRequestOut_PI",
            vec![Tag::leaf("irodsPamPassword", self.generated_password.clone())],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<PamAuthResponse> {
        validate(tag)?;
        Ok(PamAuthResponse {
            generated_password: tag.str_child("irodsPamPassword")?.to_string(),
        })
    }
}

/// SslStart / SslEnd carry a single reserved argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslToggle {
    pub arg: String,
}

impl SslToggle {
    pub fn to_tag(&self, end: bool) -> Tag {
        let name = if end { "sslEndInp_PI" } else { "sslStartInp_PI" };
        Tag::node(name, vec![Tag::leaf("arg0", self.arg.clone())])
    }

    pub fn from_tag(tag: &Tag) -> Result<SslToggle> {
        validate(tag)?;
        Ok(SslToggle {
            arg: tag.str_child("arg0")?.to_string(),
        })
    }
}

/// The workhorse input for data-object operations: open, create, put,
/// get, stat, replicate, and each half of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObjInp {
    pub obj_path: String,
    pub create_mode: i32,
    pub open_flags: i32,
    pub offset: i64,
    pub data_size: i64,
    pub num_threads: i32,
    pub opr_type: i32,
    pub cond_input: CondInput,
}

impl DataObjInp {
    pub fn at(path: impl Into<String>) -> DataObjInp {
        DataObjInp {
            obj_path: path.into(),
            create_mode: 0,
            open_flags: 0,
            offset: 0,
            data_size: 0,
            num_threads: 0,
            opr_type: opr::NO_OPR,
            cond_input: CondInput::new(),
        }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "DataObjInp_PI",
            vec![
                Tag::leaf("objPath", self.obj_path.clone()),
                Tag::int("createMode", i64::from(self.create_mode)),
                Tag::int("openFlags", i64::from(self.open_flags)),
                Tag::int("offset", self.offset),
                Tag::int("dataSize", self.data_size),
                Tag::int("numThreads", i64::from(self.num_threads)),
                Tag::int("oprType", i64::from(self.opr_type)),
                self.cond_input.to_tag(),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<DataObjInp> {
        validate(tag)?;
        let cond_input = match tag.child("KeyValPair_PI") {
            Some(kv) => CondInput::from_tag(kv)?,
            None => CondInput::new(),
        };
        Ok(DataObjInp {
            obj_path: tag.str_child("objPath")?.to_string(),
            create_mode: tag.int_child("createMode")? as i32,
            open_flags: tag.int_child("openFlags")? as i32,
            offset: tag.int_child("offset")?,
            data_size: tag.int_child("dataSize")?,
            num_threads: tag.int_child("numThreads")? as i32,
            opr_type: tag.int_child("oprType")? as i32,
            cond_input,
        })
    }
}

/// Input for operations on an already-open descriptor: read, write,
/// seek, close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedDataObjInp {
    pub fd: i32,
    pub len: i64,
    pub whence: i32,
    pub opr_type: i32,
    pub offset: i64,
    pub bytes_written: i64,
    pub cond_input: CondInput,
}

impl OpenedDataObjInp {
    pub fn for_fd(fd: i32) -> OpenedDataObjInp {
        OpenedDataObjInp {
            fd,
            len: 0,
            whence: whence::SEEK_SET,
            opr_type: opr::NO_OPR,
            offset: 0,
            bytes_written: 0,
            cond_input: CondInput::new(),
        }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "OpenedDataObjInp_PI",
            vec![
                Tag::int("l1descInx", i64::from(self.fd)),
                Tag::int("len", self.len),
                Tag::int("whence", i64::from(self.whence)),
                Tag::int("oprType", i64::from(self.opr_type)),
                Tag::int("offset", self.offset),
                Tag::int("bytesWritten", self.bytes_written),
                self.cond_input.to_tag(),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<OpenedDataObjInp> {
        validate(tag)?;
        let cond_input = match tag.child("KeyValPair_PI") {
            Some(kv) => CondInput::from_tag(kv)?,
            None => CondInput::new(),
        };
        Ok(OpenedDataObjInp {
            fd: tag.int_child("l1descInx")? as i32,
            len: tag.int_child("len")?,
            whence: tag.int_child("whence")? as i32,
            opr_type: tag.int_child("oprType")? as i32,
            offset: tag.int_child("offset")?,
            bytes_written: tag.int_child("bytesWritten")?,
            cond_input,
        })
    }
}

/// Copy and rename/move: a source half and a destination half
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObjCopyInp {
    pub src: DataObjInp,
    pub dst: DataObjInp,
}

impl DataObjCopyInp {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "DataObjCopyInp_PI",
            vec![self.src.to_tag(), self.dst.to_tag()],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<DataObjCopyInp> {
        validate(tag)?;
        let mut halves = tag.children_named("DataObjInp_PI");
        let src = halves
            .next()
            .ok_or_else(|| IrodsError::WireFormat("DataObjCopyInp_PI missing source half".into()))?;
        let dst = halves.next().ok_or_else(|| {
            IrodsError::WireFormat("DataObjCopyInp_PI missing destination half".into())
        })?;
        Ok(DataObjCopyInp {
            src: DataObjInp::from_tag(src)?,
            dst: DataObjInp::from_tag(dst)?,
        })
    }
}

/// Collection create / remove / list input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollInp {
    pub coll_name: String,
    pub flags: i32,
    pub opr_type: i32,
    pub cond_input: CondInput,
}

impl CollInp {
    pub fn at(path: impl Into<String>) -> CollInp {
        CollInp {
            coll_name: path.into(),
            flags: 0,
            opr_type: opr::NO_OPR,
            cond_input: CondInput::new(),
        }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "CollInp_PI",
            vec![
                Tag::leaf("collName", self.coll_name.clone()),
                Tag::int("flags", i64::from(self.flags)),
                Tag::int("oprType", i64::from(self.opr_type)),
                self.cond_input.to_tag(),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<CollInp> {
        validate(tag)?;
        let cond_input = match tag.child("KeyValPair_PI") {
            Some(kv) => CondInput::from_tag(kv)?,
            None => CondInput::new(),
        };
        Ok(CollInp {
            coll_name: tag.str_child("collName")?.to_string(),
            flags: tag.int_child("flags")? as i32,
            opr_type: tag.int_child("oprType")? as i32,
            cond_input,
        })
    }
}

/// Stat reply for a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RodsObjStat {
    pub obj_size: i64,
    pub obj_type: i32,
    pub create_time: i64,
    pub modify_time: i64,
    pub owner_name: String,
    pub owner_zone: String,
    pub resc_name: String,
}

impl RodsObjStat {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "RodsObjStat_PI",
            vec![
                Tag::int("objSize", self.obj_size),
                Tag::int("objType", i64::from(self.obj_type)),
                Tag::int("createTime", self.create_time),
                Tag::int("modifyTime", self.modify_time),
                Tag::leaf("ownerName", self.owner_name.clone()),
                Tag::leaf("ownerZone", self.owner_zone.clone()),
                Tag::leaf("rescName", self.resc_name.clone()),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<RodsObjStat> {
        validate(tag)?;
        Ok(RodsObjStat {
            obj_size: tag.int_child("objSize")?,
            obj_type: tag.int_child("objType")? as i32,
            create_time: tag.int_child("createTime")?,
            modify_time: tag.int_child("modifyTime")?,
            owner_name: tag.str_child("ownerName")?.to_string(),
            owner_zone: tag.str_child("ownerZone")?.to_string(),
            resc_name: tag
                .child("rescName")
                .and_then(|t| t.text())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// One child of a collection listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollEntry {
    pub obj_type: i32,
    pub name: String,
    pub data_size: i64,
    pub modify_time: i64,
}

impl CollEntry {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "CollEnt_PI",
            vec![
                Tag::int("objType", i64::from(self.obj_type)),
                Tag::leaf("entryName", self.name.clone()),
                Tag::int("dataSize", self.data_size),
                Tag::int("modifyTime", self.modify_time),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<CollEntry> {
        validate(tag)?;
        Ok(CollEntry {
            obj_type: tag.int_child("objType")? as i32,
            name: tag.str_child("entryName")?.to_string(),
            data_size: tag.int_child("dataSize")?,
            modify_time: tag.int_child("modifyTime")?,
        })
    }
}

/// Collection listing reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollEntList {
    pub entries: Vec<CollEntry>,
}

impl CollEntList {
    pub fn to_tag(&self) -> Tag {
        let mut kids = vec![Tag::int("rowCnt", self.entries.len() as i64)];
        kids.extend(self.entries.iter().map(CollEntry::to_tag));
        Tag::node("CollEntList_PI", kids)
    }

    pub fn from_tag(tag: &Tag) -> Result<CollEntList> {
        validate(tag)?;
        let row_cnt = tag.int_child("rowCnt")? as usize;
        let entries = tag
            .children_named("CollEnt_PI")
            .map(CollEntry::from_tag)
            .collect::<Result<Vec<_>>>()?;
        if entries.len() != row_cnt {
            return Err(IrodsError::WireFormat(format!(
                "CollEntList_PI rowCnt {} does not match {} entries",
                row_cnt,
                entries.len()
            )));
        }
        Ok(CollEntList { entries })
    }
}

/// One parallel endpoint handed out by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEndpoint {
    pub host: String,
    pub port: u16,
    pub cookie: i32,
}

impl PortalEndpoint {
    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "PortList_PI",
            vec![
                Tag::int("portNum", i64::from(self.port)),
                Tag::int("cookie", i64::from(self.cookie)),
                Tag::leaf("hostAddr", self.host.clone()),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<PortalEndpoint> {
        validate(tag)?;
        let port = tag.int_child("portNum")?;
        if !(1..=i64::from(u16::MAX)).contains(&port) {
            return Err(IrodsError::WireFormat(format!("bad portal port {}", port)));
        }
        Ok(PortalEndpoint {
            host: tag.str_child("hostAddr")?.to_string(),
            port: port as u16,
            cookie: tag.int_child("cookie")? as i32,
        })
    }
}

/// Reply to an open/put/get that routes bulk data through parallel
/// streams. An empty port list means the exchange stays in-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalOprOut {
    pub status: i32,
    pub l1desc_inx: i32,
    pub num_threads: i32,
    pub ports: Vec<PortalEndpoint>,
}

impl PortalOprOut {
    pub fn to_tag(&self) -> Tag {
        let mut kids = vec![
            Tag::int("status", i64::from(self.status)),
            Tag::int("l1descInx", i64::from(self.l1desc_inx)),
            Tag::int("numThreads", i64::from(self.num_threads)),
        ];
        kids.extend(self.ports.iter().map(PortalEndpoint::to_tag));
        Tag::node("PortalOprOut_PI", kids)
    }

    pub fn from_tag(tag: &Tag) -> Result<PortalOprOut> {
        validate(tag)?;
        Ok(PortalOprOut {
            status: tag.int_child("status")? as i32,
            l1desc_inx: tag.int_child("l1descInx")? as i32,
            num_threads: tag.int_child("numThreads")? as i32,
            ports: tag
                .children_named("PortList_PI")
                .map(PortalEndpoint::from_tag)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

/// Seek reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLseekOut {
    pub offset: i64,
}

impl FileLseekOut {
    pub fn to_tag(&self) -> Tag {
        Tag::node("fileLseekOut_PI", vec![Tag::int("offset", self.offset)])
    }

    pub fn from_tag(tag: &Tag) -> Result<FileLseekOut> {
        validate(tag)?;
        Ok(FileLseekOut {
            offset: tag.int_child("offset")?,
        })
    }
}

/// Bare integer body, used by OprComplete (descriptor index) and
/// EndTransaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntInfo {
    pub value: i32,
}

impl IntInfo {
    pub fn to_tag(&self) -> Tag {
        Tag::node("INT_PI", vec![Tag::int("myInt", i64::from(self.value))])
    }

    pub fn from_tag(tag: &Tag) -> Result<IntInfo> {
        validate(tag)?;
        Ok(IntInfo {
            value: tag.int_child("myInt")? as i32,
        })
    }
}

/// Bare string body, used by checksum replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrInfo {
    pub value: String,
}

impl StrInfo {
    pub fn to_tag(&self) -> Tag {
        Tag::node("STR_PI", vec![Tag::leaf("myStr", self.value.clone())])
    }

    pub fn from_tag(tag: &Tag) -> Result<StrInfo> {
        validate(tag)?;
        Ok(StrInfo {
            value: tag.str_child("myStr")?.to_string(),
        })
    }
}
