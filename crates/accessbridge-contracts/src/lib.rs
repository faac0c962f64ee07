use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type PluginDataMap = BTreeMap<String, String>;

pub const RESOURCE_KIND_ACCESS_REQUEST: &str = "access_request";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Approved,
    Denied,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Approved => "approved",
            RequestState::Denied => "denied",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Review {
    pub author: String,
    pub proposed_state: RequestState,
    #[serde(default)]
    pub reason: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRequest {
    pub id: String,
    pub user: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub created: DateTime<Utc>,
    pub state: RequestState,
    #[serde(default)]
    pub request_reason: String,
    #[serde(default)]
    pub resolve_reason: String,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    Init,
    Put { resource: AccessRequest },
    Delete { request_id: String },
}

impl WatchEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WatchEvent::Init => None,
            WatchEvent::Put { resource } => Some(resource.id.as_str()),
            WatchEvent::Delete { request_id } => Some(request_id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchFilter {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RequestState>,
}

impl WatchFilter {
    pub fn pending_requests() -> Self {
        Self {
            kind: RESOURCE_KIND_ACCESS_REQUEST.to_string(),
            state: Some(RequestState::Pending),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResolutionTag {
    #[default]
    Unresolved,
    Approved,
    Denied,
    Expired,
}

impl ResolutionTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionTag::Unresolved => "",
            ResolutionTag::Approved => "approved",
            ResolutionTag::Denied => "denied",
            ResolutionTag::Expired => "expired",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "approved" => ResolutionTag::Approved,
            "denied" => ResolutionTag::Denied,
            "expired" => ResolutionTag::Expired,
            _ => ResolutionTag::Unresolved,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub tag: ResolutionTag,
    pub reason: String,
}

impl Resolution {
    pub fn new(tag: ResolutionTag, reason: impl Into<String>) -> Self {
        Self {
            tag,
            reason: reason.into(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tag != ResolutionTag::Unresolved
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestData {
    pub user: String,
    pub roles: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub request_reason: String,
    pub reviews_count: usize,
    pub resolution: Resolution,
}

impl RequestData {
    pub fn from_request(req: &AccessRequest) -> Self {
        Self {
            user: req.user.clone(),
            roles: req.roles.clone(),
            created: DateTime::from_timestamp(req.created.timestamp(), 0),
            request_reason: req.request_reason.clone(),
            reviews_count: 0,
            resolution: Resolution::default(),
        }
    }
}

// The zero value must encode to no entries at all.
pub trait TicketIdentity:
    Clone + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    fn encode_into(&self, map: &mut PluginDataMap);
    fn decode_from(map: &PluginDataMap) -> Self;
    fn is_set(&self) -> bool;
    fn index_key(&self) -> String;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginData<T> {
    pub request: RequestData,
    pub ticket: T,
}

const KEY_USER: &str = "user";
const KEY_ROLES: &str = "roles";
const KEY_CREATED: &str = "created";
const KEY_REQUEST_REASON: &str = "request_reason";
const KEY_REVIEWS_COUNT: &str = "reviews_count";
const KEY_RESOLUTION: &str = "resolution";
const KEY_RESOLVE_REASON: &str = "resolve_reason";

impl<T: TicketIdentity> PluginData<T> {
    pub fn encode(&self) -> PluginDataMap {
        let mut map = PluginDataMap::new();
        let req = &self.request;
        put_str(&mut map, KEY_USER, &req.user);
        // Elements must not contain commas; nothing escapes them.
        put_str(&mut map, KEY_ROLES, &req.roles.join(","));
        if let Some(created) = req.created {
            map.insert(KEY_CREATED.to_string(), created.timestamp().to_string());
        }
        put_str(&mut map, KEY_REQUEST_REASON, &req.request_reason);
        put_u64(&mut map, KEY_REVIEWS_COUNT, req.reviews_count as u64);
        put_str(&mut map, KEY_RESOLUTION, req.resolution.tag.as_str());
        put_str(&mut map, KEY_RESOLVE_REASON, &req.resolution.reason);
        self.ticket.encode_into(&mut map);
        map
    }

    pub fn decode(map: &PluginDataMap) -> Self {
        let roles = map
            .get(KEY_ROLES)
            .filter(|v| !v.is_empty())
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        let created = map
            .get(KEY_CREATED)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        Self {
            request: RequestData {
                user: get_str(map, KEY_USER),
                roles,
                created,
                request_reason: get_str(map, KEY_REQUEST_REASON),
                reviews_count: get_u64(map, KEY_REVIEWS_COUNT) as usize,
                resolution: Resolution {
                    tag: ResolutionTag::parse(&get_str(map, KEY_RESOLUTION)),
                    reason: get_str(map, KEY_RESOLVE_REASON),
                },
            },
            ticket: T::decode_from(map),
        }
    }
}

pub fn put_str(map: &mut PluginDataMap, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_string(), value.to_string());
    }
}

pub fn put_u64(map: &mut PluginDataMap, key: &str, value: u64) {
    if value != 0 {
        map.insert(key.to_string(), value.to_string());
    }
}

pub fn get_str(map: &PluginDataMap, key: &str) -> String {
    map.get(key).cloned().unwrap_or_default()
}

pub fn get_u64(map: &PluginDataMap, key: &str) -> u64 {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTicket {
    pub issue_id: u64,
    pub issue_iid: u64,
    pub project_id: u64,
}

impl TicketIdentity for IssueTicket {
    fn encode_into(&self, map: &mut PluginDataMap) {
        put_u64(map, "issue_id", self.issue_id);
        put_u64(map, "issue_iid", self.issue_iid);
        put_u64(map, "project_id", self.project_id);
    }

    fn decode_from(map: &PluginDataMap) -> Self {
        Self {
            issue_id: get_u64(map, "issue_id"),
            issue_iid: get_u64(map, "issue_iid"),
            project_id: get_u64(map, "project_id"),
        }
    }

    fn is_set(&self) -> bool {
        self.issue_id != 0
    }

    fn index_key(&self) -> String {
        self.issue_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundActionKind {
    Approve,
    Deny,
    ResolveCustom(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl ActorIdentity {
    pub fn display(&self) -> &str {
        if self.email.is_empty() {
            &self.name
        } else {
            &self.email
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAction<T> {
    pub kind: InboundActionKind,
    pub ticket: T,
    pub actor: ActorIdentity,
    pub reason: String,
}
