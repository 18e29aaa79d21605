use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Protocol version sent during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// RPC commands understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Handshake,
    Auth,
    Event,
    ForceLeave,
    Join,
    Members,
    MembersFiltered,
    Tags,
    Stream,
    Monitor,
    Stop,
    Leave,
    Query,
    Respond,
    InstallKey,
    UseKey,
    RemoveKey,
    ListKeys,
    Stats,
}

impl Command {
    const ALL: [Command; 19] = [
        Command::Handshake,
        Command::Auth,
        Command::Event,
        Command::ForceLeave,
        Command::Join,
        Command::Members,
        Command::MembersFiltered,
        Command::Tags,
        Command::Stream,
        Command::Monitor,
        Command::Stop,
        Command::Leave,
        Command::Query,
        Command::Respond,
        Command::InstallKey,
        Command::UseKey,
        Command::RemoveKey,
        Command::ListKeys,
        Command::Stats,
    ];

    /// Hyphenated wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Handshake => "handshake",
            Command::Auth => "auth",
            Command::Event => "event",
            Command::ForceLeave => "force-leave",
            Command::Join => "join",
            Command::Members => "members",
            Command::MembersFiltered => "members-filtered",
            Command::Tags => "tags",
            Command::Stream => "stream",
            Command::Monitor => "monitor",
            Command::Stop => "stop",
            Command::Leave => "leave",
            Command::Query => "query",
            Command::Respond => "respond",
            Command::InstallKey => "install-key",
            Command::UseKey => "use-key",
            Command::RemoveKey => "remove-key",
            Command::ListKeys => "list-keys",
            Command::Stats => "stats",
        }
    }

    /// Whether the agent follows this command's reply header with a body.
    pub fn reply_has_body(self) -> bool {
        matches!(
            self,
            Command::Join
                | Command::Members
                | Command::MembersFiltered
                | Command::InstallKey
                | Command::UseKey
                | Command::RemoveKey
                | Command::ListKeys
                | Command::Stats
        )
    }

    /// Whether the client sends a body after this command's request header.
    pub fn request_has_body(self) -> bool {
        !matches!(
            self,
            Command::Members | Command::Leave | Command::ListKeys | Command::Stats
        )
    }

    /// Commands whose acknowledgement is followed by pushed records.
    pub fn is_streaming(self) -> bool {
        matches!(self, Command::Stream | Command::Monitor | Command::Query)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses either the wire name (`force-leave`) or the identifier form
/// (`force_leave`).
impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wire = wire_name(s);
        Command::ALL
            .into_iter()
            .find(|command| command.as_str() == wire)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Error returned when a command name is not part of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rpc command: {0}")]
pub struct UnknownCommand(pub String);

/// Translates an internal identifier into its wire form.
pub fn wire_name(identifier: &str) -> String {
    identifier.trim().to_ascii_lowercase().replace('_', "-")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestHeader {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Seq")]
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl ResponseHeader {
    /// True when the agent reported an error for this sequence.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRequest {
    pub auth_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct EventRequest {
    pub name: String,
    #[serde(with = "serde_bytes", default)]
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ForceLeaveRequest {
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRequest {
    pub existing: Vec<String>,
    pub replay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    /// Number of nodes successfully contacted.
    pub num: i32,
}

/// Filter for `members-filtered`. Tag values and the name are matched by the
/// agent as anchored regular expressions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MembersFilter {
    pub tags: BTreeMap<String, String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MembersFilter {
    /// Filter on tags, restricted to `alive` members.
    pub fn tags<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tags: tags
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            status: "alive".to_string(),
            name: None,
        }
    }

    /// Matches members in `status` instead of `alive`.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Restricts the match to the member called `name`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Default for MembersFilter {
    fn default() -> Self {
        Self::tags(std::iter::empty::<(String, String)>())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MembersResponse {
    pub members: Vec<Member>,
}

/// A cluster member as reported by `members` and membership events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Member {
    pub name: String,
    #[serde(with = "serde_bytes", default)]
    pub addr: Vec<u8>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub status: String,
    #[serde(default)]
    pub protocol_min: u8,
    #[serde(default)]
    pub protocol_max: u8,
    #[serde(default)]
    pub protocol_cur: u8,
    #[serde(default)]
    pub delegate_min: u8,
    #[serde(default)]
    pub delegate_max: u8,
    #[serde(default)]
    pub delegate_cur: u8,
}

impl Member {
    /// Decodes the raw 4- or 16-byte address.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self.addr.len() {
            4 => {
                let octets: [u8; 4] = self.addr.as_slice().try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let octets: [u8; 16] = self.addr.as_slice().try_into().ok()?;
                let v6 = Ipv6Addr::from(octets);
                Some(match v6.to_ipv4_mapped() {
                    Some(v4) => IpAddr::V4(v4),
                    None => IpAddr::V6(v6),
                })
            }
            _ => None,
        }
    }

    /// True while the member's status is `alive`.
    pub fn is_alive(&self) -> bool {
        self.status == "alive"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TagsRequest {
    pub tags: BTreeMap<String, String>,
    pub delete_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct StreamRequest {
    #[serde(rename = "Type")]
    pub event_types: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorRequest {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct StopRequest {
    pub stop: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct QueryRequest {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub filter_nodes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub filter_tags: BTreeMap<String, String>,
    pub request_ack: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_factor: Option<u8>,
    /// Query timeout in nanoseconds; zero lets the agent pick its default.
    pub timeout: u64,
    pub name: String,
    #[serde(with = "serde_bytes", default)]
    pub payload: Vec<u8>,
}

impl QueryRequest {
    /// Query `name` carrying `payload`, with the agent's default timeout.
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Only these nodes receive the query.
    pub fn with_filter_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Only nodes whose tag `key` matches `value` receive it.
    pub fn with_filter_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter_tags.insert(key.into(), value.into());
        self
    }

    /// Asks every receiving node for an `ack` record.
    pub fn with_request_ack(mut self, request_ack: bool) -> Self {
        self.request_ack = request_ack;
        self
    }

    /// Number of extra nodes that relay each response.
    pub fn with_relay_factor(mut self, relay_factor: u8) -> Self {
        self.relay_factor = Some(relay_factor);
        self
    }

    /// How long the agent collects responses. Sent as nanoseconds.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RespondRequest {
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(with = "serde_bytes", default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct KeyRequest {
    pub key: String,
}

/// Reply to the key management commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct KeyResponse {
    #[serde(default)]
    pub messages: BTreeMap<String, String>,
    /// Installed keys and how many nodes hold each one (`list-keys` only).
    #[serde(default)]
    pub keys: BTreeMap<String, u32>,
    #[serde(default)]
    pub num_nodes: u32,
    #[serde(default)]
    pub num_err: u32,
    #[serde(default)]
    pub num_resp: u32,
}

/// Record pushed on a `stream` subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "Event")]
pub enum StreamEvent {
    #[serde(rename = "user")]
    User {
        #[serde(rename = "LTime", default)]
        ltime: u64,
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Payload", with = "serde_bytes", default)]
        payload: Vec<u8>,
        #[serde(rename = "Coalesce", default)]
        coalesce: bool,
    },
    #[serde(rename = "query")]
    Query {
        #[serde(rename = "ID")]
        id: u32,
        #[serde(rename = "LTime", default)]
        ltime: u64,
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Payload", with = "serde_bytes", default)]
        payload: Vec<u8>,
    },
    #[serde(rename = "member-join")]
    MemberJoin {
        #[serde(rename = "Members")]
        members: Vec<Member>,
    },
    #[serde(rename = "member-leave")]
    MemberLeave {
        #[serde(rename = "Members")]
        members: Vec<Member>,
    },
    #[serde(rename = "member-failed")]
    MemberFailed {
        #[serde(rename = "Members")]
        members: Vec<Member>,
    },
    #[serde(rename = "member-update")]
    MemberUpdate {
        #[serde(rename = "Members")]
        members: Vec<Member>,
    },
    #[serde(rename = "member-reap")]
    MemberReap {
        #[serde(rename = "Members")]
        members: Vec<Member>,
    },
    #[serde(other)]
    Unknown,
}

/// Record pushed on a `monitor` subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct LogRecord {
    pub log: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryRecordType {
    Ack,
    Response,
    Done,
}

/// Record pushed while a `query` is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct QueryRecord {
    #[serde(rename = "Type")]
    pub kind: QueryRecordType,
    #[serde(default)]
    pub from: String,
    #[serde(with = "serde_bytes", default)]
    pub payload: Vec<u8>,
}

/// Query record discriminator that ends a query.
pub(crate) const QUERY_DONE: &str = "done";

/// Whether a raw query body is the terminal `done` record.
pub(crate) fn is_query_done(body: &Value) -> bool {
    body.as_map()
        .map(|entries| {
            entries.iter().any(|(key, value)| {
                key.as_str() == Some("Type") && value.as_str() == Some(QUERY_DONE)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_names_are_hyphenated() {
        assert_eq!(Command::ForceLeave.as_str(), "force-leave");
        assert_eq!(Command::MembersFiltered.to_string(), "members-filtered");
        assert_eq!(wire_name("install_key"), "install-key");
    }

    #[test]
    fn command_parses_identifier_and_wire_forms() {
        assert_eq!("force_leave".parse::<Command>(), Ok(Command::ForceLeave));
        assert_eq!("members-filtered".parse::<Command>(), Ok(Command::MembersFiltered));
        assert!("response".parse::<Command>().is_err());
    }

    #[test]
    fn reply_shape_table_matches_agent() {
        let with_body: Vec<_> = Command::ALL
            .into_iter()
            .filter(|command| command.reply_has_body())
            .collect();
        assert_eq!(
            with_body,
            vec![
                Command::Join,
                Command::Members,
                Command::MembersFiltered,
                Command::InstallKey,
                Command::UseKey,
                Command::RemoveKey,
                Command::ListKeys,
                Command::Stats,
            ]
        );
        assert!(!Command::Stream.reply_has_body());
        assert!(!Command::Stop.reply_has_body());
    }

    #[test]
    fn member_decodes_ipv4_and_mapped_addresses() {
        let mut member = Member {
            name: "node_0".to_string(),
            addr: vec![127, 0, 0, 1],
            port: 7946,
            tags: BTreeMap::new(),
            status: "alive".to_string(),
            protocol_min: 1,
            protocol_max: 5,
            protocol_cur: 4,
            delegate_min: 2,
            delegate_max: 5,
            delegate_cur: 4,
        };
        assert_eq!(member.ip_addr(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        member.addr = Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped().octets().to_vec();
        assert_eq!(member.ip_addr(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));

        member.addr = vec![1, 2, 3];
        assert_eq!(member.ip_addr(), None);
    }

    #[test]
    fn query_done_detection_reads_type_field() {
        let done = Value::Map(vec![
            (Value::from("Type"), Value::from("done")),
            (Value::from("From"), Value::from("")),
        ]);
        let response = Value::Map(vec![(Value::from("Type"), Value::from("response"))]);
        assert!(is_query_done(&done));
        assert!(!is_query_done(&response));
        assert!(!is_query_done(&Value::Nil));
    }

    #[test]
    fn query_timeout_is_encoded_in_nanoseconds() {
        let request = QueryRequest::new("uptime", "")
            .with_timeout(std::time::Duration::from_millis(1500))
            .with_filter_tag("role", "web");
        assert_eq!(request.timeout, 1_500_000_000);
        assert_eq!(request.filter_tags.get("role").map(String::as_str), Some("web"));
    }
}
