use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Default TCP port of the server's JSON-RPC control interface
pub const DEFAULT_CONTROL_PORT: u16 = 1705;

/// Client identifier (MAC address, optionally suffixed with `#<instance>`)
pub type ClientId = String;

/// Stream identifier
pub type StreamId = String;

/// Group identifier
pub type GroupId = String;

/// Resolved address of a control server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Volume of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Volume {
    /// Volume in percent, 0-100
    #[serde(default)]
    pub percent: u8,
    #[serde(default)]
    pub muted: bool,
}

impl Volume {
    /// Create a volume, clamping `percent` to 100
    pub fn new(percent: u8, muted: bool) -> Self {
        Self {
            percent: percent.min(100),
            muted,
        }
    }
}

/// Host descriptor reported by a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub ip: String,
}

/// Point in time as seconds + microseconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LastSeen {
    #[serde(default)]
    pub sec: i64,
    #[serde(default)]
    pub usec: i64,
}

/// Software running on a client device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClientSoftware {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: u32,
}

/// Server-side configuration of a client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub volume: Volume,
    /// Additional latency in milliseconds
    #[serde(default)]
    pub latency: i32,
    #[serde(default = "default_instance")]
    pub instance: u32,
}

fn default_instance() -> u32 {
    1
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            volume: Volume::default(),
            latency: 0,
            instance: default_instance(),
        }
    }
}

/// A playback device known to the server
///
/// Deserialization accepts both the nested schema (`host`, `snapclient`,
/// `config` objects) and the legacy flat one (`MAC`, `IP`, `name`,
/// `volume`, ... at the top level).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireClient")]
pub struct Client {
    pub id: ClientId,
    pub host: Host,
    pub snapclient: ClientSoftware,
    pub config: ClientConfig,
    #[serde(rename = "lastSeen")]
    pub last_seen: LastSeen,
    pub connected: bool,
    /// Stream the client itself reports (legacy schema); grouped servers
    /// carry the stream on the group instead
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    /// Set locally when the server reported the client as deleted
    #[serde(skip)]
    pub deleted: bool,
}

impl Client {
    /// Name to show to users: configured name, falling back to the host name
    pub fn visible_name(&self) -> &str {
        if self.config.name.is_empty() {
            &self.host.name
        } else {
            &self.config.name
        }
    }

    pub fn mac(&self) -> &str {
        &self.host.mac
    }

    pub fn volume(&self) -> Volume {
        self.config.volume
    }

    /// Display ordering key
    pub fn sort_key(&self) -> (String, String) {
        (self.visible_name().to_lowercase(), self.id.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HostField {
    Detailed(Host),
    Name(String),
}

impl HostField {
    fn into_host(field: Option<HostField>) -> Host {
        match field {
            Some(HostField::Detailed(host)) => host,
            Some(HostField::Name(name)) => Host {
                name,
                ..Host::default()
            },
            None => Host::default(),
        }
    }
}

#[derive(Deserialize)]
struct WireClient {
    id: Option<String>,
    host: Option<HostField>,
    #[serde(rename = "MAC")]
    mac: Option<String>,
    #[serde(rename = "IP")]
    ip: Option<String>,
    snapclient: Option<ClientSoftware>,
    version: Option<String>,
    config: Option<ClientConfig>,
    name: Option<String>,
    volume: Option<Volume>,
    latency: Option<i32>,
    #[serde(alias = "stream_id")]
    stream: Option<String>,
    #[serde(rename = "lastSeen", default)]
    last_seen: LastSeen,
    #[serde(default)]
    connected: bool,
}

impl TryFrom<WireClient> for Client {
    type Error = String;

    fn try_from(wire: WireClient) -> std::result::Result<Self, Self::Error> {
        let WireClient {
            id,
            host,
            mac,
            ip,
            snapclient,
            version,
            config,
            name,
            volume,
            latency,
            stream,
            last_seen,
            connected,
        } = wire;

        let mut host = HostField::into_host(host);
        if let Some(mac) = mac.filter(|_| host.mac.is_empty()) {
            host.mac = mac;
        }
        if let Some(ip) = ip.filter(|_| host.ip.is_empty()) {
            host.ip = ip;
        }

        let id = id
            .filter(|id| !id.is_empty())
            .or_else(|| (!host.mac.is_empty()).then(|| host.mac.clone()))
            .ok_or_else(|| "client has neither `id` nor MAC address".to_string())?;

        let snapclient = snapclient.unwrap_or_else(|| ClientSoftware {
            version: version.unwrap_or_default(),
            ..ClientSoftware::default()
        });

        let config = config.unwrap_or_else(|| ClientConfig {
            name: name.unwrap_or_default(),
            volume: volume.unwrap_or_default(),
            latency: latency.unwrap_or_default(),
            ..ClientConfig::default()
        });

        Ok(Client {
            id,
            host,
            snapclient,
            config,
            last_seen,
            connected,
            stream_id: stream,
            deleted: false,
        })
    }
}

/// Playback state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Playing,
    Disabled,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Parsed source URI of a stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StreamUri {
    #[serde(default, alias = "uri")]
    pub raw: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub fragment: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

/// An audio source on the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireStream")]
pub struct Stream {
    pub id: StreamId,
    pub uri: StreamUri,
    pub status: StreamStatus,
}

impl Stream {
    /// Display name from the `name` query parameter, falling back to the id
    pub fn name(&self) -> &str {
        self.uri
            .query
            .get("name")
            .map(String::as_str)
            .unwrap_or(&self.id)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UriField {
    Parts(StreamUri),
    Raw(String),
}

#[derive(Deserialize)]
struct WireStream {
    id: String,
    #[serde(default)]
    status: StreamStatus,
    uri: Option<UriField>,
    #[serde(default)]
    scheme: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    fragment: String,
    #[serde(default)]
    query: BTreeMap<String, String>,
}

impl From<WireStream> for Stream {
    fn from(wire: WireStream) -> Self {
        let uri = match wire.uri {
            Some(UriField::Parts(uri)) => uri,
            raw => StreamUri {
                raw: match raw {
                    Some(UriField::Raw(raw)) => raw,
                    _ => String::new(),
                },
                scheme: wire.scheme,
                host: wire.host,
                path: wire.path,
                fragment: wire.fragment,
                query: wire.query,
            },
        };

        Stream {
            id: wire.id,
            uri,
            status: wire.status,
        }
    }
}

/// A set of clients playing the same stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "stream", default)]
    pub stream_id: StreamId,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub clients: Vec<Client>,
}

impl Group {
    /// Wrap a client from a flat (legacy) status in a group of its own
    pub fn for_legacy_client(client: Client) -> Self {
        Self {
            id: client.id.clone(),
            name: String::new(),
            stream_id: client.stream_id.clone().unwrap_or_default(),
            muted: false,
            clients: vec![client],
        }
    }

    pub fn client(&self, id: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Sort members by their display key
    pub fn sort_clients(&mut self) {
        self.clients.sort_by_key(Client::sort_key);
    }

    /// Display ordering key: that of the first member, `None` when empty
    pub fn sort_key(&self) -> Option<(String, String)> {
        self.clients.first().map(Client::sort_key)
    }
}

/// Software running on the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ServerSoftware {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: u32,
    #[serde(rename = "controlProtocolVersion", default)]
    pub control_protocol_version: u32,
}

/// Server metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "WireServer")]
pub struct Server {
    pub host: Host,
    pub snapserver: ServerSoftware,
}

#[derive(Deserialize)]
struct WireServer {
    host: Option<HostField>,
    snapserver: Option<ServerSoftware>,
    version: Option<String>,
}

impl From<WireServer> for Server {
    fn from(wire: WireServer) -> Self {
        Server {
            host: HostField::into_host(wire.host),
            snapserver: wire.snapserver.unwrap_or_else(|| ServerSoftware {
                version: wire.version.unwrap_or_default(),
                ..ServerSoftware::default()
            }),
        }
    }
}

/// Result of `Server.GetRPCVersion`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RpcVersion {
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    #[serde(default)]
    pub patch: u32,
}

/// Schema generation spoken by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Flat client list, clients carry their own stream
    Legacy,
    /// Clients nested in groups, groups carry the stream
    #[default]
    Grouped,
}

impl From<RpcVersion> for ProtocolVersion {
    fn from(version: RpcVersion) -> Self {
        if version.major >= 2 {
            ProtocolVersion::Grouped
        } else {
            ProtocolVersion::Legacy
        }
    }
}

/// Complete server state as reported by `Server.GetStatus`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ServerStatus {
    pub server: Option<Server>,
    pub streams: Vec<Stream>,
    pub groups: Vec<Group>,
    pub protocol: ProtocolVersion,
    /// True while the connection this state came from is gone
    pub stale: bool,
}

#[derive(Deserialize)]
struct WireStatus {
    server: Option<Server>,
    #[serde(default)]
    streams: Vec<Stream>,
    groups: Option<Vec<Group>>,
    clients: Option<Vec<Client>>,
}

impl ServerStatus {
    /// Parse the `result` of `Server.GetStatus` (or the payload of
    /// `Server.OnUpdate`) in any of the schemas the server may speak
    pub fn from_result(value: Value) -> serde_json::Result<Self> {
        // Newer servers wrap everything in a top-level `server` object
        let value = match value {
            Value::Object(mut obj)
                if obj
                    .get("server")
                    .is_some_and(|server| server.get("groups").is_some()) =>
            {
                obj.remove("server").unwrap_or_default()
            }
            other => other,
        };

        let wire: WireStatus = serde_json::from_value(value)?;
        let (groups, protocol) = match (wire.groups, wire.clients) {
            (Some(groups), _) => (groups, ProtocolVersion::Grouped),
            (None, Some(clients)) => (
                clients.into_iter().map(Group::for_legacy_client).collect(),
                ProtocolVersion::Legacy,
            ),
            (None, None) => (Vec::new(), ProtocolVersion::Grouped),
        };

        let mut status = ServerStatus {
            server: wire.server,
            streams: wire.streams,
            groups,
            protocol,
            stale: false,
        };
        status.sort();
        Ok(status)
    }

    /// Restore display order: members within groups, then groups by their
    /// first member (empty groups first)
    pub fn sort(&mut self) {
        for group in &mut self.groups {
            group.sort_clients();
        }
        self.groups.sort_by_key(Group::sort_key);
    }

    /// All clients that have not been deleted, in display order
    pub fn clients(&self) -> impl Iterator<Item = &Client> + '_ {
        self.groups
            .iter()
            .flat_map(|group| group.clients.iter())
            .filter(|client| !client.deleted)
    }

    /// Look up a client by id, including deleted ones
    pub fn client(&self, id: &str) -> Option<&Client> {
        self.groups.iter().find_map(|group| group.client(id))
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|group| group.id == id)
    }

    /// Group containing the given client
    pub fn group_of_client(&self, client_id: &str) -> Option<&Group> {
        self.groups
            .iter()
            .find(|group| group.client(client_id).is_some())
    }

    pub fn stream(&self, id: &str) -> Option<&Stream> {
        self.streams.iter().find(|stream| stream.id == id)
    }

    /// Stream a client is playing: its own, or else its group's
    pub fn client_stream_id(&self, client_id: &str) -> Option<&str> {
        let group = self.group_of_client(client_id)?;
        group
            .client(client_id)
            .and_then(|client| client.stream_id.as_deref())
            .or(Some(group.stream_id.as_str()))
            .filter(|id| !id.is_empty())
    }
}
