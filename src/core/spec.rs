//! Turns directive records into the connections a machine should have.
//!
//! One [RawDirectiveRecord] expands into one [DesiredConnectionSpec] per listed protocol. Each
//! spec carries everything the broker needs to create the connection, with the connection name
//! rendered from a template (see [render_template]).

use crate::core::directive::{
    RawDirectiveRecord, CONNECTION_NAME, PORT, PROTOCOLS, USERNAME, WAKE_DISABLED, WAKE_SETTINGS,
};
use crate::core::machine::{MachineId, MachineRecord};
use crate::crypto::{SecretCodec, SecretError, SecretField};
use crate::network::{MacAddress, MachineLocation};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// The connection name template used when neither the record nor the annotation sets one.
pub const DEFAULT_TEMPLATE: &str = "{vmname}-{user}-{proto}";

/// What `{ip}` expands to when a machine's address is unknown.
pub const UNRESOLVED_IP: &str = "<unresolved>";

/// Remote access protocols the broker supports.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rdp,
    Vnc,
    Ssh,
}

impl Protocol {
    /// The registered port for the protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Rdp => 3389,
            Protocol::Vnc => 5900,
            Protocol::Ssh => 22,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Rdp => "rdp",
            Protocol::Vnc => "vnc",
            Protocol::Ssh => "ssh",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rdp" => Ok(Protocol::Rdp),
            "vnc" => Ok(Protocol::Vnc),
            "ssh" => Ok(Protocol::Ssh),
            other => Err(format!("unsupported protocol: {other}")),
        }
    }
}

/// Parses the boolean spellings accepted in directives.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes",
    )
}

fn bool_str(value: bool) -> String {
    value.to_string()
}

// Splits `key=value,key=value`. Entries without `=` are ignored.
fn split_settings(raw: &str) -> IndexMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// RDP display and security settings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RdpSettings {
    pub security: String,
    pub ignore_cert: bool,
    pub resize_method: String,
    pub color_depth: Option<u8>,
    /// `enable-*` switches, in the order the broker expects them.
    pub features: IndexMap<String, bool>,
    pub extra: IndexMap<String, String>,
}

impl Default for RdpSettings {
    fn default() -> Self {
        let features = [
            "enable-wallpaper",
            "enable-theming",
            "enable-font-smoothing",
            "enable-full-window-drag",
            "enable-desktop-composition",
            "enable-menu-animations",
        ]
        .into_iter()
        .map(|k| (k.to_string(), true))
        .collect();

        Self {
            security: "any".to_string(),
            ignore_cert: true,
            resize_method: "display-update".to_string(),
            color_depth: None,
            features,
            extra: IndexMap::new(),
        }
    }
}

/// VNC display and clipboard settings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VncSettings {
    pub color_depth: u8,
    pub encoding: String,
    pub cursor: String,
    pub read_only: bool,
    pub swap_red_blue: bool,
    pub autoretry: u32,
    /// `enable-*` and `disable-*` switches.
    pub switches: IndexMap<String, bool>,
    pub extra: IndexMap<String, String>,
}

impl Default for VncSettings {
    fn default() -> Self {
        let switches = ["enable-sftp", "disable-copy", "disable-paste"]
            .into_iter()
            .map(|k| (k.to_string(), false))
            .collect();

        Self {
            color_depth: 32,
            encoding: "tight".to_string(),
            cursor: "local".to_string(),
            read_only: false,
            swap_red_blue: false,
            autoretry: 5,
            switches,
            extra: IndexMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SshSettings {
    pub font_size: Option<u8>,
    pub color_scheme: Option<String>,
    pub extra: IndexMap<String, String>,
}

/// Protocol-specific settings. Keys the typed fields don't cover land in `extra` and are passed to
/// the broker untouched.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolSettings {
    Rdp(RdpSettings),
    Vnc(VncSettings),
    Ssh(SshSettings),
}

impl ProtocolSettings {
    /// Builds settings for `protocol` from a `key=value,...` string, starting from the defaults.
    ///
    /// Values that fail to parse for a typed field are reported in the returned warnings and the
    /// default is kept.
    pub fn parse(protocol: Protocol, raw: Option<&str>) -> (Self, Vec<String>) {
        let pairs = raw.map(split_settings).unwrap_or_default();
        let mut warnings = Vec::new();
        let mut bad = |key: &str, value: &str| {
            warnings.push(format!("ignoring {protocol} setting {key}={value}"));
        };

        let settings = match protocol {
            Protocol::Rdp => {
                let mut s = RdpSettings::default();
                for (key, value) in pairs {
                    match key.as_str() {
                        "security" => s.security = value,
                        "ignore-cert" => s.ignore_cert = parse_bool(&value),
                        "resize-method" => s.resize_method = value,
                        "color-depth" => match value.parse() {
                            Ok(depth) => s.color_depth = Some(depth),
                            Err(_) => bad(&key, &value),
                        },
                        k if k.starts_with("enable-") => {
                            s.features.insert(key.clone(), parse_bool(&value));
                        }
                        _ => {
                            s.extra.insert(key, value);
                        }
                    }
                }
                ProtocolSettings::Rdp(s)
            }
            Protocol::Vnc => {
                let mut s = VncSettings::default();
                for (key, value) in pairs {
                    match key.as_str() {
                        "color-depth" => match value.parse() {
                            Ok(depth) => s.color_depth = depth,
                            Err(_) => bad(&key, &value),
                        },
                        "encoding" => s.encoding = value,
                        "cursor" => s.cursor = value,
                        "read-only" => s.read_only = parse_bool(&value),
                        "swap-red-blue" => s.swap_red_blue = parse_bool(&value),
                        "autoretry" => match value.parse() {
                            Ok(n) => s.autoretry = n,
                            Err(_) => bad(&key, &value),
                        },
                        k if k.starts_with("enable-") || k.starts_with("disable-") => {
                            s.switches.insert(key.clone(), parse_bool(&value));
                        }
                        _ => {
                            s.extra.insert(key, value);
                        }
                    }
                }
                ProtocolSettings::Vnc(s)
            }
            Protocol::Ssh => {
                let mut s = SshSettings::default();
                for (key, value) in pairs {
                    match key.as_str() {
                        "font-size" => match value.parse() {
                            Ok(size) => s.font_size = Some(size),
                            Err(_) => bad(&key, &value),
                        },
                        "color-scheme" => s.color_scheme = Some(value),
                        _ => {
                            s.extra.insert(key, value);
                        }
                    }
                }
                ProtocolSettings::Ssh(s)
            }
        };
        (settings, warnings)
    }

    /// Renders the settings as broker connection parameters.
    pub fn to_parameters(&self) -> IndexMap<String, String> {
        let mut params = IndexMap::new();
        let mut put = |k: &str, v: String| {
            params.insert(k.to_string(), v);
        };
        match self {
            ProtocolSettings::Rdp(s) => {
                put("security", s.security.clone());
                put("ignore-cert", bool_str(s.ignore_cert));
                for (k, v) in s.features.iter() {
                    put(k, bool_str(*v));
                }
                put("resize-method", s.resize_method.clone());
                if let Some(depth) = s.color_depth {
                    put("color-depth", depth.to_string());
                }
                for (k, v) in s.extra.iter() {
                    put(k, v.clone());
                }
            }
            ProtocolSettings::Vnc(s) => {
                put("color-depth", s.color_depth.to_string());
                put("swap-red-blue", bool_str(s.swap_red_blue));
                put("cursor", s.cursor.clone());
                put("encoding", s.encoding.clone());
                for (k, v) in s.switches.iter() {
                    put(k, bool_str(*v));
                }
                put("autoretry", s.autoretry.to_string());
                put("read-only", bool_str(s.read_only));
                for (k, v) in s.extra.iter() {
                    put(k, v.clone());
                }
            }
            ProtocolSettings::Ssh(s) => {
                if let Some(size) = s.font_size {
                    put("font-size", size.to_string());
                }
                if let Some(scheme) = &s.color_scheme {
                    put("color-scheme", scheme.clone());
                }
                for (k, v) in s.extra.iter() {
                    put(k, v.clone());
                }
            }
        }
        params
    }
}

/// Values available to a connection name template.
#[derive(Clone, Debug, Default)]
pub struct Placeholders {
    pub vmname: String,
    pub user: String,
    pub password: String,
    pub proto: String,
    pub port: String,
    pub vmid: String,
    pub node: String,
    pub ip: String,
    pub hostname: String,
}

impl Placeholders {
    fn lookup(&self, name: &str) -> Option<&str> {
        let value = match name {
            "vmname" => &self.vmname,
            "user" | "username" => &self.user,
            "password" => &self.password,
            "proto" | "protocol" => &self.proto,
            "port" => &self.port,
            "vmid" | "vm_id" => &self.vmid,
            "node" | "vmnode" | "vm_node" => &self.node,
            "ip" | "vmip" | "vm_ip" => &self.ip,
            "hostname" | "host" => &self.hostname,
            _ => return None,
        };
        Some(value)
    }
}

fn placeholder_regex() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(r"\{(\w+)\}").expect("BUG: placeholder pattern should compile")
    })
}

/// Expands `{placeholder}`s in a template in a single pass.
///
/// Unknown placeholders are left as written. Substituted values are never expanded again, so a
/// password containing `{ip}` stays as it is.
pub fn render_template(template: &str, values: &Placeholders) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures| {
            let name = caps[1].to_ascii_lowercase();
            values
                .lookup(&name)
                .map_or_else(|| caps[0].to_string(), str::to_string)
        })
        .into_owned()
}

/// A connection that should exist in the broker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DesiredConnectionSpec {
    pub owner: MachineId,
    pub machine_name: String,
    /// The rendered connection name.
    pub name: String,
    pub template: String,
    pub protocol: Protocol,
    /// The machine's address; `None` while the location is unresolved.
    pub host: Option<Ipv4Addr>,
    pub port: u16,
    pub username: String,
    #[serde(skip)]
    pub secret: SecretField,
    /// Hex-encoded SHA-256 of the secret's plaintext.
    #[serde(skip)]
    pub secret_digest: String,
    pub settings: ProtocolSettings,
    pub wake_enabled: bool,
    pub wake_mac: Option<MacAddress>,
    /// Wake overrides, keyed by broker parameter name (`wol-*`).
    pub wake_settings: IndexMap<String, String>,
    /// Line of the directive this spec came from.
    pub line: usize,
}

/// Broadcast address used for wake packets unless overridden.
pub const DEFAULT_WAKE_BROADCAST: &str = "255.255.255.255";
/// UDP port used for wake packets unless overridden.
pub const DEFAULT_WAKE_PORT: u16 = 9;

impl DesiredConnectionSpec {
    /// Wake-on-LAN is only in effect if it was not disabled and the machine's hardware address
    /// is known.
    pub fn effective_wake(&self) -> bool {
        self.wake_enabled && self.wake_mac.is_some()
    }

    pub fn is_unresolved(&self) -> bool {
        self.host.is_none()
    }

    /// The host string sent to the broker.
    pub fn host_string(&self) -> String {
        match self.host {
            Some(ip) => ip.to_string(),
            None => UNRESOLVED_IP.to_string(),
        }
    }

    /// All broker parameters for this connection other than host, port, and credentials.
    pub fn parameters(&self) -> IndexMap<String, String> {
        let mut params = self.settings.to_parameters();
        if let (true, Some(mac)) = (self.wake_enabled, &self.wake_mac) {
            params.insert("wol-send-packet".to_string(), "true".to_string());
            params.insert("wol-mac-addr".to_string(), mac.to_string());
            params.insert(
                "wol-broadcast-addr".to_string(),
                DEFAULT_WAKE_BROADCAST.to_string(),
            );
            params.insert("wol-udp-port".to_string(), DEFAULT_WAKE_PORT.to_string());
            for (k, v) in self.wake_settings.iter() {
                params.insert(k.clone(), v.clone());
            }
        }
        params
    }
}

// Normalizes `wol_settings` keys to broker parameter names.
fn wake_settings(raw: Option<&str>) -> IndexMap<String, String> {
    let Some(raw) = raw else {
        return IndexMap::new();
    };
    split_settings(raw)
        .into_iter()
        .map(|(k, v)| {
            let key = match k.strip_prefix("wol-") {
                Some(rest) => format!("wol-{rest}"),
                None => format!("wol-{k}"),
            };
            let value = match key.as_str() {
                "wol-send-packet" => bool_str(parse_bool(&v)),
                _ => v,
            };
            (key, value)
        })
        .collect()
}

/// Why a directive record could not produce any connections.
#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("directive is missing {0}")]
    MissingField(&'static str),

    #[error("directive lists no supported protocols")]
    NoProtocols,

    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// A problem that dropped part of a record but not all of it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BuildWarning {
    pub line: usize,
    pub message: String,
}

/// The output of [build_specs].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpecBatch {
    pub specs: Vec<DesiredConnectionSpec>,
    pub warnings: Vec<BuildWarning>,
}

/// Everything about a machine that a record's specs depend on.
#[derive(Clone, Copy, Debug)]
pub struct MachineContext<'a> {
    pub machine: &'a MachineRecord,
    pub location: &'a MachineLocation,
    /// Short host name of the machine running the sync.
    pub controller_hostname: &'a str,
    /// Annotation-wide template from `default_conf_name`.
    pub default_template: Option<&'a str>,
}

/// Expands a record into one spec per listed protocol.
///
/// Protocols are deduplicated in the order listed. Unsupported protocols and invalid ports drop
/// only the affected protocol and are reported as warnings.
///
/// # Errors
///
/// Returns an error if the record has no usable protocol or its secret cannot be decrypted. The
/// caller should skip the record.
pub fn build_specs(
    record: &RawDirectiveRecord,
    context: &MachineContext,
    codec: &SecretCodec,
) -> Result<SpecBatch, BuildError> {
    let line = record.span().line;
    let username = record
        .get(USERNAME)
        .ok_or(BuildError::MissingField(USERNAME))?
        .to_string();
    let secret = SecretCodec::inspect(record).ok_or(BuildError::MissingField("password"))?;
    let protocols_raw = record
        .get(PROTOCOLS)
        .ok_or(BuildError::MissingField(PROTOCOLS))?;

    let mut batch = SpecBatch::default();
    let mut protocols: Vec<Protocol> = Vec::new();
    for name in protocols_raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match name.parse::<Protocol>() {
            Ok(p) if !protocols.contains(&p) => protocols.push(p),
            Ok(_) => {}
            Err(message) => batch.warnings.push(BuildWarning { line, message }),
        }
    }
    if protocols.is_empty() {
        return Err(BuildError::NoProtocols);
    }

    let plaintext = codec.reveal(&secret)?;
    let secret_digest = crate::crypto::digest(&plaintext);

    let template = record
        .get(CONNECTION_NAME)
        .or(context.default_template)
        .unwrap_or(DEFAULT_TEMPLATE)
        .to_string();
    let wake_enabled = !record.get(WAKE_DISABLED).is_some_and(parse_bool);
    let wake_settings = wake_settings(record.get(WAKE_SETTINGS));
    let location = context.location;

    for protocol in protocols {
        let port_key = format!("{protocol}_port");
        let port = match record.get(&port_key).or_else(|| record.get(PORT)) {
            None => protocol.default_port(),
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    batch.warnings.push(BuildWarning {
                        line,
                        message: format!("invalid {protocol} port {raw:?}; skipping {protocol}"),
                    });
                    continue;
                }
            },
        };

        let settings_key = format!("{protocol}_settings");
        let (settings, setting_warnings) =
            ProtocolSettings::parse(protocol, record.get(&settings_key));
        batch
            .warnings
            .extend(setting_warnings.into_iter().map(|message| BuildWarning { line, message }));

        let placeholders = Placeholders {
            vmname: context.machine.name.clone(),
            user: username.clone(),
            password: plaintext.clone(),
            proto: protocol.to_string(),
            port: port.to_string(),
            vmid: context.machine.id.vmid.to_string(),
            node: context.machine.id.node.clone(),
            ip: location
                .address
                .map_or_else(|| UNRESOLVED_IP.to_string(), |ip| ip.to_string()),
            hostname: context.controller_hostname.to_string(),
        };

        batch.specs.push(DesiredConnectionSpec {
            owner: context.machine.id.clone(),
            machine_name: context.machine.name.clone(),
            name: render_template(&template, &placeholders),
            template: template.clone(),
            protocol,
            host: location.address,
            port,
            username: username.clone(),
            secret: secret.clone(),
            secret_digest: secret_digest.clone(),
            settings,
            wake_enabled,
            wake_mac: location.hardware_address,
            wake_settings: wake_settings.clone(),
            line,
        });
    }
    Ok(batch)
}
