//! Canonical rule model shared by the compiler and the parser.
//!
//! A [`Rule`] is the validated, family-tagged, immutable representation of
//! one packet-filtering rule. Desired rules are built from a
//! [`RuleDescriptor`] via [`crate::validators::validate_rule`]; observed
//! rules are reconstructed from a save-format dump by
//! [`crate::core::parse`]. Both sides meet in structural equality, which is
//! what the reconciliation planner compares — never raw rule text.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::core::schema::MatchAttr;

/// Protocol family of a rule. Selects the flag vocabulary, the
/// address-literal grammar and which attributes are legal.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Family {
    #[strum(serialize = "IPv4")]
    Ipv4,
    #[strum(serialize = "IPv6")]
    Ipv6,
}

impl Family {
    pub const fn is_ipv6(self) -> bool {
        matches!(self, Family::Ipv6)
    }

    /// Whether `addr` is a literal of this family.
    pub const fn contains(self, addr: &IpAddr) -> bool {
        match self {
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Rule table. Built-in chain membership depends on it.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[default]
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "mangle")]
    Mangle,
    #[strum(serialize = "raw")]
    Raw,
    #[strum(serialize = "security")]
    Security,
}

impl Table {
    /// Built-in chains of this table. User-defined chains are always
    /// permitted in addition.
    pub const fn builtin_chains(self) -> &'static [&'static str] {
        match self {
            Table::Filter | Table::Security => &["INPUT", "FORWARD", "OUTPUT"],
            Table::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            Table::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
            Table::Raw => &["PREROUTING", "OUTPUT"],
        }
    }
}

/// The five names that are built-in somewhere; a chain by one of these names
/// must belong to the right table, anything else is a user chain.
pub const BUILTIN_CHAINS: &[&str] = &["INPUT", "FORWARD", "OUTPUT", "PREROUTING", "POSTROUTING"];

/// Desired state of a rule. Only meaningful on the desired side;
/// observed rules are always `Present`.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    #[default]
    #[strum(serialize = "present")]
    Present,
    #[strum(serialize = "absent")]
    Absent,
}

/// Transport protocol selector (`-p`). `All` emits no token at all.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    #[strum(serialize = "all")]
    All,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    /// IPv4 ICMP; invalid under the IPv6 family
    #[strum(serialize = "icmp")]
    Icmp,
    /// IPv6 ICMP; invalid under the IPv4 family
    #[strum(serialize = "ipv6-icmp")]
    Ipv6Icmp,
    #[strum(serialize = "esp")]
    Esp,
    #[strum(serialize = "ah")]
    Ah,
    #[strum(serialize = "sctp")]
    Sctp,
}

impl Protocol {
    pub const fn valid_for(self, family: Family) -> bool {
        match self {
            Protocol::Icmp => matches!(family, Family::Ipv4),
            Protocol::Ipv6Icmp => matches!(family, Family::Ipv6),
            _ => true,
        }
    }
}

/// ICMP code sent back by a `REJECT` target (`--reject-with`).
///
/// The vocabulary is family-specific; `TcpReset` is the only code shared by
/// both families.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum RejectCode {
    #[strum(serialize = "icmp-net-unreachable")]
    IcmpNetUnreachable,
    #[strum(serialize = "icmp-host-unreachable")]
    IcmpHostUnreachable,
    #[strum(serialize = "icmp-port-unreachable")]
    IcmpPortUnreachable,
    #[strum(serialize = "icmp-proto-unreachable")]
    IcmpProtoUnreachable,
    #[strum(serialize = "icmp-net-prohibited")]
    IcmpNetProhibited,
    #[strum(serialize = "icmp-host-prohibited")]
    IcmpHostProhibited,
    #[strum(serialize = "icmp-admin-prohibited")]
    IcmpAdminProhibited,
    #[strum(serialize = "icmp6-no-route")]
    Icmp6NoRoute,
    #[strum(serialize = "icmp6-adm-prohibited")]
    Icmp6AdmProhibited,
    #[strum(serialize = "icmp6-addr-unreachable")]
    Icmp6AddrUnreachable,
    #[strum(serialize = "icmp6-port-unreachable")]
    Icmp6PortUnreachable,
    #[strum(serialize = "tcp-reset")]
    TcpReset,
}

impl RejectCode {
    pub const fn valid_for(self, family: Family) -> bool {
        match self {
            RejectCode::TcpReset => true,
            RejectCode::Icmp6NoRoute
            | RejectCode::Icmp6AdmProhibited
            | RejectCode::Icmp6AddrUnreachable
            | RejectCode::Icmp6PortUnreachable => matches!(family, Family::Ipv6),
            _ => matches!(family, Family::Ipv4),
        }
    }

    /// Code the tool itself uses when `REJECT` is given without an explicit
    /// `--reject-with`. Validation fills this in so that the stored model
    /// matches what a later dump will show.
    pub const fn default_for(family: Family) -> Self {
        match family {
            Family::Ipv4 => RejectCode::IcmpPortUnreachable,
            Family::Ipv6 => RejectCode::Icmp6PortUnreachable,
        }
    }
}

/// Address classification tokens accepted by `src_type` / `dst_type`.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AddrType {
    #[strum(serialize = "UNSPEC")]
    Unspec,
    #[strum(serialize = "UNICAST")]
    Unicast,
    #[strum(serialize = "LOCAL")]
    Local,
    #[strum(serialize = "BROADCAST")]
    Broadcast,
    #[strum(serialize = "ANYCAST")]
    Anycast,
    #[strum(serialize = "MULTICAST")]
    Multicast,
    #[strum(serialize = "BLACKHOLE")]
    Blackhole,
    #[strum(serialize = "UNREACHABLE")]
    Unreachable,
    #[strum(serialize = "PROHIBIT")]
    Prohibit,
    #[strum(serialize = "THROW")]
    Throw,
    #[strum(serialize = "NAT")]
    Nat,
    #[strum(serialize = "XRESOLVE")]
    Xresolve,
}

/// Terminal clause of a rule. Modeling this as one enum (instead of
/// separate `action`/`jump` fields) makes the "never both" invariant
/// unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Reject { with: RejectCode },
    /// `-j MARK --set-xmark value/mask`
    Mark { value: u32, mask: u32 },
    /// `-j CHECKSUM [--checksum-fill]`
    Checksum { fill: bool },
    /// `-j TEE --gateway addr`
    Tee { gateway: IpAddr },
    /// Jump to a user-defined chain
    Jump(String),
}

/// One normalized attribute token, with its negation state.
///
/// The token is stored exactly as the compiler will emit it, so duplicate
/// detection and structural equality are literal string comparisons.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Value {
    pub negated: bool,
    pub value: String,
}

impl Value {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            negated: false,
            value: value.into(),
        }
    }

    pub fn negated(value: impl Into<String>) -> Self {
        Self {
            negated: true,
            value: value.into(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "! {}", self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// Validated value of one match attribute.
///
/// Boolean attributes are only ever stored as `Bool(true)`: a `false`
/// compiles to nothing, so validation drops it entirely and the model stays
/// equal to what reparsing the compiled line yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    Bool(bool),
    Scalar(Value),
    List(Vec<Value>),
}

impl MatchValue {
    /// Elements in declaration order; a scalar is a one-element slice.
    pub fn elements(&self) -> &[Value] {
        match self {
            MatchValue::Bool(_) => &[],
            MatchValue::Scalar(v) => std::slice::from_ref(v),
            MatchValue::List(vs) => vs,
        }
    }

    pub const fn as_bool(&self) -> bool {
        matches!(self, MatchValue::Bool(true))
    }
}

/// One desired or observed firewall rule.
///
/// Immutable once constructed; any change produces a new value. Equality is
/// structural and covers every field, which is exactly the comparison the
/// planner performs to decide noop vs. drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Unique per table+chain+family; conventionally starts with a
    /// zero-padded numeric ordering prefix ("571 - test").
    pub name: String,
    /// Numeric prefix of `name`, parsed exactly once at construction.
    /// `None` for names without a leading number.
    pub position_key: Option<u32>,
    pub ensure: Ensure,
    pub table: Table,
    pub chain: String,
    pub family: Family,
    pub protocol: Protocol,
    /// Validated match attributes in canonical form.
    pub matches: BTreeMap<MatchAttr, MatchValue>,
    /// Terminal clause; `None` for count-only rules without `-j`.
    pub target: Option<Target>,
}

impl Rule {
    /// Extracts the numeric ordering prefix from a rule name:
    /// `"571 - test"` -> `Some(571)`, `"keepalive"` -> `None`.
    pub fn ordering_key(name: &str) -> Option<u32> {
        let digits: &str = name
            .split_once(|c: char| !c.is_ascii_digit())
            .map_or(name, |(head, _)| head);
        if digits.is_empty() {
            None
        } else {
            digits.parse().ok()
        }
    }

    pub fn value(&self, attr: MatchAttr) -> Option<&MatchValue> {
        self.matches.get(&attr)
    }

    /// Scalar helper: the single normalized token of `attr`, if present.
    pub fn scalar(&self, attr: MatchAttr) -> Option<&Value> {
        match self.matches.get(&attr) {
            Some(MatchValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn flag(&self, attr: MatchAttr) -> bool {
        self.matches.get(&attr).is_some_and(MatchValue::as_bool)
    }
}

/// Wire-shaped desired rule, as handed over by a manifest front end.
///
/// Attribute values arrive loosely typed (strings, numbers, booleans,
/// lists); [`crate::validators::validate_rule`] normalizes them into a
/// [`Rule`] or rejects them with a precise message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDescriptor {
    pub name: String,
    #[serde(default)]
    pub ensure: Ensure,
    #[serde(default)]
    pub table: Table,
    #[serde(default = "default_chain")]
    pub chain: String,
    pub family: Family,
    /// Defaults to tcp, the manifest convention
    #[serde(default = "default_proto")]
    pub proto: Protocol,
    /// Terminal action: accept, drop or reject
    #[serde(default)]
    pub action: Option<String>,
    /// Terminal jump target: MARK, CHECKSUM, TEE or a user chain name
    #[serde(default)]
    pub jump: Option<String>,
    /// Everything else: match attributes plus target parameters
    /// (reject, set_mark, checksum_fill, gateway)
    #[serde(flatten)]
    pub params: BTreeMap<String, ParamValue>,
}

fn default_chain() -> String {
    "INPUT".to_string()
}

const fn default_proto() -> Protocol {
    Protocol::Tcp
}

/// Loosely typed attribute value from the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<ParamScalar>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamScalar {
    Int(i64),
    Text(String),
}

impl ParamScalar {
    fn to_text(&self) -> String {
        match self {
            ParamScalar::Int(n) => n.to_string(),
            ParamScalar::Text(s) => s.clone(),
        }
    }
}

impl ParamValue {
    pub const fn is_list(&self) -> bool {
        matches!(self, ParamValue::List(_))
    }

    /// Raw items as strings, one per element (scalars yield one).
    pub fn items(&self) -> Vec<String> {
        match self {
            ParamValue::Bool(b) => vec![b.to_string()],
            ParamValue::Int(n) => vec![n.to_string()],
            ParamValue::Text(s) => vec![s.clone()],
            ParamValue::List(xs) => xs.iter().map(ParamScalar::to_text).collect(),
        }
    }

    /// Raw form for error reporting.
    pub fn display(&self) -> String {
        match self {
            ParamValue::List(xs) => xs
                .iter()
                .map(ParamScalar::to_text)
                .collect::<Vec<_>>()
                .join(", "),
            _ => self.items().remove(0),
        }
    }
}
