//! Static attribute schema: which match module owns each attribute, how its
//! value is validated, which family it is legal under, and whether it is a
//! list. Resolved through a total `match`, so an attribute without a module
//! mapping cannot exist — the compiler relies on that.
//!
//! Also home of [`ToolCapabilities`], the explicit description of what the
//! installed control tool supports. Version-conditional validation goes
//! through it instead of comparing version strings inline.

use std::str::FromStr;

/// Match modules known to the compiler and parser, ordered by emission
/// priority. The numeric priorities reproduce every clause ordering the
/// tool's own save output exhibits, and compiling the same rule twice is
/// byte-identical because the order is total.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Module {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "physdev")]
    Physdev,
    #[strum(serialize = "frag")]
    Frag,
    #[strum(serialize = "iprange")]
    Iprange,
    #[strum(serialize = "owner")]
    Owner,
    #[strum(serialize = "mac")]
    Mac,
    #[strum(serialize = "multiport")]
    Multiport,
    #[strum(serialize = "addrtype")]
    Addrtype,
    #[strum(serialize = "hl")]
    Hl,
    #[strum(serialize = "socket")]
    Socket,
    #[strum(serialize = "policy")]
    Policy,
    #[strum(serialize = "set")]
    Set,
    #[strum(serialize = "time")]
    Time,
    /// Carries the rule name; always the last module before the target.
    #[strum(serialize = "comment")]
    Comment,
}

impl Module {
    /// Emission priority; lower compiles earlier. Total and stable.
    pub const fn priority(self) -> u8 {
        match self {
            Module::Tcp => 10,
            Module::Physdev => 20,
            Module::Frag => 30,
            Module::Iprange => 40,
            Module::Owner => 50,
            Module::Mac => 60,
            Module::Multiport => 70,
            Module::Addrtype => 80,
            Module::Hl => 90,
            Module::Socket => 100,
            Module::Policy => 110,
            Module::Set => 120,
            Module::Time => 130,
            Module::Comment => 200,
        }
    }
}

/// All supported match attributes. String forms follow the manifest
/// vocabulary (`dst_type`, `hop_limit`, ...).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum MatchAttr {
    #[strum(serialize = "source")]
    Source,
    #[strum(serialize = "destination")]
    Destination,
    #[strum(serialize = "iniface")]
    Iniface,
    #[strum(serialize = "outiface")]
    Outiface,
    #[strum(serialize = "sport")]
    Sport,
    #[strum(serialize = "dport")]
    Dport,
    #[strum(serialize = "port")]
    Port,
    #[strum(serialize = "tcp_flags")]
    TcpFlags,
    #[strum(serialize = "src_range")]
    SrcRange,
    #[strum(serialize = "dst_range")]
    DstRange,
    #[strum(serialize = "src_type")]
    SrcType,
    #[strum(serialize = "dst_type")]
    DstType,
    #[strum(serialize = "mac_source")]
    MacSource,
    #[strum(serialize = "physdev_in")]
    PhysdevIn,
    #[strum(serialize = "physdev_out")]
    PhysdevOut,
    #[strum(serialize = "physdev_is_bridged")]
    PhysdevIsBridged,
    #[strum(serialize = "uid")]
    Uid,
    #[strum(serialize = "gid")]
    Gid,
    #[strum(serialize = "hop_limit")]
    HopLimit,
    #[strum(serialize = "isfirstfrag")]
    Isfirstfrag,
    #[strum(serialize = "ishasmorefrags")]
    Ishasmorefrags,
    #[strum(serialize = "islastfrag")]
    Islastfrag,
    #[strum(serialize = "socket")]
    Socket,
    #[strum(serialize = "ipsec_dir")]
    IpsecDir,
    #[strum(serialize = "ipsec_policy")]
    IpsecPolicy,
    #[strum(serialize = "ipset")]
    Ipset,
    #[strum(serialize = "date_start")]
    DateStart,
    #[strum(serialize = "date_stop")]
    DateStop,
    #[strum(serialize = "time_start")]
    TimeStart,
    #[strum(serialize = "time_stop")]
    TimeStop,
    #[strum(serialize = "month_days")]
    MonthDays,
    #[strum(serialize = "week_days")]
    WeekDays,
    #[strum(serialize = "kernel_timezone")]
    KernelTimezone,
}

/// Where an attribute lands in the compiled argument sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// A bare short flag before any `-m` clause (`-s`, `-d`, `-i`, `-o`).
    Base(&'static str),
    /// A flag inside the given match module's clause.
    Module(Module),
}

/// How the raw value is validated and normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// CIDR network of the rule's family
    Cidr,
    /// Kernel interface name
    Interface,
    /// Port or `a:b` port range, one or more
    PortList,
    /// `"MASK COMP"` pair of comma-separated TCP flag lists
    TcpFlags,
    /// `addr-addr` with both endpoints in the rule's family
    AddrRange,
    /// `src_type`/`dst_type` vocabulary token
    AddrTypeToken,
    /// `XX:XX:XX:XX:XX:XX` hardware address
    Mac,
    /// Unsigned integer (uid/gid)
    Uint32,
    /// 0..=255
    HopLimit,
    /// true/false; false is dropped from the model
    Bool,
    /// `in` | `out`
    IpsecDir,
    /// `none` | `ipsec`
    IpsecPolicy,
    /// `setname dir[,dir]`
    IpsetSpec,
    /// `YYYY-MM-DDThh:mm:ss`
    DateTime,
    /// Time of day, normalized to `HH:MM:SS`
    TimeOfDay,
    /// Day of month, 1..=31
    MonthDay,
    /// Comma-separated `Mon`..`Sun`
    WeekDays,
}

/// Which families an attribute is legal under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyScope {
    Both,
    V4Only,
    V6Only,
}

/// Whether an attribute takes one token or a list of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    List,
}

/// Full schema entry for one attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttrSpec {
    pub placement: Placement,
    pub kind: ValueKind,
    pub scope: FamilyScope,
    pub cardinality: Cardinality,
    /// Whether a leading `! ` marker is accepted on the value
    pub negatable: bool,
}

const fn spec(
    placement: Placement,
    kind: ValueKind,
    scope: FamilyScope,
    cardinality: Cardinality,
    negatable: bool,
) -> AttrSpec {
    AttrSpec {
        placement,
        kind,
        scope,
        cardinality,
        negatable,
    }
}

/// The static registry. Total over [`MatchAttr`], so lookups cannot fail.
pub const fn attr_spec(attr: MatchAttr) -> AttrSpec {
    use Cardinality::{List, Single};
    use FamilyScope::{Both, V6Only};
    use Placement::{Base, Module as InModule};

    match attr {
        MatchAttr::Source => spec(Base("-s"), ValueKind::Cidr, Both, Single, true),
        MatchAttr::Destination => spec(Base("-d"), ValueKind::Cidr, Both, Single, true),
        MatchAttr::Iniface => spec(Base("-i"), ValueKind::Interface, Both, Single, true),
        MatchAttr::Outiface => spec(Base("-o"), ValueKind::Interface, Both, Single, true),
        MatchAttr::Sport | MatchAttr::Dport | MatchAttr::Port => spec(
            InModule(Module::Multiport),
            ValueKind::PortList,
            Both,
            List,
            false,
        ),
        MatchAttr::TcpFlags => spec(
            InModule(Module::Tcp),
            ValueKind::TcpFlags,
            Both,
            Single,
            true,
        ),
        MatchAttr::SrcRange | MatchAttr::DstRange => spec(
            InModule(Module::Iprange),
            ValueKind::AddrRange,
            Both,
            Single,
            true,
        ),
        MatchAttr::SrcType | MatchAttr::DstType => spec(
            InModule(Module::Addrtype),
            ValueKind::AddrTypeToken,
            Both,
            List,
            true,
        ),
        MatchAttr::MacSource => spec(InModule(Module::Mac), ValueKind::Mac, Both, Single, true),
        MatchAttr::PhysdevIn | MatchAttr::PhysdevOut => spec(
            InModule(Module::Physdev),
            ValueKind::Interface,
            Both,
            Single,
            false,
        ),
        MatchAttr::PhysdevIsBridged => spec(
            InModule(Module::Physdev),
            ValueKind::Bool,
            Both,
            Single,
            false,
        ),
        MatchAttr::Uid | MatchAttr::Gid => spec(
            InModule(Module::Owner),
            ValueKind::Uint32,
            Both,
            Single,
            true,
        ),
        MatchAttr::HopLimit => spec(
            InModule(Module::Hl),
            ValueKind::HopLimit,
            V6Only,
            Single,
            true,
        ),
        MatchAttr::Isfirstfrag | MatchAttr::Ishasmorefrags | MatchAttr::Islastfrag => spec(
            InModule(Module::Frag),
            ValueKind::Bool,
            V6Only,
            Single,
            false,
        ),
        MatchAttr::Socket => spec(InModule(Module::Socket), ValueKind::Bool, Both, Single, false),
        MatchAttr::IpsecDir => spec(
            InModule(Module::Policy),
            ValueKind::IpsecDir,
            Both,
            Single,
            false,
        ),
        MatchAttr::IpsecPolicy => spec(
            InModule(Module::Policy),
            ValueKind::IpsecPolicy,
            Both,
            Single,
            false,
        ),
        MatchAttr::Ipset => spec(InModule(Module::Set), ValueKind::IpsetSpec, Both, List, true),
        MatchAttr::DateStart | MatchAttr::DateStop => spec(
            InModule(Module::Time),
            ValueKind::DateTime,
            Both,
            Single,
            false,
        ),
        MatchAttr::TimeStart | MatchAttr::TimeStop => spec(
            InModule(Module::Time),
            ValueKind::TimeOfDay,
            Both,
            Single,
            false,
        ),
        MatchAttr::MonthDays => spec(
            InModule(Module::Time),
            ValueKind::MonthDay,
            Both,
            Single,
            false,
        ),
        MatchAttr::WeekDays => spec(
            InModule(Module::Time),
            ValueKind::WeekDays,
            Both,
            Single,
            false,
        ),
        MatchAttr::KernelTimezone => spec(
            InModule(Module::Time),
            ValueKind::Bool,
            Both,
            Single,
            false,
        ),
    }
}

impl MatchAttr {
    pub const fn spec(self) -> AttrSpec {
        attr_spec(self)
    }

    /// Owning module, or `None` for base short-flag attributes.
    pub const fn module(self) -> Option<Module> {
        match attr_spec(self).placement {
            Placement::Base(_) => None,
            Placement::Module(m) => Some(m),
        }
    }
}

/// Capability description of the installed control tool.
///
/// Injected into validation so that version-conditional behavior lives in
/// one place. Constructed from the tool's reported version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolCapabilities {
    version: (u32, u32, u32),
}

/// Version that first allowed one inverted plus one non-inverted instance
/// of the addrtype module in a single rule.
pub const MULTIPLE_ADDRTYPE_SINCE: &str = "1.4.1";

impl ToolCapabilities {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            version: (major, minor, patch),
        }
    }

    /// Most recent toolchain; used when the caller does not know better.
    pub const fn latest() -> Self {
        Self::new(1, 8, 10)
    }

    pub const fn version(&self) -> (u32, u32, u32) {
        self.version
    }

    /// Whether a rule may carry more than one addrtype instance per
    /// direction (e.g. `dst_type => ['LOCAL', '! LOCAL']`).
    pub fn supports_multiple_addrtype(&self) -> bool {
        self.version >= (1, 4, 1)
    }
}

impl Default for ToolCapabilities {
    fn default() -> Self {
        Self::latest()
    }
}

impl FromStr for ToolCapabilities {
    type Err = String;

    /// Parses `"1.4.21"` (or `"v1.4.21"`) into capabilities.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let mut next = |what: &str| -> Result<u32, String> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| format!("invalid {what} in tool version \"{s}\""))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        // Some builds report only two components
        let patch = parts.next().map_or(Ok(0), |p| {
            p.parse()
                .map_err(|_| format!("invalid patch in tool version \"{s}\""))
        })?;
        Ok(Self::new(major, minor, patch))
    }
}
