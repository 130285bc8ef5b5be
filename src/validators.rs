//! Attribute validation and normalization.
//!
//! Everything here is a pure function: raw descriptor values go in,
//! normalized canonical tokens or a [`ValidationError`] come out. No rule is
//! ever partially validated — the first failing attribute aborts the rule.
//!
//! Error message texts are a compatibility surface (front ends and test
//! suites match them literally); they are produced exclusively through the
//! constructors on [`ValidationError`].

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crate::core::error::ValidationError;
use crate::core::rule::{
    AddrType, Family, MatchValue, ParamValue, Protocol, RejectCode, Rule, RuleDescriptor, Target,
    Value, BUILTIN_CHAINS,
};
use crate::core::schema::{
    Cardinality, FamilyScope, MatchAttr, ToolCapabilities, ValueKind, MULTIPLE_ADDRTYPE_SINCE,
};

type VResult<T> = Result<T, ValidationError>;

const TCP_FLAG_TOKENS: &[&str] = &["FIN", "SYN", "RST", "PSH", "ACK", "URG", "ALL", "NONE"];
const WEEK_DAY_TOKENS: &[&str] = &["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Splits an optional leading negation marker (`"! value"`) off a raw token.
pub fn split_negation(raw: &str) -> (bool, &str) {
    raw.strip_prefix('!')
        .map_or((false, raw), |rest| (true, rest.trim_start()))
}

/// Validates one attribute value against the schema.
///
/// Returns `Ok(None)` when the attribute validates but stores nothing
/// (boolean `false`), so the canonical model stays equal to what reparsing
/// the compiled rule yields.
pub fn validate_attribute(
    attr: MatchAttr,
    raw: &ParamValue,
    family: Family,
    caps: &ToolCapabilities,
) -> VResult<Option<MatchValue>> {
    let name = attr.to_string();
    let spec = attr.spec();

    match spec.scope {
        FamilyScope::Both => {}
        FamilyScope::V4Only if family == Family::Ipv4 => {}
        FamilyScope::V6Only if family == Family::Ipv6 => {}
        _ => return Err(ValidationError::family_mismatch(name, raw.display(), family)),
    }

    if spec.kind == ValueKind::Bool {
        return match raw {
            ParamValue::Bool(b) => Ok(bool_value(*b)),
            ParamValue::Text(s) if s == "true" => Ok(bool_value(true)),
            ParamValue::Text(s) if s == "false" => Ok(bool_value(false)),
            _ => Err(ValidationError::invalid_value(name, raw.display())),
        };
    }

    if raw.is_list() && spec.cardinality == Cardinality::Single {
        return Err(ValidationError::invalid_value(name, raw.display()));
    }

    let items = raw.items();
    if items.is_empty() {
        return Err(ValidationError::invalid_value(name, raw.display()));
    }

    let mut values = Vec::new();
    for item in items {
        let item = item.trim();
        let (negated, token) = split_negation(item);
        if negated && !spec.negatable {
            return Err(ValidationError::invalid_value(&name, item));
        }
        let normalized = normalize_token(attr, spec.kind, token, item, family)?;
        values.push(Value {
            negated,
            value: normalized,
        });
    }

    // Duplicate detection compares the literal normalized token including
    // its negation state, so 'LOCAL' and '! LOCAL' coexist.
    for (i, a) in values.iter().enumerate() {
        if values[i + 1..].contains(a) {
            return Err(ValidationError::duplicate_elements(&name, a.to_string()));
        }
    }

    if matches!(attr, MatchAttr::SrcType | MatchAttr::DstType)
        && values.len() > 1
        && !caps.supports_multiple_addrtype()
    {
        return Err(ValidationError::version_gated(
            &name,
            raw.display(),
            MULTIPLE_ADDRTYPE_SINCE,
        ));
    }

    match spec.cardinality {
        Cardinality::List => Ok(Some(MatchValue::List(values))),
        Cardinality::Single => Ok(Some(MatchValue::Scalar(
            values.into_iter().next().expect("one scalar item"),
        ))),
    }
}

const fn bool_value(b: bool) -> Option<MatchValue> {
    if b {
        Some(MatchValue::Bool(true))
    } else {
        None
    }
}

/// Normalizes a single raw token according to its value kind.
fn normalize_token(
    attr: MatchAttr,
    kind: ValueKind,
    token: &str,
    raw_item: &str,
    family: Family,
) -> VResult<String> {
    let name = attr.to_string();
    let invalid = || ValidationError::invalid_value(&name, raw_item);

    match kind {
        ValueKind::Cidr => {
            let net = IpNetwork::from_str(token).map_err(|_| invalid())?;
            let matches_family = match net {
                IpNetwork::V4(_) => family == Family::Ipv4,
                IpNetwork::V6(_) => family == Family::Ipv6,
            };
            if !matches_family {
                return Err(invalid());
            }
            // The live tool reports the network address, not the host the
            // user typed; normalize the same way or every plan would see
            // drift.
            Ok(format!("{}/{}", net.network(), net.prefix()))
        }
        ValueKind::Interface => {
            validate_interface_name(token).map_err(|()| invalid())?;
            Ok(token.to_string())
        }
        ValueKind::PortList => normalize_port_token(token).ok_or_else(invalid),
        ValueKind::TcpFlags => normalize_tcp_flags(token).ok_or_else(invalid),
        ValueKind::AddrRange => normalize_addr_range(&name, token, family),
        ValueKind::AddrTypeToken => AddrType::from_str(token)
            .map(|t| t.to_string())
            .map_err(|_| invalid()),
        ValueKind::Mac => normalize_mac(token).ok_or_else(invalid),
        ValueKind::Uint32 => token
            .parse::<u32>()
            .map(|n| n.to_string())
            .map_err(|_| invalid()),
        ValueKind::HopLimit => match token.parse::<u32>() {
            Ok(n) if n <= 255 => Ok(n.to_string()),
            _ => Err(invalid()),
        },
        ValueKind::IpsecDir => match token {
            "in" | "out" => Ok(token.to_string()),
            _ => Err(invalid()),
        },
        ValueKind::IpsecPolicy => match token {
            "none" | "ipsec" => Ok(token.to_string()),
            _ => Err(invalid()),
        },
        ValueKind::IpsetSpec => normalize_ipset_spec(token).ok_or_else(invalid),
        ValueKind::DateTime => chrono::NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S")
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            .map_err(|_| invalid()),
        ValueKind::TimeOfDay => chrono::NaiveTime::parse_from_str(token, "%H:%M:%S")
            .or_else(|_| chrono::NaiveTime::parse_from_str(token, "%H:%M"))
            .map(|t| t.format("%H:%M:%S").to_string())
            .map_err(|_| invalid()),
        ValueKind::MonthDay => match token.parse::<u8>() {
            Ok(n) if (1..=31).contains(&n) => Ok(n.to_string()),
            _ => Err(invalid()),
        },
        ValueKind::WeekDays => {
            let days: Vec<&str> = token.split(',').collect();
            if !days.is_empty() && days.iter().all(|d| WEEK_DAY_TOKENS.contains(d)) {
                Ok(days.join(","))
            } else {
                Err(invalid())
            }
        }
        ValueKind::Bool => unreachable!("booleans are handled before tokenization"),
    }
}

/// Kernel interface name constraints: max 15 chars (IFNAMSIZ - 1),
/// alphanumeric plus `.`/`-`/`_`, trailing `+` wildcard allowed,
/// never `.` or `..`.
fn validate_interface_name(name: &str) -> Result<(), ()> {
    if name.is_empty() || name.len() > 15 || name == "." || name == ".." {
        return Err(());
    }
    let stem = name.strip_suffix('+').unwrap_or(name);
    if stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        Ok(())
    } else {
        Err(())
    }
}

/// `"571"` or `"8000:9000"`; ports 1..=65535, ranges ordered.
fn normalize_port_token(token: &str) -> Option<String> {
    fn port(s: &str) -> Option<u16> {
        match s.parse::<u16>() {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        }
    }
    if let Some((lo, hi)) = token.split_once(':') {
        let (lo, hi) = (port(lo)?, port(hi)?);
        if lo <= hi {
            Some(format!("{lo}:{hi}"))
        } else {
            None
        }
    } else {
        port(token).map(|n| n.to_string())
    }
}

/// `"FIN,SYN ACK"`: a mask list and a comparison list of TCP flag tokens.
fn normalize_tcp_flags(token: &str) -> Option<String> {
    let mut parts = token.split_whitespace();
    let mask = parts.next()?;
    let comp = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    for list in [mask, comp] {
        if !list.split(',').all(|f| TCP_FLAG_TOKENS.contains(&f)) {
            return None;
        }
    }
    Some(format!("{mask} {comp}"))
}

/// `"addr-addr"` with both endpoints literal addresses of `family`.
fn normalize_addr_range(attr: &str, token: &str, family: Family) -> VResult<String> {
    let Some((start, stop)) = token.split_once('-') else {
        return Err(ValidationError::invalid_range_endpoint(attr, token, token));
    };
    let mut endpoints = Vec::with_capacity(2);
    for endpoint in [start, stop] {
        match IpAddr::from_str(endpoint) {
            Ok(addr) if family.contains(&addr) => endpoints.push(addr),
            _ => {
                return Err(ValidationError::invalid_range_endpoint(
                    attr, endpoint, token,
                ));
            }
        }
    }
    Ok(format!("{}-{}", endpoints[0], endpoints[1]))
}

/// `"0A:1B:3C:4D:5E:6F"`, normalized to uppercase.
fn normalize_mac(token: &str) -> Option<String> {
    let groups: Vec<&str> = token.split(':').collect();
    if groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
    {
        Some(token.to_ascii_uppercase())
    } else {
        None
    }
}

/// `"setname dir[,dir]"` where dir is `src` or `dst`.
fn normalize_ipset_spec(token: &str) -> Option<String> {
    let mut parts = token.split_whitespace();
    let set_name = parts.next()?;
    let dirs = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if set_name.is_empty()
        || set_name.len() > 31
        || !set_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return None;
    }
    if !dirs.split(',').all(|d| d == "src" || d == "dst") {
        return None;
    }
    Some(format!("{set_name} {dirs}"))
}

/// Rule names end up inside a quoted comment; keep them printable and
/// quote-free.
fn validate_name(name: &str) -> VResult<()> {
    if name.is_empty() {
        return Err(ValidationError::new("name", name, "Rule name must not be empty"));
    }
    if name.len() > 255 {
        return Err(ValidationError::new(
            "name",
            name,
            "Rule name must be at most 255 characters",
        ));
    }
    if name.chars().any(|c| c.is_control() || c == '"') {
        return Err(ValidationError::new(
            "name",
            name,
            "Rule name must not contain quotes or control characters",
        ));
    }
    Ok(())
}

fn validate_chain(chain: &str, table: crate::core::rule::Table) -> VResult<()> {
    if chain.is_empty()
        || chain.len() > 28
        || !chain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(ValidationError::invalid_value("chain", chain));
    }
    if BUILTIN_CHAINS.contains(&chain) && !table.builtin_chains().contains(&chain) {
        return Err(ValidationError::new(
            "chain",
            chain,
            format!("Chain {chain} is not a built-in chain of table {table}"),
        ));
    }
    Ok(())
}

/// `"0x3e8/0xffffffff"`, `"0x3e8"`, or decimal forms; mask defaults to
/// 0xffffffff.
fn parse_mark(raw: &str) -> Option<(u32, u32)> {
    fn number(s: &str) -> Option<u32> {
        s.strip_prefix("0x")
            .map_or_else(|| s.parse().ok(), |hex| u32::from_str_radix(hex, 16).ok())
    }
    match raw.split_once('/') {
        Some((value, mask)) => Some((number(value)?, number(mask)?)),
        None => Some((number(raw)?, 0xffff_ffff)),
    }
}

/// Target parameters that travel in the descriptor's flat attribute map.
struct TargetParams {
    reject: Option<ParamValue>,
    set_mark: Option<ParamValue>,
    checksum_fill: Option<ParamValue>,
    gateway: Option<ParamValue>,
}

impl TargetParams {
    fn extract(params: &mut BTreeMap<String, ParamValue>) -> Self {
        Self {
            reject: params.remove("reject"),
            set_mark: params.remove("set_mark"),
            checksum_fill: params.remove("checksum_fill"),
            gateway: params.remove("gateway"),
        }
    }
}

fn param_bool(name: &str, raw: &ParamValue) -> VResult<bool> {
    match raw {
        ParamValue::Bool(b) => Ok(*b),
        ParamValue::Text(s) if s == "true" => Ok(true),
        ParamValue::Text(s) if s == "false" => Ok(false),
        _ => Err(ValidationError::invalid_value(name, raw.display())),
    }
}

fn resolve_target(
    desc: &RuleDescriptor,
    params: TargetParams,
    family: Family,
) -> VResult<Option<Target>> {
    let TargetParams {
        reject,
        set_mark,
        checksum_fill,
        gateway,
    } = params;

    if desc.action.is_some() && desc.jump.is_some() {
        return Err(ValidationError::new(
            "action",
            desc.action.clone().unwrap_or_default(),
            "Only one of action and jump may be specified",
        ));
    }

    let target = if let Some(action) = desc.action.as_deref() {
        match action {
            "accept" => Some(Target::Accept),
            "drop" => Some(Target::Drop),
            "reject" => {
                let with = match &reject {
                    Some(raw) => {
                        let code_raw = raw.display();
                        let code = RejectCode::from_str(&code_raw)
                            .map_err(|_| ValidationError::invalid_value("reject", &code_raw))?;
                        if !code.valid_for(family) {
                            return Err(ValidationError::invalid_value("reject", code_raw));
                        }
                        code
                    }
                    None => RejectCode::default_for(family),
                };
                Some(Target::Reject { with })
            }
            other => return Err(ValidationError::invalid_value("action", other)),
        }
    } else if let Some(jump) = desc.jump.as_deref() {
        match jump {
            "ACCEPT" | "DROP" | "REJECT" => {
                return Err(ValidationError::new(
                    "jump",
                    jump,
                    "Use action instead of jump for ACCEPT, DROP and REJECT",
                ));
            }
            "MARK" => {
                let raw = set_mark.as_ref().ok_or_else(|| {
                    ValidationError::new("set_mark", "", "set_mark is required when jump is MARK")
                })?;
                let (value, mask) = parse_mark(&raw.display())
                    .ok_or_else(|| ValidationError::invalid_value("set_mark", raw.display()))?;
                Some(Target::Mark { value, mask })
            }
            "CHECKSUM" => {
                let fill = match &checksum_fill {
                    Some(raw) => param_bool("checksum_fill", raw)?,
                    None => false,
                };
                Some(Target::Checksum { fill })
            }
            "TEE" => {
                let raw = gateway.as_ref().ok_or_else(|| {
                    ValidationError::new("gateway", "", "gateway is required when jump is TEE")
                })?;
                let addr_raw = raw.display();
                let addr = IpAddr::from_str(&addr_raw)
                    .map_err(|_| ValidationError::invalid_value("gateway", &addr_raw))?;
                if !family.contains(&addr) {
                    return Err(ValidationError::invalid_value("gateway", addr_raw));
                }
                Some(Target::Tee { gateway: addr })
            }
            chain => {
                validate_chain(chain, desc.table)
                    .map_err(|_| ValidationError::invalid_value("jump", chain))?;
                Some(Target::Jump(chain.to_string()))
            }
        }
    } else {
        None
    };

    // Leftover target parameters that do not belong to the selected target
    // are a configuration mistake, not silent noise.
    let is = |t: fn(&Target) -> bool| target.as_ref().is_some_and(t);
    if reject.is_some() && !is(|t| matches!(t, Target::Reject { .. })) {
        return Err(ValidationError::new(
            "reject",
            reject.unwrap().display(),
            "reject is only valid with action reject",
        ));
    }
    if set_mark.is_some() && !is(|t| matches!(t, Target::Mark { .. })) {
        return Err(ValidationError::new(
            "set_mark",
            set_mark.unwrap().display(),
            "set_mark is only valid with jump MARK",
        ));
    }
    if checksum_fill.is_some() && !is(|t| matches!(t, Target::Checksum { .. })) {
        return Err(ValidationError::new(
            "checksum_fill",
            checksum_fill.unwrap().display(),
            "checksum_fill is only valid with jump CHECKSUM",
        ));
    }
    if gateway.is_some() && !is(|t| matches!(t, Target::Tee { .. })) {
        return Err(ValidationError::new(
            "gateway",
            gateway.unwrap().display(),
            "gateway is only valid with jump TEE",
        ));
    }

    Ok(target)
}

/// Validates a full descriptor into a canonical [`Rule`].
///
/// All attribute checks happen here, before anything reaches the compiler;
/// a rule that validates is guaranteed to compile.
pub fn validate_rule(desc: &RuleDescriptor, caps: &ToolCapabilities) -> VResult<Rule> {
    validate_name(&desc.name)?;
    validate_chain(&desc.chain, desc.table)?;

    if !desc.proto.valid_for(desc.family) {
        return Err(ValidationError::new(
            "proto",
            desc.proto.to_string(),
            format!("Protocol {} is not valid for {}", desc.proto, desc.family),
        ));
    }

    let mut params = desc.params.clone();
    let target_params = TargetParams::extract(&mut params);
    let target = resolve_target(desc, target_params, desc.family)?;

    let mut matches = BTreeMap::new();
    for (key, raw) in &params {
        let attr = MatchAttr::from_str(key).map_err(|_| {
            ValidationError::new(key, raw.display(), format!("Unknown parameter {key}"))
        })?;
        if let Some(value) = validate_attribute(attr, raw, desc.family, caps)? {
            matches.insert(attr, value);
        }
    }

    // Port matching needs a port-carrying protocol underneath.
    for attr in [MatchAttr::Sport, MatchAttr::Dport, MatchAttr::Port] {
        if matches.contains_key(&attr)
            && !matches!(desc.proto, Protocol::Tcp | Protocol::Udp | Protocol::Sctp)
        {
            return Err(ValidationError::new(
                attr.to_string(),
                desc.proto.to_string(),
                format!("{attr} requires a port-based protocol"),
            ));
        }
    }
    if matches.contains_key(&MatchAttr::TcpFlags) && desc.proto != Protocol::Tcp {
        return Err(ValidationError::new(
            "tcp_flags",
            desc.proto.to_string(),
            "tcp_flags requires proto tcp",
        ));
    }

    Ok(Rule {
        name: desc.name.clone(),
        position_key: Rule::ordering_key(&desc.name),
        ensure: desc.ensure,
        table: desc.table,
        chain: desc.chain.clone(),
        family: desc.family,
        protocol: desc.proto,
        matches,
        target,
    })
}
