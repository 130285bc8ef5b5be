//! Save-format parser: the structural inverse of the compiler.
//!
//! One rule line (`-A INPUT -p tcp -m multiport --ports 571 ... -j ACCEPT`)
//! is tokenized with a logos lexer and rebuilt into the canonical
//! [`Rule`] model. For any line the compiler itself produced this is exact
//! (the round-trip law); externally authored lines are accepted with clause
//! order variations, and anything using modules, flags or targets outside
//! the supported grammar degrades to a *foreign* rule.
//!
//! Foreign rules keep their raw text and position but never structurally
//! match a desired rule, so reconciliation prefers a redundant insert over
//! a false noop.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use logos::Logos;

use crate::core::error::ParseError;
use crate::core::rule::{
    Ensure, Family, MatchValue, Protocol, RejectCode, Rule, Table, Target, Value,
};
use crate::core::schema::{MatchAttr, Module};

#[derive(Logos, Debug, PartialEq)]
#[logos(skip r"[ \t]+")]
enum RawToken<'a> {
    #[token("!")]
    Bang,

    #[regex(r#""[^"]*""#, |lex| lex.slice())]
    Quoted(&'a str),

    #[regex(r"--[a-zA-Z0-9][a-zA-Z0-9-]*", |lex| lex.slice())]
    Long(&'a str),

    #[regex(r"-[a-zA-Z]", |lex| lex.slice())]
    Short(&'a str),

    #[regex(r#"[^\s!"-][^\s"]*"#, |lex| lex.slice())]
    Word(&'a str),
}

/// Owned token stream of one rule line.
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Bang,
    Short(String),
    Long(String),
    Word(String),
}

fn lex(line: &str) -> Result<Vec<Tok>, ParseError> {
    let mut tokens = Vec::new();
    for result in RawToken::lexer(line) {
        let token = result.map_err(|()| ParseError::Malformed(line.to_string()))?;
        tokens.push(match token {
            RawToken::Bang => Tok::Bang,
            RawToken::Quoted(s) => Tok::Word(s[1..s.len() - 1].to_string()),
            RawToken::Long(s) => Tok::Long(s.to_string()),
            RawToken::Short(s) => Tok::Short(s.to_string()),
            RawToken::Word(s) => Tok::Word(s.to_string()),
        });
    }
    Ok(tokens)
}

/// One parsed dump line: the reconstructed rule plus enough raw context to
/// delete it verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRule {
    pub rule: Rule,
    /// True when the line used grammar outside the supported model.
    /// Foreign rules never match a desired rule.
    pub foreign: bool,
    /// The line as it appeared in the dump
    pub raw: String,
    /// Tokens after `-A <chain>`, usable as a delete specification
    pub spec_args: Vec<String>,
}

struct LineParser {
    family: Family,
    table: Table,
    chain: String,
    protocol: Protocol,
    matches: BTreeMap<MatchAttr, MatchValue>,
    src_types: Vec<Value>,
    dst_types: Vec<Value>,
    ipsets: Vec<Value>,
    name: Option<String>,
    target: Option<Target>,
    /// True while a MARK/TEE target still misses its mandatory parameter
    target_incomplete: bool,
    foreign: bool,
}

impl LineParser {
    fn new(family: Family, table: Table, chain: String) -> Self {
        Self {
            family,
            table,
            chain,
            protocol: Protocol::All,
            matches: BTreeMap::new(),
            src_types: Vec::new(),
            dst_types: Vec::new(),
            ipsets: Vec::new(),
            name: None,
            target: None,
            target_incomplete: false,
            foreign: false,
        }
    }

    fn set_scalar(&mut self, attr: MatchAttr, value: Value) {
        let prior = self.matches.insert(attr, MatchValue::Scalar(value));
        if prior.is_some() {
            // A repeated scalar flag is not something the compiler emits.
            self.foreign = true;
        }
    }

    fn set_flag(&mut self, attr: MatchAttr) {
        self.matches.insert(attr, MatchValue::Bool(true));
    }

    fn set_ports(&mut self, attr: MatchAttr, joined: &str) {
        let ports = joined.split(',').map(Value::plain).collect();
        let prior = self.matches.insert(attr, MatchValue::List(ports));
        if prior.is_some() {
            self.foreign = true;
        }
    }

    fn finish(mut self) -> Rule {
        if !self.src_types.is_empty() {
            self.matches
                .insert(MatchAttr::SrcType, MatchValue::List(self.src_types));
        }
        if !self.dst_types.is_empty() {
            self.matches
                .insert(MatchAttr::DstType, MatchValue::List(self.dst_types));
        }
        if !self.ipsets.is_empty() {
            self.matches
                .insert(MatchAttr::Ipset, MatchValue::List(self.ipsets));
        }
        let name = self.name.unwrap_or_default();
        Rule {
            position_key: Rule::ordering_key(&name),
            name,
            ensure: Ensure::Present,
            table: self.table,
            chain: self.chain,
            family: self.family,
            protocol: self.protocol,
            matches: self.matches,
            target: self.target,
        }
    }
}

/// Parses a single `-A` line from a save dump.
///
/// Never fails on unsupported-but-well-formed content; that degrades to
/// `foreign = true`. Errors are reserved for lines that are not rule lines
/// at all.
pub fn parse_rule(line: &str, family: Family, table: Table) -> Result<ParsedRule, ParseError> {
    let tokens = lex(line.trim())?;
    let mut iter = tokens.into_iter().peekable();

    match iter.next() {
        Some(Tok::Short(flag)) if flag == "-A" => {}
        _ => return Err(ParseError::Malformed(line.to_string())),
    }
    let Some(Tok::Word(chain)) = iter.next() else {
        return Err(ParseError::Malformed(line.to_string()));
    };

    // Everything after `-A <chain>` doubles as the delete spec.
    let mut spec_args = Vec::new();
    let rest: Vec<Tok> = iter.collect();
    for tok in &rest {
        spec_args.push(match tok {
            Tok::Bang => "!".to_string(),
            Tok::Short(s) | Tok::Long(s) | Tok::Word(s) => s.clone(),
        });
    }

    let mut parser = LineParser::new(family, table, chain);
    let mut tokens = rest.into_iter().peekable();
    let mut negated = false;
    let mut module: Option<Module> = None;
    let mut in_target = false;

    macro_rules! next_word {
        () => {
            match tokens.peek() {
                Some(Tok::Word(_)) => match tokens.next() {
                    Some(Tok::Word(w)) => Some(w),
                    _ => None,
                },
                _ => None,
            }
        };
    }

    while let Some(tok) = tokens.next() {
        match tok {
            Tok::Bang => negated = true,
            Tok::Short(flag) => {
                module = None;
                in_target = false;
                let neg = std::mem::take(&mut negated);
                match flag.as_str() {
                    "-s" | "-d" | "-i" | "-o" => {
                        let Some(word) = next_word!() else {
                            parser.foreign = true;
                            continue;
                        };
                        let attr = match flag.as_str() {
                            "-s" => MatchAttr::Source,
                            "-d" => MatchAttr::Destination,
                            "-i" => MatchAttr::Iniface,
                            _ => MatchAttr::Outiface,
                        };
                        parser.set_scalar(attr, Value { negated: neg, value: word });
                    }
                    "-p" => match next_word!().map(|w| Protocol::from_str(&w)) {
                        Some(Ok(proto)) if !neg => parser.protocol = proto,
                        _ => parser.foreign = true,
                    },
                    "-m" => match next_word!().map(|w| Module::from_str(&w)) {
                        Some(Ok(m)) if !neg => {
                            // socket is the one module that carries no flags
                            if m == Module::Socket {
                                parser.set_flag(MatchAttr::Socket);
                            }
                            module = Some(m);
                        }
                        _ => parser.foreign = true,
                    },
                    "-j" => match next_word!() {
                        Some(word) if !neg => {
                            parser.target = Some(initial_target(&word, family));
                            parser.target_incomplete =
                                matches!(word.as_str(), "MARK" | "TEE");
                            in_target = true;
                        }
                        _ => parser.foreign = true,
                    },
                    _ => {
                        // -g and friends are outside the supported grammar
                        parser.foreign = true;
                        let _ = next_word!();
                    }
                }
            }
            Tok::Long(flag) => {
                let neg = std::mem::take(&mut negated);
                if in_target {
                    if neg || !apply_target_flag(&mut parser, &flag, &mut || next_word!()) {
                        parser.foreign = true;
                    }
                } else if let Some(m) = module {
                    if !apply_module_flag(&mut parser, m, &flag, neg, &mut || next_word!()) {
                        parser.foreign = true;
                    }
                } else {
                    parser.foreign = true;
                }
            }
            Tok::Word(_) => parser.foreign = true,
        }
    }
    if negated || parser.target_incomplete {
        parser.foreign = true;
    }

    if parser.foreign {
        tracing::debug!(line = %line.trim(), "foreign rule in dump");
    }

    let foreign = parser.foreign;
    Ok(ParsedRule {
        rule: parser.finish(),
        foreign,
        raw: line.trim().to_string(),
        spec_args,
    })
}

fn initial_target(word: &str, family: Family) -> Target {
    match word {
        "ACCEPT" => Target::Accept,
        "DROP" => Target::Drop,
        "REJECT" => Target::Reject {
            with: RejectCode::default_for(family),
        },
        "MARK" => Target::Mark { value: 0, mask: 0 },
        "CHECKSUM" => Target::Checksum { fill: false },
        "TEE" => Target::Tee {
            gateway: IpAddr::from([0u8; 4]),
        },
        chain => Target::Jump(chain.to_string()),
    }
}

/// Applies a `--flag` that follows `-j <target>`. Returns false when the
/// flag does not belong to the supported grammar of that target.
fn apply_target_flag(
    parser: &mut LineParser,
    flag: &str,
    next_word: &mut impl FnMut() -> Option<String>,
) -> bool {
    match (&mut parser.target, flag) {
        (Some(Target::Reject { with }), "--reject-with") => match next_word() {
            Some(word) => match RejectCode::from_str(&word) {
                Ok(code) => {
                    *with = code;
                    true
                }
                Err(_) => false,
            },
            None => false,
        },
        (Some(Target::Mark { value, mask }), "--set-xmark") => match next_word() {
            Some(word) => match parse_xmark(&word) {
                Some((v, m)) => {
                    *value = v;
                    *mask = m;
                    parser.target_incomplete = false;
                    true
                }
                None => false,
            },
            None => false,
        },
        (Some(Target::Checksum { fill }), "--checksum-fill") => {
            *fill = true;
            true
        }
        (Some(Target::Tee { gateway }), "--gateway") => match next_word() {
            Some(word) => match IpAddr::from_str(&word) {
                Ok(addr) if parser.family.contains(&addr) => {
                    *gateway = addr;
                    parser.target_incomplete = false;
                    true
                }
                _ => false,
            },
            None => false,
        },
        _ => false,
    }
}

fn parse_xmark(word: &str) -> Option<(u32, u32)> {
    fn hex(s: &str) -> Option<u32> {
        s.strip_prefix("0x")
            .map_or_else(|| s.parse().ok(), |h| u32::from_str_radix(h, 16).ok())
    }
    match word.split_once('/') {
        Some((v, m)) => Some((hex(v)?, hex(m)?)),
        None => Some((hex(word)?, 0xffff_ffff)),
    }
}

/// Applies a `--flag` inside a `-m <module>` clause. Returns false for
/// flags outside the supported grammar.
fn apply_module_flag(
    parser: &mut LineParser,
    module: Module,
    flag: &str,
    negated: bool,
    next_word: &mut impl FnMut() -> Option<String>,
) -> bool {
    let scalar = |parser: &mut LineParser,
                  attr: MatchAttr,
                  next_word: &mut dyn FnMut() -> Option<String>| {
        match next_word() {
            Some(word) => {
                parser.set_scalar(attr, Value { negated, value: word });
                true
            }
            None => false,
        }
    };

    match (module, flag) {
        (Module::Tcp, "--tcp-flags") => match (next_word(), next_word()) {
            (Some(mask), Some(comp)) => {
                parser.set_scalar(
                    MatchAttr::TcpFlags,
                    Value {
                        negated,
                        value: format!("{mask} {comp}"),
                    },
                );
                true
            }
            _ => false,
        },
        (Module::Physdev, "--physdev-in") => scalar(parser, MatchAttr::PhysdevIn, next_word),
        (Module::Physdev, "--physdev-out") => scalar(parser, MatchAttr::PhysdevOut, next_word),
        (Module::Physdev, "--physdev-is-bridged") if !negated => {
            parser.set_flag(MatchAttr::PhysdevIsBridged);
            true
        }
        (Module::Frag, "--fragid") => {
            // Only the fragid the compiler emits is recognized
            matches!(next_word().as_deref(), Some("0")) && !negated
        }
        (Module::Frag, "--fragfirst") if !negated => {
            parser.set_flag(MatchAttr::Isfirstfrag);
            true
        }
        (Module::Frag, "--fragmore") if !negated => {
            parser.set_flag(MatchAttr::Ishasmorefrags);
            true
        }
        (Module::Frag, "--fraglast") if !negated => {
            parser.set_flag(MatchAttr::Islastfrag);
            true
        }
        (Module::Iprange, "--src-range") => scalar(parser, MatchAttr::SrcRange, next_word),
        (Module::Iprange, "--dst-range") => scalar(parser, MatchAttr::DstRange, next_word),
        (Module::Owner, "--uid-owner") => scalar(parser, MatchAttr::Uid, next_word),
        (Module::Owner, "--gid-owner") => scalar(parser, MatchAttr::Gid, next_word),
        (Module::Mac, "--mac-source") => scalar(parser, MatchAttr::MacSource, next_word),
        (Module::Multiport, "--sports" | "--dports" | "--ports") if !negated => {
            let attr = match flag {
                "--sports" => MatchAttr::Sport,
                "--dports" => MatchAttr::Dport,
                _ => MatchAttr::Port,
            };
            match next_word() {
                Some(word) => {
                    parser.set_ports(attr, &word);
                    true
                }
                None => false,
            }
        }
        (Module::Addrtype, "--src-type") => match next_word() {
            Some(word) => {
                parser.src_types.push(Value { negated, value: word });
                true
            }
            None => false,
        },
        (Module::Addrtype, "--dst-type") => match next_word() {
            Some(word) => {
                parser.dst_types.push(Value { negated, value: word });
                true
            }
            None => false,
        },
        (Module::Hl, "--hl-eq") => scalar(parser, MatchAttr::HopLimit, next_word),
        (Module::Policy, "--dir") if !negated => scalar(parser, MatchAttr::IpsecDir, next_word),
        (Module::Policy, "--pol") if !negated => scalar(parser, MatchAttr::IpsecPolicy, next_word),
        (Module::Set, "--match-set") => match (next_word(), next_word()) {
            (Some(set_name), Some(dirs)) => {
                parser.ipsets.push(Value {
                    negated,
                    value: format!("{set_name} {dirs}"),
                });
                true
            }
            _ => false,
        },
        (Module::Time, "--timestart") if !negated => scalar(parser, MatchAttr::TimeStart, next_word),
        (Module::Time, "--timestop") if !negated => scalar(parser, MatchAttr::TimeStop, next_word),
        (Module::Time, "--monthdays") if !negated => scalar(parser, MatchAttr::MonthDays, next_word),
        (Module::Time, "--weekdays") if !negated => scalar(parser, MatchAttr::WeekDays, next_word),
        (Module::Time, "--datestart") if !negated => scalar(parser, MatchAttr::DateStart, next_word),
        (Module::Time, "--datestop") if !negated => scalar(parser, MatchAttr::DateStop, next_word),
        (Module::Time, "--kerneltz") if !negated => {
            parser.set_flag(MatchAttr::KernelTimezone);
            true
        }
        (Module::Comment, "--comment") if !negated => match next_word() {
            Some(word) => {
                parser.name = Some(word);
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// Declared chain of a dump section (`:INPUT ACCEPT [0:0]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDecl {
    pub name: String,
    /// Built-in chain policy, `-` for user chains
    pub policy: String,
}

/// One `*table` section of a dump.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDump {
    pub table: Table,
    pub chains: Vec<ChainDecl>,
    pub rules: Vec<ParsedRule>,
}

/// A fully parsed save dump for one family.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveDump {
    pub family: Family,
    pub tables: Vec<TableDump>,
}

impl SaveDump {
    pub fn table(&self, table: Table) -> Option<&TableDump> {
        self.tables.iter().find(|t| t.table == table)
    }

    /// Observed rules of one table, empty when the table is absent.
    pub fn rules(&self, table: Table) -> &[ParsedRule] {
        self.table(table).map_or(&[], |t| t.rules.as_slice())
    }
}

/// Parses a complete `iptables-save` / `ip6tables-save` dump.
pub fn parse_save(text: &str, family: Family) -> Result<SaveDump, ParseError> {
    let mut tables = Vec::new();
    let mut current: Option<TableDump> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            if let Some(done) = current.take() {
                tables.push(done);
            }
            let table = Table::from_str(name.trim())
                .map_err(|_| ParseError::UnknownTable(name.trim().to_string()))?;
            current = Some(TableDump {
                table,
                chains: Vec::new(),
                rules: Vec::new(),
            });
        } else if let Some(decl) = line.strip_prefix(':') {
            let Some(section) = current.as_mut() else {
                return Err(ParseError::RuleOutsideTable(line.to_string()));
            };
            let mut parts = decl.split_whitespace();
            let (Some(name), Some(policy)) = (parts.next(), parts.next()) else {
                return Err(ParseError::Malformed(line.to_string()));
            };
            section.chains.push(ChainDecl {
                name: name.to_string(),
                policy: policy.to_string(),
            });
        } else if line == "COMMIT" {
            if let Some(done) = current.take() {
                tables.push(done);
            }
        } else if line.starts_with("-A") {
            let Some(section) = current.as_mut() else {
                return Err(ParseError::RuleOutsideTable(line.to_string()));
            };
            let parsed = parse_rule(line, family, section.table)?;
            section.rules.push(parsed);
        } else {
            return Err(ParseError::Malformed(line.to_string()));
        }
    }
    if let Some(done) = current.take() {
        tables.push(done);
    }

    tracing::debug!(
        tables = tables.len(),
        rules = tables.iter().map(|t| t.rules.len()).sum::<usize>(),
        "parsed save dump"
    );
    Ok(SaveDump { family, tables })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compile::compile;
    use crate::core::schema::ToolCapabilities;
    use crate::validators::validate_rule;

    fn rule_of(json: serde_json::Value) -> Rule {
        let desc = serde_json::from_value(json).unwrap();
        validate_rule(&desc, &ToolCapabilities::latest()).unwrap()
    }

    fn round_trip(json: serde_json::Value) {
        let rule = rule_of(json);
        let line = compile(&rule).save_line();
        let parsed = parse_rule(&line, rule.family, rule.table).unwrap();
        assert!(!parsed.foreign, "round trip marked foreign: {line}");
        assert_eq!(parsed.rule, rule, "round trip diverged for: {line}");
    }

    #[test]
    fn test_round_trip_multiport_hop_limit() {
        round_trip(serde_json::json!({
            "name": "571 - test",
            "family": "ipv6",
            "proto": "tcp",
            "port": "571",
            "action": "accept",
            "hop_limit": "5"
        }));
    }

    #[test]
    fn test_round_trip_combined_modules() {
        round_trip(serde_json::json!({
            "name": "801 - ipt_modules tests",
            "family": "ipv6",
            "chain": "OUTPUT",
            "proto": "tcp",
            "dport": "8080",
            "action": "reject",
            "uid": 0,
            "gid": 404,
            "src_range": "2001::-2002::",
            "dst_range": "2003::-2004::",
            "src_type": "LOCAL",
            "dst_type": "UNICAST",
            "physdev_in": "eth0",
            "physdev_out": "eth1",
            "physdev_is_bridged": true
        }));
    }

    #[test]
    fn test_round_trip_addrtype_lists() {
        round_trip(serde_json::json!({
            "name": "619 - test",
            "family": "ipv6",
            "proto": "tcp",
            "action": "accept",
            "dst_type": ["LOCAL", "! LOCAL"]
        }));
    }

    #[test]
    fn test_round_trip_time_window() {
        round_trip(serde_json::json!({
            "name": "805 - test",
            "family": "ipv6",
            "chain": "OUTPUT",
            "proto": "tcp",
            "dport": "8080",
            "action": "accept",
            "date_start": "2016-01-19T04:17:07",
            "date_stop": "2038-01-19T04:17:07",
            "time_start": "6:00",
            "time_stop": "17:00:00",
            "month_days": "7",
            "week_days": "Tue",
            "kernel_timezone": true
        }));
    }

    #[test]
    fn test_round_trip_targets() {
        round_trip(serde_json::json!({
            "name": "611 - test",
            "family": "ipv6",
            "table": "mangle",
            "chain": "OUTPUT",
            "proto": "tcp",
            "port": "611",
            "jump": "MARK",
            "set_mark": "0x3e8/0xffffffff"
        }));
        round_trip(serde_json::json!({
            "name": "811 - tee_gateway6",
            "family": "ipv6",
            "table": "mangle",
            "chain": "PREROUTING",
            "proto": "all",
            "jump": "TEE",
            "gateway": "2001:db8::1"
        }));
        round_trip(serde_json::json!({
            "name": "576 - test",
            "family": "ipv6",
            "table": "mangle",
            "chain": "POSTROUTING",
            "proto": "udp",
            "outiface": "virbr0",
            "dport": "68",
            "jump": "CHECKSUM",
            "checksum_fill": true
        }));
    }

    #[test]
    fn test_round_trip_ipset_and_frag() {
        round_trip(serde_json::json!({
            "name": "612 - test",
            "family": "ipv6",
            "proto": "tcp",
            "action": "drop",
            "ipset": ["blacklist src,dst", "! honeypot dst"]
        }));
        round_trip(serde_json::json!({
            "name": "591 - test",
            "family": "ipv6",
            "proto": "tcp",
            "port": "591",
            "action": "accept",
            "isfirstfrag": true
        }));
    }

    #[test]
    fn test_round_trip_bare_socket_module() {
        round_trip(serde_json::json!({
            "name": "605 - test",
            "family": "ipv6",
            "proto": "tcp",
            "port": "605",
            "action": "accept",
            "socket": true
        }));
    }

    #[test]
    fn test_round_trip_negated_source() {
        round_trip(serde_json::json!({
            "name": "100 - no lan",
            "family": "ipv4",
            "proto": "tcp",
            "source": "! 10.0.0.0/8",
            "action": "drop"
        }));
    }

    #[test]
    fn test_clause_order_variation_same_model() {
        let canonical = "-A INPUT -p tcp -m multiport --ports 571 -m hl --hl-eq 5 \
                         -m comment --comment \"571 - test\" -j ACCEPT";
        let permuted = "-A INPUT -p tcp -m hl --hl-eq 5 -m multiport --ports 571 \
                        -m comment --comment \"571 - test\" -j ACCEPT";
        let a = parse_rule(canonical, Family::Ipv6, Table::Filter).unwrap();
        let b = parse_rule(permuted, Family::Ipv6, Table::Filter).unwrap();
        assert!(!a.foreign && !b.foreign);
        assert_eq!(a.rule, b.rule);
    }

    #[test]
    fn test_unknown_module_is_foreign() {
        let line = "-A INPUT -p tcp -m state --state NEW -j ACCEPT";
        let parsed = parse_rule(line, Family::Ipv4, Table::Filter).unwrap();
        assert!(parsed.foreign);
    }

    #[test]
    fn test_unknown_target_params_are_foreign() {
        let line = "-A INPUT -p tcp -j LOG --log-prefix \"x\"";
        let parsed = parse_rule(line, Family::Ipv4, Table::Filter).unwrap();
        assert!(parsed.foreign);
    }

    #[test]
    fn test_goto_is_foreign() {
        let line = "-A INPUT -p tcp -g SOMEWHERE";
        let parsed = parse_rule(line, Family::Ipv4, Table::Filter).unwrap();
        assert!(parsed.foreign);
    }

    #[test]
    fn test_value_side_negation_is_foreign() {
        // The other placement the original tool sometimes shows; tolerated
        // as input, but only as a foreign rule.
        let line = "-A INPUT -p tcp -m addrtype --dst-type ! MULTICAST -j ACCEPT";
        let parsed = parse_rule(line, Family::Ipv6, Table::Filter).unwrap();
        assert!(parsed.foreign);
    }

    #[test]
    fn test_user_chain_jump_parses() {
        let line = "-A INPUT -p tcp -m comment --comment \"20 - to app\" -j APP_CHAIN";
        let parsed = parse_rule(line, Family::Ipv4, Table::Filter).unwrap();
        assert!(!parsed.foreign);
        assert_eq!(
            parsed.rule.target,
            Some(Target::Jump("APP_CHAIN".to_string()))
        );
    }

    #[test]
    fn test_unmanaged_rule_has_no_name() {
        let line = "-A INPUT -p tcp -j ACCEPT";
        let parsed = parse_rule(line, Family::Ipv4, Table::Filter).unwrap();
        assert!(!parsed.foreign);
        assert_eq!(parsed.rule.name, "");
        assert_eq!(parsed.rule.position_key, None);
    }

    #[test]
    fn test_spec_args_reusable_for_delete() {
        let line = "-A INPUT -p tcp -m multiport --ports 571 -m comment \
                    --comment \"571 - test\" -j ACCEPT";
        let parsed = parse_rule(line, Family::Ipv6, Table::Filter).unwrap();
        assert_eq!(
            parsed.spec_args,
            vec![
                "-p",
                "tcp",
                "-m",
                "multiport",
                "--ports",
                "571",
                "-m",
                "comment",
                "--comment",
                "571 - test",
                "-j",
                "ACCEPT"
            ]
        );
    }

    #[test]
    fn test_parse_save_scopes_tables() {
        let dump = "\
# Generated by ip6tables-save
*mangle
:PREROUTING ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
-A POSTROUTING -o virbr0 -p udp -m multiport --dports 68 -m comment --comment \"576 - test\" -j CHECKSUM --checksum-fill
COMMIT
*filter
:INPUT ACCEPT [433:97137]
:FORWARD ACCEPT [0:0]
:OUTPUT ACCEPT [430:93834]
-A INPUT -p tcp -m multiport --ports 571 -m hl --hl-eq 5 -m comment --comment \"571 - test\" -j ACCEPT
-A INPUT -p tcp -m multiport --ports 605 -m socket -m comment --comment \"605 - test\" -j ACCEPT
COMMIT
";
        let save = parse_save(dump, Family::Ipv6).unwrap();
        assert_eq!(save.tables.len(), 2);
        assert_eq!(save.rules(Table::Filter).len(), 2);
        assert_eq!(save.rules(Table::Mangle).len(), 1);
        assert_eq!(
            save.table(Table::Filter).unwrap().chains[0],
            ChainDecl {
                name: "INPUT".to_string(),
                policy: "ACCEPT".to_string()
            }
        );
        assert!(save.rules(Table::Filter).iter().all(|r| !r.foreign));
    }

    #[test]
    fn test_parse_save_rejects_rule_before_table() {
        let dump = "-A INPUT -p tcp -j ACCEPT\n";
        let err = parse_save(dump, Family::Ipv4).unwrap_err();
        assert!(matches!(err, ParseError::RuleOutsideTable(_)));
    }

    #[test]
    fn test_parse_save_rejects_unknown_table() {
        let dump = "*gibberish\nCOMMIT\n";
        let err = parse_save(dump, Family::Ipv4).unwrap_err();
        assert!(matches!(err, ParseError::UnknownTable(_)));
    }
}
