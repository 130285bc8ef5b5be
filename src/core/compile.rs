//! Rule compiler: canonical model -> clause sequence -> argument tokens.
//!
//! Compilation is deterministic: clauses are ordered by the total module
//! priority from [`crate::core::schema`], flags inside a clause follow a
//! fixed per-module order, and list attributes expand in declaration order.
//! Compiling the same rule twice is byte-identical, which is what makes
//! dump comparison and idempotent reconciliation possible.
//!
//! Negation is always emitted as a standalone `!` token immediately before
//! the flag it negates (`-m addrtype ! --dst-type MULTICAST`,
//! `! -s 10.0.0.0/8`). The parser understands exactly this form.

use crate::core::rule::{Ensure, MatchValue, Protocol, Rule, Table, Target, Value};
use crate::core::schema::{MatchAttr, Module};

/// One flag inside a match clause, with its value tokens.
///
/// `values` holds zero tokens for bare flags (`--checksum-fill`), one for
/// ordinary flags, and two for flags like `--tcp-flags FIN,SYN ACK` or
/// `--match-set blacklist src,dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseFlag {
    pub negated: bool,
    pub name: &'static str,
    pub values: Vec<String>,
}

impl ClauseFlag {
    fn new(name: &'static str, value: &Value) -> Self {
        Self {
            negated: value.negated,
            name,
            values: vec![value.value.clone()],
        }
    }

    fn bare(name: &'static str) -> Self {
        Self {
            negated: false,
            name,
            values: Vec::new(),
        }
    }

    fn split(name: &'static str, value: &Value) -> Self {
        Self {
            negated: value.negated,
            name,
            values: value.value.split(' ').map(str::to_string).collect(),
        }
    }
}

/// One compiled match-module invocation (`-m <module> <flags...>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchClause {
    pub module: Module,
    pub flags: Vec<ClauseFlag>,
}

/// A base short flag emitted before any module clause (`-s`, `-d`, `-i`, `-o`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseFlag {
    pub negated: bool,
    pub flag: &'static str,
    pub value: String,
}

/// Fully compiled rule, ready to render as argv tokens or as a save line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub table: Table,
    pub chain: String,
    pub base: Vec<BaseFlag>,
    /// Protocol token for `-p`, absent for `all`
    pub protocol: Option<String>,
    pub clauses: Vec<MatchClause>,
    /// Target tokens starting with `-j`, empty for count-only rules
    pub target: Vec<String>,
}

impl CompiledRule {
    /// Tokens after `-A <chain>` — the shape shared by append, insert and
    /// delete invocations.
    pub fn spec_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for base in &self.base {
            if base.negated {
                args.push("!".to_string());
            }
            args.push(base.flag.to_string());
            args.push(base.value.clone());
        }
        if let Some(proto) = &self.protocol {
            args.push("-p".to_string());
            args.push(proto.clone());
        }
        for clause in &self.clauses {
            args.push("-m".to_string());
            args.push(clause.module.to_string());
            for flag in &clause.flags {
                if flag.negated {
                    args.push("!".to_string());
                }
                args.push(flag.name.to_string());
                args.extend(flag.values.iter().cloned());
            }
        }
        args.extend(self.target.iter().cloned());
        args
    }

    /// Full append invocation: `-A <chain> <spec...>`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-A".to_string(), self.chain.clone()];
        args.extend(self.spec_args());
        args
    }

    /// The line a save dump would show for this rule (comment quoted).
    pub fn save_line(&self) -> String {
        let mut out = String::new();
        out.push_str("-A ");
        out.push_str(&self.chain);
        for base in &self.base {
            if base.negated {
                out.push_str(" !");
            }
            out.push(' ');
            out.push_str(base.flag);
            out.push(' ');
            out.push_str(&base.value);
        }
        if let Some(proto) = &self.protocol {
            out.push_str(" -p ");
            out.push_str(proto);
        }
        for clause in &self.clauses {
            out.push_str(" -m ");
            out.push_str(clause.module.as_ref());
            let quoted = clause.module == Module::Comment;
            for flag in &clause.flags {
                if flag.negated {
                    out.push_str(" !");
                }
                out.push(' ');
                out.push_str(flag.name);
                for value in &flag.values {
                    out.push(' ');
                    if quoted {
                        out.push('"');
                        out.push_str(value);
                        out.push('"');
                    } else {
                        out.push_str(value);
                    }
                }
            }
        }
        for token in &self.target {
            out.push(' ');
            out.push_str(token);
        }
        out
    }
}

/// Compiles a validated rule into its canonical clause sequence.
///
/// Validation has already succeeded by the time a rule reaches this
/// function; an attribute without a module mapping cannot occur (the schema
/// is total over [`MatchAttr`]) and would be a programming error, not a
/// user-facing one.
pub fn compile(rule: &Rule) -> CompiledRule {
    debug_assert_eq!(
        rule.ensure,
        Ensure::Present,
        "absent rules are never compiled"
    );

    let mut base = Vec::new();
    for (attr, flag) in [
        (MatchAttr::Source, "-s"),
        (MatchAttr::Destination, "-d"),
        (MatchAttr::Iniface, "-i"),
        (MatchAttr::Outiface, "-o"),
    ] {
        if let Some(v) = rule.scalar(attr) {
            base.push(BaseFlag {
                negated: v.negated,
                flag,
                value: v.value.clone(),
            });
        }
    }

    let protocol = match rule.protocol {
        Protocol::All => None,
        p => Some(p.as_ref().to_string()),
    };

    let mut clauses = Vec::new();
    for module in modules_by_priority() {
        emit_module(rule, module, &mut clauses);
    }

    let target = target_tokens(rule.target.as_ref());

    tracing::debug!(
        rule = %rule.name,
        chain = %rule.chain,
        clauses = clauses.len(),
        "compiled rule"
    );

    CompiledRule {
        table: rule.table,
        chain: rule.chain.clone(),
        base,
        protocol,
        clauses,
        target,
    }
}

/// All modules in emission order.
fn modules_by_priority() -> Vec<Module> {
    use strum::IntoEnumIterator;
    let mut modules: Vec<Module> = Module::iter().collect();
    modules.sort_by_key(|m| m.priority());
    modules
}

fn emit_module(rule: &Rule, module: Module, clauses: &mut Vec<MatchClause>) {
    match module {
        Module::Tcp => {
            if let Some(v) = rule.scalar(MatchAttr::TcpFlags) {
                clauses.push(MatchClause {
                    module,
                    flags: vec![ClauseFlag::split("--tcp-flags", v)],
                });
            }
        }
        Module::Physdev => {
            let mut flags = Vec::new();
            if let Some(v) = rule.scalar(MatchAttr::PhysdevIn) {
                flags.push(ClauseFlag::new("--physdev-in", v));
            }
            if let Some(v) = rule.scalar(MatchAttr::PhysdevOut) {
                flags.push(ClauseFlag::new("--physdev-out", v));
            }
            if rule.flag(MatchAttr::PhysdevIsBridged) {
                flags.push(ClauseFlag::bare("--physdev-is-bridged"));
            }
            if !flags.is_empty() {
                clauses.push(MatchClause { module, flags });
            }
        }
        Module::Frag => {
            let first = rule.flag(MatchAttr::Isfirstfrag);
            let more = rule.flag(MatchAttr::Ishasmorefrags);
            let last = rule.flag(MatchAttr::Islastfrag);
            if first || more || last {
                let mut flags = vec![ClauseFlag {
                    negated: false,
                    name: "--fragid",
                    values: vec!["0".to_string()],
                }];
                if first {
                    flags.push(ClauseFlag::bare("--fragfirst"));
                }
                if more {
                    flags.push(ClauseFlag::bare("--fragmore"));
                }
                if last {
                    flags.push(ClauseFlag::bare("--fraglast"));
                }
                clauses.push(MatchClause { module, flags });
            }
        }
        Module::Iprange => {
            let mut flags = Vec::new();
            if let Some(v) = rule.scalar(MatchAttr::SrcRange) {
                flags.push(ClauseFlag::new("--src-range", v));
            }
            if let Some(v) = rule.scalar(MatchAttr::DstRange) {
                flags.push(ClauseFlag::new("--dst-range", v));
            }
            if !flags.is_empty() {
                clauses.push(MatchClause { module, flags });
            }
        }
        Module::Owner => {
            let mut flags = Vec::new();
            if let Some(v) = rule.scalar(MatchAttr::Uid) {
                flags.push(ClauseFlag::new("--uid-owner", v));
            }
            if let Some(v) = rule.scalar(MatchAttr::Gid) {
                flags.push(ClauseFlag::new("--gid-owner", v));
            }
            if !flags.is_empty() {
                clauses.push(MatchClause { module, flags });
            }
        }
        Module::Mac => {
            if let Some(v) = rule.scalar(MatchAttr::MacSource) {
                clauses.push(MatchClause {
                    module,
                    flags: vec![ClauseFlag::new("--mac-source", v)],
                });
            }
        }
        Module::Multiport => {
            for (attr, flag) in [
                (MatchAttr::Sport, "--sports"),
                (MatchAttr::Dport, "--dports"),
                (MatchAttr::Port, "--ports"),
            ] {
                if let Some(MatchValue::List(ports)) = rule.value(attr) {
                    let joined = ports
                        .iter()
                        .map(|p| p.value.as_str())
                        .collect::<Vec<_>>()
                        .join(",");
                    clauses.push(MatchClause {
                        module,
                        flags: vec![ClauseFlag {
                            negated: false,
                            name: flag,
                            values: vec![joined],
                        }],
                    });
                }
            }
        }
        Module::Addrtype => {
            let src = rule
                .value(MatchAttr::SrcType)
                .map_or(&[] as &[Value], MatchValue::elements);
            let dst = rule
                .value(MatchAttr::DstType)
                .map_or(&[] as &[Value], MatchValue::elements);
            if src.len() == 1 && dst.len() == 1 {
                // The live tool folds a single src/dst pair into one clause.
                clauses.push(MatchClause {
                    module,
                    flags: vec![
                        ClauseFlag::new("--src-type", &src[0]),
                        ClauseFlag::new("--dst-type", &dst[0]),
                    ],
                });
            } else {
                for v in src {
                    clauses.push(MatchClause {
                        module,
                        flags: vec![ClauseFlag::new("--src-type", v)],
                    });
                }
                for v in dst {
                    clauses.push(MatchClause {
                        module,
                        flags: vec![ClauseFlag::new("--dst-type", v)],
                    });
                }
            }
        }
        Module::Hl => {
            if let Some(v) = rule.scalar(MatchAttr::HopLimit) {
                clauses.push(MatchClause {
                    module,
                    flags: vec![ClauseFlag::new("--hl-eq", v)],
                });
            }
        }
        Module::Socket => {
            if rule.flag(MatchAttr::Socket) {
                clauses.push(MatchClause {
                    module,
                    flags: Vec::new(),
                });
            }
        }
        Module::Policy => {
            let mut flags = Vec::new();
            if let Some(v) = rule.scalar(MatchAttr::IpsecDir) {
                flags.push(ClauseFlag::new("--dir", v));
            }
            if let Some(v) = rule.scalar(MatchAttr::IpsecPolicy) {
                flags.push(ClauseFlag::new("--pol", v));
            }
            if !flags.is_empty() {
                clauses.push(MatchClause { module, flags });
            }
        }
        Module::Set => {
            if let Some(MatchValue::List(sets)) = rule.value(MatchAttr::Ipset) {
                for v in sets {
                    clauses.push(MatchClause {
                        module,
                        flags: vec![ClauseFlag::split("--match-set", v)],
                    });
                }
            }
        }
        Module::Time => {
            let mut flags = Vec::new();
            for (attr, flag) in [
                (MatchAttr::TimeStart, "--timestart"),
                (MatchAttr::TimeStop, "--timestop"),
                (MatchAttr::MonthDays, "--monthdays"),
                (MatchAttr::WeekDays, "--weekdays"),
                (MatchAttr::DateStart, "--datestart"),
                (MatchAttr::DateStop, "--datestop"),
            ] {
                if let Some(v) = rule.scalar(attr) {
                    flags.push(ClauseFlag::new(flag, v));
                }
            }
            if rule.flag(MatchAttr::KernelTimezone) {
                flags.push(ClauseFlag::bare("--kerneltz"));
            }
            if !flags.is_empty() {
                clauses.push(MatchClause { module, flags });
            }
        }
        Module::Comment => {
            clauses.push(MatchClause {
                module,
                flags: vec![ClauseFlag {
                    negated: false,
                    name: "--comment",
                    values: vec![rule.name.clone()],
                }],
            });
        }
    }
}

fn target_tokens(target: Option<&Target>) -> Vec<String> {
    let Some(target) = target else {
        return Vec::new();
    };
    let jump = |t: &str| vec!["-j".to_string(), t.to_string()];
    match target {
        Target::Accept => jump("ACCEPT"),
        Target::Drop => jump("DROP"),
        Target::Reject { with } => {
            let mut tokens = jump("REJECT");
            tokens.push("--reject-with".to_string());
            tokens.push(with.to_string());
            tokens
        }
        Target::Mark { value, mask } => {
            let mut tokens = jump("MARK");
            tokens.push("--set-xmark".to_string());
            tokens.push(format!("{value:#x}/{mask:#x}"));
            tokens
        }
        Target::Checksum { fill } => {
            let mut tokens = jump("CHECKSUM");
            if *fill {
                tokens.push("--checksum-fill".to_string());
            }
            tokens
        }
        Target::Tee { gateway } => {
            let mut tokens = jump("TEE");
            tokens.push("--gateway".to_string());
            tokens.push(gateway.to_string());
            tokens
        }
        Target::Jump(chain) => jump(chain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ToolCapabilities;
    use crate::validators::validate_rule;

    fn compiled(json: serde_json::Value) -> CompiledRule {
        let desc = serde_json::from_value(json).unwrap();
        let rule = validate_rule(&desc, &ToolCapabilities::latest()).unwrap();
        compile(&rule)
    }

    #[test]
    fn test_multiport_and_hop_limit_line() {
        let line = compiled(serde_json::json!({
            "name": "571 - test",
            "family": "ipv6",
            "proto": "tcp",
            "port": "571",
            "action": "accept",
            "hop_limit": "5"
        }))
        .save_line();
        assert_eq!(
            line,
            "-A INPUT -p tcp -m multiport --ports 571 -m hl --hl-eq 5 \
             -m comment --comment \"571 - test\" -j ACCEPT"
        );
    }

    #[test]
    fn test_checksum_fill_line() {
        let line = compiled(serde_json::json!({
            "name": "576 - test",
            "family": "ipv6",
            "table": "mangle",
            "chain": "POSTROUTING",
            "proto": "udp",
            "outiface": "virbr0",
            "dport": "68",
            "jump": "CHECKSUM",
            "checksum_fill": true
        }))
        .save_line();
        assert_eq!(
            line,
            "-A POSTROUTING -o virbr0 -p udp -m multiport --dports 68 \
             -m comment --comment \"576 - test\" -j CHECKSUM --checksum-fill"
        );
    }

    #[test]
    fn test_frag_before_multiport() {
        let line = compiled(serde_json::json!({
            "name": "587 - test",
            "family": "ipv6",
            "proto": "tcp",
            "port": "587",
            "action": "accept",
            "ishasmorefrags": true
        }))
        .save_line();
        assert_eq!(
            line,
            "-A INPUT -p tcp -m frag --fragid 0 --fragmore -m multiport --ports 587 \
             -m comment --comment \"587 - test\" -j ACCEPT"
        );
    }

    #[test]
    fn test_combined_modules_ordering() {
        let line = compiled(serde_json::json!({
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
        }))
        .save_line();
        assert_eq!(
            line,
            "-A OUTPUT -p tcp -m physdev --physdev-in eth0 --physdev-out eth1 \
             --physdev-is-bridged -m iprange --src-range 2001::-2002:: \
             --dst-range 2003::-2004:: -m owner --uid-owner 0 --gid-owner 404 \
             -m multiport --dports 8080 -m addrtype --src-type LOCAL --dst-type UNICAST \
             -m comment --comment \"801 - ipt_modules tests\" \
             -j REJECT --reject-with icmp6-port-unreachable"
        );
    }

    #[test]
    fn test_addrtype_list_one_clause_per_element() {
        let line = compiled(serde_json::json!({
            "name": "619 - test",
            "family": "ipv6",
            "proto": "tcp",
            "action": "accept",
            "dst_type": ["LOCAL", "! LOCAL"]
        }))
        .save_line();
        assert_eq!(
            line,
            "-A INPUT -p tcp -m addrtype --dst-type LOCAL -m addrtype ! --dst-type LOCAL \
             -m comment --comment \"619 - test\" -j ACCEPT"
        );
    }

    #[test]
    fn test_negated_scalar_marker_before_flag() {
        let line = compiled(serde_json::json!({
            "name": "615 - test inversion",
            "family": "ipv6",
            "proto": "tcp",
            "action": "accept",
            "dst_type": "! MULTICAST"
        }))
        .save_line();
        assert_eq!(
            line,
            "-A INPUT -p tcp -m addrtype ! --dst-type MULTICAST \
             -m comment --comment \"615 - test inversion\" -j ACCEPT"
        );
    }

    #[test]
    fn test_negation_symmetry_only_marker_differs() {
        let plain = compiled(serde_json::json!({
            "name": "614 - test",
            "family": "ipv6",
            "proto": "tcp",
            "action": "accept",
            "src_type": "MULTICAST"
        }));
        let negated = compiled(serde_json::json!({
            "name": "614 - test",
            "family": "ipv6",
            "proto": "tcp",
            "action": "accept",
            "src_type": "! MULTICAST"
        }));
        let plain_tokens = plain.args();
        let negated_tokens: Vec<String> = negated
            .args()
            .into_iter()
            .filter(|t| t != "!")
            .collect();
        assert_eq!(plain_tokens, negated_tokens);
    }

    #[test]
    fn test_ipset_clause_per_element() {
        let line = compiled(serde_json::json!({
            "name": "612 - test",
            "family": "ipv6",
            "proto": "tcp",
            "action": "drop",
            "ipset": ["blacklist src,dst", "! honeypot dst"]
        }))
        .save_line();
        assert_eq!(
            line,
            "-A INPUT -p tcp -m set --match-set blacklist src,dst \
             -m set ! --match-set honeypot dst -m comment --comment \"612 - test\" -j DROP"
        );
    }

    #[test]
    fn test_time_window_flag_order() {
        let line = compiled(serde_json::json!({
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
        }))
        .save_line();
        assert_eq!(
            line,
            "-A OUTPUT -p tcp -m multiport --dports 8080 -m time --timestart 06:00:00 \
             --timestop 17:00:00 --monthdays 7 --weekdays Tue --datestart 2016-01-19T04:17:07 \
             --datestop 2038-01-19T04:17:07 --kerneltz \
             -m comment --comment \"805 - test\" -j ACCEPT"
        );
    }

    #[test]
    fn test_tee_gateway_with_proto_all() {
        let line = compiled(serde_json::json!({
            "name": "811 - tee_gateway6",
            "family": "ipv6",
            "table": "mangle",
            "chain": "PREROUTING",
            "proto": "all",
            "jump": "TEE",
            "gateway": "2001:db8::1"
        }))
        .save_line();
        assert_eq!(
            line,
            "-A PREROUTING -m comment --comment \"811 - tee_gateway6\" \
             -j TEE --gateway 2001:db8::1"
        );
    }

    #[test]
    fn test_mark_target_tokens() {
        let line = compiled(serde_json::json!({
            "name": "611 - test",
            "family": "ipv6",
            "table": "mangle",
            "chain": "OUTPUT",
            "proto": "tcp",
            "port": "611",
            "jump": "MARK",
            "set_mark": "0x3e8/0xffffffff"
        }))
        .save_line();
        assert_eq!(
            line,
            "-A OUTPUT -p tcp -m multiport --ports 611 -m comment --comment \"611 - test\" \
             -j MARK --set-xmark 0x3e8/0xffffffff"
        );
    }

    #[test]
    fn test_count_only_rule_has_no_target() {
        let line = compiled(serde_json::json!({
            "name": "604 - test",
            "family": "ipv6",
            "source": "2001:db8::1/128",
            "mac_source": "0A:1B:3C:4D:5E:6F"
        }))
        .save_line();
        assert_eq!(
            line,
            "-A INPUT -s 2001:db8::1/128 -p tcp -m mac --mac-source 0A:1B:3C:4D:5E:6F \
             -m comment --comment \"604 - test\""
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        let make = || {
            compiled(serde_json::json!({
                "name": "801 - ipt_modules tests",
                "family": "ipv6",
                "chain": "OUTPUT",
                "proto": "tcp",
                "dport": "8080",
                "action": "reject",
                "uid": 0,
                "src_type": "LOCAL",
                "physdev_in": "eth0"
            }))
        };
        assert_eq!(make().save_line(), make().save_line());
        assert_eq!(make().args(), make().args());
    }

    #[test]
    fn test_socket_module_is_bare() {
        let line = compiled(serde_json::json!({
            "name": "605 - test",
            "family": "ipv6",
            "proto": "tcp",
            "port": "605",
            "action": "accept",
            "socket": true
        }))
        .save_line();
        assert_eq!(
            line,
            "-A INPUT -p tcp -m multiport --ports 605 -m socket \
             -m comment --comment \"605 - test\" -j ACCEPT"
        );
    }

    #[test]
    fn test_policy_clause_flag_order() {
        let line = compiled(serde_json::json!({
            "name": "607 - test",
            "family": "ipv6",
            "chain": "OUTPUT",
            "proto": "all",
            "destination": "2001:db8::1/128",
            "ipsec_dir": "out",
            "ipsec_policy": "ipsec",
            "action": "reject",
            "reject": "icmp6-adm-prohibited"
        }))
        .save_line();
        assert_eq!(
            line,
            "-A OUTPUT -d 2001:db8::1/128 -m policy --dir out --pol ipsec \
             -m comment --comment \"607 - test\" -j REJECT --reject-with icmp6-adm-prohibited"
        );
    }
}
