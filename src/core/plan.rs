//! Reconciliation planner: desired rules + parsed live rules -> action plan.
//!
//! The planner works on one table+family unit at a time and is a pure
//! function of its inputs. It never reorders existing rules; new rules are
//! inserted immediately after the nearest lower-numbered managed rule of
//! their chain, which keeps interleaved unmanaged rules where they are.
//!
//! Matching is by rule name (the comment is the identity key); the
//! noop-or-drift decision then compares canonical structures. Foreign rules
//! match nothing, so an unsupported live line is repaired by removal and
//! reinsertion rather than silently trusted.

use std::collections::BTreeMap;

use crate::core::compile::{compile, CompiledRule};
use crate::core::parse::ParsedRule;
use crate::core::rule::{Ensure, Family, Rule, Table};

/// One step of a reconciliation plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    /// The live chain already holds a structurally equal rule.
    Noop { name: String },
    /// Insert the compiled rule at a 1-based position in its chain.
    Insert {
        name: String,
        position: usize,
        compiled: CompiledRule,
    },
    /// Delete a live rule by its full specification.
    Remove {
        name: String,
        chain: String,
        spec_args: Vec<String>,
    },
}

impl PlanAction {
    /// Argument vector for the control tool, or `None` for a noop.
    pub fn argv(&self, table: Table) -> Option<Vec<String>> {
        match self {
            PlanAction::Noop { .. } => None,
            PlanAction::Insert {
                position, compiled, ..
            } => {
                let mut args = vec![
                    "-t".to_string(),
                    table.to_string(),
                    "-I".to_string(),
                    compiled.chain.clone(),
                    position.to_string(),
                ];
                args.extend(compiled.spec_args());
                Some(args)
            }
            PlanAction::Remove {
                chain, spec_args, ..
            } => {
                let mut args = vec![
                    "-t".to_string(),
                    table.to_string(),
                    "-D".to_string(),
                    chain.clone(),
                ];
                args.extend(spec_args.iter().cloned());
                Some(args)
            }
        }
    }
}

/// Ordered action plan for one table+family unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub table: Table,
    pub family: Family,
    pub actions: Vec<PlanAction>,
}

impl Plan {
    /// True when applying the plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.actions
            .iter()
            .all(|a| matches!(a, PlanAction::Noop { .. }))
    }

    /// The argument vectors to hand to the tool-invocation layer, in order.
    /// Strictly sequential within this unit: each insert position depends
    /// on the chain state left behind by the previous action.
    pub fn argv(&self) -> Vec<Vec<String>> {
        self.actions
            .iter()
            .filter_map(|a| a.argv(self.table))
            .collect()
    }
}

/// Live chain state used to simulate the effect of planned actions, so
/// later insert positions account for earlier inserts and removals.
struct WorkEntry {
    name: String,
    key: Option<u32>,
    rule: Rule,
    foreign: bool,
    spec_args: Vec<String>,
}

/// Computes the reconciliation plan for one table+family unit.
///
/// `observed` must come from a dump of the same table and family (see
/// [`crate::core::parse::SaveDump::rules`]).
pub fn plan(desired: &[Rule], observed: &[ParsedRule], table: Table, family: Family) -> Plan {
    let mut chains: BTreeMap<String, Vec<WorkEntry>> = BTreeMap::new();
    for parsed in observed {
        chains
            .entry(parsed.rule.chain.clone())
            .or_default()
            .push(WorkEntry {
                name: parsed.rule.name.clone(),
                key: parsed.rule.position_key,
                rule: parsed.rule.clone(),
                foreign: parsed.foreign,
                spec_args: parsed.spec_args.clone(),
            });
    }

    let mut actions = Vec::new();
    for rule in desired {
        debug_assert_eq!(rule.table, table, "rule {} belongs to another table", rule.name);
        debug_assert_eq!(rule.family, family, "rule {} belongs to another family", rule.name);

        let entries = chains.entry(rule.chain.clone()).or_default();
        let found = entries
            .iter()
            .position(|e| !e.name.is_empty() && e.name == rule.name);

        match rule.ensure {
            Ensure::Present => {
                if let Some(idx) = found {
                    let entry = &entries[idx];
                    if !entry.foreign && entry.rule == *rule {
                        actions.push(PlanAction::Noop {
                            name: rule.name.clone(),
                        });
                        continue;
                    }
                    // Same name, different substance: repair the drift.
                    let removed = entries.remove(idx);
                    actions.push(PlanAction::Remove {
                        name: removed.name,
                        chain: rule.chain.clone(),
                        spec_args: removed.spec_args,
                    });
                }
                let position = insert_position(entries, rule.position_key);
                let compiled = compile(rule);
                actions.push(PlanAction::Insert {
                    name: rule.name.clone(),
                    position,
                    compiled: compiled.clone(),
                });
                entries.insert(
                    position - 1,
                    WorkEntry {
                        name: rule.name.clone(),
                        key: rule.position_key,
                        rule: rule.clone(),
                        foreign: false,
                        spec_args: compiled.spec_args(),
                    },
                );
            }
            Ensure::Absent => {
                if let Some(idx) = found {
                    let removed = entries.remove(idx);
                    actions.push(PlanAction::Remove {
                        name: removed.name,
                        chain: rule.chain.clone(),
                        spec_args: removed.spec_args,
                    });
                } else {
                    actions.push(PlanAction::Noop {
                        name: rule.name.clone(),
                    });
                }
            }
        }
    }

    let inserts = actions
        .iter()
        .filter(|a| matches!(a, PlanAction::Insert { .. }))
        .count();
    let removes = actions
        .iter()
        .filter(|a| matches!(a, PlanAction::Remove { .. }))
        .count();
    tracing::debug!(%table, %family, inserts, removes, total = actions.len(), "computed plan");

    Plan {
        table,
        family,
        actions,
    }
}

/// 1-based insert position: immediately after the last entry whose ordering
/// key is strictly lower, or at chain head when there is none. Entries
/// without keys (foreign or hand-added rules) are never displaced — a rule
/// without a key of its own appends at the end.
fn insert_position(entries: &[WorkEntry], key: Option<u32>) -> usize {
    let Some(key) = key else {
        return entries.len() + 1;
    };
    let mut position = 1;
    for (idx, entry) in entries.iter().enumerate() {
        if let Some(entry_key) = entry.key
            && entry_key < key
        {
            position = idx + 2;
        }
    }
    position
}

/// Line diff between the live rules and what the desired set compiles to,
/// for drift reports. `-` lines exist only live, `+` lines only desired.
pub fn drift_diff(desired: &[Rule], observed: &[ParsedRule]) -> String {
    let live_text: String = observed
        .iter()
        .map(|p| format!("{}\n", p.raw))
        .collect();
    let desired_text: String = desired
        .iter()
        .filter(|r| r.ensure == Ensure::Present)
        .map(|r| format!("{}\n", compile(r).save_line()))
        .collect();

    let diff = similar::TextDiff::from_lines(&live_text, &desired_text);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        out.push_str(sign);
        out.push_str(change.value());
        if !change.value().ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parse::{parse_rule, parse_save};
    use crate::core::schema::ToolCapabilities;
    use crate::validators::validate_rule;

    fn rule_of(json: serde_json::Value) -> Rule {
        let desc = serde_json::from_value(json).unwrap();
        validate_rule(&desc, &ToolCapabilities::latest()).unwrap()
    }

    fn accept_rule(name: &str, port: &str) -> Rule {
        rule_of(serde_json::json!({
            "name": name,
            "family": "ipv6",
            "proto": "tcp",
            "port": port,
            "action": "accept"
        }))
    }

    fn dump_of(rules: &[Rule]) -> String {
        let lines: Vec<String> = rules.iter().map(|r| compile(r).save_line()).collect();
        format!(
            "*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n{}\nCOMMIT\n",
            lines.join("\n")
        )
    }

    #[test]
    fn test_plan_into_empty_chain_inserts_at_head() {
        let desired = vec![accept_rule("100 - ssh", "22")];
        let p = plan(&desired, &[], Table::Filter, Family::Ipv6);
        assert_eq!(p.actions.len(), 1);
        assert!(matches!(
            &p.actions[0],
            PlanAction::Insert { position: 1, .. }
        ));
    }

    #[test]
    fn test_plan_is_idempotent_against_own_output() {
        let desired = vec![
            accept_rule("100 - ssh", "22"),
            accept_rule("200 - http", "80"),
            accept_rule("300 - https", "443"),
        ];
        let dump = dump_of(&desired);
        let save = parse_save(&dump, Family::Ipv6).unwrap();
        let p = plan(&desired, save.rules(Table::Filter), Table::Filter, Family::Ipv6);
        assert!(p.is_noop(), "expected all-noop plan, got {:?}", p.actions);
        assert!(p.argv().is_empty());
    }

    #[test]
    fn test_plan_inserts_between_numeric_neighbors() {
        let observed_rules = vec![
            accept_rule("100 - ssh", "22"),
            accept_rule("300 - https", "443"),
        ];
        let dump = dump_of(&observed_rules);
        let save = parse_save(&dump, Family::Ipv6).unwrap();

        let desired = vec![
            accept_rule("100 - ssh", "22"),
            accept_rule("200 - http", "80"),
            accept_rule("300 - https", "443"),
        ];
        let p = plan(&desired, save.rules(Table::Filter), Table::Filter, Family::Ipv6);
        let inserts: Vec<_> = p
            .actions
            .iter()
            .filter_map(|a| match a {
                PlanAction::Insert { name, position, .. } => Some((name.clone(), *position)),
                _ => None,
            })
            .collect();
        assert_eq!(inserts, vec![("200 - http".to_string(), 2)]);
    }

    #[test]
    fn test_plan_insert_below_all_keys_goes_to_head() {
        let observed_rules = vec![accept_rule("100 - ssh", "22")];
        let dump = dump_of(&observed_rules);
        let save = parse_save(&dump, Family::Ipv6).unwrap();

        let desired = vec![
            accept_rule("050 - early", "25"),
            accept_rule("100 - ssh", "22"),
        ];
        let p = plan(&desired, save.rules(Table::Filter), Table::Filter, Family::Ipv6);
        assert!(matches!(
            &p.actions[0],
            PlanAction::Insert { position: 1, .. }
        ));
        assert!(matches!(&p.actions[1], PlanAction::Noop { .. }));
    }

    #[test]
    fn test_plan_repairs_drift_with_remove_then_insert() {
        let observed_rules = vec![accept_rule("100 - ssh", "2222")];
        let dump = dump_of(&observed_rules);
        let save = parse_save(&dump, Family::Ipv6).unwrap();

        let desired = vec![accept_rule("100 - ssh", "22")];
        let p = plan(&desired, save.rules(Table::Filter), Table::Filter, Family::Ipv6);
        assert_eq!(p.actions.len(), 2);
        assert!(matches!(&p.actions[0], PlanAction::Remove { name, .. } if name == "100 - ssh"));
        assert!(matches!(&p.actions[1], PlanAction::Insert { .. }));
    }

    #[test]
    fn test_plan_removes_absent_rule() {
        let observed_rules = vec![accept_rule("100 - ssh", "22")];
        let dump = dump_of(&observed_rules);
        let save = parse_save(&dump, Family::Ipv6).unwrap();

        let mut gone = accept_rule("100 - ssh", "22");
        gone.ensure = Ensure::Absent;
        let p = plan(&[gone], save.rules(Table::Filter), Table::Filter, Family::Ipv6);
        assert_eq!(p.actions.len(), 1);
        assert!(matches!(&p.actions[0], PlanAction::Remove { .. }));

        // Second run against the emptied chain: nothing left to do.
        let p2 = plan(
            &[{
                let mut r = accept_rule("100 - ssh", "22");
                r.ensure = Ensure::Absent;
                r
            }],
            &[],
            Table::Filter,
            Family::Ipv6,
        );
        assert!(p2.is_noop());
    }

    #[test]
    fn test_foreign_rule_with_matching_name_forces_reinsert() {
        // Same name, but the live line uses an unsupported module; it must
        // never count as a match.
        let line = "-A INPUT -p tcp -m state --state NEW -m comment \
                    --comment \"100 - ssh\" -j ACCEPT";
        let parsed = parse_rule(line, Family::Ipv6, Table::Filter).unwrap();
        assert!(parsed.foreign);

        let desired = vec![accept_rule("100 - ssh", "22")];
        let p = plan(&desired, &[parsed], Table::Filter, Family::Ipv6);
        assert_eq!(p.actions.len(), 2);
        assert!(matches!(&p.actions[0], PlanAction::Remove { .. }));
        assert!(matches!(&p.actions[1], PlanAction::Insert { .. }));
    }

    #[test]
    fn test_unmanaged_rules_are_not_displaced() {
        let unmanaged = parse_rule("-A INPUT -i lo -j ACCEPT", Family::Ipv6, Table::Filter)
            .unwrap();
        let managed = parse_rule(
            &compile(&accept_rule("100 - ssh", "22")).save_line(),
            Family::Ipv6,
            Table::Filter,
        )
        .unwrap();

        let desired = vec![
            accept_rule("100 - ssh", "22"),
            accept_rule("200 - http", "80"),
        ];
        let p = plan(
            &desired,
            &[unmanaged, managed],
            Table::Filter,
            Family::Ipv6,
        );
        // 100 is a noop; 200 inserts after it (position 3, behind the
        // unmanaged loopback rule at position 1).
        assert!(matches!(&p.actions[0], PlanAction::Noop { .. }));
        assert!(matches!(
            &p.actions[1],
            PlanAction::Insert { position: 3, .. }
        ));
    }

    #[test]
    fn test_plan_argv_shapes() {
        let desired = vec![accept_rule("100 - ssh", "22")];
        let p = plan(&desired, &[], Table::Filter, Family::Ipv6);
        let argv = p.argv();
        assert_eq!(argv.len(), 1);
        assert_eq!(
            argv[0][..5],
            [
                "-t".to_string(),
                "filter".to_string(),
                "-I".to_string(),
                "INPUT".to_string(),
                "1".to_string()
            ]
        );
        assert!(argv[0].contains(&"--comment".to_string()));
        assert_eq!(argv[0].last().unwrap(), "ACCEPT");
    }

    #[test]
    fn test_drift_diff_marks_changed_lines() {
        let observed_rules = vec![accept_rule("100 - ssh", "2222")];
        let dump = dump_of(&observed_rules);
        let save = parse_save(&dump, Family::Ipv6).unwrap();
        let desired = vec![accept_rule("100 - ssh", "22")];

        let diff = drift_diff(&desired, save.rules(Table::Filter));
        assert!(diff.contains("- -A INPUT -p tcp -m multiport --ports 2222"));
        assert!(diff.contains("+ -A INPUT -p tcp -m multiport --ports 22"));
    }
}
