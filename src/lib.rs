//! iptrc - iptables rule compiler and reconciliation planner
//!
//! iptrc translates declarative descriptions of desired packet-filtering
//! rules into the exact argument sequences iptables/ip6tables expect,
//! parses existing save-format dumps back into the same model, and computes
//! the minimal set of insert/remove operations to reconcile live state with
//! desired state.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, compiler, parser and reconciliation planner
//! - [`validators`] - Attribute validation and normalization
//!
//! # Guarantees
//!
//! - Compiling a rule twice yields byte-identical output (total module
//!   ordering, fixed per-module flag order).
//! - `parse(compile(r)) == r` for every rule the compiler accepts.
//! - Planning against the reparse of the plan's own output is all-noop.
//! - Validation error messages are stable text, matched literally by
//!   callers.
//!
//! iptrc never invokes the packet-filter tool; dump acquisition and plan
//! application are the caller's responsibility.

pub mod core;
pub mod validators;

// Re-export commonly used types
pub use core::compile::{compile, CompiledRule, MatchClause};
pub use core::error::{Error, ParseError, Result, ValidationError};
pub use core::parse::{parse_rule, parse_save, ParsedRule, SaveDump};
pub use core::plan::{drift_diff, plan, Plan, PlanAction};
pub use core::rule::{Ensure, Family, Protocol, Rule, RuleDescriptor, Table, Target};
pub use core::schema::{MatchAttr, Module, ToolCapabilities};
pub use validators::validate_rule;
