//! iptrc - iptables rule compiler and reconciliation planner
//!
//! Thin CLI over the library for working with rule descriptor files and
//! save-format dumps offline. It never invokes iptables itself.
//!
//! # Usage
//!
//! ```bash
//! iptrc compile rules.json                      # print compiled save lines
//! iptrc check rules.json                        # validate only
//! iptrc plan rules.json dump.txt --family ipv6  # reconciliation plan
//! iptrc diff rules.json dump.txt --family ipv6  # textual drift report
//! ```
//!
//! Rule files are JSON arrays of rule descriptors, the same shape a
//! manifest front end would hand over.

use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use iptrc::core::plan::PlanAction;
use iptrc::core::rule::{Ensure, Family, Rule, RuleDescriptor, Table};
use iptrc::core::schema::ToolCapabilities;
use iptrc::validators::validate_rule;

#[derive(Parser)]
#[command(name = "iptrc")]
#[command(about = "iptables rule compiler and reconciliation planner", long_about = None)]
struct Cli {
    /// Version of the target iptables toolchain (affects validation)
    #[arg(long, value_name = "X.Y.Z", global = true)]
    tool_version: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile rule descriptors into save-format lines
    Compile {
        /// JSON file with an array of rule descriptors
        rules: String,
    },
    /// Validate rule descriptors without compiling
    Check {
        /// JSON file with an array of rule descriptors
        rules: String,
    },
    /// Plan the reconciliation of desired rules against a live dump
    Plan {
        /// JSON file with an array of rule descriptors
        rules: String,
        /// Save-format dump of the live rule set
        dump: String,
        /// Protocol family of the dump
        #[arg(short, long, default_value = "ipv4")]
        family: String,
        /// Restrict planning to one table
        #[arg(short, long)]
        table: Option<String>,
    },
    /// Show a line diff between the live dump and the desired rules
    Diff {
        /// JSON file with an array of rule descriptors
        rules: String,
        /// Save-format dump of the live rule set
        dump: String,
        /// Protocol family of the dump
        #[arg(short, long, default_value = "ipv4")]
        family: String,
        /// Restrict the diff to one table
        #[arg(short, long)]
        table: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let caps = match cli.tool_version.as_deref() {
        Some(raw) => match ToolCapabilities::from_str(raw) {
            Ok(caps) => caps,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => ToolCapabilities::latest(),
    };

    match handle_cli(cli.command, &caps) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_rules(
    path: &str,
    caps: &ToolCapabilities,
) -> Result<Vec<Rule>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let descriptors: Vec<RuleDescriptor> = serde_json::from_str(&text)?;
    let mut rules = Vec::with_capacity(descriptors.len());
    for desc in &descriptors {
        let rule = validate_rule(desc, caps)
            .map_err(|e| format!("{}: {} (attribute {})", desc.name, e, e.attribute))?;
        rules.push(rule);
    }
    tracing::info!(count = rules.len(), file = path, "loaded rule descriptors");
    Ok(rules)
}

fn parse_family(raw: &str) -> Result<Family, Box<dyn std::error::Error>> {
    Family::from_str(raw).map_err(|_| format!("invalid family \"{raw}\" (ipv4 or ipv6)").into())
}

/// Tables that the given desired rules touch, in stable order.
fn tables_of(rules: &[Rule], only: Option<&str>) -> Result<Vec<Table>, Box<dyn std::error::Error>> {
    if let Some(raw) = only {
        let table =
            Table::from_str(raw).map_err(|_| format!("invalid table \"{raw}\""))?;
        return Ok(vec![table]);
    }
    let mut tables: Vec<Table> = rules.iter().map(|r| r.table).collect();
    tables.sort_unstable();
    tables.dedup();
    Ok(tables)
}

fn handle_cli(
    command: Commands,
    caps: &ToolCapabilities,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Compile { rules } => {
            for rule in load_rules(&rules, caps)? {
                if rule.ensure == Ensure::Present {
                    println!("{}", iptrc::compile(&rule).save_line());
                }
            }
        }
        Commands::Check { rules } => {
            let count = load_rules(&rules, caps)?.len();
            println!("{count} rules valid");
        }
        Commands::Plan {
            rules,
            dump,
            family,
            table,
        } => {
            let family = parse_family(&family)?;
            let desired = load_rules(&rules, caps)?;
            let dump_text = std::fs::read_to_string(&dump)?;
            let save = iptrc::parse_save(&dump_text, family)?;

            for table in tables_of(&desired, table.as_deref())? {
                let unit: Vec<Rule> = desired
                    .iter()
                    .filter(|r| r.table == table && r.family == family)
                    .cloned()
                    .collect();
                if unit.is_empty() {
                    continue;
                }
                let plan = iptrc::plan(&unit, save.rules(table), table, family);
                println!("# table {table}");
                for action in &plan.actions {
                    match action {
                        PlanAction::Noop { name } => println!("noop   {name}"),
                        PlanAction::Insert {
                            name,
                            position,
                            compiled,
                        } => {
                            println!("insert {name} @ {}:{position}", compiled.chain);
                        }
                        PlanAction::Remove { name, chain, .. } => {
                            println!("remove {name} ({chain})");
                        }
                    }
                }
                for argv in plan.argv() {
                    println!("  {}", argv.join(" "));
                }
            }
        }
        Commands::Diff {
            rules,
            dump,
            family,
            table,
        } => {
            let family = parse_family(&family)?;
            let desired = load_rules(&rules, caps)?;
            let dump_text = std::fs::read_to_string(&dump)?;
            let save = iptrc::parse_save(&dump_text, family)?;

            for table in tables_of(&desired, table.as_deref())? {
                let unit: Vec<Rule> = desired
                    .iter()
                    .filter(|r| r.table == table && r.family == family)
                    .cloned()
                    .collect();
                if unit.is_empty() {
                    continue;
                }
                println!("# table {table}");
                print!("{}", iptrc::drift_diff(&unit, save.rules(table)));
            }
        }
    }
    Ok(())
}
