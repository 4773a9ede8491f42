//! Scenario files: the nodes of a network, the trust lines between them and the steps to run.
//!
//! ```yaml
//! nodes: [alice, bob, carol]
//! links:
//!   - { from: alice, to: bob, forward: 100 }
//!   - { from: bob, to: carol, forward: 100, backward: 50, debt: -20 }
//! steps:
//!   - { action: pay, from: alice, to: carol, amount: 60 }
//!   - { action: close_cycles, node: carol }
//! ```

use crate::error::CliError;
use crate::settings::Settings;
use credit_net::LocalNetworkBuilder;
use libcredit::paths::Path as PaymentPath;
use libcredit::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Link {
    pub from: String,
    pub to: String,
    /// Most `from` may owe `to`.
    pub forward: u64,
    /// Most `to` may owe `from`.
    #[serde(default)]
    pub backward: u64,
    /// What `from` already owes `to`. Negative when `to` owes `from`.
    #[serde(default)]
    pub debt: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Pay { from: String, to: String, amount: u64 },
    /// Discover every debt cycle through `node` and close them one after another.
    CloseCycles { node: String },
    CloseCycle { cycle: Vec<String> },
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Pay { from, to, amount } => write!(f, "{from} pays {amount} to {to}"),
            Step::CloseCycles { node } => write!(f, "{node} closes its debt cycles"),
            Step::CloseCycle { cycle } => write!(f, "close {}", cycle.join(" -> ")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Scenario {
    pub nodes: Vec<String>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn try_load<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let scenario: Scenario = serde_yml::from_reader(reader)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CliError> {
        let scenario: Scenario = serde_yml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Every name a link or a step mentions must be a declared node, and declared only once.
    pub fn validate(&self) -> Result<(), CliError> {
        let mut known = BTreeSet::new();
        for name in &self.nodes {
            if !known.insert(name.as_str()) {
                return Err(CliError::scenario(format!("node {name} is declared twice")));
            }
        }
        let check = |name: &String| {
            if known.contains(name.as_str()) {
                Ok(())
            } else {
                Err(CliError::scenario(format!("unknown node {name}")))
            }
        };
        for link in &self.links {
            check(&link.from)?;
            check(&link.to)?;
            if link.from == link.to {
                return Err(CliError::scenario(format!("{} cannot trust itself", link.from)));
            }
        }
        for step in &self.steps {
            match step {
                Step::Pay { from, to, .. } => {
                    check(from)?;
                    check(to)?;
                }
                Step::CloseCycles { node } => check(node)?,
                Step::CloseCycle { cycle } => cycle.iter().try_for_each(check)?,
            }
        }
        Ok(())
    }

    /// Node ids by name. Ids are derived from the names so runs are reproducible.
    pub fn node_ids(&self) -> BTreeMap<String, NodeId> {
        self.nodes.iter().map(|name| (name.clone(), NodeId::from_name(name))).collect()
    }

    pub fn network(&self, settings: &Settings) -> Result<LocalNetworkBuilder, CliError> {
        let mut builder = LocalNetworkBuilder::new(settings.protocol.clone()).max_paths(settings.max_paths);
        for name in &self.nodes {
            builder = builder.node(NodeId::from_name(name))?;
        }
        for link in &self.links {
            let (from, to) = (NodeId::from_name(&link.from), NodeId::from_name(&link.to));
            builder = builder.link_with_debt(from, to, link.forward, link.backward, link.debt)?;
        }
        Ok(builder)
    }
}

pub fn cycle_path(names: &[String]) -> Result<PaymentPath, CliError> {
    PaymentPath::new(names.iter().map(|name| NodeId::from_name(name)).collect())
        .map_err(|e| CliError::scenario(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    const SCENARIO: &str = r#"
nodes: [alice, bob, carol]
links:
  - { from: alice, to: bob, forward: 100 }
  - { from: bob, to: carol, forward: 100, backward: 50, debt: -20 }
steps:
  - { action: pay, from: alice, to: carol, amount: 60 }
  - { action: close_cycles, node: carol }
  - { action: close_cycle, cycle: [alice, bob, carol, alice] }
"#;

    #[test]
    fn scenario_files_parse() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        assert_eq!(scenario.nodes.len(), 3);
        assert_eq!(scenario.links[0].backward, 0);
        assert_eq!(scenario.links[1].debt, -20);
        assert_eq!(scenario.steps[0], Step::Pay { from: "alice".into(), to: "carol".into(), amount: 60 });
        assert_eq!(scenario.steps[1], Step::CloseCycles { node: "carol".into() });
        assert_eq!(scenario.steps[2].to_string(), "close alice -> bob -> carol -> alice");
    }

    #[test]
    fn unknown_names_are_rejected() {
        let yaml = "nodes: [alice]\nsteps:\n  - { action: pay, from: alice, to: dave, amount: 1 }\n";
        assert!(matches!(Scenario::from_yaml(yaml), Err(CliError::InvalidScenario(_))));
        let yaml = "nodes: [alice, alice]\n";
        assert!(matches!(Scenario::from_yaml(yaml), Err(CliError::InvalidScenario(_))));
        let yaml = "nodes: [alice]\nlinks:\n  - { from: alice, to: alice, forward: 1 }\n";
        assert!(matches!(Scenario::from_yaml(yaml), Err(CliError::InvalidScenario(_))));
    }

    #[test]
    fn unknown_actions_are_rejected() {
        let yaml = "nodes: [alice]\nsteps:\n  - { action: dance, node: alice }\n";
        assert!(matches!(Scenario::from_yaml(yaml), Err(CliError::InvalidYaml(_))));
    }
}
