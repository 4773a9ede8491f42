use crate::error::CliError;
use crate::scenario::{cycle_path, Scenario, Step};
use crate::settings::Settings;
use credit_net::{LocalNetwork, NetworkError, NetworkEvent};
use libcredit::transactions::{CommandResult, ResultCode};
use libcredit::trust_lines::TrustLine;
use libcredit::{NodeId, TrustLineAmount};
use log::*;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const SETTLE_POLL: Duration = Duration::from_millis(50);

/// What one step of a scenario ended with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepReport {
    pub step: Step,
    /// One entry per transaction the step started. Empty when it started none.
    pub results: Vec<CommandResult>,
    /// Set when the step could not run at all.
    pub error: Option<String>,
}

impl StepReport {
    pub fn moved(&self) -> TrustLineAmount {
        self.results.iter().filter(|r| r.is_ok()).map(|r| r.amount).sum()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.results.iter().all(CommandResult::is_ok)
    }
}

/// Trust lines of one node once the simulation is over.
#[derive(Clone, Debug)]
pub struct NodeReport {
    pub name: String,
    pub lines: Vec<(String, TrustLine)>,
}

#[derive(Clone, Debug)]
pub struct SimulationReport {
    pub steps: Vec<StepReport>,
    pub nodes: Vec<NodeReport>,
    /// Whether every participant finished its transactions before the settle timeout.
    pub settled: bool,
}

/// Starts the scenario's network, runs its steps one after another and collects the final state.
pub async fn run(scenario: &Scenario, settings: &Settings) -> Result<SimulationReport, CliError> {
    let names: BTreeMap<NodeId, String> = scenario.node_ids().into_iter().map(|(name, id)| (id, name)).collect();
    let (network, mut events) = scenario.network(settings)?.start()?;
    let mut steps = Vec::with_capacity(scenario.steps.len());
    for step in &scenario.steps {
        // Each step starts from a quiet network, with no result of an earlier step left in the queue.
        if !wait_until_settled(&network, settings.settle_timeout()).await {
            warn!("Starting \"{step}\" while transactions are still running");
        }
        while events.try_recv().is_ok() {}
        info!("Running step: {step}");
        let report = match run_step(&network, &mut events, step).await {
            Ok(results) => StepReport { step: step.clone(), results, error: None },
            Err(e) => {
                warn!("Step failed: {step}. {e}");
                StepReport { step: step.clone(), results: Vec::new(), error: Some(e.to_string()) }
            }
        };
        steps.push(report);
    }
    let settled = wait_until_settled(&network, settings.settle_timeout()).await;
    if !settled {
        warn!("Some transactions were still running after {:?}", settings.settle_timeout());
    }
    let mut nodes = Vec::with_capacity(scenario.nodes.len());
    for handle in network.nodes() {
        let name = names.get(&handle.id()).cloned().unwrap_or_else(|| handle.id().short());
        let lines = handle
            .trust_lines()
            .await
            .into_iter()
            .map(|line| (names.get(&line.contractor()).cloned().unwrap_or_else(|| line.contractor().short()), line))
            .collect();
        nodes.push(NodeReport { name, lines });
    }
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    network.shutdown().await;
    Ok(SimulationReport { steps, nodes, settled })
}

async fn run_step(
    network: &LocalNetwork,
    events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    step: &Step,
) -> Result<Vec<CommandResult>, CliError> {
    match step {
        Step::Pay { from, to, amount } => {
            let result = network.pay(&NodeId::from_name(from), NodeId::from_name(to), *amount).await?;
            Ok(vec![result])
        }
        Step::CloseCycle { cycle } => {
            let coordinator = cycle.first().ok_or_else(|| CliError::scenario("empty cycle"))?;
            let node = network.node(&NodeId::from_name(coordinator))?;
            let result = node.close_cycle(cycle_path(cycle)?).await?;
            Ok(vec![result])
        }
        Step::CloseCycles { node } => {
            let id = NodeId::from_name(node);
            let queued = network.close_cycles(&id).await?;
            collect_results(events, id, queued).await
        }
    }
}

/// Waits for `count` results of commands `node` started on its own.
async fn collect_results(
    events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    node: NodeId,
    count: usize,
) -> Result<Vec<CommandResult>, CliError> {
    let mut results = Vec::with_capacity(count);
    while results.len() < count {
        match events.recv().await {
            Some(NetworkEvent::CommandFinished { node: origin, result }) if origin == node => results.push(result),
            Some(_) => continue,
            None => return Err(NetworkError::NodeStopped(node).into()),
        }
    }
    Ok(results)
}

async fn wait_until_settled(network: &LocalNetwork, limit: Duration) -> bool {
    let started = Instant::now();
    let polling = async {
        while !network.is_settled().await {
            sleep(SETTLE_POLL).await;
        }
    };
    let settled = timeout(limit, polling).await.is_ok();
    debug!("Network settled: {settled} after {:?}", started.elapsed());
    settled
}

/// Short label for a result code in reports.
pub fn outcome_label(report: &StepReport) -> String {
    if let Some(error) = &report.error {
        return format!("error: {error}");
    }
    match report.results.as_slice() {
        [] => "nothing to do".to_string(),
        [single] => single.code.to_string(),
        many => {
            let ok = many.iter().filter(|r| r.code == ResultCode::Ok).count();
            format!("{ok} of {} closed", many.len())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SCENARIO: &str = r#"
nodes: [alice, bob, carol]
links:
  - { from: alice, to: bob, forward: 100, backward: 100 }
  - { from: bob, to: carol, forward: 100, backward: 100 }
  - { from: carol, to: alice, forward: 100, backward: 100 }
steps:
  - { action: pay, from: alice, to: bob, amount: 30 }
  - { action: pay, from: bob, to: carol, amount: 30 }
  - { action: pay, from: carol, to: alice, amount: 10 }
  - { action: close_cycles, node: alice }
  - { action: pay, from: alice, to: carol, amount: 1000 }
  - { action: close_cycle, cycle: [alice, alice] }
"#;

    fn balance(report: &SimulationReport, owner: &str, contractor: &str) -> i64 {
        let node = report.nodes.iter().find(|n| n.name == owner).unwrap();
        node.lines.iter().find(|(name, _)| name == contractor).unwrap().1.balance().value()
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_runs_to_the_end() {
        env_logger::try_init().ok();
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        let report = run(&scenario, &Settings::default()).await.unwrap();
        assert_eq!(report.steps.len(), 6);
        assert!(report.steps[..3].iter().all(StepReport::is_ok));
        // alice -> carol -> bob -> alice is the only debt cycle, limited by the 10 carol owes alice.
        assert_eq!(report.steps[3].results.len(), 1);
        assert_eq!(report.steps[3].moved(), TrustLineAmount::new(10));
        assert_eq!(balance(&report, "alice", "carol"), 0);
        assert_eq!(balance(&report, "bob", "alice"), 20);
        assert!(!report.steps[4].is_ok());
        assert!(report.steps[5].error.is_some());
        assert!(report.settled);
        assert_eq!(balance(&report, "alice", "bob") + balance(&report, "bob", "alice"), 0);
        assert_eq!(report.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), ["alice", "bob", "carol"]);
    }
}
