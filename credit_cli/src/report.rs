use crate::settings::Settings;
use crate::simulation::{outcome_label, SimulationReport};
use prettytable::format::{LinePosition, LineSeparator, TableFormat};
use prettytable::{row, Table};

fn markdown_format() -> TableFormat {
    prettytable::format::FormatBuilder::new()
        .column_separator('|')
        .borders('|')
        .separator(LinePosition::Title, LineSeparator::new('-', '|', '|', '|'))
        .padding(1, 1)
        .build()
}

fn markdown_table() -> Table {
    let mut table = Table::new();
    table.set_format(markdown_format());
    table
}

pub fn steps_table(report: &SimulationReport) -> Table {
    let mut table = markdown_table();
    table.set_titles(row!["#", "Step", "Outcome", "Moved"]);
    for (i, step) in report.steps.iter().enumerate() {
        table.add_row(row![i + 1, step.step, outcome_label(step), r->step.moved()]);
    }
    table
}

pub fn balances_table(report: &SimulationReport) -> Table {
    let mut table = markdown_table();
    table.set_titles(row!["Node", "Contractor", "Outgoing trust", "Incoming trust", "Balance", "State"]);
    for node in &report.nodes {
        for (contractor, line) in &node.lines {
            table.add_row(row![
                node.name,
                contractor,
                r->line.outgoing_trust_amount(),
                r->line.incoming_trust_amount(),
                r->line.balance().value(),
                format!("{:?}", line.state())
            ]);
        }
    }
    table
}

pub fn settings_table(settings: &Settings) -> Table {
    let protocol = &settings.protocol;
    let mut table = markdown_table();
    table.set_titles(row!["Setting", "Value"]);
    table.add_row(row!["message transfer lag (ms)", r->protocol.message_transfer_lag_ms]);
    table.add_row(row!["resource transfer lag (ms)", r->protocol.resource_transfer_lag_ms]);
    table.add_row(row!["max path length", r->protocol.max_path_length]);
    table.add_row(row!["conflict poll delay (ms)", r->protocol.conflict_poll_delay_ms]);
    table.add_row(row!["recovery retry delay (ms)", r->protocol.recovery_retry_delay_ms]);
    table.add_row(row!["max recovery attempts", r->protocol.max_recovery_attempts]);
    table.add_row(row!["max TTL prolongations", r->protocol.max_ttl_prolongations]);
    table.add_row(row!["min votes timeout (ms)", r->protocol.votes_timeout(0).as_millis()]);
    table.add_row(row!["max paths per payment", r->settings.max_paths]);
    table.add_row(row!["settle timeout (ms)", r->settings.settle_timeout_ms]);
    table
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scenario::Step;
    use crate::simulation::StepReport;

    #[test]
    fn every_step_gets_a_row() {
        let step = Step::CloseCycles { node: "alice".into() };
        let report = SimulationReport {
            steps: vec![StepReport { step, results: Vec::new(), error: None }],
            nodes: Vec::new(),
            settled: true,
        };
        let table = steps_table(&report);
        assert_eq!(table.len(), 1);
        let rendered = table.to_string();
        assert!(rendered.contains("alice closes its debt cycles"));
        assert!(rendered.contains("nothing to do"));
    }

    #[test]
    fn settings_are_listed() {
        let table = settings_table(&Settings::default());
        assert_eq!(table.len(), 10);
        assert!(table.to_string().contains("votes timeout (ms)"));
    }
}
