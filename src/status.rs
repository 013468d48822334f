//! Build status reporting, for display to the user.

use crate::graph::{Edge, EdgeId};
use crate::task::{CommandResult, Termination};
use std::io::Write;

/// Compute the message to display on the console for a given edge.
pub fn build_message(edge: &Edge) -> &str {
    edge.desc
        .as_ref()
        .filter(|desc| !desc.is_empty())
        .or(edge.cmdline.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("phony")
}

/// Trait for build progress notifications.
pub trait Status {
    /// Called when the number of commands the plan intends to run changes.
    fn plan_has_total_edges(&mut self, n: usize);

    fn build_started(&mut self);

    fn build_edge_started(&mut self, id: EdgeId, edge: &Edge, start_ms: i64);

    fn build_edge_finished(&mut self, id: EdgeId, edge: &Edge, end_ms: i64, result: &CommandResult);

    fn build_finished(&mut self);

    fn warning(&mut self, msg: &str);

    fn error(&mut self, msg: &str);
}

/// Plain console reporter without any overprinting.
#[derive(Default)]
pub struct ConsoleStatus {
    /// Whether to print command lines of started programs.
    verbose: bool,

    /// The id of the last command printed, used to avoid printing it twice
    /// when we have two updates from the same command in a row.
    last_started: Option<EdgeId>,
}

impl ConsoleStatus {
    pub fn new(verbose: bool) -> Self {
        ConsoleStatus {
            verbose,
            last_started: None,
        }
    }

    fn log(&self, msg: &str) {
        println!("{}", msg);
    }
}

impl Status for ConsoleStatus {
    fn plan_has_total_edges(&mut self, _n: usize) {
        // ignore
    }

    fn build_started(&mut self) {
        // ignore
    }

    fn build_edge_started(&mut self, id: EdgeId, edge: &Edge, _start_ms: i64) {
        self.log(if self.verbose {
            edge.cmdline.as_deref().unwrap_or("phony")
        } else {
            build_message(edge)
        });
        self.last_started = Some(id);
    }

    fn build_edge_finished(
        &mut self,
        id: EdgeId,
        edge: &Edge,
        _end_ms: i64,
        result: &CommandResult,
    ) {
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() || self.last_started == Some(id) {
                    // Output is empty, or we just printed the command.
                } else {
                    self.log(build_message(edge))
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", build_message(edge))),
            Termination::Failure => self.log(&format!("failed: {}", build_message(edge))),
        }
        if !result.output.is_empty() {
            std::io::stdout().write_all(&result.output).unwrap();
        }
    }

    fn build_finished(&mut self) {
        // ignore
    }

    fn warning(&mut self, msg: &str) {
        println!("warning: {}", msg);
    }

    fn error(&mut self, msg: &str) {
        eprintln!("error: {}", msg);
    }
}

/// Records every notification, for assertions on ordering and content.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CapturingStatus {
    pub totals: Vec<usize>,
    pub started: Vec<EdgeId>,
    pub finished: Vec<(EdgeId, bool, Vec<u8>)>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[cfg(test)]
impl Status for CapturingStatus {
    fn plan_has_total_edges(&mut self, n: usize) {
        self.totals.push(n);
    }

    fn build_started(&mut self) {}

    fn build_edge_started(&mut self, id: EdgeId, _edge: &Edge, _start_ms: i64) {
        self.started.push(id);
    }

    fn build_edge_finished(
        &mut self,
        id: EdgeId,
        _edge: &Edge,
        _end_ms: i64,
        result: &CommandResult,
    ) {
        self.finished
            .push((id, result.success(), result.output.clone()));
    }

    fn build_finished(&mut self) {}

    fn warning(&mut self, msg: &str) {
        self.warnings.push(msg.to_string());
    }

    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }
}
