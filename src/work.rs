//! Build execution: the Plan tracks which edges must run and which are ready
//! to run; the Builder drives scanner, plan, and command runner, and does the
//! post-edge bookkeeping (dep extraction, restat, log writes, cleanup).

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use anyhow::{anyhow, bail};

use crate::canon::canon_path;
use crate::db::{BuildLog, DepsLog};
use crate::densemap::DenseMap;
use crate::depfile;
use crate::fs::{DiskInterface, MTime};
use crate::graph::{DepsKind, EdgeId, Graph, NodeId, PoolId};
use crate::scan::{self, Scan};
use crate::showincludes;
use crate::status::Status;
use crate::task::{CommandResult, CommandRunner, DryRunner, Runner, Termination};

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Knobs controlling one build.
pub struct BuildConfig {
    /// Cap on concurrently running commands.
    pub parallelism: usize,
    /// How many failing commands to tolerate before stopping.
    pub failures_allowed: usize,
    /// Admission gate on system load average; <= 0 disables it.
    pub max_load_average: f64,
    /// Pretend to run commands instead of spawning them.
    pub dry_run: bool,
    /// Print why each edge was considered dirty.
    pub explain: bool,
    /// Enable post-run output checks.
    pub uses_phony_outputs: bool,
    pub missing_output_file_should_err: bool,
    pub old_output_should_err: bool,
    pub output_directory_should_err: bool,
    pub missing_depfile_should_err: bool,
    /// Delete declared outputs before running non-restat edges.
    pub pre_remove_output_files: bool,
    pub keep_depfile: bool,
    pub keep_rspfile: bool,
}

impl Default for BuildConfig {
    fn default() -> BuildConfig {
        BuildConfig {
            parallelism: default_parallelism(),
            failures_allowed: 1,
            max_load_average: -0.0,
            dry_run: false,
            explain: false,
            uses_phony_outputs: false,
            missing_output_file_should_err: false,
            old_output_should_err: false,
            output_directory_should_err: false,
            missing_depfile_should_err: false,
            pre_remove_output_files: false,
            keep_depfile: false,
            keep_rspfile: false,
        }
    }
}

/// How much the plan wants an edge. Transitions are only
/// Nothing -> ToStart -> ToFinish -> removed, plus ToStart -> Nothing when a
/// restat clean pass unwants the edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Want {
    Nothing,
    ToStart,
    ToFinish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeResult {
    Succeeded,
    Failed,
}

/// Runtime state of one pool: how many member edges run now, and which are
/// waiting for a slot.
struct PoolState {
    depth: usize,
    current_use: usize,
    delayed: VecDeque<EdgeId>,
}

impl PoolState {
    fn should_delay(&self) -> bool {
        self.depth != 0 && self.current_use >= self.depth
    }

    fn edge_scheduled(&mut self) {
        if self.depth != 0 {
            self.current_use += 1;
        }
    }

    fn edge_finished(&mut self) {
        if self.depth != 0 && self.current_use > 0 {
            self.current_use -= 1;
        }
    }

    /// Move delayed edges into `ready` while slots are free.
    fn retrieve_ready_edges(&mut self, ready: &mut BTreeSet<EdgeId>) {
        while self.depth == 0 || self.current_use < self.depth {
            match self.delayed.pop_front() {
                Some(edge) => {
                    self.edge_scheduled();
                    ready.insert(edge);
                }
                None => break,
            }
        }
    }
}

/// Plan tracks progress through the build: the edges we want brought up to
/// date, and among those, the ones whose inputs are all ready.
pub struct Plan {
    want: HashMap<EdgeId, Want>,
    /// Ready edges, ordered by edge identity so selection is reproducible.
    ready: BTreeSet<EdgeId>,
    pools: DenseMap<PoolId, PoolState>,
    /// Non-phony edges we still intend to run.
    command_edges: usize,
    /// Edges in the want set we intend to run.
    wanted_edges: usize,
}

fn all_inputs_ready(graph: &Graph, edge_id: EdgeId) -> bool {
    graph
        .edge(edge_id)
        .ins
        .iter()
        .all(|&input| match graph.node(input).in_edge {
            Some(in_edge) => graph.edge(in_edge).outputs_ready,
            None => true,
        })
}

impl Plan {
    pub fn new(graph: &Graph) -> Plan {
        let mut pools = DenseMap::new();
        for (_, pool) in graph.pools().iter() {
            pools.push(PoolState {
                depth: pool.depth,
                current_use: 0,
                delayed: VecDeque::new(),
            });
        }
        Plan {
            want: HashMap::new(),
            ready: BTreeSet::new(),
            pools,
            command_edges: 0,
            wanted_edges: 0,
        }
    }

    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn wanted_edge_count(&self) -> usize {
        self.wanted_edges
    }

    /// Add a target and its dirty transitive inputs to the want set.
    pub fn add_target(&mut self, graph: &Graph, node: NodeId) -> anyhow::Result<()> {
        self.add_sub_target(graph, node, None)
    }

    fn add_sub_target(
        &mut self,
        graph: &Graph,
        node_id: NodeId,
        dependent: Option<NodeId>,
    ) -> anyhow::Result<()> {
        let node = graph.node(node_id);
        let edge_id = match node.in_edge {
            None => {
                // Leaf node. A dirty leaf has nothing that can produce it.
                if node.dirty {
                    let referenced = match dependent {
                        Some(dep) => format!(", needed by '{}',", graph.node(dep).path),
                        None => String::new(),
                    };
                    bail!(
                        "'{}'{} missing and no known rule to make it",
                        node.path,
                        referenced
                    );
                }
                return Ok(());
            }
            Some(edge_id) => edge_id,
        };

        if graph.edge(edge_id).outputs_ready {
            return Ok(()); // Don't need to do anything.
        }

        // First visit gets an entry mapping to Nothing: we know of the edge
        // but don't yet intend to run it.
        let first_visit = !self.want.contains_key(&edge_id);
        if first_visit {
            self.want.insert(edge_id, Want::Nothing);
        }

        // If the node needs rebuilding and the edge isn't already wanted,
        // want it now.
        if node.dirty && self.want[&edge_id] == Want::Nothing {
            self.want.insert(edge_id, Want::ToStart);
            self.wanted_edges += 1;
            if !graph.edge(edge_id).is_phony() {
                self.command_edges += 1;
            }
            if all_inputs_ready(graph, edge_id) {
                self.schedule_work(graph, edge_id);
            }
        }

        if !first_visit {
            return Ok(()); // We've already processed the inputs.
        }

        for &input in &graph.edge(edge_id).ins {
            self.add_sub_target(graph, input, Some(node_id))?;
        }
        Ok(())
    }

    /// Pop some ready edge, lowest edge id first.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        let edge = self.ready.iter().next().copied()?;
        self.ready.remove(&edge);
        Some(edge)
    }

    fn schedule_work(&mut self, graph: &Graph, edge_id: EdgeId) {
        let want = self.want[&edge_id];
        if want == Want::ToFinish {
            // Already scheduled. We can get here again when an edge and one
            // of its dependents share an order-only input.
            return;
        }
        debug_assert_eq!(want, Want::ToStart);
        self.want.insert(edge_id, Want::ToFinish);

        let pool = self.pools.get_mut(graph.edge(edge_id).pool);
        if pool.should_delay() {
            pool.delayed.push_back(edge_id);
            pool.retrieve_ready_edges(&mut self.ready);
        } else {
            pool.edge_scheduled();
            self.ready.insert(edge_id);
        }
    }

    pub fn edge_finished(&mut self, graph: &mut Graph, edge_id: EdgeId, result: EdgeResult) {
        let directly_wanted = self
            .want
            .get(&edge_id)
            .map_or(false, |&want| want != Want::Nothing);

        // See if this job frees up any delayed jobs in its pool.
        let pool = self.pools.get_mut(graph.edge(edge_id).pool);
        if directly_wanted {
            pool.edge_finished();
        }
        pool.retrieve_ready_edges(&mut self.ready);

        // The rest of this function only applies to successful commands: a
        // failed edge stays wanted so the error sticks.
        if result != EdgeResult::Succeeded {
            return;
        }

        if directly_wanted {
            self.wanted_edges -= 1;
            if !graph.edge(edge_id).is_phony() {
                self.command_edges -= 1;
            }
        }
        self.want.remove(&edge_id);
        graph.edge_mut(edge_id).outputs_ready = true;

        // Check off any nodes we were waiting for with this edge.
        for out in graph.edge(edge_id).outs.clone() {
            self.node_finished(graph, out);
        }
    }

    fn node_finished(&mut self, graph: &mut Graph, node_id: NodeId) {
        // See if we want any edges reading this node.
        for edge_id in graph.get_out_edges(node_id) {
            let Some(&want) = self.want.get(&edge_id) else {
                continue;
            };
            if !all_inputs_ready(graph, edge_id) {
                continue;
            }
            if want != Want::Nothing {
                self.schedule_work(graph, edge_id);
            } else {
                // We do not need to build this edge, but we might need to
                // build one of its dependents.
                self.edge_finished(graph, edge_id, EdgeResult::Succeeded);
            }
        }
    }

    /// Propagate "the command did not actually change this output" along
    /// restat chains: for wanted downstream edges whose non-order-only inputs
    /// are now all clean, re-decide output dirtiness and unwant the edges
    /// that turn out clean.
    pub fn clean_node(
        &mut self,
        graph: &mut Graph,
        build_log: &BuildLog,
        node_id: NodeId,
        explain: bool,
    ) {
        graph.node_mut(node_id).dirty = false;

        for edge_id in graph.get_out_edges(node_id) {
            // Don't process edges we don't actually want.
            let Some(&want) = self.want.get(&edge_id) else {
                continue;
            };
            if want == Want::Nothing {
                continue;
            }
            // Don't attempt to clean an edge that failed to load deps.
            if graph.edge(edge_id).deps_missing {
                continue;
            }

            let scan_ins = graph.edge(edge_id).non_order_only_ins().to_vec();
            if scan_ins.iter().any(|&input| graph.node(input).dirty) {
                continue;
            }

            // All inputs clean: the outputs' dirty state may have changed.
            let mut most_recent_input: Option<NodeId> = None;
            for &input in &scan_ins {
                let newer = match most_recent_input {
                    None => true,
                    Some(prev) => {
                        graph.node(input).mtime_or_missing() > graph.node(prev).mtime_or_missing()
                    }
                };
                if newer {
                    most_recent_input = Some(input);
                }
            }

            if !scan::recompute_outputs_dirty(graph, build_log, edge_id, most_recent_input, explain)
            {
                for out in graph.edge(edge_id).outs.clone() {
                    self.clean_node(graph, build_log, out, explain);
                }
                self.want.insert(edge_id, Want::Nothing);
                self.wanted_edges -= 1;
                if !graph.edge(edge_id).is_phony() {
                    self.command_edges -= 1;
                }
            }
        }
    }
}

fn append_output(output: &mut Vec<u8>, msg: &str) {
    if !output.is_empty() {
        output.push(b'\n');
    }
    output.extend_from_slice(msg.as_bytes());
}

/// Drives a build: scans targets, then alternately pulls ready edges from the
/// plan and finished commands from the runner until the plan is exhausted.
pub struct Builder<'a> {
    graph: Graph,
    config: BuildConfig,
    disk: &'a dyn DiskInterface,
    status: &'a mut dyn Status,
    build_log: BuildLog,
    deps_log: DepsLog,
    plan: Plan,
    runner: Box<dyn CommandRunner + 'a>,
    /// Start times of running edges, in ms relative to build start.
    running_edges: HashMap<EdgeId, i64>,
    start_time: Instant,
}

impl<'a> Builder<'a> {
    pub fn new(
        graph: Graph,
        build_log: BuildLog,
        deps_log: DepsLog,
        config: BuildConfig,
        disk: &'a dyn DiskInterface,
        status: &'a mut dyn Status,
    ) -> Builder<'a> {
        let plan = Plan::new(&graph);
        let runner: Box<dyn CommandRunner> = if config.dry_run {
            Box::<DryRunner>::default()
        } else {
            Box::new(Runner::new(config.parallelism, config.max_load_average))
        };
        Builder {
            graph,
            config,
            disk,
            status,
            build_log,
            deps_log,
            plan,
            runner,
            running_edges: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Replace the command runner; tests use this to script completions.
    pub fn set_runner(&mut self, runner: Box<dyn CommandRunner + 'a>) {
        self.runner = runner;
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn build_log(&self) -> &BuildLog {
        &self.build_log
    }

    pub fn deps_log(&self) -> &DepsLog {
        &self.deps_log
    }

    pub fn command_edge_count(&self) -> usize {
        self.plan.command_edge_count()
    }

    pub fn wanted_edge_count(&self) -> usize {
        self.plan.wanted_edge_count()
    }

    /// Resolve a target by interned name.
    pub fn add_target(&mut self, name: &str) -> anyhow::Result<NodeId> {
        let canonical = canon_path(name);
        match self.graph.lookup(&canonical) {
            Some(node) => Ok(node),
            None => bail!("unknown target: '{}'", name),
        }
    }

    /// Scan the targets' input closures, then populate the plan. A target
    /// that is already up to date adds no work; that is not an error.
    pub fn add_targets(&mut self, nodes: &[NodeId]) -> anyhow::Result<()> {
        Scan::new(
            &mut self.graph,
            self.disk,
            &self.build_log,
            &self.deps_log,
            self.config.explain,
        )
        .recompute_nodes_dirty(nodes)?;

        for &node in nodes {
            self.plan.add_target(&self.graph, node)?;
        }
        Ok(())
    }

    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the plan to completion. Returns the number of commands launched.
    pub fn build(&mut self) -> anyhow::Result<usize> {
        self.status.plan_has_total_edges(self.plan.command_edge_count());
        self.status.build_started();

        let mut pending = 0usize;
        let mut failures_allowed = self.config.failures_allowed;
        let mut commands_ran = 0usize;

        while self.plan.more_to_do() {
            // First, start as many commands as the runner admits.
            if failures_allowed > 0 && self.runner.can_run_more() {
                if let Some(edge_id) = self.plan.find_work() {
                    if let Err(err) = self.start_edge(edge_id) {
                        self.cleanup(None);
                        self.status.build_finished();
                        return Err(err);
                    }
                    if self.graph.edge(edge_id).is_phony() {
                        self.plan
                            .edge_finished(&mut self.graph, edge_id, EdgeResult::Succeeded);
                    } else {
                        pending += 1;
                        commands_ran += 1;
                    }
                    // We made progress; go back to the top.
                    continue;
                }
            }

            // Second, reap the next finished command.
            if pending > 0 {
                let result = match self.runner.wait_for_command() {
                    Ok(result) => result,
                    Err(err) => {
                        self.cleanup(None);
                        self.status.build_finished();
                        return Err(err);
                    }
                };
                if result.termination == Termination::Interrupted {
                    self.cleanup(Some(result.edge));
                    self.status.build_finished();
                    bail!("interrupted by user");
                }
                pending -= 1;
                let success = match self.finish_command(result) {
                    Ok(success) => success,
                    Err(err) => {
                        self.cleanup(None);
                        self.status.build_finished();
                        return Err(err);
                    }
                };
                if !success && failures_allowed > 0 {
                    failures_allowed -= 1;
                }
                continue;
            }

            // No work ready and nothing running: we cannot make progress.
            self.status.build_finished();
            if failures_allowed == 0 {
                if self.config.failures_allowed > 1 {
                    bail!("subcommands failed");
                }
                bail!("subcommand failed");
            } else if failures_allowed < self.config.failures_allowed {
                bail!("cannot make progress due to previous errors");
            } else {
                bail!("stuck [this is a bug]");
            }
        }

        self.status.build_finished();
        Ok(commands_ran)
    }

    fn start_edge(&mut self, edge_id: EdgeId) -> anyhow::Result<()> {
        let Some(cmdline) = self.graph.edge(edge_id).cmdline.clone() else {
            return Ok(()); // Phony edges don't run anything.
        };

        let start_ms = self.start_time.elapsed().as_millis() as i64;
        self.running_edges.insert(edge_id, start_ms);
        self.status
            .build_edge_started(edge_id, self.graph.edge(edge_id), start_ms);

        for out in self.graph.edge(edge_id).outs.clone() {
            // Create directories necessary for outputs.
            let path = self.graph.node(out).path.clone();
            self.disk
                .make_dirs_for(&path)
                .map_err(|err| anyhow!("mkdir for {}: {}", path, err))?;

            // Remove existing outputs for non-restat rules.
            if self.config.pre_remove_output_files
                && !self.graph.edge(edge_id).restat
                && !self.config.dry_run
                && self.graph.node(out).exists()
            {
                self.disk
                    .remove_file(&path)
                    .map_err(|err| anyhow!("remove {}: {}", path, err))?;
            }
        }

        // Create the response file, if any.
        if let Some(rspfile) = self.graph.edge(edge_id).rspfile.clone() {
            self.disk
                .make_dirs_for(&rspfile.path)
                .map_err(|err| anyhow!("mkdir for {}: {}", rspfile.path, err))?;
            self.disk
                .write_file(&rspfile.path, rspfile.content.as_bytes())
                .map_err(|err| anyhow!("write {}: {}", rspfile.path, err))?;
        }

        self.runner.start_command(edge_id, cmdline)
    }

    fn finish_command(&mut self, mut result: CommandResult) -> anyhow::Result<bool> {
        let edge_id = result.edge;

        // Extract dependency side-effects first: this filters /showIncludes
        // lines out of the output even on failure, and an extraction failure
        // makes the command fail from a build perspective.
        let deps_kind = self.graph.edge(edge_id).deps;
        let mut deps_nodes: Vec<NodeId> = Vec::new();
        if deps_kind.is_some() {
            match self.extract_deps(&mut result) {
                Ok(nodes) => deps_nodes = nodes,
                Err(err) => {
                    if result.success() {
                        append_output(&mut result.output, &err.to_string());
                        result.termination = Termination::Failure;
                    }
                }
            }
        }

        let start_ms = self.running_edges.remove(&edge_id).unwrap_or(0);
        let end_ms = self.start_time.elapsed().as_millis() as i64;

        let mut output_mtime = MTime::Missing;
        let restat = self.graph.edge(edge_id).restat;

        if result.success() && !self.config.dry_run {
            // Restat the outputs and compare against the newest input.
            let mut newest_input: Option<NodeId> = None;
            for &input in self.graph.edge(edge_id).non_order_only_ins() {
                let newer = match newest_input {
                    None => true,
                    Some(prev) => {
                        self.graph.node(input).mtime_or_missing()
                            > self.graph.node(prev).mtime_or_missing()
                    }
                };
                if newer {
                    newest_input = Some(input);
                }
            }
            let newest_input_mtime = newest_input
                .map(|n| self.graph.node(n).mtime_or_missing())
                .unwrap_or(MTime::Missing);

            let mut nodes_cleaned: Vec<NodeId> = Vec::new();
            for out in self.graph.edge(edge_id).outs.clone() {
                let path = self.graph.node(out).path.clone();
                let old_mtime = self.graph.node(out).mtime_or_missing();
                let (new_mtime, is_dir) = self
                    .disk
                    .lstat(&path)
                    .map_err(|err| anyhow!("lstat {}: {}", path, err))?;
                self.graph.node_mut(out).mtime = Some(new_mtime);

                if self.config.uses_phony_outputs {
                    if !new_mtime.exists() {
                        append_output(
                            &mut result.output,
                            &format!("output file missing after successful execution: {}", path),
                        );
                        if self.config.missing_output_file_should_err {
                            result.termination = Termination::Failure;
                        }
                    } else if !restat && new_mtime < newest_input_mtime {
                        let input_path = newest_input
                            .map(|n| self.graph.node(n).path.as_str())
                            .unwrap_or("");
                        append_output(
                            &mut result.output,
                            &format!(
                                "missing `restat`? output {} older than most recent input {}",
                                path, input_path
                            ),
                        );
                        if self.config.old_output_should_err {
                            result.termination = Termination::Failure;
                        }
                    }
                    if is_dir {
                        append_output(
                            &mut result.output,
                            &format!("outputs should be files, not directories: {}", path),
                        );
                        if self.config.output_directory_should_err {
                            result.termination = Termination::Failure;
                        }
                    }
                }

                if new_mtime > output_mtime {
                    output_mtime = new_mtime;
                }
                // Note this also applies to nonexistent outputs.
                if restat && old_mtime == new_mtime {
                    nodes_cleaned.push(out);
                }
            }

            self.status
                .build_edge_finished(edge_id, self.graph.edge(edge_id), end_ms, &result);

            if result.success() && !nodes_cleaned.is_empty() {
                // The command did not change these outputs; propagate the
                // clean state through the build graph.
                for &out in &nodes_cleaned {
                    self.plan.clean_node(
                        &mut self.graph,
                        &self.build_log,
                        out,
                        self.config.explain,
                    );
                }

                // Record the most recent input (or depfile) stamp as the
                // output mtime, so only a newer modification dirties us.
                let mut restat_mtime = newest_input_mtime;
                if restat_mtime.exists() && deps_kind.is_none() {
                    if let Some(depfile) = self.graph.edge(edge_id).depfile.clone() {
                        let depfile_mtime = self
                            .disk
                            .stat(&depfile)
                            .map_err(|err| anyhow!("stat {}: {}", depfile, err))?;
                        if depfile_mtime > restat_mtime {
                            restat_mtime = depfile_mtime;
                        }
                    }
                }

                // Cleaning may have shrunk the number of edges left to run.
                self.status.plan_has_total_edges(self.plan.command_edge_count());
                output_mtime = restat_mtime;
            }
        } else {
            self.status
                .build_edge_finished(edge_id, self.graph.edge(edge_id), end_ms, &result);
        }

        let success = result.success();
        if success && !self.config.dry_run {
            // Merge discovered implicit inputs into the edge so later work
            // in this process sees them; future scans reload them from the
            // deps log.
            for &dep in &deps_nodes {
                if !self.graph.edge(edge_id).ins.contains(&dep) {
                    self.graph.add_implicit_input(edge_id, dep);
                }
            }

            // Delete any leftover response file.
            if !self.config.keep_rspfile {
                if let Some(rspfile) = self.graph.edge(edge_id).rspfile.clone() {
                    let _ = self.disk.remove_file(&rspfile.path);
                }
            }

            // Durable bookkeeping, in observable order: build log, then deps
            // log, then the plan transition below.
            if !self.graph.edge(edge_id).is_phony() {
                let hash = self.graph.edge(edge_id).command_hash();
                for out in self.graph.edge(edge_id).outs.clone() {
                    let path = self.graph.node(out).path.clone();
                    self.build_log
                        .record_command(&path, start_ms, end_ms, output_mtime, hash)
                        .map_err(|err| anyhow!("error writing to build log: {}", err))?;
                }
            }

            if deps_kind.is_some() {
                let out = self.graph.edge(edge_id).outs[0];
                let out_path = self.graph.node(out).path.clone();
                let (deps_mtime, _) = self
                    .disk
                    .lstat(&out_path)
                    .map_err(|err| anyhow!("lstat {}: {}", out_path, err))?;
                let dep_names: Vec<String> = deps_nodes
                    .iter()
                    .map(|&n| self.graph.node(n).path.clone())
                    .collect();
                self.deps_log
                    .record_deps(&out_path, deps_mtime, dep_names)
                    .map_err(|err| anyhow!("error writing to deps log: {}", err))?;
            }
        }

        self.plan.edge_finished(
            &mut self.graph,
            edge_id,
            if success {
                EdgeResult::Succeeded
            } else {
                EdgeResult::Failed
            },
        );
        Ok(success)
    }

    fn extract_deps(&mut self, result: &mut CommandResult) -> anyhow::Result<Vec<NodeId>> {
        let edge_id = result.edge;
        match self.graph.edge(edge_id).deps {
            Some(DepsKind::Msvc) => {
                let prefix = self
                    .graph
                    .edge(edge_id)
                    .msvc_deps_prefix
                    .clone()
                    .unwrap_or_else(|| showincludes::DEFAULT_PREFIX.to_string());
                let parsed = showincludes::parse(&result.output, &prefix);
                result.output = parsed.filtered;
                let mut nodes = Vec::new();
                for include in parsed.includes {
                    // The all-ones separator mask deliberately widens "some
                    // of these are backslashes" to "treat them all as
                    // backslashes"; MSVC reports both orientations.
                    nodes.push(self.graph.file_id_with_slash_bits(&canon_path(include), !0));
                }
                Ok(nodes)
            }
            Some(DepsKind::Gcc) => {
                let Some(depfile_path) = self.graph.edge(edge_id).depfile.clone() else {
                    bail!("edge with deps=gcc but no depfile makes no sense");
                };
                let content = match self.disk.read_file(&depfile_path) {
                    Ok(content) => content,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        // Only complain if the tool claimed success.
                        if !self.config.dry_run && result.success() {
                            if self.config.missing_depfile_should_err {
                                bail!("depfile is missing");
                            }
                            let out = self.graph.edge(edge_id).outs[0];
                            let msg = format!(
                                "depfile is missing ({} for {})",
                                depfile_path,
                                self.graph.node(out).path
                            );
                            self.status.warning(&msg);
                        }
                        Vec::new()
                    }
                    Err(err) => bail!("loading '{}': {}", depfile_path, err),
                };

                let mut nodes = Vec::new();
                if !content.is_empty() {
                    let parsed = depfile::parse(&content)
                        .map_err(|err| anyhow!("{}", err.format(&depfile_path, &content)))?;
                    let deps: Vec<String> = parsed
                        .first()
                        .map(|(_, deps)| deps.iter().map(|dep| canon_path(*dep)).collect())
                        .unwrap_or_default();
                    for dep in deps {
                        nodes.push(self.graph.file_id(&dep));
                    }
                }

                if !self.config.keep_depfile {
                    self.disk
                        .remove_file(&depfile_path)
                        .map_err(|err| anyhow!("deleting depfile: {}", err))?;
                }
                Ok(nodes)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Delete partial outputs of in-flight edges so the next dirty pass
    /// doesn't mistake them for good, and always delete their depfiles.
    fn cleanup(&mut self, interrupted: Option<EdgeId>) {
        let mut active = self.runner.active_edges();
        if let Some(edge) = interrupted {
            if !active.contains(&edge) {
                active.push(edge);
            }
        }
        self.runner.abort();

        for edge_id in active {
            let depfile = self.graph.edge(edge_id).depfile.clone();
            for out in self.graph.edge(edge_id).outs.clone() {
                // Only delete an output the command actually modified; a
                // depfile-using edge may have touched its depfile without
                // touching the output yet, so for those always delete.
                let path = self.graph.node(out).path.clone();
                match self.disk.lstat(&path) {
                    Ok((new_mtime, is_dir)) => {
                        if !is_dir
                            && (depfile.is_some()
                                || self.graph.node(out).mtime_or_missing() != new_mtime)
                        {
                            let _ = self.disk.remove_file(&path);
                        }
                    }
                    Err(err) => {
                        let msg = format!("lstat {}: {}", path, err);
                        self.status.error(&msg);
                    }
                }
            }
            if let Some(depfile) = depfile {
                let _ = self.disk.remove_file(&depfile);
            }
        }
    }
}
