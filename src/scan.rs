//! Dependency scanning: given requested targets, decide which nodes are out
//! of date and which edges' outputs are ready, consulting the disk, the build
//! log, and the deps log.
//!
//! The scan runs in three phases: a single-threaded collect pass over the
//! transitive input closure, a parallel precompute pass (stat every collected
//! node, compute every collected edge's scan info), and a single-threaded
//! depth-first main pass that fills dirty flags, loads implicit deps, and
//! detects cycles.

use anyhow::{anyhow, bail};

use crate::canon::canon_path;
use crate::db::{BuildLog, BuildLogEntry, DepsLog};
use crate::depfile;
use crate::fs::DiskInterface;
use crate::graph::{EdgeId, Graph, NodeId, VisitMark};
use crate::thread_pool;

pub struct Scan<'a> {
    graph: &'a mut Graph,
    disk: &'a dyn DiskInterface,
    build_log: &'a BuildLog,
    deps_log: &'a DepsLog,
    explain: bool,
}

impl<'a> Scan<'a> {
    pub fn new(
        graph: &'a mut Graph,
        disk: &'a dyn DiskInterface,
        build_log: &'a BuildLog,
        deps_log: &'a DepsLog,
        explain: bool,
    ) -> Scan<'a> {
        Scan {
            graph,
            disk,
            build_log,
            deps_log,
            explain,
        }
    }

    /// Recompute dirtiness for the transitive input closure of `roots`.
    pub fn recompute_nodes_dirty(&mut self, roots: &[NodeId]) -> anyhow::Result<()> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for &root in roots {
            self.collect_precompute_lists(root, &mut nodes, &mut edges);
        }

        let result = self.precompute_nodes_dirty(&nodes, &edges).and_then(|()| {
            let mut stack = Vec::new();
            for &root in roots {
                stack.clear();
                self.recompute_node_dirty(root, &mut stack)?;
            }
            Ok(())
        });

        // The precomputed stat information must not outlive this scan:
        // post-build stats have to go back to disk.
        for &id in &nodes {
            let node = self.graph.node_mut(id);
            node.precomputed_mtime = None;
            node.precomputed_dirtiness = false;
        }
        for &id in &edges {
            self.graph.edge_mut(id).precomputed_dirtiness = false;
        }

        result
    }

    /// Flatten the transitive input closure of `id` into node and edge lists,
    /// each entity at most once. Also descends into inputs recorded in the
    /// deps log, widening the closure to implicit inputs before the loader
    /// officially merges them.
    fn collect_precompute_lists(
        &mut self,
        id: NodeId,
        nodes: &mut Vec<NodeId>,
        edges: &mut Vec<EdgeId>,
    ) {
        if self.graph.node(id).precomputed_dirtiness {
            return;
        }
        self.graph.node_mut(id).precomputed_dirtiness = true;
        nodes.push(id);

        if let Some(edge_id) = self.graph.node(id).in_edge {
            if !self.graph.edge(edge_id).precomputed_dirtiness {
                self.graph.edge_mut(edge_id).precomputed_dirtiness = true;
                edges.push(edge_id);
                for input in self.graph.edge(edge_id).ins.clone() {
                    self.collect_precompute_lists(input, nodes, edges);
                }
            }
        }

        let deps_log = self.deps_log;
        if let Some(entry) = deps_log.get_deps(&self.graph.node(id).path) {
            for name in &entry.deps {
                let dep = self.graph.file_id(name);
                self.collect_precompute_lists(dep, nodes, edges);
            }
        }
    }

    /// Parallel fan-out over the collected lists: stat every node into its
    /// precomputed slot and cache every edge's scan info. Collection
    /// guarantees uniqueness, so results apply without contention.
    fn precompute_nodes_dirty(&mut self, nodes: &[NodeId], edges: &[EdgeId]) -> anyhow::Result<()> {
        let jobs = thread_pool::optimal_job_count();

        // Pre-stat'ing mostly pays off for the null build. Skip it when the
        // disk can't take concurrent stats; the main pass stats on demand.
        if self.disk.is_stat_thread_safe() && jobs > 1 {
            let stats = {
                let graph = &*self.graph;
                let disk = self.disk;
                thread_pool::parallel_map(jobs, nodes, |&id| {
                    let node = graph.node(id);
                    if node.in_edge.is_some() {
                        disk.lstat(&node.path).map(|(mtime, _)| mtime)
                    } else {
                        disk.stat(&node.path)
                    }
                })
            };
            for (&id, stat) in nodes.iter().zip(stats) {
                match stat {
                    Ok(mtime) => self.graph.node_mut(id).precomputed_mtime = Some(mtime),
                    Err(err) => bail!("stat {}: {}", self.graph.node(id).path, err),
                }
            }
        }

        let infos = {
            let graph = &*self.graph;
            thread_pool::parallel_map(jobs, edges, |&id| graph.edge(id).compute_dep_scan_info())
        };
        for (&id, info) in edges.iter().zip(infos) {
            self.graph.edge_mut(id).set_dep_scan_info(info);
        }

        Ok(())
    }

    /// Fill in the node's mtime from the precomputed slot, or from disk when
    /// the precompute pass didn't run over it.
    fn stat_if_necessary(&mut self, id: NodeId) -> anyhow::Result<()> {
        if self.graph.node(id).status_known() {
            return Ok(());
        }
        let mtime = match self.graph.node(id).precomputed_mtime {
            Some(mtime) => mtime,
            None => {
                let disk = self.disk;
                let node = self.graph.node(id);
                let stat = if node.in_edge.is_some() {
                    disk.lstat(&node.path).map(|(mtime, _)| mtime)
                } else {
                    disk.stat(&node.path)
                };
                stat.map_err(|err| anyhow!("stat {}: {}", node.path, err))?
            }
        };
        self.graph.node_mut(id).mtime = Some(mtime);
        Ok(())
    }

    fn recompute_node_dirty(
        &mut self,
        node_id: NodeId,
        stack: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let edge_id = match self.graph.node(node_id).in_edge {
            None => {
                // If we already visited this leaf node then we are done.
                if self.graph.node(node_id).status_known() {
                    return Ok(());
                }
                // This node has no in-edge; it is dirty if it is missing.
                self.stat_if_necessary(node_id)?;
                let exists = self.graph.node(node_id).exists();
                if !exists && self.explain {
                    eprintln!(
                        "explain: {} has no in-edge and is missing",
                        self.graph.node(node_id).path
                    );
                }
                self.graph.node_mut(node_id).dirty = !exists;
                return Ok(());
            }
            Some(edge_id) => edge_id,
        };

        match self.graph.edge(edge_id).mark {
            // If we already finished this edge then we are done.
            VisitMark::Done => return Ok(()),
            // If we encountered this edge earlier in the call stack we have
            // a cycle.
            VisitMark::InStack => return Err(self.cycle_error(node_id, edge_id, stack)),
            VisitMark::Unvisited => {}
        }

        // Mark the edge temporarily while in the call stack.
        self.graph.edge_mut(edge_id).mark = VisitMark::InStack;
        stack.push(node_id);

        let mut dirty = false;
        {
            let edge = self.graph.edge_mut(edge_id);
            edge.outputs_ready = true;
            edge.deps_missing = false;
        }

        // Load output mtimes so we can compare them to the most recent input.
        for out in self.graph.edge(edge_id).outs.clone() {
            self.stat_if_necessary(out)?;
        }

        if !self.load_deps(edge_id)? {
            // Failed to load dependency info: rebuild to regenerate it.
            dirty = true;
            self.graph.edge_mut(edge_id).deps_missing = true;
        }

        // Visit all inputs; we're dirty if any of the inputs are dirty.
        let ins = self.graph.edge(edge_id).ins.clone();
        let mut most_recent_input: Option<NodeId> = None;
        for (i, &input) in ins.iter().enumerate() {
            self.recompute_node_dirty(input, stack)?;

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = self.graph.node(input).in_edge {
                if !self.graph.edge(in_edge).outputs_ready {
                    self.graph.edge_mut(edge_id).outputs_ready = false;
                }
            }

            if !self.graph.edge(edge_id).is_order_only(i) {
                // A dirty regular input dirties us; otherwise its mtime
                // competes for most-recent.
                if self.graph.node(input).dirty {
                    if self.explain {
                        eprintln!("explain: {} is dirty", self.graph.node(input).path);
                    }
                    dirty = true;
                } else {
                    let newer = match most_recent_input {
                        None => true,
                        Some(prev) => {
                            self.graph.node(input).mtime_or_missing()
                                > self.graph.node(prev).mtime_or_missing()
                        }
                    };
                    if newer {
                        most_recent_input = Some(input);
                    }
                }
            }
        }

        // We may also be dirty due to output state: missing or out-of-date
        // outputs, a changed command, a stale log entry.
        if !dirty {
            dirty = recompute_outputs_dirty(
                self.graph,
                self.build_log,
                edge_id,
                most_recent_input,
                self.explain,
            );
        }

        if dirty {
            for out in self.graph.edge(edge_id).outs.clone() {
                self.graph.node_mut(out).dirty = true;
            }
        }

        // A dirty edge's outputs are normally not ready. (Clean but not
        // ready is also possible, via order-only inputs.) The exception is a
        // phony edge with no inputs: nothing to do, so always ready.
        let always_ready = {
            let edge = self.graph.edge(edge_id);
            edge.is_phony() && edge.ins.is_empty()
        };
        if dirty && !always_ready {
            self.graph.edge_mut(edge_id).outputs_ready = false;
        }

        self.graph.edge_mut(edge_id).mark = VisitMark::Done;
        debug_assert_eq!(stack.last(), Some(&node_id));
        stack.pop();

        Ok(())
    }

    fn cycle_error(&self, node: NodeId, edge: EdgeId, stack: &[NodeId]) -> anyhow::Error {
        // Report the cycle from the stack entry owned by this edge back to
        // the current node, naming the current node at the start so that
        // `a b: rule c` / `c: rule a` reads a -> c -> a, not b -> c -> a.
        let start = stack
            .iter()
            .position(|&n| self.graph.node(n).in_edge == Some(edge))
            .unwrap_or(0);
        let mut cycle: Vec<NodeId> = stack[start..].to_vec();
        if let Some(first) = cycle.first_mut() {
            *first = node;
        }

        let mut msg = String::from("dependency cycle: ");
        for &n in &cycle {
            msg.push_str(&self.graph.node(n).path);
            msg.push_str(" -> ");
        }
        msg.push_str(&self.graph.node(cycle[0]).path);

        if start + 1 == stack.len() && self.graph.edge(edge).maybe_phonycycle_diagnostic() {
            // Old manifest generators emitted self-referencing phony edges;
            // point at the warning that accepts them.
            msg.push_str(" [-w phonycycle=err]");
        }

        anyhow!(msg)
    }

    /// Load implicit inputs for an edge from the deps log or its depfile.
    /// Ok(false) means the info is missing and the edge must rebuild to
    /// regenerate it; Err is fatal.
    fn load_deps(&mut self, edge_id: EdgeId) -> anyhow::Result<bool> {
        if self.graph.edge(edge_id).deps.is_some() {
            return Ok(self.load_deps_from_log(edge_id));
        }
        let depfile = self.graph.edge(edge_id).depfile.clone();
        if let Some(path) = depfile {
            return self.load_depfile(edge_id, &path);
        }
        Ok(true)
    }

    fn load_deps_from_log(&mut self, edge_id: EdgeId) -> bool {
        let deps_log = self.deps_log;
        // Deps are only recorded under the first output.
        let out = self.graph.edge(edge_id).outs[0];
        let entry = match deps_log.get_deps(&self.graph.node(out).path) {
            Some(entry) => entry,
            None => {
                if self.explain {
                    eprintln!(
                        "explain: deps for '{}' are missing",
                        self.graph.node(out).path
                    );
                }
                return false;
            }
        };

        // Deps are invalid if the output changed since they were recorded.
        let out_mtime = self.graph.node(out).mtime_or_missing();
        if out_mtime.raw() > entry.mtime {
            if self.explain {
                eprintln!(
                    "explain: stored deps info out of date for '{}' ({} vs {})",
                    self.graph.node(out).path,
                    entry.mtime,
                    out_mtime.raw()
                );
            }
            return false;
        }

        for name in &entry.deps {
            let dep = self.graph.file_id(name);
            self.graph.add_implicit_input(edge_id, dep);
        }
        true
    }

    fn load_depfile(&mut self, edge_id: EdgeId, path: &str) -> anyhow::Result<bool> {
        // A missing depfile means "rebuild to regenerate it", not an error.
        let content = match self.disk.read_file(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(anyhow!("loading '{}': {}", path, err)),
        };
        if content.is_empty() {
            if self.explain {
                eprintln!("explain: depfile '{}' is missing", path);
            }
            return Ok(false);
        }

        let parsed =
            depfile::parse(&content).map_err(|err| anyhow!("{}", err.format(path, &content)))?;
        let (target, deps) = match parsed.first() {
            Some((target, deps)) => (
                canon_path(*target),
                deps.iter().map(|dep| canon_path(*dep)).collect::<Vec<_>>(),
            ),
            None => {
                if self.explain {
                    eprintln!("explain: depfile '{}' is missing", path);
                }
                return Ok(false);
            }
        };

        // The depfile must describe this edge's first output; a mismatch is
        // a cache miss, not an error.
        let first_out = self.graph.edge(edge_id).outs[0];
        if target != self.graph.node(first_out).path {
            if self.explain {
                eprintln!(
                    "explain: expected depfile '{}' to mention '{}', got '{}'",
                    path,
                    self.graph.node(first_out).path,
                    target
                );
            }
            return Ok(false);
        }

        for dep in deps {
            let id = self.graph.file_id(&dep);
            self.graph.add_implicit_input(edge_id, id);
        }
        Ok(true)
    }
}

/// Decide whether any output of `edge` is out of date against the most
/// recent input and the build log. Shared between the scanner's main pass
/// and the plan's restat cleanliness propagation; consults only already
/// gathered state, never the disk.
pub fn recompute_outputs_dirty(
    graph: &Graph,
    build_log: &BuildLog,
    edge_id: EdgeId,
    most_recent_input: Option<NodeId>,
    explain: bool,
) -> bool {
    let command_hash = graph.edge(edge_id).command_hash();
    graph.edge(edge_id).outs.iter().any(|&out| {
        recompute_output_dirty(
            graph,
            build_log,
            edge_id,
            most_recent_input,
            command_hash,
            out,
            explain,
        )
    })
}

fn recompute_output_dirty(
    graph: &Graph,
    build_log: &BuildLog,
    edge_id: EdgeId,
    most_recent_input: Option<NodeId>,
    command_hash: u64,
    output: NodeId,
    explain: bool,
) -> bool {
    let edge = graph.edge(edge_id);
    let out = graph.node(output);

    if edge.is_phony() {
        // Phony edges don't write any output. Outputs are only dirty if
        // there are no inputs and we're missing the output.
        if edge.ins.is_empty() && !out.exists() {
            if explain {
                eprintln!(
                    "explain: output {} of phony edge with no inputs doesn't exist",
                    out.path
                );
            }
            return true;
        }
        return false;
    }

    // Dirty if we're missing the output.
    if !out.exists() {
        if explain {
            eprintln!("explain: output {} doesn't exist", out.path);
        }
        return true;
    }

    let mut entry: Option<&BuildLogEntry> = None;

    // Dirty if the output is older than the input.
    if let Some(input_id) = most_recent_input {
        let input_mtime = graph.node(input_id).mtime_or_missing().raw();
        if out.mtime_or_missing().raw() < input_mtime {
            let mut output_mtime = out.mtime_or_missing().raw();

            // A restat rule may have cleaned this output on a previous run
            // and stored the newer input mtime in the build log; compare
            // against that stamp so only newer modifications dirty us.
            let mut used_restat = false;
            if edge.restat {
                if let Some(log_entry) = build_log.lookup(&out.path) {
                    output_mtime = log_entry.mtime;
                    used_restat = true;
                    entry = Some(log_entry);
                }
            }

            if output_mtime < input_mtime {
                if explain {
                    eprintln!(
                        "explain: {}output {} older than most recent input {} ({} vs {})",
                        if used_restat { "restat of " } else { "" },
                        out.path,
                        graph.node(input_id).path,
                        output_mtime,
                        input_mtime
                    );
                }
                return true;
            }
        }
    }

    if entry.is_none() {
        entry = build_log.lookup(&out.path);
    }
    match entry {
        Some(log_entry) => {
            // A changed command dirties us, unless the edge is a generator
            // (those are allowed to churn).
            if !edge.generator && command_hash != log_entry.command_hash {
                if explain {
                    eprintln!("explain: command line changed for {}", out.path);
                }
                return true;
            }
            if let Some(input_id) = most_recent_input {
                let input_mtime = graph.node(input_id).mtime_or_missing().raw();
                if log_entry.mtime < input_mtime {
                    // The recorded stamp can trail the on-disk mtime when a
                    // previous run wrote the output and then failed or was
                    // interrupted; trust the log.
                    if explain {
                        eprintln!(
                            "explain: recorded mtime of {} older than most recent input {} ({} vs {})",
                            out.path,
                            graph.node(input_id).path,
                            log_entry.mtime,
                            input_mtime
                        );
                    }
                    return true;
                }
            }
        }
        None => {
            if !edge.generator {
                if explain {
                    eprintln!("explain: command line not found in log for {}", out.path);
                }
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::MemDisk;
    use crate::fs::MTime;
    use crate::graph::{DepsKind, Edge};

    fn scan_roots(
        graph: &mut Graph,
        disk: &MemDisk,
        build_log: &BuildLog,
        deps_log: &DepsLog,
        roots: &[NodeId],
    ) -> anyhow::Result<()> {
        Scan::new(graph, disk, build_log, deps_log, false).recompute_nodes_dirty(roots)
    }

    /// A `build out: cc in`-shaped graph.
    fn single_edge(graph: &mut Graph, cmdline: &str) -> (NodeId, NodeId, EdgeId) {
        let input = graph.file_id("in");
        let out = graph.file_id("out");
        let edge = graph
            .add_edge(Edge {
                ins: vec![input],
                outs: vec![out],
                cmdline: Some(cmdline.to_string()),
                ..Default::default()
            })
            .unwrap();
        (input, out, edge)
    }

    fn record_clean(log: &mut BuildLog, graph: &Graph, edge: EdgeId, out: &str, mtime: i64) {
        log.record_command(out, 0, 0, MTime::Stamp(mtime), graph.edge(edge).command_hash())
            .unwrap();
    }

    #[test]
    fn missing_leaf_is_dirty() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let leaf = graph.file_id("src.c");
        let disk = MemDisk::new();
        scan_roots(&mut graph, &disk, &BuildLog::new(), &DepsLog::new(), &[leaf])?;
        assert!(graph.node(leaf).dirty);
        assert_eq!(graph.node(leaf).mtime, Some(MTime::Missing));
        Ok(())
    }

    #[test]
    fn missing_output_is_dirty() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, edge) = single_edge(&mut graph, "cc in");
        let disk = MemDisk::new();
        disk.write("in", b"");
        scan_roots(&mut graph, &disk, &BuildLog::new(), &DepsLog::new(), &[out])?;
        assert!(graph.node(out).dirty);
        assert!(!graph.edge(edge).outputs_ready);
        Ok(())
    }

    #[test]
    fn up_to_date_output_is_clean() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, edge) = single_edge(&mut graph, "cc in");
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 200);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(!graph.node(out).dirty);
        assert!(graph.edge(edge).outputs_ready);
        // Pre-stat cache does not outlive the scan.
        assert_eq!(graph.node(out).precomputed_mtime, None);
        Ok(())
    }

    #[test]
    fn output_older_than_input_is_dirty() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, edge) = single_edge(&mut graph, "cc in");
        let disk = MemDisk::new();
        disk.write_at("out", 100, b"");
        disk.write_at("in", 200, b"");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 100);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn changed_command_is_dirty() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, _) = single_edge(&mut graph, "cc -O2 in");
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        let mut log = BuildLog::new();
        // Entry recorded under the old command.
        log.record_command("out", 0, 0, MTime::Stamp(200), crate::hash::hash_command("cc in", None))
            .unwrap();

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn generator_ignores_changed_command() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let input = graph.file_id("in");
        let out = graph.file_id("out");
        graph.add_edge(Edge {
            ins: vec![input],
            outs: vec![out],
            cmdline: Some("gen --new-flags".to_string()),
            generator: true,
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        let mut log = BuildLog::new();
        log.record_command("out", 0, 0, MTime::Stamp(200), crate::hash::hash_command("gen", None))
            .unwrap();

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(!graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn missing_log_entry_is_dirty() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, _) = single_edge(&mut graph, "cc in");
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        scan_roots(&mut graph, &disk, &BuildLog::new(), &DepsLog::new(), &[out])?;
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn restat_substitutes_logged_mtime() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let input = graph.file_id("in");
        let out = graph.file_id("out");
        let edge = graph.add_edge(Edge {
            ins: vec![input],
            outs: vec![out],
            cmdline: Some("touch out".to_string()),
            restat: true,
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        disk.write_at("out", 100, b"");
        disk.write_at("in", 200, b"");
        // A previous restat recorded the newer input mtime as clean.
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 300);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(!graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn recorded_mtime_older_than_input_is_dirty() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, edge) = single_edge(&mut graph, "cc in");
        let disk = MemDisk::new();
        disk.write_at("in", 200, b"");
        // On-disk output is newer than the input, but a prior interrupted
        // run recorded an older stamp.
        disk.write_at("out", 300, b"");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 100);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn order_only_input_does_not_dirty() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let input = graph.file_id("in");
        let oo = graph.file_id("orderonly");
        let out = graph.file_id("out");
        let edge = graph.add_edge(Edge {
            ins: vec![input, oo],
            order_only_ins: 1,
            outs: vec![out],
            cmdline: Some("cc in".to_string()),
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        disk.write_at("orderonly", 900, b"");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 200);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(!graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn phony_edge_dirtiness() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let alias = graph.file_id("alias");
        let phony = graph.add_edge(Edge {
            outs: vec![alias],
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        scan_roots(&mut graph, &disk, &BuildLog::new(), &DepsLog::new(), &[alias])?;
        // No inputs and missing output: dirty, but still ready.
        assert!(graph.node(alias).dirty);
        assert!(graph.edge(phony).outputs_ready);
        Ok(())
    }

    #[test]
    fn cycle_is_reported() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let a = graph.file_id("a");
        let b = graph.file_id("b");
        graph.add_edge(Edge {
            ins: vec![b],
            outs: vec![a],
            cmdline: Some("cat b".to_string()),
            ..Default::default()
        })?;
        graph.add_edge(Edge {
            ins: vec![a],
            outs: vec![b],
            cmdline: Some("cat a".to_string()),
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        let err = scan_roots(&mut graph, &disk, &BuildLog::new(), &DepsLog::new(), &[a])
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("dependency cycle: "), "got: {err}");
        assert!(err.contains("a -> b -> a"), "got: {err}");
        Ok(())
    }

    #[test]
    fn self_referencing_phony_gets_hint() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let a = graph.file_id("a");
        graph.add_edge(Edge {
            ins: vec![a],
            outs: vec![a],
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        let err = scan_roots(&mut graph, &disk, &BuildLog::new(), &DepsLog::new(), &[a])
            .unwrap_err()
            .to_string();
        assert!(err.contains("a -> a"), "got: {err}");
        assert!(err.contains("[-w phonycycle=err]"), "got: {err}");
        Ok(())
    }

    #[test]
    fn depfile_inputs_are_merged() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let input = graph.file_id("in");
        let out = graph.file_id("out");
        let edge = graph.add_edge(Edge {
            ins: vec![input],
            outs: vec![out],
            cmdline: Some("cc in".to_string()),
            depfile: Some("out.d".to_string()),
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("h1", 100, b"");
        disk.write_at("out", 200, b"");
        disk.write_at("out.d", 200, b"out: h1 ./h2");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 200);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;

        let h1 = graph.lookup("h1").unwrap();
        let h2 = graph.lookup("h2").unwrap();
        assert_eq!(graph.edge(edge).ins, vec![input, h1, h2]);
        assert_eq!(graph.edge(edge).implicit_ins, 2);
        assert!(!graph.edge(edge).deps_missing);
        // Discovered sources get a ready phony stand-in producer.
        assert!(graph.node(h1).in_edge.is_some());
        // h2 is missing, so the edge is dirty through it.
        assert!(graph.node(h2).dirty);
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn depfile_target_mismatch_forces_rebuild() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, edge) = single_edge(&mut graph, "cc in");
        graph.edge_mut(edge).depfile = Some("out.d".to_string());
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        disk.write_at("out.d", 200, b"different: h1");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 200);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(graph.edge(edge).deps_missing);
        assert!(graph.node(out).dirty);
        // The mismatching depfile contributed no inputs.
        assert_eq!(graph.edge(edge).implicit_ins, 0);
        Ok(())
    }

    #[test]
    fn missing_depfile_forces_rebuild() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, edge) = single_edge(&mut graph, "cc in");
        graph.edge_mut(edge).depfile = Some("out.d".to_string());
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 200);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(graph.edge(edge).deps_missing);
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn deps_log_inputs_dirty_via_newer_header() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let input = graph.file_id("in");
        let out = graph.file_id("out");
        let edge = graph.add_edge(Edge {
            ins: vec![input],
            outs: vec![out],
            cmdline: Some("cc in".to_string()),
            deps: Some(DepsKind::Gcc),
            depfile: Some("out.d".to_string()),
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        disk.write_at("header.h", 300, b"");
        let mut deps_log = DepsLog::new();
        deps_log
            .record_deps("out", MTime::Stamp(200), vec!["header.h".to_string()])
            .unwrap();
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 200);

        scan_roots(&mut graph, &disk, &log, &deps_log, &[out])?;

        let header = graph.lookup("header.h").unwrap();
        assert_eq!(graph.edge(edge).ins, vec![input, header]);
        assert!(!graph.edge(edge).deps_missing);
        // header.h (mtime 300) is newer than the recorded output stamp.
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn stale_deps_log_forces_rebuild() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let input = graph.file_id("in");
        let out = graph.file_id("out");
        let edge = graph.add_edge(Edge {
            ins: vec![input],
            outs: vec![out],
            cmdline: Some("cc in".to_string()),
            deps: Some(DepsKind::Gcc),
            ..Default::default()
        })?;
        let disk = MemDisk::new();
        disk.write_at("in", 100, b"");
        // Output is newer than the recorded deps: someone rebuilt it behind
        // our back, so the recorded deps can't be trusted.
        disk.write_at("out", 300, b"");
        let mut deps_log = DepsLog::new();
        deps_log
            .record_deps("out", MTime::Stamp(200), vec!["header.h".to_string()])
            .unwrap();
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 300);

        scan_roots(&mut graph, &disk, &log, &deps_log, &[out])?;
        assert!(graph.edge(edge).deps_missing);
        assert!(graph.node(out).dirty);
        Ok(())
    }

    #[test]
    fn serial_stat_fallback_matches() -> anyhow::Result<()> {
        let mut graph = Graph::new();
        let (_, out, edge) = single_edge(&mut graph, "cc in");
        let disk = MemDisk::with_serial_stat();
        disk.write_at("in", 100, b"");
        disk.write_at("out", 200, b"");
        let mut log = BuildLog::new();
        record_clean(&mut log, &graph, edge, "out", 200);

        scan_roots(&mut graph, &disk, &log, &DepsLog::new(), &[out])?;
        assert!(!graph.node(out).dirty);
        Ok(())
    }
}
