//! The build graph: named files, the edges that produce them, and the pools
//! that throttle them. Nodes and edges live in arenas addressed by stable
//! ids; the structure is read-mostly once scanning begins, with the specific
//! exceptions of dep-loader-discovered inputs and scan/build bookkeeping.

use anyhow::bail;

use crate::concurrent_list::ConcurrentList;
use crate::densemap::{self, DenseMap};
use crate::fs::MTime;
use crate::hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u)
    }
}
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(usize);
impl From<usize> for EdgeId {
    fn from(u: usize) -> EdgeId {
        EdgeId(u)
    }
}
impl densemap::Index for EdgeId {
    fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(usize);
impl From<usize> for PoolId {
    fn from(u: usize) -> PoolId {
        PoolId(u)
    }
}
impl densemap::Index for PoolId {
    fn index(&self) -> usize {
        self.0
    }
}

/// A named file or logical target.
pub struct Node {
    pub path: String,
    /// Per-separator backslash mask, Windows bookkeeping; opaque elsewhere.
    pub slash_bits: u64,
    /// The edge producing this node, if any. At most one.
    pub in_edge: Option<EdgeId>,
    /// Out-edges declared by the manifest; observed sorted by edge identity.
    out_edges: ConcurrentList<EdgeId>,
    /// Out-edges registered by dep scanning, in discovery order.
    dep_scan_out_edges: Vec<EdgeId>,
    /// Some once the node has been statted; None means status unknown.
    pub mtime: Option<MTime>,
    /// Stat gathered by the scanner's parallel pre-stat pass; cleared when
    /// the scan finishes so later stats go back to disk.
    pub precomputed_mtime: Option<MTime>,
    pub dirty: bool,
    /// Visited flag for the scanner's collect pass.
    pub precomputed_dirtiness: bool,
}

impl Node {
    fn new(path: String, slash_bits: u64) -> Node {
        Node {
            path,
            slash_bits,
            in_edge: None,
            out_edges: ConcurrentList::new(),
            dep_scan_out_edges: Vec::new(),
            mtime: None,
            precomputed_mtime: None,
            dirty: false,
            precomputed_dirtiness: false,
        }
    }

    pub fn status_known(&self) -> bool {
        self.mtime.is_some()
    }

    pub fn exists(&self) -> bool {
        matches!(self.mtime, Some(m) if m.exists())
    }

    /// The node's mtime, treating "not yet statted" as missing.
    pub fn mtime_or_missing(&self) -> MTime {
        self.mtime.unwrap_or(MTime::Missing)
    }
}

/// DFS coloring for the scanner's cycle detection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VisitMark {
    #[default]
    Unvisited,
    InStack,
    Done,
}

/// How an edge exposes compiler-discovered dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepsKind {
    /// Depfile written by the command, folded into the deps log.
    Gcc,
    /// `/showIncludes` lines in the command output.
    Msvc,
}

#[derive(Debug, Clone, Hash)]
pub struct RspFile {
    pub path: String,
    pub content: String,
}

/// Facts the scanner needs per edge, computed once during the precompute
/// fan-out and cached.
#[derive(Debug, Clone, Copy)]
pub struct DepScanInfo {
    pub restat: bool,
    pub generator: bool,
    pub deps: bool,
    pub depfile: bool,
    pub command_hash: u64,
}

/// A rule application producing one or more outputs from one or more inputs.
#[derive(Default)]
pub struct Edge {
    /// Inputs, ordered explicit then implicit then order-only.
    pub ins: Vec<NodeId>,
    pub implicit_ins: usize,
    pub order_only_ins: usize,
    /// Outputs, ordered explicit then implicit.
    pub outs: Vec<NodeId>,
    pub implicit_outs: usize,
    /// Final command string; phony edges have none.
    pub cmdline: Option<String>,
    pub desc: Option<String>,
    pub depfile: Option<String>,
    pub rspfile: Option<RspFile>,
    pub deps: Option<DepsKind>,
    pub msvc_deps_prefix: Option<String>,
    pub restat: bool,
    pub generator: bool,
    pub pool: PoolId,

    // Scan and build state.
    pub mark: VisitMark,
    pub outputs_ready: bool,
    pub deps_missing: bool,
    /// Visited flag for the scanner's collect pass.
    pub precomputed_dirtiness: bool,
    pub dep_scan_info: Option<DepScanInfo>,
}

impl Edge {
    pub fn is_phony(&self) -> bool {
        self.cmdline.is_none()
    }

    pub fn explicit_ins(&self) -> usize {
        self.ins.len() - self.implicit_ins - self.order_only_ins
    }

    /// The inputs whose mtimes dirty this edge: everything but order-only.
    pub fn non_order_only_ins(&self) -> &[NodeId] {
        &self.ins[..self.ins.len() - self.order_only_ins]
    }

    pub fn is_order_only(&self, index: usize) -> bool {
        index >= self.ins.len() - self.order_only_ins
    }

    pub fn explicit_outs(&self) -> &[NodeId] {
        &self.outs[..self.outs.len() - self.implicit_outs]
    }

    /// Whether a self-referencing cycle through this edge matches the shape
    /// old manifest generators produced for phony aliases.
    pub fn maybe_phonycycle_diagnostic(&self) -> bool {
        self.is_phony()
            && self.outs.len() == 1
            && self.implicit_outs == 0
            && self.implicit_ins == 0
            && self.order_only_ins == 0
    }

    pub fn compute_dep_scan_info(&self) -> DepScanInfo {
        DepScanInfo {
            restat: self.restat,
            generator: self.generator,
            deps: self.deps.is_some(),
            depfile: self.depfile.is_some(),
            command_hash: hash::hash_command(
                self.cmdline.as_deref().unwrap_or(""),
                self.rspfile.as_ref().map(|r| r.content.as_str()),
            ),
        }
    }

    pub fn set_dep_scan_info(&mut self, info: DepScanInfo) {
        self.dep_scan_info = Some(info);
    }

    /// Cached scan info, or a fresh computation when the precompute pass has
    /// not run over this edge (e.g. one synthesized after scanning).
    pub fn dep_scan_info(&self) -> DepScanInfo {
        self.dep_scan_info
            .unwrap_or_else(|| self.compute_dep_scan_info())
    }

    pub fn command_hash(&self) -> u64 {
        self.dep_scan_info().command_hash
    }
}

/// A named concurrency class. Depth zero means unbounded.
pub struct Pool {
    pub name: String,
    pub depth: usize,
}

pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    edges: DenseMap<EdgeId, Edge>,
    pools: DenseMap<PoolId, Pool>,
    by_path: hashbrown::HashMap<String, NodeId, ahash::RandomState>,
}

impl Graph {
    pub fn new() -> Graph {
        let mut graph = Graph {
            nodes: DenseMap::new(),
            edges: DenseMap::new(),
            pools: DenseMap::new(),
            by_path: hashbrown::HashMap::default(),
        };
        // PoolId::default() refers to this unbounded pool.
        graph.pools.push(Pool {
            name: String::new(),
            depth: 0,
        });
        graph
    }

    /// Intern a path, creating the node on first reference.
    pub fn file_id(&mut self, name: &str) -> NodeId {
        self.file_id_with_slash_bits(name, 0)
    }

    /// Intern a path with an explicit separator mask. The mask only applies
    /// when the node is created; an existing node keeps its own.
    pub fn file_id_with_slash_bits(&mut self, name: &str, slash_bits: u64) -> NodeId {
        if let Some(&id) = self.by_path.get(name) {
            return id;
        }
        let id = self.nodes.push(Node::new(name.to_string(), slash_bits));
        self.by_path.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_path.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges.get(id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.get_mut(id)
    }

    pub fn add_pool(&mut self, name: &str, depth: usize) -> PoolId {
        self.pools.push(Pool {
            name: name.to_string(),
            depth,
        })
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        self.pools.get(id)
    }

    pub fn pools(&self) -> &DenseMap<PoolId, Pool> {
        &self.pools
    }

    pub fn add_edge(&mut self, edge: Edge) -> anyhow::Result<EdgeId> {
        let id = self.edges.next_id();
        for &out in &edge.outs {
            let node = self.nodes.get_mut(out);
            if node.in_edge.is_some() {
                bail!("multiple rules generate {}", node.path);
            }
            node.in_edge = Some(id);
        }
        for &input in &edge.ins {
            self.nodes.get(input).out_edges.prepend(id);
        }
        self.edges.push(edge);
        Ok(id)
    }

    /// Manifest out-edges sorted by edge identity, then dep-scan out-edges in
    /// discovery order. This ordering is observable and stable.
    pub fn get_out_edges(&self, id: NodeId) -> Vec<EdgeId> {
        let node = self.nodes.get(id);
        let mut result: Vec<EdgeId> = node.out_edges.iter().copied().collect();
        result.sort_unstable();
        result.extend(node.dep_scan_out_edges.iter().copied());
        result
    }

    /// Record a discovered implicit input on an edge: insert it just before
    /// the order-only range, register the edge on the node's dep-scan
    /// out-edge list, and give in-edge-less nodes a phony producer.
    pub fn add_implicit_input(&mut self, edge_id: EdgeId, input: NodeId) {
        {
            let edge = self.edges.get_mut(edge_id);
            let pos = edge.ins.len() - edge.order_only_ins;
            edge.ins.insert(pos, input);
            edge.implicit_ins += 1;
        }
        self.nodes.get_mut(input).dep_scan_out_edges.push(edge_id);
        if self.nodes.get(input).in_edge.is_none() {
            self.add_phony_in_edge(input);
        }
    }

    /// Synthesize a phony in-edge for a dep-scan-discovered source. A prior
    /// scan may already have statted the node as a leaf and considered it
    /// ready, so the stand-in edge starts with outputs_ready set; a scan
    /// that does visit it computes the real value.
    fn add_phony_in_edge(&mut self, node: NodeId) {
        let edge = Edge {
            outs: vec![node],
            outputs_ready: true,
            ..Default::default()
        };
        let id = self.edges.push(edge);
        self.nodes.get_mut(node).in_edge = Some(id);
    }
}
