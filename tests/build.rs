//! End-to-end tests driving the builder with real commands in a temporary
//! directory.

#![cfg(unix)]

use std::time::Duration;

use joist::db::{BuildLog, DepsLog};
use joist::fs::RealDisk;
use joist::graph::{DepsKind, Edge, Graph, NodeId};
use joist::status::ConsoleStatus;
use joist::work::{BuildConfig, Builder};

/// Manages a temporary directory for running builds in. Node paths are
/// absolute so tests don't have to chdir.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
        })
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_str().unwrap().to_string()
    }

    fn write(&self, name: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(name), content)
    }

    fn read(&self, name: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(name))
    }

    fn exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }
}

/// in -> mid -> out, each step a `cat`.
fn chain_graph(space: &TestSpace) -> anyhow::Result<(Graph, NodeId)> {
    let mut graph = Graph::new();
    let input = graph.file_id(&space.path("in"));
    let mid = graph.file_id(&space.path("mid"));
    let out = graph.file_id(&space.path("out"));
    graph.add_edge(Edge {
        ins: vec![input],
        outs: vec![mid],
        cmdline: Some(format!("cat {} > {}", space.path("in"), space.path("mid"))),
        ..Default::default()
    })?;
    graph.add_edge(Edge {
        ins: vec![mid],
        outs: vec![out],
        cmdline: Some(format!("cat {} > {}", space.path("mid"), space.path("out"))),
        ..Default::default()
    })?;
    Ok((graph, out))
}

#[test]
fn chain_build_then_no_op() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "hello\n")?;
    let disk = RealDisk::new();

    let ran = {
        let (graph, out) = chain_graph(&space)?;
        let build_log = BuildLog::open(&space.path("build.log"))?;
        let deps_log = DepsLog::open(&space.path("deps.log"))?;
        let mut status = ConsoleStatus::new(false);
        let mut builder = Builder::new(
            graph,
            build_log,
            deps_log,
            BuildConfig::default(),
            &disk,
            &mut status,
        );
        builder.add_targets(&[out])?;
        assert!(!builder.already_up_to_date());
        builder.build()?
    };
    assert_eq!(ran, 2);
    assert_eq!(space.read("out")?, b"hello\n");

    // Re-running the engine immediately after performs zero launches.
    let ran = {
        let (graph, out) = chain_graph(&space)?;
        let build_log = BuildLog::open(&space.path("build.log"))?;
        let deps_log = DepsLog::open(&space.path("deps.log"))?;
        let mut status = ConsoleStatus::new(false);
        let mut builder = Builder::new(
            graph,
            build_log,
            deps_log,
            BuildConfig::default(),
            &disk,
            &mut status,
        );
        builder.add_targets(&[out])?;
        assert!(builder.already_up_to_date());
        builder.build()?
    };
    assert_eq!(ran, 0);
    Ok(())
}

#[test]
fn failing_command_fails_the_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "")?;
    let disk = RealDisk::new();

    let mut graph = Graph::new();
    let input = graph.file_id(&space.path("in"));
    let out = graph.file_id(&space.path("out"));
    graph.add_edge(Edge {
        ins: vec![input],
        outs: vec![out],
        cmdline: Some("exit 1".to_string()),
        ..Default::default()
    })?;

    let mut status = ConsoleStatus::new(false);
    let mut builder = Builder::new(
        graph,
        BuildLog::new(),
        DepsLog::new(),
        BuildConfig::default(),
        &disk,
        &mut status,
    );
    builder.add_targets(&[out])?;
    let err = builder.build().unwrap_err().to_string();
    assert_eq!(err, "subcommand failed");
    Ok(())
}

/// One compile-like edge whose command produces a depfile naming a header.
fn depfile_graph(space: &TestSpace) -> anyhow::Result<(Graph, NodeId)> {
    let mut graph = Graph::new();
    let src = graph.file_id(&space.path("src"));
    let out = graph.file_id(&space.path("out"));
    let cmd = format!(
        "printf '%s: %s\\n' {out} {hdr} > {depfile} && cat {src} {hdr} > {out}",
        out = space.path("out"),
        hdr = space.path("hdr"),
        depfile = space.path("out.d"),
        src = space.path("src"),
    );
    graph.add_edge(Edge {
        ins: vec![src],
        outs: vec![out],
        cmdline: Some(cmd),
        deps: Some(DepsKind::Gcc),
        depfile: Some(space.path("out.d")),
        ..Default::default()
    })?;
    Ok((graph, out))
}

fn run_depfile_build(space: &TestSpace, disk: &RealDisk) -> anyhow::Result<usize> {
    let (graph, out) = depfile_graph(space)?;
    let build_log = BuildLog::open(&space.path("build.log"))?;
    let deps_log = DepsLog::open(&space.path("deps.log"))?;
    let mut status = ConsoleStatus::new(false);
    let mut builder = Builder::new(
        graph,
        build_log,
        deps_log,
        BuildConfig::default(),
        disk,
        &mut status,
    );
    builder.add_targets(&[out])?;
    builder.build()
}

#[test]
fn discovered_header_triggers_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src", "src\n")?;
    space.write("hdr", "hdr\n")?;
    let disk = RealDisk::new();

    // First build discovers the header and deletes the depfile.
    assert_eq!(run_depfile_build(&space, &disk)?, 1);
    assert_eq!(space.read("out")?, b"src\nhdr\n");
    assert!(!space.exists("out.d"));
    {
        let deps_log = DepsLog::open(&space.path("deps.log"))?;
        let entry = deps_log.get_deps(&space.path("out")).unwrap();
        assert_eq!(entry.deps, vec![space.path("hdr")]);
    }

    // Nothing changed: no work.
    assert_eq!(run_depfile_build(&space, &disk)?, 0);

    // Touching only the discovered header reruns the compile.
    std::thread::sleep(Duration::from_millis(20));
    space.write("hdr", "hdr2\n")?;
    assert_eq!(run_depfile_build(&space, &disk)?, 1);
    assert_eq!(space.read("out")?, b"src\nhdr2\n");
    Ok(())
}

#[test]
fn independent_edges_build_in_parallel() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("in", "")?;
    let disk = RealDisk::new();

    let mut graph = Graph::new();
    let input = graph.file_id(&space.path("in"));
    let mut targets = Vec::new();
    for i in 0..3 {
        let name = format!("out{i}");
        let out = graph.file_id(&space.path(&name));
        graph.add_edge(Edge {
            ins: vec![input],
            outs: vec![out],
            cmdline: Some(format!("touch {}", space.path(&name))),
            ..Default::default()
        })?;
        targets.push(out);
    }

    let config = BuildConfig {
        parallelism: 2,
        ..Default::default()
    };
    let mut status = ConsoleStatus::new(false);
    let mut builder = Builder::new(
        graph,
        BuildLog::new(),
        DepsLog::new(),
        config,
        &disk,
        &mut status,
    );
    builder.add_targets(&targets)?;
    assert_eq!(builder.build()?, 3);
    for i in 0..3 {
        assert!(space.exists(&format!("out{i}")));
    }
    Ok(())
}
