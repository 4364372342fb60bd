//! Shell emission.
//!
//! Turns one (sub)graph back into a bash script: a `mkfifo` prologue for
//! ephemeral edges, one background job per node in topological order, and
//! a closing `wait`. Remote splice nodes render as invocations of the
//! datastream helpers under `$DISH_TOP/runtime`.

use petgraph::{algo::toposort, graphmap::GraphMap, Directed};
use std::{
	collections::BTreeSet,
	fmt::Write,
	path::{Path, PathBuf},
};
use thiserror::Error;

use crate::{
	fileid::{FileId, PipeRole, Resource},
	graph::{DataflowGraph, GraphError},
	id::{FileIdent, NodeId},
	node::{Arg, Node, NodeKind},
};

//
// MARK: Errors
//

#[derive(Debug, Error)]
pub enum EmitError {
	#[error("graph error while emitting")]
	Graph(#[from] GraphError),

	#[error("cannot emit a graph with a cycle")]
	HasCycle,

	/// A command node has more edges than stdin/stdout/argv can carry
	#[error("node {node:?} cannot route edge {edge:?} to the command line")]
	UnroutedEdge { node: NodeId, edge: FileIdent },

	/// A synthetic node is missing an edge its rendering needs
	#[error("node {node:?} is malformed: {what}")]
	MalformedNode { node: NodeId, what: &'static str },
}

//
// MARK: Quoting
//

/// Shell-quote a single word. Plain words pass through untouched so that
/// emitted scripts stay readable.
fn quote(s: &str) -> String {
	let plain = !s.is_empty()
		&& s.chars()
			.all(|c| c.is_ascii_alphanumeric() || "_-./=:%+,@^".contains(c));
	if plain {
		s.to_owned()
	} else {
		format!("'{}'", s.replace('\'', "'\\''"))
	}
}

/// Quote a path while keeping variable references expandable. DFS paths
/// arrive as `$HDFS_DATANODE_DIR/…` and each worker expands its own
/// datanode directory.
fn quote_path(s: &str) -> String {
	if s.contains('$') {
		format!(
			"\"{}\"",
			s.replace('\\', "\\\\").replace('"', "\\\"").replace('`', "\\`")
		)
	} else {
		quote(s)
	}
}

fn fifo_path(tmp_prefix: &Path, fid: &FileId) -> PathBuf {
	let dir = if fid.prefix().is_empty() {
		tmp_prefix.to_path_buf()
	} else {
		tmp_prefix.join(fid.prefix())
	};
	dir.join(format!("fifo{}", i64::from(fid.ident())))
}

//
// MARK: Emitter
//

struct Emitter<'a> {
	graph: &'a DataflowGraph,
	tmp_prefix: &'a Path,
}

impl Emitter<'_> {
	/// The path-like rendering of an edge, for argv references and
	/// redirect targets.
	fn edge_word(&self, ident: FileIdent) -> Result<String, EmitError> {
		let edge = self
			.graph
			.get_edge(ident)
			.ok_or(GraphError::MissingEdge(ident))?;

		let word = match edge.fid.resource() {
			Resource::File { path, .. } => quote_path(&path.to_string_lossy()),
			Resource::Ephemeral => quote(&fifo_path(self.tmp_prefix, &edge.fid).to_string_lossy()),
			Resource::FileDescriptor { fd } => format!("/dev/fd/{fd}"),
			Resource::RemotePipe { host, port, role } => match role {
				PipeRole::Read => format!(
					"<(\"$DISH_TOP\"/runtime/dish_read --host {} --port {port})",
					quote(host)
				),
				PipeRole::Write => format!(
					">(\"$DISH_TOP\"/runtime/dish_write --listen --port {port})"
				),
			},
		};
		return Ok(word);
	}

	/// `< …` rendering for a node's stdin edge. Descriptor 0 is already
	/// where it needs to be.
	fn stdin_redirect(&self, ident: FileIdent) -> Result<String, EmitError> {
		let edge = self
			.graph
			.get_edge(ident)
			.ok_or(GraphError::MissingEdge(ident))?;

		let r = match edge.fid.resource() {
			Resource::FileDescriptor { fd: 0 } => String::new(),
			Resource::FileDescriptor { fd } => format!(" 0<&{fd}"),
			_ => format!(" < {}", self.edge_word(ident)?),
		};
		return Ok(r);
	}

	/// `> …` rendering for a node's stdout edge.
	fn stdout_redirect(&self, ident: FileIdent) -> Result<String, EmitError> {
		let edge = self
			.graph
			.get_edge(ident)
			.ok_or(GraphError::MissingEdge(ident))?;

		let r = match edge.fid.resource() {
			Resource::FileDescriptor { fd: 1 } => String::new(),
			Resource::FileDescriptor { fd } => format!(" 1>&{fd}"),
			_ => format!(" > {}", self.edge_word(ident)?),
		};
		return Ok(r);
	}

	fn emit_command(&self, node: &Node, argv: &[Arg]) -> Result<String, EmitError> {
		let referenced: BTreeSet<FileIdent> = argv
			.iter()
			.filter_map(|a| match a {
				Arg::Fid(f) => Some(*f),
				Arg::Lit(_) => None,
			})
			.collect();

		let mut words = Vec::with_capacity(argv.len());
		if let NodeKind::Command { env, .. } = node.kind() {
			for (k, v) in env {
				words.push(format!("{k}={}", quote(v)));
			}
		}
		for arg in argv {
			words.push(match arg {
				Arg::Lit(s) => quote(s),
				Arg::Fid(f) => self.edge_word(*f)?,
			});
		}

		let mut line = words.join(" ");

		let mut unrouted_in = node.inputs().iter().filter(|i| !referenced.contains(i));
		if let Some(stdin) = unrouted_in.next() {
			line.push_str(&self.stdin_redirect(*stdin)?);
		}
		if let Some(extra) = unrouted_in.next() {
			return Err(EmitError::UnroutedEdge {
				node: node.id(),
				edge: *extra,
			});
		}

		let mut unrouted_out = node.outputs().iter().filter(|i| !referenced.contains(i));
		if let Some(stdout) = unrouted_out.next() {
			line.push_str(&self.stdout_redirect(*stdout)?);
		}
		if let Some(extra) = unrouted_out.next() {
			return Err(EmitError::UnroutedEdge {
				node: node.id(),
				edge: *extra,
			});
		}

		return Ok(line);
	}

	fn single_input(&self, node: &Node) -> Result<FileIdent, EmitError> {
		node.inputs()
			.first()
			.copied()
			.ok_or(EmitError::MalformedNode {
				node: node.id(),
				what: "missing input edge",
			})
	}

	fn single_output(&self, node: &Node) -> Result<FileIdent, EmitError> {
		node.outputs()
			.first()
			.copied()
			.ok_or(EmitError::MalformedNode {
				node: node.id(),
				what: "missing output edge",
			})
	}

	fn emit_node(&self, node: &Node) -> Result<String, EmitError> {
		let line = match node.kind() {
			NodeKind::Command { argv, .. } => self.emit_command(node, argv)?,

			NodeKind::RemoteRead {
				host,
				port,
				uuid,
				debug,
			} => {
				let mut line = format!(
					"\"$DISH_TOP\"/runtime/dish_read --host {} --port {port} --uuid {uuid}",
					quote(host),
				);
				if *debug {
					line.push_str(" --debug");
				}
				line.push_str(&self.stdout_redirect(self.single_output(node)?)?);
				line
			}

			NodeKind::RemoteWrite {
				port,
				uuid,
				debug,
				kill,
				..
			} => {
				let mut line = format!(
					"\"$DISH_TOP\"/runtime/dish_write --listen --port {port} --uuid {uuid}"
				);
				if let Some(role) = kill {
					write!(line, " --kill {}", quote(role)).unwrap();
				}
				if *debug {
					line.push_str(" --debug");
				}
				line.push_str(&self.stdin_redirect(self.single_input(node)?)?);
				line.push_str(&self.stdout_redirect(self.single_output(node)?)?);
				line
			}

			NodeKind::Eager => {
				let mut line = "\"$DISH_TOP\"/runtime/dish_eager".to_owned();
				line.push_str(&self.stdin_redirect(self.single_input(node)?)?);
				line.push_str(&self.stdout_redirect(self.single_output(node)?)?);
				line
			}

			NodeKind::Split => {
				let mut line = "\"$DISH_TOP\"/runtime/dish_split".to_owned();
				for out in node.outputs() {
					write!(line, " {}", self.edge_word(*out)?).unwrap();
				}
				line.push_str(&self.stdin_redirect(self.single_input(node)?)?);
				line
			}

			NodeKind::Merge => {
				let mut line = "cat".to_owned();
				for input in node.inputs() {
					write!(line, " {}", self.edge_word(*input)?).unwrap();
				}
				line.push_str(&self.stdout_redirect(self.single_output(node)?)?);
				line
			}

			NodeKind::Unwrap => {
				let mut line = "\"$DISH_TOP\"/runtime/dish_unwrap".to_owned();
				line.push_str(&self.stdin_redirect(self.single_input(node)?)?);
				line.push_str(&self.stdout_redirect(self.single_output(node)?)?);
				line
			}
		};

		return Ok(line);
	}
}

/// Nodes in an order that respects the graph's edges.
fn topo_order(graph: &DataflowGraph) -> Result<Vec<NodeId>, EmitError> {
	let mut fake_graph = GraphMap::<i64, (), Directed>::new();
	for node in graph.iter_nodes() {
		fake_graph.add_node(node.id().into());
	}
	for edge in graph.iter_edges() {
		if let (Some(from), Some(to)) = (edge.from, edge.to) {
			fake_graph.add_edge(from.into(), to.into(), ());
		}
	}

	let sorted = toposort(&fake_graph, None).map_err(|_cycle| EmitError::HasCycle)?;
	return Ok(sorted.into_iter().map(NodeId::from).collect());
}

/// Render `graph` as a bash script.
///
/// Ephemeral edges materialize as FIFOs under `tmp_prefix`; every node
/// becomes one background job; the script waits for all of them.
pub fn to_shell(graph: &DataflowGraph, tmp_prefix: &Path) -> Result<String, EmitError> {
	let emitter = Emitter { graph, tmp_prefix };

	let fifos: Vec<String> = graph
		.iter_edges()
		.filter(|e| e.fid.is_ephemeral())
		.map(|e| quote(&fifo_path(tmp_prefix, &e.fid).to_string_lossy()))
		.collect();
	let fifo_dirs: BTreeSet<String> = graph
		.iter_edges()
		.filter(|e| e.fid.is_ephemeral())
		.filter_map(|e| {
			fifo_path(tmp_prefix, &e.fid)
				.parent()
				.map(|p| quote(&p.to_string_lossy()))
		})
		.collect();

	let mut script = String::new();
	script.push_str("#!/bin/bash\n");

	if !fifos.is_empty() {
		for dir in &fifo_dirs {
			writeln!(script, "mkdir -p {dir}").unwrap();
		}
		writeln!(script, "rm -f {}", fifos.join(" ")).unwrap();
		writeln!(script, "mkfifo {}", fifos.join(" ")).unwrap();
	}

	for node_id in topo_order(graph)? {
		let node = graph
			.get_node(node_id)
			.ok_or(GraphError::MissingNode(node_id))?;
		writeln!(script, "{} &", emitter.emit_node(node)?).unwrap();
	}

	script.push_str("wait\n");

	if !fifos.is_empty() {
		writeln!(script, "rm -f {}", fifos.join(" ")).unwrap();
	}

	return Ok(script);
}

//
// MARK: Tests
//

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{fileid::FileIdGen, id::SubgraphIdGen, split::split_graph};

	fn file_fid(gen: &mut FileIdGen, path: &str) -> FileId {
		let mut f = gen.next_file_id();
		f.set_resource(Resource::File {
			path: path.into(),
			replicas: vec![],
		});
		f
	}

	/// Split an emitted line back into words, undoing our quoting.
	fn reparse(line: &str) -> Vec<String> {
		let mut words = Vec::new();
		let mut cur = String::new();
		let mut in_quotes = false;
		let mut chars = line.chars().peekable();
		while let Some(c) = chars.next() {
			match c {
				'\'' if !in_quotes => in_quotes = true,
				'\'' if in_quotes => {
					// either closing, or the '\'' escape
					if chars.peek() == Some(&'\\') {
						chars.next();
						chars.next();
						cur.push('\'');
					} else {
						in_quotes = false;
					}
				}
				' ' if !in_quotes => {
					if !cur.is_empty() {
						words.push(std::mem::take(&mut cur));
					}
				}
				c => cur.push(c),
			}
		}
		if !cur.is_empty() {
			words.push(cur);
		}
		words
	}

	#[test]
	fn trivial_graph_round_trips() {
		let mut gen = FileIdGen::starting_at(1);
		let mut g = DataflowGraph::new();

		let input = file_fid(&mut gen, "/tmp/in files/books.txt");
		let output = file_fid(&mut gen, "/tmp/out.txt");
		g.add_edge(input.clone()).unwrap();
		g.add_edge(output.clone()).unwrap();
		g.add_node(Node::command(
			1.into(),
			&["grep", "-c", "one two"],
			vec![input.ident()],
			vec![output.ident()],
		))
		.unwrap();

		// Splitting a single node introduces no remote splices.
		let mut ids = SubgraphIdGen::new();
		let split = split_graph(&g, &mut ids).unwrap();
		assert_eq!(split.subgraphs.len(), 1);
		let sub = &split.subgraphs[0];
		assert!(sub
			.graph
			.iter_nodes()
			.all(|n| !n.is_remote_read() && !n.is_remote_write()));

		let script = to_shell(&sub.graph, Path::new("/tmp/dish")).unwrap();
		let line = script
			.lines()
			.find(|l| l.contains("grep"))
			.unwrap()
			.trim_end_matches(" &");

		let words = reparse(line);
		assert_eq!(
			words,
			vec!["grep", "-c", "one two", "<", "/tmp/in files/books.txt", ">", "/tmp/out.txt"]
		);
	}

	#[test]
	fn ephemeral_edges_become_fifos() {
		let mut gen = FileIdGen::starting_at(1);
		let mut g = DataflowGraph::new();

		let input = file_fid(&mut gen, "/tmp/in.txt");
		let mid = gen.next_ephemeral_file_id();
		let output = file_fid(&mut gen, "/tmp/out.txt");
		for fid in [&input, &mid, &output] {
			g.add_edge((*fid).clone()).unwrap();
		}
		g.add_node(Node::command(
			1.into(),
			&["cat"],
			vec![input.ident()],
			vec![mid.ident()],
		))
		.unwrap();
		g.add_node(Node::command(
			2.into(),
			&["wc", "-l"],
			vec![mid.ident()],
			vec![output.ident()],
		))
		.unwrap();

		let script = to_shell(&g, Path::new("/tmp/dish")).unwrap();

		assert!(script.contains("mkfifo /tmp/dish/fifo2"));
		assert!(script.contains("cat < /tmp/in.txt > /tmp/dish/fifo2 &"));
		assert!(script.contains("wc -l < /tmp/dish/fifo2 > /tmp/out.txt &"));
		assert!(script.ends_with("rm -f /tmp/dish/fifo2\n"));

		// Producer before consumer.
		assert!(script.find("cat <").unwrap() < script.find("wc -l").unwrap());
	}

	#[test]
	fn argv_edge_references_render_as_paths() {
		let mut gen = FileIdGen::starting_at(1);
		let mut g = DataflowGraph::new();

		let input = file_fid(&mut gen, "/tmp/in.txt");
		let to_file = file_fid(&mut gen, "/tmp/copy.txt");
		let out = gen.next_ephemeral_file_id();
		for fid in [&input, &to_file, &out] {
			g.add_edge((*fid).clone()).unwrap();
		}

		g.add_node(Node::new(
			1.into(),
			vec![input.ident()],
			vec![to_file.ident(), out.ident()],
			NodeKind::Command {
				argv: vec![Arg::lit("tee"), Arg::Fid(to_file.ident())],
				env: Default::default(),
			},
		))
		.unwrap();

		let script = to_shell(&g, Path::new("/tmp/dish")).unwrap();
		assert!(script.contains("tee /tmp/copy.txt < /tmp/in.txt > /tmp/dish/fifo3 &"));
	}

	#[test]
	fn remote_pair_renders_helper_invocations() {
		let mut gen = FileIdGen::starting_at(1);
		let uuid = uuid::Uuid::new_v4();

		// Writer side
		let mut wg = DataflowGraph::new();
		let eph = gen.next_ephemeral_file_id();
		let mut stdout = gen.next_file_id();
		stdout.set_resource(Resource::FileDescriptor { fd: 1 });
		let mut input = file_fid(&mut gen, "/tmp/in.txt");
		input.set_prefix("");
		wg.add_edge(eph.clone()).unwrap();
		wg.add_edge(stdout.clone()).unwrap();
		wg.add_edge(input.clone()).unwrap();
		wg.add_node(Node::command(
			1.into(),
			&["sort"],
			vec![input.ident()],
			vec![eph.ident()],
		))
		.unwrap();
		wg.add_node(Node::remote_write(
			2.into(),
			eph.ident(),
			stdout.ident(),
			"worker-1",
			58003,
			uuid,
		))
		.unwrap();

		let script = to_shell(&wg, Path::new("/tmp/dish")).unwrap();
		assert!(script.contains(&format!(
			"\"$DISH_TOP\"/runtime/dish_write --listen --port 58003 --uuid {uuid} < /tmp/dish/fifo1 &"
		)));

		// Reader side
		let mut rg = DataflowGraph::new();
		let target = file_fid(&mut gen, "/tmp/out.txt");
		rg.add_edge(target.clone()).unwrap();
		rg.add_node(Node::remote_read(
			3.into(),
			target.ident(),
			"worker-1",
			58003,
			uuid,
		))
		.unwrap();

		let script = to_shell(&rg, Path::new("/tmp/dish")).unwrap();
		assert!(script.contains(&format!(
			"\"$DISH_TOP\"/runtime/dish_read --host worker-1 --port 58003 --uuid {uuid} > /tmp/out.txt &"
		)));
	}

	#[test]
	fn dfs_paths_keep_their_variables_expandable() {
		let mut gen = FileIdGen::starting_at(1);
		let mut g = DataflowGraph::new();

		let mut input = gen.next_file_id();
		input.set_resource(Resource::File {
			path: "$HDFS_DATANODE_DIR/books/part-0".into(),
			replicas: vec!["worker-1".into()],
		});
		let output = file_fid(&mut gen, "/tmp/out.txt");
		g.add_edge(input.clone()).unwrap();
		g.add_edge(output.clone()).unwrap();
		g.add_node(Node::command(
			1.into(),
			&["wc", "-l"],
			vec![input.ident()],
			vec![output.ident()],
		))
		.unwrap();

		let script = to_shell(&g, Path::new("/tmp/dish")).unwrap();
		assert!(script.contains("wc -l < \"$HDFS_DATANODE_DIR/books/part-0\" > /tmp/out.txt &"));
	}

	#[test]
	fn merge_concatenates_inputs_in_order() {
		let mut gen = FileIdGen::starting_at(1);
		let mut g = DataflowGraph::new();

		let a = file_fid(&mut gen, "/tmp/a.txt");
		let b = file_fid(&mut gen, "/tmp/b.txt");
		let out = file_fid(&mut gen, "/tmp/out.txt");
		for fid in [&a, &b, &out] {
			g.add_edge((*fid).clone()).unwrap();
		}
		g.add_node(Node::new(
			1.into(),
			vec![a.ident(), b.ident()],
			vec![out.ident()],
			NodeKind::Merge,
		))
		.unwrap();

		let script = to_shell(&g, Path::new("/tmp/dish")).unwrap();
		assert!(script.contains("cat /tmp/a.txt /tmp/b.txt > /tmp/out.txt &"));
	}
}
