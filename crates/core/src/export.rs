//! Text export of presentation and diff trees.
//!
//! Three node formats, one row (or element) per node in depth-first order:
//!
//! * CSV: every field quoted, depth shown as leading spaces inside the name
//!   field, CRLF line ends.
//! * HTML: `<tr>` rows, depth shown as leading dots in the method cell.
//! * XML: nested `<Node>` elements, one space of indent per level.

use std::fmt::Write as _;
use std::io::{self, BufWriter, Write};

use memcct_protocol::SharedStr;
use thiserror::Error;

use crate::views::{DiffNode, DiffTree, PresoNode, PresoTree};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Html,
    Xml,
}

/// Buffered sink for exported text. The first write error is kept and
/// every later write is skipped; `finish` reports it.
pub struct ExportDataDumper<W: Write> {
    out: BufWriter<W>,
    error: Option<io::Error>,
}

impl<W: Write> ExportDataDumper<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: BufWriter::new(out),
            error: None,
        }
    }

    pub fn dump_data(&mut self, data: &str) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.out.write_all(data.as_bytes()) {
            tracing::warn!(error = %err, "export write failed");
            self.error = Some(err);
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<W, ExportError> {
        if let Some(err) = self.error.take() {
            return Err(err.into());
        }
        self.out.into_inner().map_err(|e| ExportError::Io(e.into_error()))
    }
}

impl<W: Write> std::fmt::Debug for ExportDataDumper<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportDataDumper")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Columns of one exported node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExportValues {
    Alloc {
        bytes: i64,
        objects: i64,
    },
    Liveness {
        live_bytes: i64,
        live_objects: i64,
        allocated_objects: i64,
        avg_age: f32,
        generations: i32,
    },
}

/// A tree that can be walked for export.
pub trait ExportSource {
    type Node;

    fn root(&self) -> &Self::Node;
    fn node_name(&self, node: &Self::Node) -> SharedStr;
    fn node_children<'a>(&'a self, node: &'a Self::Node) -> &'a [Self::Node];
    fn node_values(&self, node: &Self::Node) -> ExportValues;
}

impl ExportSource for PresoTree {
    type Node = PresoNode;

    fn root(&self) -> &PresoNode {
        PresoTree::root(self)
    }

    fn node_name(&self, node: &PresoNode) -> SharedStr {
        PresoTree::node_name(self, node)
    }

    fn node_children<'a>(&'a self, node: &'a PresoNode) -> &'a [PresoNode] {
        node.children()
    }

    fn node_values(&self, node: &PresoNode) -> ExportValues {
        match node.liveness() {
            None => ExportValues::Alloc {
                bytes: node.total_obj_size(),
                objects: node.n_calls(),
            },
            Some(stats) => ExportValues::Liveness {
                live_bytes: node.total_obj_size(),
                live_objects: stats.live_object_count,
                allocated_objects: node.n_calls(),
                avg_age: stats.avg_object_age,
                generations: stats.surviving_generations,
            },
        }
    }
}

impl ExportSource for DiffTree {
    type Node = DiffNode;

    fn root(&self) -> &DiffNode {
        DiffTree::root(self)
    }

    fn node_name(&self, node: &DiffNode) -> SharedStr {
        node.name().clone()
    }

    fn node_children<'a>(&'a self, node: &'a DiffNode) -> &'a [DiffNode] {
        node.children()
    }

    fn node_values(&self, node: &DiffNode) -> ExportValues {
        if node.is_liveness() {
            ExportValues::Liveness {
                live_bytes: node.total_obj_size(),
                live_objects: node.live_object_count(),
                allocated_objects: node.n_calls(),
                avg_age: node.avg_object_age(),
                generations: node.surviving_generations(),
            }
        } else {
            ExportValues::Alloc {
                bytes: node.total_obj_size(),
                objects: node.n_calls(),
            }
        }
    }
}

/// Write every node of `tree` to `dumper`. `separator` is only used by CSV.
pub fn export_tree<S: ExportSource, W: Write>(
    tree: &S,
    format: ExportFormat,
    separator: &str,
    dumper: &mut ExportDataDumper<W>,
) {
    let mut exporter = Exporter {
        tree,
        separator,
        dumper,
        line: String::new(),
    };
    match format {
        ExportFormat::Csv => exporter.csv(tree.root(), None, 0),
        ExportFormat::Html => exporter.html(tree.root(), None, 0),
        ExportFormat::Xml => exporter.xml(tree.root(), None, ""),
    }
}

struct Exporter<'a, S: ExportSource, W: Write> {
    tree: &'a S,
    separator: &'a str,
    dumper: &'a mut ExportDataDumper<W>,
    line: String,
}

impl<S: ExportSource, W: Write> Exporter<'_, S, W> {
    fn csv(&mut self, node: &S::Node, parent: Option<&str>, depth: usize) {
        let tree = self.tree;
        let name = tree.node_name(node);
        let sep = self.separator;
        self.line.clear();
        self.line.push('"');
        self.line.extend(std::iter::repeat_n(' ', depth));
        let _ = write!(self.line, "{name}\"{sep}");
        match tree.node_values(node) {
            ExportValues::Alloc { bytes, objects } => {
                let _ = write!(self.line, "\"{bytes}\"{sep}\"{objects}\"{sep}");
            }
            ExportValues::Liveness {
                live_bytes,
                live_objects,
                allocated_objects,
                avg_age,
                generations,
            } => {
                let _ = write!(
                    self.line,
                    "\"{live_bytes}\"{sep}\"{live_objects}\"{sep}\"{allocated_objects}\"{sep}\"{avg_age:.1}\"{sep}\"{generations}\"{sep}"
                );
            }
        }
        let _ = write!(self.line, "\"{}\"\r\n", parent.unwrap_or("none"));
        self.dumper.dump_data(&self.line);

        for child in tree.node_children(node) {
            self.csv(child, Some(name.as_str()), depth + 1);
        }
    }

    fn html(&mut self, node: &S::Node, parent: Option<&str>, depth: usize) {
        let tree = self.tree;
        let name = tree.node_name(node);
        self.line.clear();
        self.line.push_str("<tr><td class=\"method\"><pre class=\"method\">");
        self.line.extend(std::iter::repeat_n('.', depth));
        push_escaped(&mut self.line, &name);
        self.line.push_str("</pre></td>");
        match tree.node_values(node) {
            ExportValues::Alloc { bytes, objects } => {
                let _ = write!(
                    self.line,
                    "<td class=\"right\">{bytes}</td><td class=\"right\">{objects}</td>"
                );
            }
            ExportValues::Liveness {
                live_bytes,
                live_objects,
                allocated_objects,
                avg_age,
                generations,
            } => {
                let _ = write!(
                    self.line,
                    "<td class=\"right\">{live_bytes}</td><td class=\"right\">{live_objects}</td><td class=\"right\">{allocated_objects}</td><td class=\"right\">{avg_age:.1}</td><td class=\"right\">{generations}</td>"
                );
            }
        }
        self.line.push_str("<td class=\"parent\"><pre class=\"parent\">");
        push_escaped(&mut self.line, parent.unwrap_or("none"));
        self.line.push_str("</pre></td></tr>");
        self.dumper.dump_data(&self.line);

        for child in tree.node_children(node) {
            self.html(child, Some(name.as_str()), depth + 1);
        }
    }

    fn xml(&mut self, node: &S::Node, parent: Option<&str>, indent: &str) {
        let tree = self.tree;
        let name = tree.node_name(node);
        self.line.clear();
        let _ = write!(self.line, "{indent}<Node>\n{indent} <Name>");
        push_escaped(&mut self.line, &name);
        let _ = write!(self.line, "</Name>\n{indent} <Parent>");
        push_escaped(&mut self.line, parent.unwrap_or("none"));
        let _ = writeln!(self.line, "</Parent>");
        match tree.node_values(node) {
            ExportValues::Alloc { bytes, objects } => {
                let _ = write!(
                    self.line,
                    "{indent} <Bytes_Allocated>{bytes}</Bytes_Allocated>\n\
                     {indent} <Objects_Allocated>{objects}</Objects_Allocated>\n"
                );
            }
            ExportValues::Liveness {
                live_bytes,
                live_objects,
                allocated_objects,
                avg_age,
                generations,
            } => {
                let _ = write!(
                    self.line,
                    "{indent} <Live_Bytes>{live_bytes}</Live_Bytes>\n\
                     {indent} <Live_Objects>{live_objects}</Live_Objects>\n\
                     {indent} <Allocated_Objects>{allocated_objects}</Allocated_Objects>\n\
                     {indent} <Avg_Age>{avg_age:.1}</Avg_Age>\n\
                     {indent} <Generations>{generations}</Generations>\n"
                );
            }
        }
        self.dumper.dump_data(&self.line);

        let child_indent = format!("{indent} ");
        for child in tree.node_children(node) {
            self.xml(child, Some(name.as_str()), &child_indent);
        }
        self.line.clear();
        let _ = writeln!(self.line, "{indent}</Node>");
        self.dumper.dump_data(&self.line);
    }
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}
