use std::io::{self, Write};

use memcct_core::views::{DiffNode, DiffTree, PresoNode, PresoTree};

/// Indented text rendering of a presentation tree. Filtered nodes are
/// skipped, `max_depth` bounds the levels below the root.
pub fn render_tree(out: &mut impl Write, tree: &PresoTree, max_depth: usize) -> io::Result<()> {
    let liveness = tree.is_liveness();
    if liveness {
        writeln!(
            out,
            "{:>12} {:>10} {:>10} {:>8} {:>5}  name",
            "live bytes", "live objs", "allocated", "avg age", "gens"
        )?;
    } else {
        writeln!(out, "{:>12} {:>10}  name", "bytes", "objects")?;
    }
    render_preso_node(out, tree, tree.root(), 0, max_depth)
}

fn render_preso_node(
    out: &mut impl Write,
    tree: &PresoTree,
    node: &PresoNode,
    depth: usize,
    max_depth: usize,
) -> io::Result<()> {
    if node.is_filtered() {
        return Ok(());
    }
    let indent = "  ".repeat(depth);
    let name = tree.node_name(node);
    match node.liveness() {
        Some(stats) => writeln!(
            out,
            "{:>12} {:>10} {:>10} {:>8.1} {:>5}  {indent}{name}",
            node.total_obj_size(),
            stats.live_object_count,
            node.n_calls(),
            stats.avg_object_age,
            stats.surviving_generations,
        )?,
        None => writeln!(
            out,
            "{:>12} {:>10}  {indent}{name}",
            node.total_obj_size(),
            node.n_calls()
        )?,
    }
    if depth < max_depth {
        for child in node.children() {
            render_preso_node(out, tree, child, depth + 1, max_depth)?;
        }
    }
    Ok(())
}

pub fn render_diff(out: &mut impl Write, tree: &DiffTree, max_depth: usize) -> io::Result<()> {
    writeln!(out, "{:>12} {:>10}  name", "Δ bytes", "Δ objects")?;
    render_diff_node(out, tree.root(), 0, max_depth)
}

fn render_diff_node(
    out: &mut impl Write,
    node: &DiffNode,
    depth: usize,
    max_depth: usize,
) -> io::Result<()> {
    let indent = "  ".repeat(depth);
    let marker = match (node.left(), node.right()) {
        (None, Some(_)) => " (new)",
        (Some(_), None) => " (gone)",
        _ => "",
    };
    writeln!(
        out,
        "{:>+12} {:>+10}  {indent}{}{marker}",
        node.total_obj_size(),
        node.n_calls(),
        node.name()
    )?;
    if depth < max_depth {
        for child in node.children() {
            render_diff_node(out, child, depth + 1, max_depth)?;
        }
    }
    Ok(())
}
