//! Graph snapshots for debugging a schedule: DOT for eyes, XML for tools.

use std::fmt::Write;

use super::{Ddg, DepKind, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Dot,
    Xml,
}

fn kind_label(kind: &DepKind) -> String {
    match kind {
        DepKind::RegisterRaw(r) => format!("raw:{r}"),
        DepKind::RegisterWar(r) => format!("war:{r}"),
        DepKind::RegisterWaw(r) => format!("waw:{r}"),
        DepKind::MemoryRaw => "mem-raw".into(),
        DepKind::MemoryWar => "mem-war".into(),
        DepKind::MemoryWaw => "mem-waw".into(),
        DepKind::Operation => "op".into(),
        DepKind::GuardRaw => "guard".into(),
    }
}

impl Ddg {
    pub fn to_dot(&self, scope: Scope) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", self.name());
        for id in self.nodes_in(scope) {
            let node = self.node(id);
            let cycle = node
                .cycle
                .map(|c| format!("\\n@{c}"))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  n{} [label=\"{}{}\"];",
                id.0,
                escape(&node.mv.to_string()),
                cycle
            );
        }
        for id in self.nodes_in(scope) {
            for (_, e) in self.out_edges(scope, id) {
                let style = if e.back_edge { ",style=dashed" } else { "" };
                let _ = writeln!(
                    out,
                    "  n{} -> n{} [label=\"{}:{}\"{}];",
                    e.tail.0,
                    e.head.0,
                    kind_label(&e.kind),
                    e.latency,
                    style
                );
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn to_xml(&self, scope: Scope) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<ddg name=\"{}\">", self.name());
        for id in self.nodes_in(scope) {
            let node = self.node(id);
            match node.cycle {
                Some(c) => {
                    let _ = writeln!(
                        out,
                        "  <node id=\"{}\" cycle=\"{}\">{}</node>",
                        id.0,
                        c,
                        escape_xml(&node.mv.to_string())
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "  <node id=\"{}\">{}</node>",
                        id.0,
                        escape_xml(&node.mv.to_string())
                    );
                }
            }
        }
        for id in self.nodes_in(scope) {
            for (_, e) in self.out_edges(scope, id) {
                let _ = writeln!(
                    out,
                    "  <edge tail=\"{}\" head=\"{}\" kind=\"{}\" latency=\"{}\" back=\"{}\"/>",
                    e.tail.0,
                    e.head.0,
                    kind_label(&e.kind),
                    e.latency,
                    e.back_edge
                );
            }
        }
        out.push_str("</ddg>\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('"', "\\\"")
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
