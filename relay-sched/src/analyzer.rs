//! Post-schedule resource-constraint diagnostics.
//!
//! Answers "what made this block as long as it is" after the fact: the
//! dependence critical path, bus saturation, or one oversubscribed unit or
//! register file.  Reporting goes through `tracing`; nothing here affects
//! the schedule.

use rustc_hash::FxHashMap;

use relay_machine::Machine;

use crate::ddg::{Cycle, Ddg, Scope};

pub fn analyze_block(ddg: &Ddg, scope: Scope, machine: &Machine, span: Cycle) {
    let placed: Vec<_> = ddg
        .nodes_in(scope)
        .filter(|n| ddg.node(*n).is_scheduled())
        .collect();
    if placed.is_empty() || span <= 0 {
        return;
    }

    let critical = ddg.critical_path_length(scope);
    let cycles = span + 1;
    let bus_pressure = placed.len() as f64 / (cycles as f64 * machine.buses.len() as f64);

    let mut initiations: FxHashMap<usize, usize> = FxHashMap::default();
    for n in &placed {
        if let Some((op, operand)) = ddg.node(*n).mv.destination.as_fu_port() {
            if operand == op.hw(machine).trigger {
                *initiations.entry(op.fu.0).or_insert(0) += 1;
            }
        }
    }
    let busiest_fu = initiations.iter().max_by_key(|(_, c)| **c);

    if critical >= span {
        tracing::debug!(
            "block {}: bound by the dependence critical path ({critical} cycles)",
            scope.block
        );
    } else if let Some((fu, count)) = busiest_fu.filter(|(_, c)| **c as i64 >= cycles) {
        tracing::debug!(
            "block {}: bound by function unit {} ({count} initiations over {cycles} cycles)",
            scope.block,
            machine.function_units[*fu].name
        );
    } else if bus_pressure > 0.9 {
        tracing::debug!(
            "block {}: bound by bus capacity ({:.0}% full)",
            scope.block,
            bus_pressure * 100.0
        );
    } else {
        tracing::debug!(
            "block {}: span {span} vs critical path {critical}, no single binding resource",
            scope.block
        );
    }
}
