//! Resource-constrained instruction scheduling for exposed-datapath
//! machines.
//!
//! The input is a register-allocated procedure of data-transport moves; the
//! output is the same procedure with every move assigned a cycle and a bus
//! such that all data, control, resource, and latency constraints hold.  The
//! interesting machinery sits in three places: the dependence graph
//! ([`ddg`]), the cycle-indexed reservation table ([`resources`]), and the
//! bottom-up block scheduler with transactional software bypassing
//! ([`algo`]).  Single-block loops with known trip counts are software
//! pipelined.

pub mod algo;
pub mod analyzer;
pub mod controller;
pub mod copy_adder;
pub mod ddg;
pub mod error;
pub mod renamer;
pub mod resources;
pub mod selector;

pub use controller::{schedule_cfg_ddg, schedule_procedure};
pub use ddg::DumpFormat;
pub use error::ScheduleError;

/// Which block-scheduling algorithm drives the placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerVariant {
    /// The historical forward list scheduler.  No bypassing.
    TopDown,
    /// Bottom-up with bypassing and dead-result elimination.
    BottomUp,
    /// Bottom-up plus operand swapping and late bypass.
    #[default]
    BubbleFish,
}

/// Externally observable knobs.  The defaults are what production builds
/// run with.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub variant: SchedulerVariant,
    /// How far (in cycles) a bypassed consumer may drift from its original
    /// slot.  Zero disables bypassing entirely.
    pub bypass_distance: u32,
    /// Delete register writes whose every reader was bypassed.
    pub kill_dead_results: bool,
    /// Rename live ranges to dodge anti dependences.  Also requires the
    /// stack/return-value registers to be published on the inter-pass
    /// channel, or the renamer cannot tell which names are free.
    pub rename_registers: bool,
    /// Software-pipeline eligible single-block loops.
    pub loop_scheduling: bool,
    /// Above this many moves, skip the whole-procedure dependence graph and
    /// build one graph per block.
    pub low_mem_threshold: Option<usize>,
    /// Write a dependence-graph snapshot per block and stage.
    pub dump_ddg: Option<DumpFormat>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            variant: SchedulerVariant::default(),
            bypass_distance: 4,
            kill_dead_results: true,
            rename_registers: false,
            loop_scheduling: false,
            low_mem_threshold: Some(100_000),
            dump_ddg: None,
        }
    }
}
