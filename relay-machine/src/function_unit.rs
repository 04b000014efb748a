use smallvec::SmallVec;

/// Distinguishes the datapath units from the control unit.
///
/// The control unit is modeled as a function unit whose operations are the
/// control-flow operations; it additionally owns the return-address register
/// and the delay-slot count (see [`crate::ControlInfo`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuKind {
    Normal,
    Control,
}

/// A result port of a hardware operation, with its latency.
///
/// Operand indices follow the usual convention: inputs are `1..=inputs`,
/// results come after.  `latency` is the number of cycles between the trigger
/// write and the earliest cycle the result can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSpec {
    pub operand: u8,
    pub latency: u32,
}

/// One operation a function unit implements.
#[derive(Debug, Clone)]
pub struct HwOperation {
    pub name: String,
    /// Number of input operands; their indices are `1..=inputs`.
    pub inputs: u8,
    /// The input operand whose write starts the pipeline.
    pub trigger: u8,
    pub results: SmallVec<[ResultSpec; 2]>,
    /// Whether the first two inputs may be exchanged.
    pub commutative: bool,
    pub reads_memory: bool,
    pub writes_memory: bool,
    /// Side effects other than memory (e.g. I/O); forces program order.
    pub has_side_effects: bool,
}

impl HwOperation {
    pub fn new(name: impl Into<String>, inputs: u8, trigger: u8) -> Self {
        HwOperation {
            name: name.into(),
            inputs,
            trigger,
            results: SmallVec::new(),
            commutative: false,
            reads_memory: false,
            writes_memory: false,
            has_side_effects: false,
        }
    }

    pub fn with_result(mut self, operand: u8, latency: u32) -> Self {
        self.results.push(ResultSpec { operand, latency });
        self
    }

    pub fn commutative(mut self) -> Self {
        self.commutative = true;
        self
    }

    pub fn memory_read(mut self) -> Self {
        self.reads_memory = true;
        self
    }

    pub fn memory_write(mut self) -> Self {
        self.writes_memory = true;
        self
    }

    pub fn side_effecting(mut self) -> Self {
        self.has_side_effects = true;
        self
    }

    pub fn latency(&self, result_operand: u8) -> Option<u32> {
        self.results
            .iter()
            .find(|r| r.operand == result_operand)
            .map(|r| r.latency)
    }

    /// The longest result latency, i.e. the cycles the pipeline stays live
    /// past the trigger.
    pub fn max_latency(&self) -> u32 {
        self.results.iter().map(|r| r.latency).max().unwrap_or(0)
    }

    pub fn is_input(&self, operand: u8) -> bool {
        (1..=self.inputs).contains(&operand)
    }
}

/// A function unit: a named set of operations sharing operand ports and one
/// initiation slot per cycle.
#[derive(Debug, Clone)]
pub struct FunctionUnit {
    pub name: String,
    pub kind: FuKind,
    pub operations: Vec<HwOperation>,
}

impl FunctionUnit {
    pub fn operation(&self, name: &str) -> Option<&HwOperation> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn supports(&self, name: &str) -> bool {
        self.operation(name).is_some()
    }
}
