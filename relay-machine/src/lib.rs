//! Read-only description of an exposed-datapath target machine.
//!
//! Everything a schedule has to respect lives here: the transport buses and
//! what they can carry, the function units with their operations and
//! latencies, the register files with their port counts, the long-immediate
//! units, and the control unit with its delay slots and guard latency.
//!
//! The model is built once (programmatically, via [`MachineBuilder`]),
//! validated, and then only ever read.  The scheduler crates hold it behind a
//! shared reference for the whole run.

mod builder;
mod bus;
mod connectivity;
mod error;
mod function_unit;
mod machine;
mod register_file;

pub use builder::MachineBuilder;
pub use bus::{Bus, BusGuard};
pub use connectivity::Connectivity;
pub use error::MachineError;
pub use function_unit::{FuKind, FunctionUnit, HwOperation, ResultSpec};
pub use machine::{ControlInfo, ImmediateUnit, Machine};
pub use register_file::RegisterFile;

use std::fmt;

/// Index of a transport bus within its [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub usize);

/// Index of a function unit within its [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuId(pub usize);

/// Index of a register file within its [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RfId(pub usize);

/// Index of a long-immediate unit within its [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IuId(pub usize);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl fmt::Display for FuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FU{}", self.0)
    }
}

impl fmt::Display for RfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RF{}", self.0)
    }
}

impl fmt::Display for IuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IU{}", self.0)
    }
}

/// One end of a transport: a socket a bus is wired to.
///
/// Register-file sockets are shared by all ports of the file; how many reads
/// and writes fit in one cycle is a port-count question for the resource
/// manager, not a wiring question.  Function-unit sockets are per operand, so
/// a machine can expose some operand ports on some buses only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRef {
    /// Read side of a register file.
    RfRead(RfId),
    /// Write side of a register file.
    RfWrite(RfId),
    /// An input operand port of a function unit.
    FuIn { fu: FuId, operand: u8 },
    /// An output (result) port of a function unit.
    FuOut { fu: FuId, operand: u8 },
    /// Read side of the control unit's return-address register.
    RaRead,
    /// Write side of the control unit's return-address register.
    RaWrite,
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRef::RfRead(rf) => write!(f, "{rf}.r"),
            PortRef::RfWrite(rf) => write!(f, "{rf}.w"),
            PortRef::FuIn { fu, operand } => write!(f, "{fu}.in{operand}"),
            PortRef::FuOut { fu, operand } => write!(f, "{fu}.out{operand}"),
            PortRef::RaRead => write!(f, "ra.r"),
            PortRef::RaWrite => write!(f, "ra.w"),
        }
    }
}

/// Number of bits needed to transport `value` on a sign-extending channel.
pub fn required_immediate_width(value: i64, sign_extends: bool) -> u32 {
    if sign_extends {
        // One sign bit on top of the magnitude.
        if value >= 0 {
            64 - value.leading_zeros() + 1
        } else {
            64 - (!value).leading_zeros() + 1
        }
    } else if value < 0 {
        // Negative values cannot be zero-extended.
        u32::MAX
    } else {
        (64 - value.leading_zeros()).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_widths() {
        assert_eq!(required_immediate_width(0, false), 1);
        assert_eq!(required_immediate_width(1, false), 1);
        assert_eq!(required_immediate_width(255, false), 8);
        assert_eq!(required_immediate_width(256, false), 9);
        assert_eq!(required_immediate_width(-1, false), u32::MAX);

        assert_eq!(required_immediate_width(0, true), 1);
        assert_eq!(required_immediate_width(3, true), 3);
        assert_eq!(required_immediate_width(-1, true), 1);
        assert_eq!(required_immediate_width(-4, true), 3);
        assert_eq!(required_immediate_width(127, true), 8);
        assert_eq!(required_immediate_width(-128, true), 8);
    }
}
