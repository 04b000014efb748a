use std::fmt;

use relay_machine::{BusGuard, FuId, HwOperation, Machine, PortRef, RfId};

use crate::InstrRef;

/// One architectural register: a file and an index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub rf: RfId,
    pub index: u16,
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.rf, self.index)
    }
}

/// A predicate on a move: the move takes effect only when the guard register
/// holds true (or false, when inverted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guard {
    pub register: Register,
    pub inverted: bool,
}

impl Guard {
    pub fn bus_guard(&self) -> BusGuard {
        BusGuard {
            rf: self.register.rf,
            index: self.register.index,
            inverted: self.inverted,
        }
    }

    /// Whether this guard is implied by `other`: same term, or `other` is
    /// absent (unconditional implies anything is too strong the other way
    /// around, so only equality counts here).
    pub fn implied_by(&self, other: Option<&Guard>) -> bool {
        match other {
            None => false,
            Some(g) => g == self,
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            write!(f, "!{}", self.register)
        } else {
            write!(f, "?{}", self.register)
        }
    }
}

/// A specific hardware operation on a specific function unit, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpRef {
    pub fu: FuId,
    pub op: u16,
}

impl OpRef {
    pub fn hw<'m>(&self, machine: &'m Machine) -> &'m HwOperation {
        &machine.function_unit(self.fu).operations[self.op as usize]
    }
}

/// One end of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminal {
    Register(Register),
    /// An operand or result port of a function-unit operation.
    FuPort { op: OpRef, operand: u8 },
    /// An inline constant (source only).
    Immediate(i64),
    /// A jump/call target (source operand of a control-flow operation).
    InstructionRef(InstrRef),
    /// The control unit's return-address register.
    ReturnAddress,
}

impl Terminal {
    pub fn reg(rf: RfId, index: u16) -> Terminal {
        Terminal::Register(Register { rf, index })
    }

    pub fn as_register(&self) -> Option<Register> {
        match self {
            Terminal::Register(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_fu_port(&self) -> Option<(OpRef, u8)> {
        match self {
            Terminal::FuPort { op, operand } => Some((*op, *operand)),
            _ => None,
        }
    }

    pub fn as_immediate(&self) -> Option<i64> {
        match self {
            Terminal::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Terminal::Register(_))
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Terminal::Immediate(_) | Terminal::InstructionRef(_))
    }

    /// The machine socket this terminal occupies when used as a move source.
    /// Immediates travel in the bus's own immediate field, so they have no
    /// socket.
    pub fn source_port(&self) -> Option<PortRef> {
        match self {
            Terminal::Register(r) => Some(PortRef::RfRead(r.rf)),
            Terminal::FuPort { op, operand } => Some(PortRef::FuOut {
                fu: op.fu,
                operand: *operand,
            }),
            Terminal::Immediate(_) | Terminal::InstructionRef(_) => None,
            Terminal::ReturnAddress => Some(PortRef::RaRead),
        }
    }

    /// The machine socket this terminal occupies when used as a destination.
    pub fn destination_port(&self) -> Option<PortRef> {
        match self {
            Terminal::Register(r) => Some(PortRef::RfWrite(r.rf)),
            Terminal::FuPort { op, operand } => Some(PortRef::FuIn {
                fu: op.fu,
                operand: *operand,
            }),
            Terminal::Immediate(_) | Terminal::InstructionRef(_) => None,
            Terminal::ReturnAddress => Some(PortRef::RaWrite),
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Register(r) => write!(f, "{r}"),
            Terminal::FuPort { op, operand } => write!(f, "{}.{}.{}", op.fu, op.op, operand),
            Terminal::Immediate(v) => write!(f, "#{v}"),
            Terminal::InstructionRef(r) => write!(f, "@{r}"),
            Terminal::ReturnAddress => write!(f, "ra"),
        }
    }
}
