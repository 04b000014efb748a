use std::fmt;

use relay_machine::{BusId, Machine};

use crate::{Guard, Register, Terminal};

/// One data transport: source to destination, optionally guarded, on a bus
/// chosen at scheduling time (`bus == None` reads as "any bus").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub source: Terminal,
    pub destination: Terminal,
    pub guard: Option<Guard>,
    pub bus: Option<BusId>,
    /// Set when the constant source cannot travel as a short immediate and a
    /// long-immediate unit must produce it.
    pub needs_long_imm: bool,
}

impl Move {
    pub fn new(source: Terminal, destination: Terminal) -> Move {
        Move {
            source,
            destination,
            guard: None,
            bus: None,
            needs_long_imm: false,
        }
    }

    pub fn guarded(source: Terminal, destination: Terminal, guard: Guard) -> Move {
        Move {
            source,
            destination,
            guard: Some(guard),
            bus: None,
            needs_long_imm: false,
        }
    }

    /// Whether this move redirects control flow (its destination is an
    /// operand port of the control unit).
    pub fn is_control_flow(&self, machine: &Machine) -> bool {
        match self.destination {
            Terminal::FuPort { op, .. } => machine.is_control_fu(op.fu),
            Terminal::ReturnAddress => false,
            _ => false,
        }
    }

    /// Whether the move is a plain register-to-register copy, taking part in
    /// no operation.
    pub fn is_register_copy(&self) -> bool {
        self.source.is_register() && self.destination.is_register()
    }

    pub fn source_register(&self) -> Option<Register> {
        self.source.as_register()
    }

    pub fn destination_register(&self) -> Option<Register> {
        self.destination.as_register()
    }

    /// Registers this move reads: the source register and the guard source.
    pub fn read_registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.source
            .as_register()
            .into_iter()
            .chain(self.guard.map(|g| g.register))
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(g) = &self.guard {
            write!(f, "{g} ")?;
        }
        write!(f, "{} -> {}", self.source, self.destination)?;
        if let Some(bus) = self.bus {
            write!(f, " [{bus}]")?;
        }
        Ok(())
    }
}
