use crate::{
    Bus, BusId, FuId, FuKind, FunctionUnit, HwOperation, IuId, MachineError, RegisterFile, RfId,
};

/// A long-immediate unit: a small register the instruction-fetch side can
/// preload with a wide constant, readable one cycle later.
#[derive(Debug, Clone)]
pub struct ImmediateUnit {
    pub name: String,
    pub width: u32,
    pub latency: u32,
}

/// Control-unit parameters that are not ordinary function-unit business.
#[derive(Debug, Clone, Copy)]
pub struct ControlInfo {
    /// The function unit holding the control-flow operations.
    pub fu: FuId,
    /// Instructions issued after a control-flow move before it takes effect.
    pub delay_slots: u32,
    /// Cycles between a guard register write and the earliest guarded move.
    pub guard_latency: u32,
}

/// The complete target description.  Built once, then read-only.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub buses: Vec<Bus>,
    pub function_units: Vec<FunctionUnit>,
    pub register_files: Vec<RegisterFile>,
    pub immediate_units: Vec<ImmediateUnit>,
    pub control: ControlInfo,
}

impl Machine {
    pub fn bus(&self, id: BusId) -> &Bus {
        &self.buses[id.0]
    }

    pub fn function_unit(&self, id: FuId) -> &FunctionUnit {
        &self.function_units[id.0]
    }

    pub fn register_file(&self, id: RfId) -> &RegisterFile {
        &self.register_files[id.0]
    }

    pub fn immediate_unit(&self, id: IuId) -> &ImmediateUnit {
        &self.immediate_units[id.0]
    }

    pub fn bus_ids(&self) -> impl Iterator<Item = BusId> {
        (0..self.buses.len()).map(BusId)
    }

    pub fn rf_ids(&self) -> impl Iterator<Item = RfId> {
        (0..self.register_files.len()).map(RfId)
    }

    pub fn is_control_fu(&self, fu: FuId) -> bool {
        fu == self.control.fu
    }

    pub fn delay_slots(&self) -> u32 {
        self.control.delay_slots
    }

    pub fn guard_latency(&self) -> u32 {
        self.control.guard_latency
    }

    /// Function units (control unit included) supporting `op`.
    pub fn units_supporting<'a>(&'a self, op: &'a str) -> impl Iterator<Item = FuId> + 'a {
        self.function_units
            .iter()
            .enumerate()
            .filter(move |(_, fu)| fu.supports(op))
            .map(|(i, _)| FuId(i))
    }

    pub fn operation_on(&self, fu: FuId, op: &str) -> Option<&HwOperation> {
        self.function_unit(fu).operation(op)
    }

    /// Widest long-immediate the machine can produce, if it has any IU.
    pub fn max_immediate_width(&self) -> Option<u32> {
        self.immediate_units.iter().map(|iu| iu.width).max()
    }

    /// Structural sanity of the description.  A failure here means no
    /// schedule can exist for some representable program, so it is checked
    /// up front instead of surfacing mid-schedule.
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.buses.is_empty() {
            return Err(MachineError::NoBuses);
        }
        match self.function_units.get(self.control.fu.0) {
            Some(fu) if fu.kind == FuKind::Control => {}
            _ => return Err(MachineError::MissingControlUnit),
        }
        for fu in &self.function_units {
            for op in &fu.operations {
                if op.inputs == 0 {
                    return Err(MachineError::NoInputs {
                        fu: fu.name.clone(),
                        op: op.name.clone(),
                    });
                }
                if !op.is_input(op.trigger) {
                    return Err(MachineError::BadTriggerOperand {
                        fu: fu.name.clone(),
                        op: op.name.clone(),
                        trigger: op.trigger,
                        inputs: op.inputs,
                    });
                }
                for res in &op.results {
                    if op.is_input(res.operand) {
                        return Err(MachineError::ResultOperandCollision {
                            fu: fu.name.clone(),
                            op: op.name.clone(),
                            operand: res.operand,
                        });
                    }
                }
            }
        }
        for rf in &self.register_files {
            if rf.read_ports == 0 && rf.write_ports == 0 {
                return Err(MachineError::PortlessRegisterFile {
                    rf: rf.name.clone(),
                });
            }
        }
        for iu in &self.immediate_units {
            if iu.width == 0 {
                return Err(MachineError::ZeroWidthImmediateUnit {
                    iu: iu.name.clone(),
                });
            }
        }
        for bus in &self.buses {
            for g in &bus.guards {
                if !self.register_file(g.rf).guard_capable {
                    return Err(MachineError::GuardOnNonGuardFile {
                        bus: bus.name.clone(),
                        rf: self.register_file(g.rf).name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
