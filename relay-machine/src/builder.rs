//! Programmatic construction of machine descriptions.
//!
//! The scheduler is handed a finished [`Machine`]; parsing an architecture
//! definition file into one is the embedder's concern.  This builder is the
//! shared construction path for embedders and for the test suites, which
//! assemble many small machines.

use rustc_hash::FxHashSet;

use crate::{
    Bus, BusGuard, BusId, ControlInfo, FuId, FuKind, FunctionUnit, HwOperation, ImmediateUnit,
    IuId, Machine, MachineError, PortRef, RegisterFile, RfId,
};

pub struct MachineBuilder {
    name: String,
    buses: Vec<Bus>,
    function_units: Vec<FunctionUnit>,
    register_files: Vec<RegisterFile>,
    immediate_units: Vec<ImmediateUnit>,
    control: Option<ControlInfo>,
}

impl MachineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        MachineBuilder {
            name: name.into(),
            buses: Vec::new(),
            function_units: Vec::new(),
            register_files: Vec::new(),
            immediate_units: Vec::new(),
            control: None,
        }
    }

    pub fn register_file(
        &mut self,
        name: impl Into<String>,
        size: u16,
        width: u32,
        read_ports: u8,
        write_ports: u8,
    ) -> RfId {
        self.register_files.push(RegisterFile {
            name: name.into(),
            size,
            width,
            read_ports,
            write_ports,
            guard_capable: false,
        });
        RfId(self.register_files.len() - 1)
    }

    /// A one-bit-capable file whose registers may source guards.
    pub fn guard_register_file(
        &mut self,
        name: impl Into<String>,
        size: u16,
        read_ports: u8,
        write_ports: u8,
    ) -> RfId {
        self.register_files.push(RegisterFile {
            name: name.into(),
            size,
            width: 1,
            read_ports,
            write_ports,
            guard_capable: true,
        });
        RfId(self.register_files.len() - 1)
    }

    pub fn function_unit(
        &mut self,
        name: impl Into<String>,
        operations: Vec<HwOperation>,
    ) -> FuId {
        self.function_units.push(FunctionUnit {
            name: name.into(),
            kind: FuKind::Normal,
            operations,
        });
        FuId(self.function_units.len() - 1)
    }

    /// Creates the control unit with the standard `jump` and `call`
    /// operations and records delay slots and guard latency.
    pub fn control_unit(&mut self, delay_slots: u32, guard_latency: u32) -> FuId {
        self.function_units.push(FunctionUnit {
            name: "gcu".into(),
            kind: FuKind::Control,
            operations: vec![
                HwOperation::new("jump", 1, 1),
                HwOperation::new("call", 1, 1),
            ],
        });
        let fu = FuId(self.function_units.len() - 1);
        self.control = Some(ControlInfo {
            fu,
            delay_slots,
            guard_latency,
        });
        fu
    }

    pub fn immediate_unit(&mut self, name: impl Into<String>, width: u32, latency: u32) -> IuId {
        self.immediate_units.push(ImmediateUnit {
            name: name.into(),
            width,
            latency,
        });
        IuId(self.immediate_units.len() - 1)
    }

    pub fn bus(&mut self, name: impl Into<String>, short_imm_width: u32, sign_extends: bool) -> BusId {
        self.buses.push(Bus {
            name: name.into(),
            short_imm_width,
            sign_extends,
            guards: Vec::new(),
            sources: FxHashSet::default(),
            destinations: FxHashSet::default(),
        });
        BusId(self.buses.len() - 1)
    }

    pub fn source(&mut self, bus: BusId, port: PortRef) -> &mut Self {
        self.buses[bus.0].sources.insert(port);
        self
    }

    pub fn destination(&mut self, bus: BusId, port: PortRef) -> &mut Self {
        self.buses[bus.0].destinations.insert(port);
        self
    }

    pub fn bus_guard(&mut self, bus: BusId, rf: RfId, index: u16, inverted: bool) -> &mut Self {
        self.buses[bus.0].guards.push(BusGuard { rf, index, inverted });
        self
    }

    /// Wires `bus` to every socket of every unit declared so far.
    pub fn fully_connect(&mut self, bus: BusId) -> &mut Self {
        let mut sources = Vec::new();
        let mut destinations = Vec::new();
        for rf in 0..self.register_files.len() {
            sources.push(PortRef::RfRead(RfId(rf)));
            destinations.push(PortRef::RfWrite(RfId(rf)));
        }
        for (i, fu) in self.function_units.iter().enumerate() {
            for op in &fu.operations {
                for operand in 1..=op.inputs {
                    destinations.push(PortRef::FuIn { fu: FuId(i), operand });
                }
                for res in &op.results {
                    sources.push(PortRef::FuOut {
                        fu: FuId(i),
                        operand: res.operand,
                    });
                }
            }
        }
        sources.push(PortRef::RaRead);
        destinations.push(PortRef::RaWrite);

        let b = &mut self.buses[bus.0];
        b.sources.extend(sources);
        b.destinations.extend(destinations);
        self
    }

    /// Lets `bus` evaluate every register of every guard-capable file, both
    /// plain and inverted.
    pub fn all_guards(&mut self, bus: BusId) -> &mut Self {
        let mut guards = Vec::new();
        for (i, rf) in self.register_files.iter().enumerate() {
            if !rf.guard_capable {
                continue;
            }
            for index in 0..rf.size {
                guards.push(BusGuard { rf: RfId(i), index, inverted: false });
                guards.push(BusGuard { rf: RfId(i), index, inverted: true });
            }
        }
        self.buses[bus.0].guards.extend(guards);
        self
    }

    pub fn build(self) -> Result<Machine, MachineError> {
        let control = self.control.ok_or(MachineError::MissingControlUnit)?;
        let machine = Machine {
            name: self.name,
            buses: self.buses,
            function_units: self.function_units,
            register_files: self.register_files,
            immediate_units: self.immediate_units,
            control,
        };
        machine.validate()?;
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connectivity;

    fn minimal() -> MachineBuilder {
        let mut b = MachineBuilder::new("minimal");
        b.register_file("int", 8, 32, 2, 1);
        b.function_unit(
            "alu",
            vec![HwOperation::new("add", 2, 2).with_result(3, 1).commutative()],
        );
        b.control_unit(3, 1);
        b
    }

    #[test]
    fn validate_catches_bad_trigger() {
        let mut b = MachineBuilder::new("bad");
        b.register_file("int", 8, 32, 1, 1);
        b.function_unit("alu", vec![HwOperation::new("add", 2, 3).with_result(3, 1)]);
        b.control_unit(3, 1);
        let bus = b.bus("b0", 8, true);
        b.fully_connect(bus);
        assert!(matches!(
            b.build(),
            Err(MachineError::BadTriggerOperand { trigger: 3, .. })
        ));
    }

    #[test]
    fn validate_requires_buses() {
        assert_eq!(minimal().build().unwrap_err(), MachineError::NoBuses);
    }

    #[test]
    fn direct_connectivity() {
        let mut b = minimal();
        let bus = b.bus("b0", 8, true);
        b.fully_connect(bus);
        let machine = b.build().unwrap();
        let conn = Connectivity::new(&machine);
        assert!(conn.is_connected(
            PortRef::RfRead(RfId(0)),
            PortRef::FuIn { fu: FuId(0), operand: 1 },
            None,
        ));
        assert!(conn.rf_connected(RfId(0), RfId(0)));
    }

    #[test]
    fn scratch_chain_bridges_disconnected_ports() {
        let mut b = MachineBuilder::new("split");
        let int = b.register_file("int", 8, 32, 1, 1);
        let scratch = b.register_file("scratch", 2, 32, 1, 1);
        let fpu = b.function_unit("fpu", vec![HwOperation::new("mul", 2, 2).with_result(3, 3)]);
        b.control_unit(3, 1);

        // int RF and the FPU live on separate buses; only the scratch file
        // is wired to both.
        let b0 = b.bus("b0", 8, true);
        b.source(b0, PortRef::RfRead(int));
        b.destination(b0, PortRef::RfWrite(scratch));
        let b1 = b.bus("b1", 8, true);
        b.source(b1, PortRef::RfRead(scratch));
        b.destination(b1, PortRef::FuIn { fu: fpu, operand: 1 });
        b.destination(b1, PortRef::FuIn { fu: fpu, operand: 2 });

        let machine = b.build().unwrap();
        let conn = Connectivity::new(&machine);

        let src = PortRef::RfRead(int);
        let dst = PortRef::FuIn { fu: fpu, operand: 1 };
        assert!(!conn.is_connected(src, dst, None));
        assert_eq!(conn.scratch_chain(src, dst, None, &[scratch]), Some(vec![scratch]));
        assert_eq!(conn.scratch_chain(src, dst, None, &[]), None);
    }

    #[test]
    fn two_hop_scratch_chain() {
        let mut b = MachineBuilder::new("hops");
        let a = b.register_file("a", 4, 32, 1, 1);
        let s1 = b.register_file("s1", 1, 32, 1, 1);
        let s2 = b.register_file("s2", 1, 32, 1, 1);
        let z = b.register_file("z", 4, 32, 1, 1);
        b.control_unit(3, 1);
        let b0 = b.bus("b0", 0, true);
        b.source(b0, PortRef::RfRead(a));
        b.destination(b0, PortRef::RfWrite(s1));
        let b1 = b.bus("b1", 0, true);
        b.source(b1, PortRef::RfRead(s1));
        b.destination(b1, PortRef::RfWrite(s2));
        let b2 = b.bus("b2", 0, true);
        b.source(b2, PortRef::RfRead(s2));
        b.destination(b2, PortRef::RfWrite(z));

        let machine = b.build().unwrap();
        let conn = Connectivity::new(&machine);
        assert_eq!(
            conn.scratch_chain(PortRef::RfRead(a), PortRef::RfWrite(z), None, &[s1, s2]),
            Some(vec![s1, s2])
        );
    }

    #[test]
    fn immediate_transport() {
        let mut b = minimal();
        let bus = b.bus("b0", 8, true);
        b.fully_connect(bus);
        b.immediate_unit("limm", 32, 1);
        let machine = b.build().unwrap();
        let conn = Connectivity::new(&machine);
        let dst = PortRef::FuIn { fu: FuId(0), operand: 2 };
        assert!(conn.can_transport_immediate(100, dst, None));
        assert!(!conn.can_transport_immediate(1000, dst, None));
        assert!(conn.can_transport_long_immediate(1000, dst));
    }
}
