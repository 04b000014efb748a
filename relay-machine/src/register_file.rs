/// A general-purpose register file.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    pub name: String,
    /// Number of registers in the file.
    pub size: u16,
    /// Register width in bits.
    pub width: u32,
    /// Simultaneous reads allowed per cycle.
    pub read_ports: u8,
    /// Simultaneous writes allowed per cycle.
    pub write_ports: u8,
    /// Whether registers of this file can be used as one-bit guard sources.
    pub guard_capable: bool,
}
