use thiserror::Error;

/// Errors raised while validating a machine description.
///
/// These correspond to machines the scheduler cannot target at all; they are
/// fatal for the whole run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("function unit {fu} operation '{op}' declares trigger operand {trigger} outside its {inputs} inputs")]
    BadTriggerOperand {
        fu: String,
        op: String,
        trigger: u8,
        inputs: u8,
    },
    #[error("function unit {fu} operation '{op}' has no input operands")]
    NoInputs { fu: String, op: String },
    #[error("function unit {fu} operation '{op}' result operand {operand} collides with an input operand")]
    ResultOperandCollision { fu: String, op: String, operand: u8 },
    #[error("register file {rf} has no ports")]
    PortlessRegisterFile { rf: String },
    #[error("immediate unit {iu} has zero width")]
    ZeroWidthImmediateUnit { iu: String },
    #[error("bus {bus} guard refers to register file {rf} which is not guard capable")]
    GuardOnNonGuardFile { bus: String, rf: String },
    #[error("machine has no control unit")]
    MissingControlUnit,
    #[error("machine has no buses")]
    NoBuses,
}
