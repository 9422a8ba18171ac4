use crate::arm::ArmError;
use crate::probe::ProbeError;
use crate::semihosting::SemihostingError;

/// Top-level error for a debug session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("An error occurred in the probe transport")]
    Probe(#[from] ProbeError),
    #[error("An ARM debug interface error occurred")]
    Arm(#[from] ArmError),
    #[error("A semihosting request could not be serviced")]
    Semihosting(#[from] SemihostingError),
}
