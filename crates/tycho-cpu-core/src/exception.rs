use thiserror::Error;

/// CPU exceptions surfaced by the linear access layer.
///
/// The exception-delivery collaborator consumes these through
/// [`Exception::vector`] and [`Exception::error_code`]; for page faults the
/// faulting linear address has already been latched into CR2 by the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("#PF at {addr:#x} (error code {error_code:#x})")]
    PageFault { addr: u64, error_code: u32 },
    #[error("#GP({0})")]
    GeneralProtection(u32),
}

impl Exception {
    pub const PF_VECTOR: u8 = 14;
    pub const GP_VECTOR: u8 = 13;

    #[inline]
    pub fn gp0() -> Self {
        Self::GeneralProtection(0)
    }

    /// Architectural vector number.
    #[inline]
    pub fn vector(&self) -> u8 {
        match self {
            Self::PageFault { .. } => Self::PF_VECTOR,
            Self::GeneralProtection(_) => Self::GP_VECTOR,
        }
    }

    /// Architectural error code pushed with the exception.
    #[inline]
    pub fn error_code(&self) -> u32 {
        match self {
            Self::PageFault { error_code, .. } => *error_code,
            Self::GeneralProtection(code) => *code,
        }
    }
}
