use std::io;

use thiserror::Error;

use crate::kernel::KernReturn;

/// Why [`crate::ExceptionServer::register`] failed.
///
/// Either way the task's exception ports are as they were before the call.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// A local resource (thread, memory, handshake) could not be set up.
    #[error("{what}: {source}")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// A kernel call returned an error status.
    #[error("{call} failed: {code}")]
    Kernel { call: &'static str, code: KernReturn },
}

impl RegistrationError {
    pub(crate) fn resource(what: &'static str, source: io::Error) -> Self {
        Self::Resource { what, source }
    }

    pub(crate) fn kernel(call: &'static str, code: KernReturn) -> Self {
        Self::Kernel { call, code }
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Resource { .. })
    }

    /// Kernel status, for kernel-class failures.
    pub fn kernel_code(&self) -> Option<KernReturn> {
        match self {
            Self::Kernel { code, .. } => Some(*code),
            Self::Resource { .. } => None,
        }
    }

    /// Platform error number, for resource-class failures that have one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Resource { source, .. } => source.raw_os_error(),
            Self::Kernel { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
