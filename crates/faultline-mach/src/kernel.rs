//! The seam between the interception core and the kernel.
//!
//! Everything the core does to the process's exception-port table, to Mach
//! ports and to the message queue goes through [`ExceptionKernel`]. The macOS
//! backend lives in [`crate::mach`]; [`crate::testing::SimulatedKernel`]
//! models the same contract in-process.

use std::fmt;
use std::io;

use crate::exception::{ExceptionBehavior, ExceptionMask};
use crate::message::{ExceptionReply, REQUEST_RECEIVE_SIZE};
use crate::snapshot::HandlerSnapshot;

/// Mach port name (`mach_port_t`). Tasks and threads are ports too.
pub type Port = u32;

pub const PORT_NULL: Port = 0;

/// A `kern_return_t` / `mach_msg_return_t`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct KernReturn(pub i32);

impl KernReturn {
    pub const SUCCESS: KernReturn = KernReturn(0);
    pub const INVALID_ADDRESS: KernReturn = KernReturn(1);
    pub const NO_SPACE: KernReturn = KernReturn(3);
    pub const INVALID_ARGUMENT: KernReturn = KernReturn(4);
    pub const FAILURE: KernReturn = KernReturn(5);
    pub const RESOURCE_SHORTAGE: KernReturn = KernReturn(6);
    pub const INVALID_NAME: KernReturn = KernReturn(15);
    pub const INVALID_RIGHT: KernReturn = KernReturn(17);
    pub const SEND_INVALID_DEST: KernReturn = KernReturn(0x1000_0003);
    pub const SEND_TIMED_OUT: KernReturn = KernReturn(0x1000_0004);
    pub const RCV_INVALID_NAME: KernReturn = KernReturn(0x1000_4002);
    pub const RCV_TOO_LARGE: KernReturn = KernReturn(0x1000_4004);
    pub const RCV_INTERRUPTED: KernReturn = KernReturn(0x1000_4005);
    pub const MIG_BAD_ID: KernReturn = KernReturn(-303);
    pub const MIG_BAD_ARGUMENTS: KernReturn = KernReturn(-304);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// `Ok(())` for `SUCCESS`, `Err(self)` otherwise.
    pub fn into_result(self) -> Result<(), KernReturn> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "KERN_SUCCESS",
            Self::INVALID_ADDRESS => "KERN_INVALID_ADDRESS",
            Self::NO_SPACE => "KERN_NO_SPACE",
            Self::INVALID_ARGUMENT => "KERN_INVALID_ARGUMENT",
            Self::FAILURE => "KERN_FAILURE",
            Self::RESOURCE_SHORTAGE => "KERN_RESOURCE_SHORTAGE",
            Self::INVALID_NAME => "KERN_INVALID_NAME",
            Self::INVALID_RIGHT => "KERN_INVALID_RIGHT",
            Self::SEND_INVALID_DEST => "MACH_SEND_INVALID_DEST",
            Self::SEND_TIMED_OUT => "MACH_SEND_TIMED_OUT",
            Self::RCV_INVALID_NAME => "MACH_RCV_INVALID_NAME",
            Self::RCV_TOO_LARGE => "MACH_RCV_TOO_LARGE",
            Self::RCV_INTERRUPTED => "MACH_RCV_INTERRUPTED",
            Self::MIG_BAD_ID => "MIG_BAD_ID",
            Self::MIG_BAD_ARGUMENTS => "MIG_BAD_ARGUMENTS",
            _ => return None,
        })
    }
}

impl fmt::Display for KernReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#x})", name, self.0),
            None => write!(f, "kern_return {:#x}", self.0),
        }
    }
}

impl fmt::Debug for KernReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Outcome of a successful receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A message of `len` bytes is in the buffer.
    Message { len: usize },
    /// The pending message needs `required` bytes; it is still queued.
    TooLarge { required: usize },
}

/// Body of the receiver thread, handed to [`ExceptionKernel::spawn_receiver`].
pub type ReceiverBody = Box<dyn FnOnce() + Send + 'static>;

/// Kernel operations used by the interception core.
///
/// Every method must be callable from the receiver thread while the rest of
/// the process may be in an inconsistent state.
pub trait ExceptionKernel: Send + Sync + 'static {
    /// Allocate a new port holding a receive right.
    fn allocate_receive_port(&self) -> Result<Port, KernReturn>;

    /// Give `port` a send right to itself.
    fn insert_send_right(&self, port: Port) -> Result<(), KernReturn>;

    /// Release `port`. Best-effort; failures are only logged.
    fn release_port(&self, port: Port, has_send_right: bool);

    /// Install `port` for `mask` on `task` and return what was installed before,
    /// in a single kernel call.
    fn swap_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> Result<HandlerSnapshot, KernReturn>;

    fn set_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> Result<(), KernReturn>;

    /// Read the handlers installed on `task` for `mask` without changing them.
    fn get_exception_ports(&self, task: Port, mask: ExceptionMask)
        -> Result<HandlerSnapshot, KernReturn>;

    /// Bytes reserved for the first receive. Larger messages grow the buffer.
    fn initial_receive_size(&self) -> usize {
        REQUEST_RECEIVE_SIZE
    }

    /// Block until a message arrives on `port`. Never times out.
    fn receive(&self, port: Port, buffer: &mut [u8]) -> Result<Received, KernReturn>;

    fn send_reply(&self, reply: &ExceptionReply) -> Result<(), KernReturn>;

    /// Re-raise an exception against a previously installed handler port and
    /// return that handler's reply status.
    fn forward_exception(
        &self,
        port: Port,
        thread: Port,
        task: Port,
        exception: i32,
        codes: &[i32],
    ) -> KernReturn;

    /// Start the receiver on a detached OS thread.
    fn spawn_receiver(
        &self,
        name: String,
        stack_size: Option<usize>,
        body: ReceiverBody,
    ) -> io::Result<()> {
        let mut builder = std::thread::Builder::new().name(name);
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        // Dropping the handle detaches the thread.
        builder.spawn(body).map(drop)
    }
}
