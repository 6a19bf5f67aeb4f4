//! The callback boundary between the interception core and the crash reporter.

use crate::exception::ExceptionKind;
use crate::kernel::Port;

/// What the receiver knows about an intercepted fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultContext<'a> {
    /// Faulting thread.
    pub thread: Port,
    /// Task the thread belongs to.
    pub task: Port,
    /// Raw exception type as delivered by the kernel.
    pub exception: i32,
    /// Exception codes, `code[0]` first. For `EXC_BAD_ACCESS`, `code[1]` is
    /// the faulting address (truncated to 32 bits).
    pub codes: &'a [i32],
}

impl FaultContext<'_> {
    pub fn kind(&self) -> Option<ExceptionKind> {
        ExceptionKind::from_raw(self.exception)
    }
}

/// Receives intercepted faults.
///
/// `on_exception` runs on the receiver thread after the previous handlers
/// have been put back and before the fault is forwarded to them. At that
/// point any other thread may have stopped mid-operation holding locks, the
/// heap may be corrupted, and no other subsystem's invariants hold.
///
/// # Safety
///
/// Implementors promise the callback only touches state it owns or that was
/// prepared before the fault, and that it cannot block on locks another
/// thread of the process may hold (including the allocator's).
pub unsafe trait CrashHandler: Send + Sync + 'static {
    fn on_exception(&self, fault: &FaultContext<'_>);
}

/// A closure used as a [`CrashHandler`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F>
where
    F: Fn(&FaultContext<'_>) + Send + Sync + 'static,
{
    /// # Safety
    ///
    /// `f` must uphold the [`CrashHandler`] contract.
    pub unsafe fn new(f: F) -> Self {
        Self { f }
    }
}

unsafe impl<F> CrashHandler for HandlerFn<F>
where
    F: Fn(&FaultContext<'_>) + Send + Sync + 'static,
{
    fn on_exception(&self, fault: &FaultContext<'_>) {
        (self.f)(fault)
    }
}

/// Handler that does nothing; the fault is only forwarded.
pub struct NoopHandler;

unsafe impl CrashHandler for NoopHandler {
    fn on_exception(&self, _fault: &FaultContext<'_>) {}
}
