//! # faultline-mach
//!
//! Mach exception interception for Faultline.
//!
//! Registers a server port in front of a task's existing exception handlers
//! so that hardware and software faults (bad access, illegal instruction,
//! arithmetic, breakpoint, ...) are seen before the previous handler or the
//! default termination runs.
//!
//! - [`ExceptionServer::register`] allocates the server port, starts the
//!   receiver thread and returns only once the port swap has succeeded or
//!   failed.
//! - The receiver services exactly one exception. It restores the previous
//!   handlers first, calls the [`CrashHandler`], forwards the exception to
//!   the previous handler where the behavior allows, and replies.
//!
//! All kernel access goes through [`ExceptionKernel`]; [`mach::MachKernel`]
//! is the macOS implementation and [`testing::SimulatedKernel`] an
//! in-process one.

pub mod buffer;
pub mod error;
pub mod exception;
pub mod forward;
pub mod handler;
pub mod kernel;
pub mod message;
pub mod receiver;
pub mod registration;
pub mod restore;
pub mod snapshot;
pub mod testing;

#[cfg(target_os = "macos")]
pub mod mach;

pub use error::{RegistrationError, Result};
pub use exception::{
    mask_for_exception, ExceptionBehavior, ExceptionKind, ExceptionMask, MAX_EXCEPTION_TYPES,
};
pub use forward::select_forward_target;
pub use handler::{CrashHandler, FaultContext, HandlerFn, NoopHandler};
pub use kernel::{ExceptionKernel, KernReturn, Port, Received};
pub use message::{ExceptionReply, ExceptionRequest};
pub use registration::{ExceptionServer, Registration, ServerOptions};
pub use restore::{restore_handlers, RestoreOutcome, RestoreReport};
pub use snapshot::{HandlerEntry, HandlerSnapshot};

/// Intercept fatal exceptions of `task` using the global configuration.
///
/// Options that fail to parse fall back to [`ServerOptions::default`].
#[cfg(target_os = "macos")]
pub fn register_handler<H: CrashHandler>(task: Port, handler: H) -> Result<Registration> {
    let options = match ServerOptions::from_config(&faultline_config::config().intercept) {
        Ok(options) => options,
        Err(e) => {
            faultline_config::log_register_warn!(
                "Invalid intercept config, using defaults",
                error = tracing::field::display(e)
            );
            ServerOptions::default()
        }
    };
    ExceptionServer::new(std::sync::Arc::new(mach::MachKernel::new()), task)
        .with_options(options)
        .register(handler)
}
