//! Body of the receiver thread.
//!
//! The thread moves through `Bootstrapping -> Waiting -> Handling -> Replying
//! -> Terminated`, leaving early to `Terminated` when bootstrapping or a
//! receive fails. It services at most one exception: the previous handlers
//! are reinstalled as soon as a message arrives, so a fault raised while
//! handling goes to them rather than back here.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::Sender;
use faultline_config::{
    log_intercept_debug, log_intercept_error, log_intercept_info, log_intercept_warn,
};

use crate::buffer::ReceiveBuffer;
use crate::exception::{ExceptionBehavior, ExceptionMask, THREAD_STATE_NONE};
use crate::forward::select_forward_target;
use crate::handler::{CrashHandler, FaultContext};
use crate::kernel::{ExceptionKernel, KernReturn, Port, Received};
use crate::message::{ExceptionReply, ExceptionRequest, MsgHeader};
use crate::restore::restore_handlers;
use crate::snapshot::HandlerSnapshot;

/// Reply status telling the kernel the fault was not handled and the thread
/// must not be resumed.
pub const UNHANDLED: KernReturn = KernReturn::FAILURE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Bootstrapping,
    Waiting,
    Handling,
    Replying,
    Terminated,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReceiverState::Bootstrapping => "bootstrapping",
            ReceiverState::Waiting => "waiting",
            ReceiverState::Handling => "handling",
            ReceiverState::Replying => "replying",
            ReceiverState::Terminated => "terminated",
        })
    }
}

/// Bootstrap failure reported back to the registering thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootstrapError {
    OutOfMemory,
    Swap(KernReturn),
}

pub(crate) type Handshake = Sender<Result<(), BootstrapError>>;

/// Everything the receiver thread owns once it is running.
pub(crate) struct ServerContext<K, H> {
    kernel: Arc<K>,
    handler: H,
    task: Port,
    server_port: Port,
    mask: ExceptionMask,
    forward: bool,
    previous: HandlerSnapshot,
}

impl<K: ExceptionKernel, H: CrashHandler> ServerContext<K, H> {
    pub(crate) fn new(
        kernel: Arc<K>,
        handler: H,
        task: Port,
        server_port: Port,
        mask: ExceptionMask,
        forward: bool,
    ) -> Self {
        Self {
            kernel,
            handler,
            task,
            server_port,
            mask,
            forward,
            previous: HandlerSnapshot::new(),
        }
    }

    fn enter(&self, state: ReceiverState) {
        log_intercept_debug!(
            "Receiver state",
            state = display(state),
            port = self.server_port
        );
    }

    pub(crate) fn run(mut self, handshake: Handshake) {
        self.enter(ReceiverState::Bootstrapping);

        // Allocate before touching the ports so an allocation failure leaves
        // the task untouched.
        let mut buffer = match ReceiveBuffer::with_size(self.kernel.initial_receive_size()) {
            Ok(buffer) => buffer,
            Err(_) => {
                let _ = handshake.send(Err(BootstrapError::OutOfMemory));
                self.enter(ReceiverState::Terminated);
                return;
            }
        };

        match self.kernel.swap_exception_ports(
            self.task,
            self.mask,
            self.server_port,
            ExceptionBehavior::DEFAULT,
            THREAD_STATE_NONE,
        ) {
            Ok(previous) => self.previous = previous,
            Err(kr) => {
                let _ = handshake.send(Err(BootstrapError::Swap(kr)));
                self.enter(ReceiverState::Terminated);
                return;
            }
        }

        if handshake.send(Ok(())).is_err() {
            // Nobody is waiting to learn the handler is installed; back out.
            log_intercept_warn!("Registering thread went away, uninstalling");
            self.restore();
            self.enter(ReceiverState::Terminated);
            return;
        }
        drop(handshake);

        self.enter(ReceiverState::Waiting);
        let len = loop {
            match self.kernel.receive(self.server_port, buffer.as_mut_bytes()) {
                Ok(Received::Message { len }) => break len.min(buffer.len()),
                Ok(Received::TooLarge { required }) => {
                    log_intercept_debug!(
                        "Receive buffer too small, growing",
                        have = buffer.len(),
                        required = required
                    );
                    if buffer.grow_to(required).is_err() {
                        log_intercept_error!(
                            "Cannot grow receive buffer, uninstalling",
                            required = required
                        );
                        self.restore();
                        self.enter(ReceiverState::Terminated);
                        return;
                    }
                }
                Err(kr) => {
                    log_intercept_error!(
                        "Receive failed, uninstalling",
                        port = self.server_port,
                        error = display(kr)
                    );
                    self.restore();
                    self.enter(ReceiverState::Terminated);
                    return;
                }
            }
        };

        self.enter(ReceiverState::Handling);
        self.restore();

        let bytes = &buffer.as_bytes()[..len];
        let header = match MsgHeader::parse(bytes) {
            Ok(header) => header,
            Err(e) => {
                log_intercept_error!("Undecodable message header, cannot reply", error = display(e));
                self.enter(ReceiverState::Terminated);
                return;
            }
        };
        let ret_code = match ExceptionRequest::parse(bytes) {
            Ok(request) => self.handle(&request),
            Err(e) => {
                log_intercept_warn!(
                    "Malformed exception request",
                    id = header.id,
                    error = display(e)
                );
                KernReturn::MIG_BAD_ARGUMENTS
            }
        };

        self.enter(ReceiverState::Replying);
        let reply = ExceptionReply::for_request(&header, ret_code);
        if let Err(kr) = self.kernel.send_reply(&reply) {
            log_intercept_error!(
                "Failed to send exception reply",
                remote_port = header.remote_port,
                error = display(kr)
            );
        }

        drop(buffer);
        self.enter(ReceiverState::Terminated);
    }

    /// Notify the handler, then forward. Returns the reply status.
    fn handle(&self, request: &ExceptionRequest) -> KernReturn {
        let fault = FaultContext {
            thread: request.thread.name,
            task: request.task.name,
            exception: request.exception,
            codes: request.codes(),
        };
        log_intercept_info!(
            "Exception intercepted",
            exception = fault.exception,
            thread = fault.thread,
            task = fault.task
        );

        if catch_unwind(AssertUnwindSafe(|| self.handler.on_exception(&fault))).is_err() {
            log_intercept_error!("Crash handler panicked", exception = fault.exception);
        }

        if !self.forward {
            return UNHANDLED;
        }

        match select_forward_target(&self.previous, fault.exception) {
            Some(target) => {
                let kr = self.kernel.forward_exception(
                    target.port,
                    fault.thread,
                    fault.task,
                    fault.exception,
                    fault.codes,
                );
                log_intercept_info!(
                    "Forwarded exception to previous handler",
                    port = target.port,
                    result = display(kr)
                );
                kr
            }
            None => {
                log_intercept_debug!(
                    "No previous handler accepts this exception",
                    exception = fault.exception
                );
                UNHANDLED
            }
        }
    }

    fn restore(&self) {
        let report = restore_handlers(&*self.kernel, self.task, &self.previous);
        if !report.is_clean() {
            log_intercept_warn!(
                "Some previous exception handlers could not be restored",
                failed = report.failures().count()
            );
        }
    }
}
