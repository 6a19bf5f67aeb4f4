//! Integration tests for the exception receiver
//!
//! Each test registers a server on a simulated task, raises an exception the
//! way the kernel would, and checks the reply, the forwarded exception and the
//! port table the receiver leaves behind.

use std::sync::Arc;
use std::time::Duration;

use faultline_mach::buffer::page_size;
use faultline_mach::exception::THREAD_STATE_NONE;
use faultline_mach::message::{ExceptionRequest, EXCEPTION_RAISE_ID, REQUEST_RECEIVE_SIZE};
use faultline_mach::receiver::UNHANDLED;
use faultline_mach::testing::{Delivery, SimulatedKernel};
use faultline_mach::{
    ExceptionBehavior, ExceptionKind, ExceptionMask, ExceptionServer, FaultContext, HandlerFn,
    KernReturn, NoopHandler, Port, Registration, ServerOptions,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const THREAD: Port = 0x2203;

/// A task whose bad-access faults went to `p1` (plain behavior) and whose
/// breakpoints went to `p2` (state behavior) before registration.
struct Fixture {
    sim: Arc<SimulatedKernel>,
    task: Port,
    p1: Port,
    p2: Port,
}

impl Fixture {
    fn new() -> Self {
        let sim = Arc::new(SimulatedKernel::new());
        let task = sim.new_task();
        let p1 = sim.new_port();
        let p2 = sim.new_port();
        sim.install(
            task,
            ExceptionMask::BAD_ACCESS,
            p1,
            ExceptionBehavior::DEFAULT,
            THREAD_STATE_NONE,
        );
        sim.install(task, ExceptionMask::BREAKPOINT, p2, ExceptionBehavior::STATE, 7);
        Self { sim, task, p1, p2 }
    }

    fn register(&self) -> Registration {
        ExceptionServer::new(Arc::clone(&self.sim), self.task)
            .register(NoopHandler)
            .unwrap()
    }

    fn raise(&self, kind: ExceptionKind) -> Delivery {
        self.sim.raise(self.task, THREAD, kind, &[1, 0x10]).unwrap()
    }
}

#[test]
fn test_bad_access_is_forwarded_to_previous_handler() {
    let fx = Fixture::new();
    fx.sim.set_forward_status(fx.p1, KernReturn::INVALID_ADDRESS);
    let registration = fx.register();

    assert_eq!(
        fx.raise(ExceptionKind::BadAccess),
        Delivery::Queued {
            port: registration.server_port
        }
    );

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.ret_code(), KernReturn::INVALID_ADDRESS);
    assert_eq!(reply.header.id, EXCEPTION_RAISE_ID + 100);
    assert_eq!(reply.header.size, 36);
    assert_eq!(reply.header.local_port, 0);

    let forwards = fx.sim.forwards();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].port, fx.p1);
    assert_eq!(forwards[0].thread, THREAD);
    assert_eq!(forwards[0].task, fx.task);
    assert_eq!(forwards[0].exception, ExceptionKind::BadAccess.as_raw());
    assert_eq!(forwards[0].codes, vec![1, 0x10]);
}

#[test]
fn test_breakpoint_with_state_behavior_is_not_forwarded() {
    let fx = Fixture::new();
    fx.register();

    fx.raise(ExceptionKind::Breakpoint);

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.ret_code(), UNHANDLED);
    assert!(fx.sim.forwards().is_empty());
}

#[test]
fn test_exception_without_previous_handler_is_unhandled() {
    let fx = Fixture::new();
    fx.register();

    fx.raise(ExceptionKind::Arithmetic);

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.ret_code(), UNHANDLED);
    assert!(fx.sim.forwards().is_empty());
}

#[test]
fn test_reply_goes_to_request_reply_port() {
    let fx = Fixture::new();
    let registration = fx.register();
    let reply_port = 0x7703;
    let request = ExceptionRequest::new(
        registration.server_port,
        reply_port,
        THREAD,
        fx.task,
        ExceptionKind::BadAccess.as_raw(),
        &[2, 0],
    );
    fx.sim
        .send_raw(registration.server_port, request.as_bytes().to_vec());

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.header.remote_port, reply_port);
    assert_eq!(reply.header.bits, request.header.remote_bits());
}

#[test]
fn test_single_shot_restores_previous_handlers() {
    let fx = Fixture::new();
    let before = fx.sim.port_table(fx.task);
    let registration = fx.register();
    assert_ne!(fx.sim.port_table(fx.task), before);

    fx.raise(ExceptionKind::BadAccess);
    fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert!(fx.sim.wait_for_receiver_exit(TIMEOUT));

    assert_eq!(fx.sim.port_table(fx.task), before);
    assert_eq!(fx.sim.route(fx.task, ExceptionKind::Breakpoint), fx.p2);

    // A second fault goes straight to the previous handler.
    assert_eq!(
        fx.raise(ExceptionKind::BadAccess),
        Delivery::Queued { port: fx.p1 }
    );
    assert_eq!(fx.sim.pending_messages(registration.server_port), 0);
    assert_eq!(fx.sim.replies().len(), 1);
}

#[test]
fn test_large_message_grows_receive_buffer() {
    let fx = Fixture::new();
    fx.register();

    fx.sim
        .raise_padded(fx.task, THREAD, ExceptionKind::BadAccess, &[1, 0], 10_000)
        .unwrap();

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.ret_code(), KernReturn::SUCCESS);

    let sizes = fx.sim.receive_buffer_sizes();
    assert_eq!(sizes.len(), 2);
    assert_eq!(sizes[0], REQUEST_RECEIVE_SIZE);
    assert!(sizes[1] >= 10_076 + 68);
    assert_eq!(sizes[1] % page_size(), 0);
}

#[test]
fn test_receive_error_uninstalls_server() {
    let fx = Fixture::new();
    let before = fx.sim.port_table(fx.task);
    let registration = fx.register();
    assert!(fx
        .sim
        .wait_for_receiver_blocked(registration.server_port, TIMEOUT));

    fx.sim.fail_next_receive(KernReturn::RCV_INTERRUPTED);

    assert!(fx.sim.wait_for_receiver_exit(TIMEOUT));
    assert_eq!(fx.sim.port_table(fx.task), before);
    assert!(fx.sim.replies().is_empty());
}

#[test]
fn test_handler_runs_after_restore_and_before_forward() {
    let fx = Fixture::new();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let sim = Arc::clone(&fx.sim);
    let task = fx.task;
    let on_fault = move |fault: &FaultContext<'_>| {
        let observed = (
            fault.kind(),
            fault.codes.to_vec(),
            sim.route(task, ExceptionKind::BadAccess),
            sim.forwards().len(),
        );
        let _ = tx.send(observed);
    };
    // SAFETY: test-only handler; runs on a healthy process.
    let handler = unsafe { HandlerFn::new(on_fault) };
    ExceptionServer::new(Arc::clone(&fx.sim), fx.task)
        .register(handler)
        .unwrap();

    fx.raise(ExceptionKind::BadAccess);

    let (kind, codes, route, forwarded) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(kind, Some(ExceptionKind::BadAccess));
    assert_eq!(codes, vec![1, 0x10]);
    assert_eq!(route, fx.p1);
    assert_eq!(forwarded, 0);
    fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(fx.sim.forwards().len(), 1);
}

#[test]
fn test_panicking_handler_still_replies() {
    let fx = Fixture::new();
    // SAFETY: test-only handler.
    let handler = unsafe { HandlerFn::new(|_: &FaultContext<'_>| panic!("handler failure")) };
    ExceptionServer::new(Arc::clone(&fx.sim), fx.task)
        .register(handler)
        .unwrap();

    fx.raise(ExceptionKind::BadAccess);

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.ret_code(), KernReturn::SUCCESS);
    assert_eq!(fx.sim.forwards().len(), 1);
}

#[test]
fn test_forwarding_disabled() {
    let fx = Fixture::new();
    let options = ServerOptions {
        forward_to_previous: false,
        ..ServerOptions::default()
    };
    ExceptionServer::new(Arc::clone(&fx.sim), fx.task)
        .with_options(options)
        .register(NoopHandler)
        .unwrap();

    fx.raise(ExceptionKind::BadAccess);

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.ret_code(), UNHANDLED);
    assert!(fx.sim.forwards().is_empty());
}

#[test]
fn test_unexpected_message_id_gets_bad_arguments() {
    let fx = Fixture::new();
    let before = fx.sim.port_table(fx.task);
    let registration = fx.register();
    let mut request = ExceptionRequest::new(
        registration.server_port,
        0x7703,
        THREAD,
        fx.task,
        ExceptionKind::BadAccess.as_raw(),
        &[1, 0],
    );
    request.header.id = 2405;
    fx.sim
        .send_raw(registration.server_port, request.as_bytes().to_vec());

    let reply = fx.sim.wait_for_reply(TIMEOUT).expect("no reply sent");
    assert_eq!(reply.ret_code(), KernReturn::MIG_BAD_ARGUMENTS);
    assert_eq!(reply.header.id, 2505);
    assert!(fx.sim.forwards().is_empty());
    assert!(fx.sim.wait_for_receiver_exit(TIMEOUT));
    assert_eq!(fx.sim.port_table(fx.task), before);
}

#[test]
fn test_truncated_message_is_dropped_without_reply() {
    let fx = Fixture::new();
    let before = fx.sim.port_table(fx.task);
    let registration = fx.register();

    fx.sim.send_raw(registration.server_port, vec![0u8; 8]);

    assert!(fx.sim.wait_for_receiver_exit(TIMEOUT));
    assert!(fx.sim.replies().is_empty());
    assert_eq!(fx.sim.port_table(fx.task), before);
}

#[test]
fn test_reply_failure_still_terminates() {
    let fx = Fixture::new();
    let before = fx.sim.port_table(fx.task);
    fx.register();
    fx.sim.fail_reply(KernReturn::SEND_INVALID_DEST);

    fx.raise(ExceptionKind::BadAccess);

    assert!(fx.sim.wait_for_receiver_exit(TIMEOUT));
    assert!(fx.sim.replies().is_empty());
    assert_eq!(fx.sim.forwards().len(), 1);
    assert_eq!(fx.sim.port_table(fx.task), before);
}
