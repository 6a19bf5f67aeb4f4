//! Integration tests for exception server registration
//!
//! These tests drive `ExceptionServer::register` against the simulated kernel
//! and check what the task's exception-port table looks like afterwards.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use faultline_mach::exception::THREAD_STATE_NONE;
use faultline_mach::testing::SimulatedKernel;
use faultline_mach::{
    ExceptionBehavior, ExceptionKind, ExceptionMask, ExceptionServer, KernReturn, NoopHandler,
    RegistrationError, ServerOptions,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn setup() -> (Arc<SimulatedKernel>, u32, u32) {
    let sim = Arc::new(SimulatedKernel::new());
    let task = sim.new_task();
    let previous = sim.new_port();
    sim.install(
        task,
        ExceptionMask::BAD_ACCESS | ExceptionMask::SOFTWARE,
        previous,
        ExceptionBehavior::DEFAULT,
        THREAD_STATE_NONE,
    );
    (sim, task, previous)
}

#[test]
fn test_register_installs_server_for_fatal_mask() {
    let (sim, task, previous) = setup();

    let registration = ExceptionServer::new(Arc::clone(&sim), task)
        .register(NoopHandler)
        .unwrap();

    assert_eq!(registration.task, task);
    assert_eq!(registration.mask, ExceptionMask::FATAL);
    assert!(sim.is_live(registration.server_port));
    for kind in ExceptionMask::FATAL.kinds() {
        assert_eq!(sim.route(task, kind), registration.server_port);
    }
    // Outside the mask nothing changed.
    assert_eq!(sim.route(task, ExceptionKind::Software), previous);
    assert!(sim.released_ports().is_empty());
}

#[test]
fn test_register_with_custom_options() {
    let (sim, task, previous) = setup();
    let options = ServerOptions {
        mask: ExceptionMask::SOFTWARE,
        thread_name: "custom-exc".to_string(),
        stack_size: Some(256 * 1024),
        forward_to_previous: true,
    };

    let registration = ExceptionServer::new(Arc::clone(&sim), task)
        .with_options(options)
        .register(NoopHandler)
        .unwrap();

    assert_eq!(sim.route(task, ExceptionKind::Software), registration.server_port);
    assert_eq!(sim.route(task, ExceptionKind::BadAccess), previous);
}

#[test]
fn test_thread_spawn_failure_leaves_no_trace() {
    let (sim, task, _) = setup();
    let before = sim.port_table(task);
    sim.fail_thread_spawn();

    let err = ExceptionServer::new(Arc::clone(&sim), task)
        .register(NoopHandler)
        .unwrap_err();

    assert!(err.is_resource());
    assert_eq!(err.os_code(), Some(libc::EAGAIN));
    assert_eq!(sim.port_table(task), before);
    let released = sim.released_ports();
    assert_eq!(released.len(), 1);
    assert!(!sim.is_live(released[0]));
}

#[test]
fn test_swap_failure_reports_kernel_status() {
    let (sim, task, _) = setup();
    let before = sim.port_table(task);
    sim.fail_swap(KernReturn::INVALID_ARGUMENT);

    let err = ExceptionServer::new(Arc::clone(&sim), task)
        .register(NoopHandler)
        .unwrap_err();

    assert!(!err.is_resource());
    assert_eq!(err.kernel_code(), Some(KernReturn::INVALID_ARGUMENT));
    assert_eq!(sim.port_table(task), before);
    assert_eq!(sim.released_ports().len(), 1);
    assert!(sim.wait_for_receiver_exit(TIMEOUT));
}

#[test]
fn test_port_allocation_failure() {
    let (sim, task, _) = setup();
    let before = sim.port_table(task);
    sim.fail_port_allocation(KernReturn::RESOURCE_SHORTAGE);

    let err = ExceptionServer::new(Arc::clone(&sim), task)
        .register(NoopHandler)
        .unwrap_err();

    assert_eq!(err.kernel_code(), Some(KernReturn::RESOURCE_SHORTAGE));
    assert!(sim.released_ports().is_empty());
    assert_eq!(sim.port_table(task), before);
}

#[test]
fn test_send_right_failure_releases_port() {
    let (sim, task, _) = setup();
    sim.fail_insert_right(KernReturn::INVALID_RIGHT);

    let err = ExceptionServer::new(Arc::clone(&sim), task)
        .register(NoopHandler)
        .unwrap_err();

    assert_eq!(err.kernel_code(), Some(KernReturn::INVALID_RIGHT));
    let released = sim.released_ports();
    assert_eq!(released.len(), 1);
    assert!(!sim.is_live(released[0]));
}

#[test]
fn test_register_unknown_task_fails_cleanly() {
    let sim = Arc::new(SimulatedKernel::new());

    let err = ExceptionServer::new(Arc::clone(&sim), 0xdead)
        .register(NoopHandler)
        .unwrap_err();

    assert_eq!(err.kernel_code(), Some(KernReturn::INVALID_ARGUMENT));
    assert_eq!(sim.released_ports().len(), 1);
}

#[test]
fn test_register_blocks_until_swap_returns() {
    let (sim, task, _) = setup();
    sim.hold_swaps();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let kernel = Arc::clone(&sim);
    let caller = thread::spawn(move || {
        let result = ExceptionServer::new(kernel, task).register(NoopHandler);
        done_tx.send(()).unwrap();
        result
    });

    assert!(sim.wait_for_swap_started(TIMEOUT));
    // The swap is parked; the caller must still be waiting on the handshake.
    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(sim.route(task, ExceptionKind::BadAccess), sim.route(task, ExceptionKind::Software));

    sim.release_swaps();
    let registration = caller.join().unwrap().unwrap();
    assert!(done_rx.recv_timeout(TIMEOUT).is_ok());
    assert_eq!(sim.route(task, ExceptionKind::BadAccess), registration.server_port);
}

#[test]
fn test_receive_buffer_exhaustion_is_resource_error() {
    let (sim, task, _) = setup();
    let before = sim.port_table(task);
    sim.set_initial_receive_size(usize::MAX);

    let err = ExceptionServer::new(Arc::clone(&sim), task)
        .register(NoopHandler)
        .unwrap_err();

    assert!(err.is_resource());
    assert_eq!(err.os_code(), Some(libc::ENOMEM));
    assert_eq!(sim.port_table(task), before);
    assert_eq!(sim.released_ports().len(), 1);
    assert!(sim.wait_for_receiver_exit(TIMEOUT));
}

#[test]
fn test_lost_handshake_is_resource_error() {
    let (sim, task, _) = setup();
    let before = sim.port_table(task);
    sim.panic_in_swap();

    let err = ExceptionServer::new(Arc::clone(&sim), task)
        .register(NoopHandler)
        .unwrap_err();

    assert!(err.is_resource());
    assert!(matches!(
        &err,
        RegistrationError::Resource { source, .. }
            if source.kind() == std::io::ErrorKind::BrokenPipe
    ));
    assert_eq!(sim.port_table(task), before);
    let released = sim.released_ports();
    assert_eq!(released.len(), 1);
    assert!(!sim.is_live(released[0]));
}
