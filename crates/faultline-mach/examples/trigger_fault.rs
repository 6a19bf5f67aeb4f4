//! Register an exception server, then crash on purpose.
//!
//! Run with `cargo run -p faultline-mach --example trigger_fault` on macOS.
//! The handler logs the fault, which is then forwarded to whatever handled
//! it before (usually the crash reporter of the OS).

#[cfg(target_os = "macos")]
fn main() -> anyhow::Result<()> {
    use faultline_config::{config, logging::init_logging};
    use faultline_mach::mach::MachKernel;
    use faultline_mach::{register_handler, FaultContext, HandlerFn};

    init_logging(config().logging.level);

    let on_fault = |_fault: &FaultContext<'_>| {
        let msg = b"trigger_fault: exception intercepted\n";
        unsafe { libc::write(2, msg.as_ptr() as *const _, msg.len()) };
    };
    // SAFETY: the closure only writes a static buffer to stderr.
    let handler = unsafe { HandlerFn::new(on_fault) };

    let registration = register_handler(MachKernel::task_self(), handler)?;
    println!(
        "Installed on port {:#x} for mask {:#x}, faulting now",
        registration.server_port,
        registration.mask.bits()
    );

    unsafe {
        let ptr: *mut u32 = std::ptr::null_mut();
        std::ptr::write_volatile(ptr, 0xdead);
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn main() {
    eprintln!("trigger_fault needs macOS");
}
