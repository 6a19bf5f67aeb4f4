//! Registering an exception server for a task.

use std::io;
use std::sync::Arc;

use faultline_config::{
    log_register_debug, log_register_error, log_register_info, ConfigError, InterceptConfig,
};

use crate::error::{RegistrationError, Result};
use crate::exception::ExceptionMask;
use crate::handler::CrashHandler;
use crate::kernel::{ExceptionKernel, Port};
use crate::receiver::{BootstrapError, ServerContext};

/// Knobs for one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Exceptions routed to the server.
    pub mask: ExceptionMask,
    pub thread_name: String,
    pub stack_size: Option<usize>,
    /// Re-raise the intercepted exception on the previously installed handler.
    pub forward_to_previous: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            mask: ExceptionMask::FATAL,
            thread_name: "faultline-exc".to_string(),
            stack_size: None,
            forward_to_previous: true,
        }
    }
}

impl ServerOptions {
    pub fn from_config(config: &InterceptConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            mask: ExceptionMask::from_names(&config.exceptions)?,
            thread_name: config.thread_name.clone(),
            stack_size: config.stack_size,
            forward_to_previous: config.forward_to_previous,
        })
    }
}

/// A live registration. The server port now sits in front of whatever
/// handled `mask` before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub task: Port,
    pub server_port: Port,
    pub mask: ExceptionMask,
}

/// One interception of one task. Consumed by [`ExceptionServer::register`].
pub struct ExceptionServer<K: ExceptionKernel> {
    kernel: Arc<K>,
    task: Port,
    options: ServerOptions,
}

impl<K: ExceptionKernel> ExceptionServer<K> {
    pub fn new(kernel: Arc<K>, task: Port) -> Self {
        Self {
            kernel,
            task,
            options: ServerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Install the server in front of the task's current handlers.
    ///
    /// Blocks until the receiver thread has either swapped its port in or
    /// failed to. On error nothing was changed on the task.
    pub fn register<H: CrashHandler>(self, handler: H) -> Result<Registration> {
        let ExceptionServer {
            kernel,
            task,
            options,
        } = self;

        let port = kernel.allocate_receive_port().map_err(|kr| {
            log_register_error!("Port allocation failed", error = display(kr));
            RegistrationError::kernel("mach_port_allocate", kr)
        })?;
        let mut guard = PortGuard::new(&*kernel, port);

        kernel.insert_send_right(port).map_err(|kr| {
            log_register_error!("Inserting send right failed", port = port, error = display(kr));
            RegistrationError::kernel("mach_port_insert_right", kr)
        })?;
        guard.has_send_right = true;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let context = ServerContext::new(
            Arc::clone(&kernel),
            handler,
            task,
            port,
            options.mask,
            options.forward_to_previous,
        );
        kernel
            .spawn_receiver(
                options.thread_name.clone(),
                options.stack_size,
                Box::new(move || context.run(tx)),
            )
            .map_err(|e| {
                log_register_error!("Spawning receiver thread failed", error = display(&e));
                RegistrationError::resource("spawn receiver thread", e)
            })?;

        log_register_debug!("Waiting for receiver handshake", port = port);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(BootstrapError::Swap(kr))) => {
                log_register_error!("Installing exception port failed", error = display(kr));
                return Err(RegistrationError::kernel("task_swap_exception_ports", kr));
            }
            Ok(Err(BootstrapError::OutOfMemory)) => {
                return Err(RegistrationError::resource(
                    "allocate receive buffer",
                    io::Error::from_raw_os_error(libc::ENOMEM),
                ));
            }
            Err(_) => {
                return Err(RegistrationError::resource(
                    "receiver handshake",
                    io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "receiver exited without reporting",
                    ),
                ));
            }
        }

        guard.disarm();
        log_register_info!(
            "Exception server installed",
            task = task,
            port = port,
            mask = options.mask.bits()
        );
        Ok(Registration {
            task,
            server_port: port,
            mask: options.mask,
        })
    }
}

/// Releases the server port unless registration succeeds.
struct PortGuard<'a, K: ExceptionKernel + ?Sized> {
    kernel: &'a K,
    port: Port,
    has_send_right: bool,
    armed: bool,
}

impl<'a, K: ExceptionKernel + ?Sized> PortGuard<'a, K> {
    fn new(kernel: &'a K, port: Port) -> Self {
        Self {
            kernel,
            port,
            has_send_right: false,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<K: ExceptionKernel + ?Sized> Drop for PortGuard<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            self.kernel.release_port(self.port, self.has_send_right);
        }
    }
}
