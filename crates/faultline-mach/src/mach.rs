//! [`ExceptionKernel`] over the real Mach APIs.

use mach2::exc::exception_raise;
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_port::{
    mach_port_allocate, mach_port_deallocate, mach_port_insert_right, mach_port_mod_refs,
};
use mach2::message::{
    mach_msg, mach_msg_header_t, mach_msg_type_number_t, MACH_MSG_SUCCESS, MACH_MSG_TIMEOUT_NONE,
    MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_LARGE, MACH_RCV_MSG, MACH_RCV_TOO_LARGE, MACH_SEND_MSG,
};
use mach2::port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::task::{task_get_exception_ports, task_set_exception_ports, task_swap_exception_ports};
use mach2::traps::mach_task_self;
use faultline_config::log_register_warn;

use crate::exception::{ExceptionBehavior, ExceptionMask, EXCEPTION_CODE_MAX, MAX_EXCEPTION_TYPES};
use crate::kernel::{ExceptionKernel, KernReturn, Port, Received};
use crate::message::{ExceptionReply, MAX_TRAILER_SIZE};
use crate::snapshot::HandlerSnapshot;

fn check(kr: kern_return_t) -> Result<(), KernReturn> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(KernReturn(kr))
    }
}

/// Storage for the kernel's parallel-array handler output.
struct HandlerArrays {
    count: mach_msg_type_number_t,
    masks: [u32; MAX_EXCEPTION_TYPES],
    ports: [mach_port_t; MAX_EXCEPTION_TYPES],
    behaviors: [i32; MAX_EXCEPTION_TYPES],
    flavors: [i32; MAX_EXCEPTION_TYPES],
}

impl HandlerArrays {
    fn new() -> Self {
        Self {
            count: MAX_EXCEPTION_TYPES as mach_msg_type_number_t,
            masks: [0; MAX_EXCEPTION_TYPES],
            ports: [MACH_PORT_NULL; MAX_EXCEPTION_TYPES],
            behaviors: [0; MAX_EXCEPTION_TYPES],
            flavors: [0; MAX_EXCEPTION_TYPES],
        }
    }

    fn into_snapshot(self) -> HandlerSnapshot {
        HandlerSnapshot::from_parallel(
            &self.masks,
            &self.ports,
            &self.behaviors,
            &self.flavors,
            self.count as usize,
        )
    }
}

/// The running process's Mach kernel interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachKernel;

impl MachKernel {
    pub fn new() -> Self {
        Self
    }

    /// Port naming the current task.
    pub fn task_self() -> Port {
        unsafe { mach_task_self() }
    }
}

impl ExceptionKernel for MachKernel {
    fn allocate_receive_port(&self) -> Result<Port, KernReturn> {
        let mut port: mach_port_t = MACH_PORT_NULL;
        check(unsafe { mach_port_allocate(mach_task_self(), MACH_PORT_RIGHT_RECEIVE, &mut port) })?;
        Ok(port)
    }

    fn insert_send_right(&self, port: Port) -> Result<(), KernReturn> {
        check(unsafe {
            mach_port_insert_right(mach_task_self(), port, port, MACH_MSG_TYPE_MAKE_SEND)
        })
    }

    fn release_port(&self, port: Port, has_send_right: bool) {
        unsafe {
            if has_send_right {
                if let Err(kr) = check(mach_port_deallocate(mach_task_self(), port)) {
                    log_register_warn!(
                        "mach_port_deallocate failed",
                        port = port,
                        error = display(kr)
                    );
                }
            }
            if let Err(kr) = check(mach_port_mod_refs(
                mach_task_self(),
                port,
                MACH_PORT_RIGHT_RECEIVE,
                -1,
            )) {
                log_register_warn!(
                    "Dropping receive right failed",
                    port = port,
                    error = display(kr)
                );
            }
        }
    }

    fn swap_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> Result<HandlerSnapshot, KernReturn> {
        let mut old = HandlerArrays::new();
        check(unsafe {
            task_swap_exception_ports(
                task,
                mask.bits(),
                port,
                behavior.0,
                flavor,
                old.masks.as_mut_ptr(),
                &mut old.count,
                old.ports.as_mut_ptr(),
                old.behaviors.as_mut_ptr(),
                old.flavors.as_mut_ptr(),
            )
        })?;
        Ok(old.into_snapshot())
    }

    fn set_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> Result<(), KernReturn> {
        check(unsafe { task_set_exception_ports(task, mask.bits(), port, behavior.0, flavor) })
    }

    fn get_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
    ) -> Result<HandlerSnapshot, KernReturn> {
        let mut current = HandlerArrays::new();
        check(unsafe {
            task_get_exception_ports(
                task,
                mask.bits(),
                current.masks.as_mut_ptr(),
                &mut current.count,
                current.ports.as_mut_ptr(),
                current.behaviors.as_mut_ptr(),
                current.flavors.as_mut_ptr(),
            )
        })?;
        Ok(current.into_snapshot())
    }

    fn receive(&self, port: Port, buffer: &mut [u8]) -> Result<Received, KernReturn> {
        let header = buffer.as_mut_ptr() as *mut mach_msg_header_t;
        let kr = unsafe {
            mach_msg(
                header,
                MACH_RCV_MSG | MACH_RCV_LARGE,
                0,
                buffer.len() as u32,
                port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        match kr {
            MACH_MSG_SUCCESS => {
                let size = unsafe { (*header).msgh_size } as usize;
                Ok(Received::Message { len: size })
            }
            // With MACH_RCV_LARGE the message stays queued and msgh_size
            // holds the size it needs, trailer excluded.
            MACH_RCV_TOO_LARGE => {
                let size = unsafe { (*header).msgh_size } as usize;
                Ok(Received::TooLarge {
                    required: size + MAX_TRAILER_SIZE,
                })
            }
            other => Err(KernReturn(other)),
        }
    }

    fn send_reply(&self, reply: &ExceptionReply) -> Result<(), KernReturn> {
        let mut reply = *reply;
        let kr = unsafe {
            mach_msg(
                &mut reply as *mut ExceptionReply as *mut mach_msg_header_t,
                MACH_SEND_MSG,
                reply.header.size,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr == MACH_MSG_SUCCESS {
            Ok(())
        } else {
            Err(KernReturn(kr))
        }
    }

    fn forward_exception(
        &self,
        port: Port,
        thread: Port,
        task: Port,
        exception: i32,
        codes: &[i32],
    ) -> KernReturn {
        let n = codes.len().min(EXCEPTION_CODE_MAX);
        let mut code = [0i32; EXCEPTION_CODE_MAX];
        code[..n].copy_from_slice(&codes[..n]);
        KernReturn(unsafe {
            exception_raise(
                port,
                thread,
                task,
                exception,
                code.as_mut_ptr(),
                n as mach_msg_type_number_t,
            )
        })
    }
}
