//! Wire layout of the `exception_raise` request and its reply.
//!
//! These mirror the MIG-generated structures from `exc.defs`. All structs are
//! plain data with no implicit padding, so they can be copied to and from raw
//! message buffers.

use std::mem::size_of;
use std::ptr;

use thiserror::Error;

use crate::exception::EXCEPTION_CODE_MAX;
use crate::kernel::{KernReturn, Port, PORT_NULL};

/// `exception_raise` routine id in the `exc` subsystem.
pub const EXCEPTION_RAISE_ID: i32 = 2401;

/// MIG replies carry the request id plus this offset.
pub const REPLY_ID_OFFSET: i32 = 100;

/// Upper bound on the trailer the kernel may append on receive.
pub const MAX_TRAILER_SIZE: usize = 68;

pub const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_001f;
pub const MACH_MSGH_BITS_COMPLEX: u32 = 0x8000_0000;
pub const MACH_MSG_TYPE_MOVE_SEND: u32 = 17;
pub const MACH_MSG_TYPE_MOVE_SEND_ONCE: u32 = 18;
pub const MACH_MSG_PORT_DESCRIPTOR: u8 = 0;

/// `MACH_MSGH_BITS(remote, local)`
pub const fn msgh_bits(remote: u32, local: u32) -> u32 {
    remote | (local << 8)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("message truncated: {len} bytes, need {expected}")]
    Truncated { len: usize, expected: usize },

    #[error("unexpected message id {0}")]
    UnexpectedId(i32),

    #[error("expected 2 port descriptors, got {0}")]
    BadDescriptorCount(u32),

    #[error("code count {0} exceeds {max}", max = EXCEPTION_CODE_MAX)]
    TooManyCodes(u32),
}

/// `mach_msg_header_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MsgHeader {
    pub bits: u32,
    pub size: u32,
    pub remote_port: Port,
    pub local_port: Port,
    pub voucher_port: Port,
    pub id: i32,
}

impl MsgHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, RequestError> {
        read_pod(bytes)
    }

    /// Disposition bits of the remote (reply) port.
    pub fn remote_bits(&self) -> u32 {
        self.bits & MACH_MSGH_BITS_REMOTE_MASK
    }
}

/// `mach_msg_port_descriptor_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PortDescriptor {
    pub name: Port,
    pub pad1: u32,
    pub pad2: u16,
    pub disposition: u8,
    pub kind: u8,
}

impl PortDescriptor {
    fn send_right(name: Port) -> Self {
        Self {
            name,
            pad1: 0,
            pad2: 0,
            disposition: MACH_MSG_TYPE_MOVE_SEND as u8,
            kind: MACH_MSG_PORT_DESCRIPTOR,
        }
    }
}

/// `NDR_record_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct NdrRecord {
    pub mig_vers: u8,
    pub if_vers: u8,
    pub reserved1: u8,
    pub mig_encoding: u8,
    pub int_rep: u8,
    pub char_rep: u8,
    pub float_rep: u8,
    pub reserved2: u8,
}

impl Default for NdrRecord {
    fn default() -> Self {
        // NDR_record for a little-endian host.
        Self {
            mig_vers: 0,
            if_vers: 0,
            reserved1: 0,
            mig_encoding: 0,
            int_rep: 1,
            char_rep: 0,
            float_rep: 0,
            reserved2: 0,
        }
    }
}

/// `__Request__exception_raise_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ExceptionRequest {
    pub header: MsgHeader,
    pub descriptor_count: u32,
    pub thread: PortDescriptor,
    pub task: PortDescriptor,
    pub ndr: NdrRecord,
    pub exception: i32,
    pub code_count: u32,
    pub code: [i32; EXCEPTION_CODE_MAX],
}

impl ExceptionRequest {
    /// Build a request as the kernel would deliver it to `local_port`.
    /// Codes beyond [`EXCEPTION_CODE_MAX`] are dropped.
    pub fn new(
        local_port: Port,
        reply_port: Port,
        thread: Port,
        task: Port,
        exception: i32,
        codes: &[i32],
    ) -> Self {
        let n = codes.len().min(EXCEPTION_CODE_MAX);
        let mut code = [0; EXCEPTION_CODE_MAX];
        code[..n].copy_from_slice(&codes[..n]);
        Self {
            header: MsgHeader {
                bits: MACH_MSGH_BITS_COMPLEX
                    | msgh_bits(MACH_MSG_TYPE_MOVE_SEND_ONCE, MACH_MSG_TYPE_MOVE_SEND),
                size: size_of::<Self>() as u32,
                remote_port: reply_port,
                local_port,
                voucher_port: PORT_NULL,
                id: EXCEPTION_RAISE_ID,
            },
            descriptor_count: 2,
            thread: PortDescriptor::send_right(thread),
            task: PortDescriptor::send_right(task),
            ndr: NdrRecord::default(),
            exception,
            code_count: n as u32,
            code,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, RequestError> {
        let request: Self = read_pod(bytes)?;
        if request.header.id != EXCEPTION_RAISE_ID {
            return Err(RequestError::UnexpectedId(request.header.id));
        }
        if request.descriptor_count != 2 {
            return Err(RequestError::BadDescriptorCount(request.descriptor_count));
        }
        if request.code_count as usize > EXCEPTION_CODE_MAX {
            return Err(RequestError::TooManyCodes(request.code_count));
        }
        Ok(request)
    }

    /// The valid prefix of the code vector.
    pub fn codes(&self) -> &[i32] {
        &self.code[..(self.code_count as usize).min(EXCEPTION_CODE_MAX)]
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) plain data without padding (checked below).
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }
}

/// `__Reply__exception_raise_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ExceptionReply {
    pub header: MsgHeader,
    pub ndr: NdrRecord,
    pub ret_code: i32,
}

impl ExceptionReply {
    /// Reply to `request` with `ret_code`.
    ///
    /// Only the remote disposition of the request survives; the reply goes to
    /// the request's reply port under id + [`REPLY_ID_OFFSET`].
    pub fn for_request(request: &MsgHeader, ret_code: KernReturn) -> Self {
        Self {
            header: MsgHeader {
                bits: msgh_bits(request.remote_bits(), 0),
                size: size_of::<Self>() as u32,
                remote_port: request.remote_port,
                local_port: PORT_NULL,
                voucher_port: PORT_NULL,
                id: request.id.wrapping_add(REPLY_ID_OFFSET),
            },
            ndr: NdrRecord::default(),
            ret_code: ret_code.0,
        }
    }

    pub fn ret_code(&self) -> KernReturn {
        KernReturn(self.ret_code)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) plain data without padding (checked below).
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }
}

// Layouts must match the MIG structures byte for byte.
const _: () = assert!(size_of::<MsgHeader>() == 24);
const _: () = assert!(size_of::<PortDescriptor>() == 12);
const _: () = assert!(size_of::<NdrRecord>() == 8);
const _: () = assert!(size_of::<ExceptionRequest>() == 76);
const _: () = assert!(size_of::<ExceptionReply>() == 36);

/// Bytes needed to receive one request including the kernel trailer.
pub const REQUEST_RECEIVE_SIZE: usize = size_of::<ExceptionRequest>() + MAX_TRAILER_SIZE;

/// Copy a plain-data struct out of the front of `bytes`.
fn read_pod<T: Copy>(bytes: &[u8]) -> Result<T, RequestError> {
    let expected = size_of::<T>();
    if bytes.len() < expected {
        return Err(RequestError::Truncated {
            len: bytes.len(),
            expected,
        });
    }
    // SAFETY: length checked; only used with padding-free integer structs,
    // for which every bit pattern is valid.
    Ok(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_mirrors_request() {
        let request = ExceptionRequest::new(0x1503, 0x2707, 0x303, 0x203, 1, &[1, 0x10]);
        let reply = ExceptionReply::for_request(&request.header, KernReturn::SUCCESS);

        assert_eq!(reply.header.id, EXCEPTION_RAISE_ID + 100);
        assert_eq!(reply.header.remote_port, 0x2707);
        assert_eq!(reply.header.local_port, PORT_NULL);
        assert_eq!(reply.header.bits, MACH_MSG_TYPE_MOVE_SEND_ONCE);
        assert_eq!(reply.header.size, 36);
        assert_eq!(reply.ret_code(), KernReturn::SUCCESS);
    }

    #[test]
    fn test_reply_unhandled_code() {
        let header = MsgHeader {
            bits: MACH_MSGH_BITS_COMPLEX | msgh_bits(MACH_MSG_TYPE_MOVE_SEND_ONCE, 20),
            id: 77,
            ..MsgHeader::default()
        };
        let reply = ExceptionReply::for_request(&header, KernReturn::FAILURE);
        assert_eq!(reply.header.id, 177);
        assert_eq!(reply.header.bits & MACH_MSGH_BITS_COMPLEX, 0);
        assert_eq!(reply.ret_code, 5);
    }

    #[test]
    fn test_parse_request_from_buffer_with_trailer() {
        let request = ExceptionRequest::new(0x1503, 0x2707, 0x303, 0x203, 3, &[7]);
        let mut buf = vec![0u8; REQUEST_RECEIVE_SIZE];
        buf[..size_of::<ExceptionRequest>()].copy_from_slice(request.as_bytes());

        let parsed = ExceptionRequest::parse(&buf).unwrap();
        assert_eq!(parsed.thread.name, 0x303);
        assert_eq!(parsed.task.name, 0x203);
        assert_eq!(parsed.exception, 3);
        assert_eq!(parsed.codes(), &[7]);
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        let request = ExceptionRequest::new(1, 2, 3, 4, 1, &[0, 0]);
        assert_eq!(
            ExceptionRequest::parse(&request.as_bytes()[..40]),
            Err(RequestError::Truncated {
                len: 40,
                expected: 76
            })
        );

        let mut wrong_id = request;
        wrong_id.header.id = 2405;
        assert_eq!(
            ExceptionRequest::parse(wrong_id.as_bytes()),
            Err(RequestError::UnexpectedId(2405))
        );

        let mut too_many = request;
        too_many.code_count = 9;
        assert_eq!(
            ExceptionRequest::parse(too_many.as_bytes()),
            Err(RequestError::TooManyCodes(9))
        );
    }

    #[test]
    fn test_new_truncates_codes() {
        let request = ExceptionRequest::new(1, 2, 3, 4, 1, &[1, 2, 3]);
        assert_eq!(request.code_count, 2);
        assert_eq!(request.codes(), &[1, 2]);
    }
}
