//! Exception classifications, masks and handler behaviors.
//!
//! Values mirror `<mach/exception_types.h>` so they can be passed to the
//! kernel unchanged.

use std::fmt;

use bitflags::bitflags;
use faultline_config::{log_forward_warn, ConfigError};

/// Number of exception slots the kernel keeps per task (`EXC_TYPES_COUNT`).
pub const MAX_EXCEPTION_TYPES: usize = 14;

/// Maximum number of codes carried by an `exception_raise` message.
pub const EXCEPTION_CODE_MAX: usize = 2;

/// `THREAD_STATE_NONE` for the running architecture.
#[cfg(target_arch = "aarch64")]
pub const THREAD_STATE_NONE: i32 = 5;
#[cfg(not(target_arch = "aarch64"))]
pub const THREAD_STATE_NONE: i32 = 13;

/// A kernel exception classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExceptionKind {
    BadAccess = 1,
    BadInstruction = 2,
    Arithmetic = 3,
    Emulation = 4,
    Software = 5,
    Breakpoint = 6,
    Syscall = 7,
    MachSyscall = 8,
    RpcAlert = 9,
    Crash = 10,
    Resource = 11,
    Guard = 12,
    CorpseNotify = 13,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 13] = [
        ExceptionKind::BadAccess,
        ExceptionKind::BadInstruction,
        ExceptionKind::Arithmetic,
        ExceptionKind::Emulation,
        ExceptionKind::Software,
        ExceptionKind::Breakpoint,
        ExceptionKind::Syscall,
        ExceptionKind::MachSyscall,
        ExceptionKind::RpcAlert,
        ExceptionKind::Crash,
        ExceptionKind::Resource,
        ExceptionKind::Guard,
        ExceptionKind::CorpseNotify,
    ];

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| *k as i32 == raw)
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Config-file name of this classification.
    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::BadAccess => "bad_access",
            ExceptionKind::BadInstruction => "bad_instruction",
            ExceptionKind::Arithmetic => "arithmetic",
            ExceptionKind::Emulation => "emulation",
            ExceptionKind::Software => "software",
            ExceptionKind::Breakpoint => "breakpoint",
            ExceptionKind::Syscall => "syscall",
            ExceptionKind::MachSyscall => "mach_syscall",
            ExceptionKind::RpcAlert => "rpc_alert",
            ExceptionKind::Crash => "crash",
            ExceptionKind::Resource => "resource",
            ExceptionKind::Guard => "guard",
            ExceptionKind::CorpseNotify => "corpse_notify",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionKind::BadAccess => "EXC_BAD_ACCESS",
            ExceptionKind::BadInstruction => "EXC_BAD_INSTRUCTION",
            ExceptionKind::Arithmetic => "EXC_ARITHMETIC",
            ExceptionKind::Emulation => "EXC_EMULATION",
            ExceptionKind::Software => "EXC_SOFTWARE",
            ExceptionKind::Breakpoint => "EXC_BREAKPOINT",
            ExceptionKind::Syscall => "EXC_SYSCALL",
            ExceptionKind::MachSyscall => "EXC_MACH_SYSCALL",
            ExceptionKind::RpcAlert => "EXC_RPC_ALERT",
            ExceptionKind::Crash => "EXC_CRASH",
            ExceptionKind::Resource => "EXC_RESOURCE",
            ExceptionKind::Guard => "EXC_GUARD",
            ExceptionKind::CorpseNotify => "EXC_CORPSE_NOTIFY",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Set of exception classifications, as used by the `*_exception_ports` calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExceptionMask: u32 {
        const BAD_ACCESS = 1 << 1;
        const BAD_INSTRUCTION = 1 << 2;
        const ARITHMETIC = 1 << 3;
        const EMULATION = 1 << 4;
        const SOFTWARE = 1 << 5;
        const BREAKPOINT = 1 << 6;
        const SYSCALL = 1 << 7;
        const MACH_SYSCALL = 1 << 8;
        const RPC_ALERT = 1 << 9;
        const CRASH = 1 << 10;
        const RESOURCE = 1 << 11;
        const GUARD = 1 << 12;
        const CORPSE_NOTIFY = 1 << 13;
    }
}

impl ExceptionMask {
    /// Hardware and software faults that end the process by default.
    pub const FATAL: ExceptionMask = ExceptionMask::BAD_ACCESS
        .union(ExceptionMask::BAD_INSTRUCTION)
        .union(ExceptionMask::ARITHMETIC)
        .union(ExceptionMask::BREAKPOINT);

    /// Kinds [`mask_for_exception`] maps, and so the only ones an intercepted
    /// exception can be forwarded for.
    pub const FORWARDABLE: ExceptionMask = ExceptionMask::FATAL
        .union(ExceptionMask::EMULATION)
        .union(ExceptionMask::SOFTWARE)
        .union(ExceptionMask::SYSCALL)
        .union(ExceptionMask::MACH_SYSCALL)
        .union(ExceptionMask::RPC_ALERT)
        .union(ExceptionMask::CRASH);

    /// Parse config-file names (`bad_access`, `breakpoint`, ...) into a mask.
    ///
    /// Names outside [`Self::FORWARDABLE`] (`resource`, `guard`,
    /// `corpse_notify`) are rejected: intercepting them would cut the previous
    /// handler of that kind out of the chain.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        names.iter().try_fold(ExceptionMask::empty(), |mask, name| {
            let name = name.as_ref().trim();
            ExceptionKind::ALL
                .iter()
                .find(|k| k.name().eq_ignore_ascii_case(name))
                .map(|k| ExceptionMask::from_bits_retain(1 << k.as_raw()))
                .filter(|bit| Self::FORWARDABLE.contains(*bit))
                .map(|bit| mask | bit)
                .ok_or_else(|| ConfigError::UnknownException(name.to_string()))
        })
    }

    /// Exception kinds contained in this mask, in ascending order.
    pub fn kinds(self) -> impl Iterator<Item = ExceptionKind> {
        ExceptionKind::ALL
            .into_iter()
            .filter(move |k| self.bits() & (1 << k.as_raw()) != 0)
    }
}

/// Map one raw exception classification to its registration mask bit.
///
/// Only the classifications that can describe a fatal fault are mapped. Anything
/// else yields the empty mask so that forwarding finds no match instead of failing.
pub fn mask_for_exception(exception: i32) -> ExceptionMask {
    match ExceptionKind::from_raw(exception) {
        Some(ExceptionKind::BadAccess) => ExceptionMask::BAD_ACCESS,
        Some(ExceptionKind::BadInstruction) => ExceptionMask::BAD_INSTRUCTION,
        Some(ExceptionKind::Arithmetic) => ExceptionMask::ARITHMETIC,
        Some(ExceptionKind::Emulation) => ExceptionMask::EMULATION,
        Some(ExceptionKind::Software) => ExceptionMask::SOFTWARE,
        Some(ExceptionKind::Breakpoint) => ExceptionMask::BREAKPOINT,
        Some(ExceptionKind::Syscall) => ExceptionMask::SYSCALL,
        Some(ExceptionKind::MachSyscall) => ExceptionMask::MACH_SYSCALL,
        Some(ExceptionKind::RpcAlert) => ExceptionMask::RPC_ALERT,
        Some(ExceptionKind::Crash) => ExceptionMask::CRASH,
        _ => {
            log_forward_warn!("No mask mapping for exception type", exception = exception);
            ExceptionMask::empty()
        }
    }
}

/// Calling convention the kernel uses to notify a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExceptionBehavior(pub i32);

impl ExceptionBehavior {
    pub const DEFAULT: ExceptionBehavior = ExceptionBehavior(1);
    pub const STATE: ExceptionBehavior = ExceptionBehavior(2);
    pub const STATE_IDENTITY: ExceptionBehavior = ExceptionBehavior(3);
    /// Flag requesting 64-bit codes (`MACH_EXCEPTION_CODES`).
    pub const MACH_EXCEPTION_CODES: i32 = 0x8000_0000_u32 as i32;

    /// Plain notification with 32-bit codes and no thread state.
    pub fn is_plain(self) -> bool {
        self == Self::DEFAULT
    }

    pub fn uses_mach_codes(self) -> bool {
        self.0 & Self::MACH_EXCEPTION_CODES != 0
    }
}

impl fmt::Display for ExceptionBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.0 & !Self::MACH_EXCEPTION_CODES {
            0 => "NONE",
            1 => "EXCEPTION_DEFAULT",
            2 => "EXCEPTION_STATE",
            3 => "EXCEPTION_STATE_IDENTITY",
            other => return write!(f, "behavior({:#x})", other),
        };
        if self.uses_mach_codes() {
            write!(f, "{}|MACH_EXCEPTION_CODES", base)
        } else {
            f.write_str(base)
        }
    }
}
