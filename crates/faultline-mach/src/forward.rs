//! Choosing which previously installed handler receives a forwarded exception.

use faultline_config::{log_forward_debug, log_forward_warn};

use crate::exception::mask_for_exception;
use crate::kernel::PORT_NULL;
use crate::snapshot::{HandlerEntry, HandlerSnapshot};

/// First entry, in stored order, that covers `exception` with the plain
/// notification behavior.
///
/// Entries asking for thread state or 64-bit codes cannot be served from an
/// `exception_raise` request and are skipped. Entries with a null port have
/// nobody to notify and are skipped too.
pub fn select_forward_target(snapshot: &HandlerSnapshot, exception: i32) -> Option<HandlerEntry> {
    let mask = mask_for_exception(exception);
    if mask.is_empty() {
        return None;
    }

    for entry in snapshot {
        if !entry.mask.intersects(mask) {
            continue;
        }
        if entry.port == PORT_NULL {
            log_forward_debug!(
                "Skipping previous handler with null port",
                exception = exception
            );
            continue;
        }
        if !entry.behavior.is_plain() {
            log_forward_warn!(
                "Previous handler uses an unsupported behavior, not forwarding to it",
                exception = exception,
                port = entry.port,
                behavior = display(entry.behavior)
            );
            continue;
        }
        return Some(*entry);
    }

    None
}
