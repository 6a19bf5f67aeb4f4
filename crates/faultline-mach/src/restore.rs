//! Reinstalling a captured handler snapshot.

use faultline_config::{log_restore_debug, log_restore_warn};

use crate::exception::MAX_EXCEPTION_TYPES;
use crate::kernel::{ExceptionKernel, KernReturn, Port};
use crate::snapshot::{HandlerEntry, HandlerSnapshot};

/// Result of restoring a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub entry: HandlerEntry,
    pub result: Result<(), KernReturn>,
}

/// Per-entry outcomes of [`restore_handlers`], in snapshot order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    outcomes: heapless::Vec<RestoreOutcome, MAX_EXCEPTION_TYPES>,
}

impl RestoreReport {
    pub fn outcomes(&self) -> &[RestoreOutcome] {
        &self.outcomes
    }

    pub fn failures(&self) -> impl Iterator<Item = &RestoreOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Put every entry of `snapshot` back on `task`.
///
/// A failed entry does not stop the remaining ones from being attempted.
/// The snapshot and the report share capacity, so no outcome is dropped.
pub fn restore_handlers<K: ExceptionKernel + ?Sized>(
    kernel: &K,
    task: Port,
    snapshot: &HandlerSnapshot,
) -> RestoreReport {
    let mut report = RestoreReport::default();

    for entry in snapshot {
        let result =
            kernel.set_exception_ports(task, entry.mask, entry.port, entry.behavior, entry.flavor);
        match result {
            Ok(()) => log_restore_debug!(
                "Restored exception handler",
                task = task,
                mask = entry.mask.bits(),
                port = entry.port
            ),
            Err(kr) => log_restore_warn!(
                "Failed to restore exception handler",
                task = task,
                mask = entry.mask.bits(),
                port = entry.port,
                behavior = display(entry.behavior),
                error = display(kr)
            ),
        }
        let _ = report.outcomes.push(RestoreOutcome {
            entry: *entry,
            result,
        });
    }

    report
}
