//! In-process model of the kernel pieces the interception core touches.
//!
//! `SimulatedKernel` keeps a per-task exception-port table, per-port message
//! queues, and records of replies and forwarded exceptions. Failures and
//! blocking can be injected at every kernel call so registration and the
//! receiver state machine can be exercised on any host.
//!
//! # Usage
//!
//! ```ignore
//! use faultline_mach::testing::SimulatedKernel;
//!
//! let sim = Arc::new(SimulatedKernel::new());
//! let task = sim.new_task();
//! let registration = ExceptionServer::new(Arc::clone(&sim), task).register(NoopHandler)?;
//! sim.raise(task, 0x303, ExceptionKind::BadAccess, &[1, 0])?;
//! let reply = sim.wait_for_reply(Duration::from_secs(5));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::exception::{ExceptionBehavior, ExceptionKind, ExceptionMask, MAX_EXCEPTION_TYPES};
use crate::kernel::{ExceptionKernel, KernReturn, Port, ReceiverBody, Received, PORT_NULL};
use crate::message::{ExceptionReply, ExceptionRequest, MAX_TRAILER_SIZE, REQUEST_RECEIVE_SIZE};
use crate::snapshot::{HandlerEntry, HandlerSnapshot};

/// One exception slot of a task: where that exception type is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub port: Port,
    pub behavior: ExceptionBehavior,
    pub flavor: i32,
}

impl Slot {
    const EMPTY: Slot = Slot {
        port: PORT_NULL,
        behavior: ExceptionBehavior(0),
        flavor: 0,
    };
}

/// Exception-port table of one task, indexed by exception type.
pub type PortTable = [Slot; MAX_EXCEPTION_TYPES];

/// An exception re-raised through [`ExceptionKernel::forward_exception`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRecord {
    pub port: Port,
    pub thread: Port,
    pub task: Port,
    pub exception: i32,
    pub codes: Vec<i32>,
}

/// Where [`SimulatedKernel::raise`] sent an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on a port somebody may be receiving on.
    Queued { port: Port },
    /// The slot is empty; the process would take the default action.
    Unhandled,
}

#[derive(Debug, Default)]
struct Injected {
    allocate: Option<KernReturn>,
    insert_right: Option<KernReturn>,
    swap: Option<KernReturn>,
    set_by_port: HashMap<Port, KernReturn>,
    receive: Option<KernReturn>,
    reply: Option<KernReturn>,
    spawn: bool,
    hold_swaps: bool,
    panic_in_swap: bool,
    receive_size: Option<usize>,
}

#[derive(Debug, Default)]
struct SimState {
    next_name: Port,
    receive_rights: HashSet<Port>,
    send_rights: HashSet<Port>,
    released: Vec<Port>,
    tasks: HashMap<Port, PortTable>,
    queues: HashMap<Port, VecDeque<Vec<u8>>>,
    receive_buffer_sizes: Vec<usize>,
    replies: Vec<ExceptionReply>,
    forwards: Vec<ForwardRecord>,
    forward_status: HashMap<Port, KernReturn>,
    set_calls: usize,
    swaps_started: usize,
    receivers_exited: usize,
    injected: Injected,
}

impl SimState {
    fn name(&mut self) -> Port {
        self.next_name += 0x100;
        self.next_name | 0x03
    }

    fn table(&mut self, task: Port) -> Result<&mut PortTable, KernReturn> {
        self.tasks.get_mut(&task).ok_or(KernReturn::INVALID_ARGUMENT)
    }

    fn collect(&self, task: Port, mask: ExceptionMask) -> Result<HandlerSnapshot, KernReturn> {
        let table = self.tasks.get(&task).ok_or(KernReturn::INVALID_ARGUMENT)?;
        let mut snapshot = HandlerSnapshot::new();
        let mut found: heapless::Vec<HandlerEntry, MAX_EXCEPTION_TYPES> = heapless::Vec::new();
        for kind in mask.kinds() {
            let slot = table[kind.as_raw() as usize];
            let bit = ExceptionMask::from_bits_retain(1 << kind.as_raw());
            // Identical handlers are reported once with a combined mask.
            match found.iter_mut().find(|e| {
                e.port == slot.port && e.behavior == slot.behavior && e.flavor == slot.flavor
            }) {
                Some(entry) => entry.mask |= bit,
                None => {
                    let _ = found.push(HandlerEntry {
                        mask: bit,
                        port: slot.port,
                        behavior: slot.behavior,
                        flavor: slot.flavor,
                    });
                }
            }
        }
        for entry in found {
            let _ = snapshot.push(entry);
        }
        Ok(snapshot)
    }

    fn assign(
        &mut self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> Result<(), KernReturn> {
        if mask.bits() & !ExceptionMask::all().bits() != 0 {
            return Err(KernReturn::INVALID_ARGUMENT);
        }
        if port != PORT_NULL
            && !(1..=3).contains(&(behavior.0 & !ExceptionBehavior::MACH_EXCEPTION_CODES))
        {
            return Err(KernReturn::INVALID_ARGUMENT);
        }
        let table = self.table(task)?;
        for kind in mask.kinds() {
            table[kind.as_raw() as usize] = Slot {
                port,
                behavior,
                flavor,
            };
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SimState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// See the module documentation.
#[derive(Debug, Default)]
pub struct SimulatedKernel {
    shared: Arc<Shared>,
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared.lock()
    }

    /// Wait until `pred` holds or `timeout` passes. Returns the last result of `pred`.
    fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut(&SimState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if pred(&state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    // === Setup ===

    /// Create a task with an empty exception-port table.
    pub fn new_task(&self) -> Port {
        let mut state = self.lock();
        let task = state.name();
        state.tasks.insert(task, [Slot::EMPTY; MAX_EXCEPTION_TYPES]);
        task
    }

    /// Create a port standing in for some other handler.
    pub fn new_port(&self) -> Port {
        let mut state = self.lock();
        let port = state.name();
        state.receive_rights.insert(port);
        state.send_rights.insert(port);
        port
    }

    /// Set handlers directly, bypassing injected failures.
    pub fn install(
        &self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) {
        let mut state = self.lock();
        state
            .assign(task, mask, port, behavior, flavor)
            .unwrap_or_else(|kr| panic!("install failed: {}", kr));
    }

    /// Status a previously installed handler port answers forwarded exceptions with.
    pub fn set_forward_status(&self, port: Port, status: KernReturn) {
        self.lock().forward_status.insert(port, status);
    }

    // === Fault injection ===

    pub fn fail_port_allocation(&self, kr: KernReturn) {
        self.lock().injected.allocate = Some(kr);
    }

    pub fn fail_insert_right(&self, kr: KernReturn) {
        self.lock().injected.insert_right = Some(kr);
    }

    pub fn fail_swap(&self, kr: KernReturn) {
        self.lock().injected.swap = Some(kr);
    }

    /// Make `set_exception_ports` fail whenever it installs `port`.
    pub fn fail_set_for_port(&self, port: Port, kr: KernReturn) {
        self.lock().injected.set_by_port.insert(port, kr);
    }

    /// Make the next receive call fail.
    pub fn fail_next_receive(&self, kr: KernReturn) {
        let mut state = self.lock();
        state.injected.receive = Some(kr);
        drop(state);
        self.shared.changed.notify_all();
    }

    pub fn fail_reply(&self, kr: KernReturn) {
        self.lock().injected.reply = Some(kr);
    }

    pub fn fail_thread_spawn(&self) {
        self.lock().injected.spawn = true;
    }

    /// Make the receiver's swap call panic, so it exits without answering
    /// the handshake.
    pub fn panic_in_swap(&self) {
        self.lock().injected.panic_in_swap = true;
    }

    /// Size the receiver asks for its first receive buffer.
    pub fn set_initial_receive_size(&self, bytes: usize) {
        self.lock().injected.receive_size = Some(bytes);
    }

    /// Park swap calls until [`Self::release_swaps`].
    pub fn hold_swaps(&self) {
        self.lock().injected.hold_swaps = true;
    }

    pub fn release_swaps(&self) {
        self.lock().injected.hold_swaps = false;
        self.shared.changed.notify_all();
    }

    // === Exception delivery ===

    /// Deliver `kind` from `thread` of `task` the way the kernel would.
    pub fn raise(
        &self,
        task: Port,
        thread: Port,
        kind: ExceptionKind,
        codes: &[i32],
    ) -> Result<Delivery, KernReturn> {
        self.raise_padded(task, thread, kind, codes, 0)
    }

    /// Like [`Self::raise`], with `padding` extra bytes appended to the message.
    pub fn raise_padded(
        &self,
        task: Port,
        thread: Port,
        kind: ExceptionKind,
        codes: &[i32],
        padding: usize,
    ) -> Result<Delivery, KernReturn> {
        let mut state = self.lock();
        let slot = state.table(task)?[kind.as_raw() as usize];
        if slot.port == PORT_NULL {
            return Ok(Delivery::Unhandled);
        }
        let reply_port = state.name();
        let mut request =
            ExceptionRequest::new(slot.port, reply_port, thread, task, kind.as_raw(), codes);
        request.header.size += padding as u32;
        let mut bytes = request.as_bytes().to_vec();
        bytes.resize(bytes.len() + padding, 0);
        state.queues.entry(slot.port).or_default().push_back(bytes);
        drop(state);
        self.shared.changed.notify_all();
        Ok(Delivery::Queued { port: slot.port })
    }

    /// Queue arbitrary bytes on `port`.
    pub fn send_raw(&self, port: Port, bytes: Vec<u8>) {
        self.lock().queues.entry(port).or_default().push_back(bytes);
        self.shared.changed.notify_all();
    }

    // === Observation ===

    pub fn exception_ports(&self, task: Port, mask: ExceptionMask) -> HandlerSnapshot {
        self.lock()
            .collect(task, mask)
            .unwrap_or_else(|kr| panic!("unknown task: {}", kr))
    }

    /// Copy of the full exception-port table of `task`.
    pub fn port_table(&self, task: Port) -> PortTable {
        self.lock().tasks[&task]
    }

    /// Port `kind` is currently routed to on `task`.
    pub fn route(&self, task: Port, kind: ExceptionKind) -> Port {
        self.lock().tasks[&task][kind.as_raw() as usize].port
    }

    /// Ports holding a receive right.
    pub fn is_live(&self, port: Port) -> bool {
        self.lock().receive_rights.contains(&port)
    }

    pub fn released_ports(&self) -> Vec<Port> {
        self.lock().released.clone()
    }

    pub fn replies(&self) -> Vec<ExceptionReply> {
        self.lock().replies.clone()
    }

    pub fn forwards(&self) -> Vec<ForwardRecord> {
        self.lock().forwards.clone()
    }

    /// Buffer sizes passed to each receive call, in order.
    pub fn receive_buffer_sizes(&self) -> Vec<usize> {
        self.lock().receive_buffer_sizes.clone()
    }

    pub fn set_call_count(&self) -> usize {
        self.lock().set_calls
    }

    pub fn pending_messages(&self, port: Port) -> usize {
        self.lock().queues.get(&port).map_or(0, VecDeque::len)
    }

    pub fn wait_for_reply(&self, timeout: Duration) -> Option<ExceptionReply> {
        let mut reply = None;
        self.wait_until(timeout, |s| {
            reply = s.replies.first().copied();
            reply.is_some()
        });
        reply
    }

    pub fn wait_for_swap_started(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.swaps_started > 0)
    }

    pub fn wait_for_receiver_exit(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.receivers_exited > 0)
    }

    /// Wait until a receiver is blocked on `port` with an empty queue.
    pub fn wait_for_receiver_blocked(&self, port: Port, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| {
            !s.receive_buffer_sizes.is_empty() && s.queues.get(&port).map_or(true, VecDeque::is_empty)
        })
    }
}

impl ExceptionKernel for SimulatedKernel {
    fn allocate_receive_port(&self) -> Result<Port, KernReturn> {
        let mut state = self.lock();
        if let Some(kr) = state.injected.allocate {
            return Err(kr);
        }
        let port = state.name();
        state.receive_rights.insert(port);
        Ok(port)
    }

    fn insert_send_right(&self, port: Port) -> Result<(), KernReturn> {
        let mut state = self.lock();
        if let Some(kr) = state.injected.insert_right {
            return Err(kr);
        }
        if !state.receive_rights.contains(&port) {
            return Err(KernReturn::INVALID_NAME);
        }
        state.send_rights.insert(port);
        Ok(())
    }

    fn release_port(&self, port: Port, has_send_right: bool) {
        let mut state = self.lock();
        if has_send_right {
            state.send_rights.remove(&port);
        }
        state.receive_rights.remove(&port);
        state.queues.remove(&port);
        state.released.push(port);
    }

    fn swap_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> Result<HandlerSnapshot, KernReturn> {
        if self.lock().injected.panic_in_swap {
            panic!("injected swap panic");
        }
        let mut state = self.lock();
        state.swaps_started += 1;
        self.shared.changed.notify_all();
        while state.injected.hold_swaps {
            state = self.shared.changed.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if let Some(kr) = state.injected.swap {
            return Err(kr);
        }
        let previous = state.collect(task, mask)?;
        state.assign(task, mask, port, behavior, flavor)?;
        Ok(previous)
    }

    fn set_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
        port: Port,
        behavior: ExceptionBehavior,
        flavor: i32,
    ) -> Result<(), KernReturn> {
        let mut state = self.lock();
        state.set_calls += 1;
        if let Some(kr) = state.injected.set_by_port.get(&port) {
            return Err(*kr);
        }
        state.assign(task, mask, port, behavior, flavor)
    }

    fn get_exception_ports(
        &self,
        task: Port,
        mask: ExceptionMask,
    ) -> Result<HandlerSnapshot, KernReturn> {
        self.lock().collect(task, mask)
    }

    fn initial_receive_size(&self) -> usize {
        self.lock()
            .injected
            .receive_size
            .unwrap_or(REQUEST_RECEIVE_SIZE)
    }

    fn receive(&self, port: Port, buffer: &mut [u8]) -> Result<Received, KernReturn> {
        let mut state = self.lock();
        state.receive_buffer_sizes.push(buffer.len());
        self.shared.changed.notify_all();
        loop {
            if let Some(kr) = state.injected.receive.take() {
                return Err(kr);
            }
            if !state.receive_rights.contains(&port) {
                return Err(KernReturn::RCV_INVALID_NAME);
            }
            let front = state.queues.get(&port).and_then(|q| q.front()).map(Vec::len);
            if let Some(len) = front {
                let required = len + MAX_TRAILER_SIZE;
                if buffer.len() < required {
                    return Ok(Received::TooLarge { required });
                }
                if let Some(message) = state.queues.get_mut(&port).and_then(VecDeque::pop_front) {
                    buffer[..len].copy_from_slice(&message);
                    buffer[len..required].fill(0);
                }
                self.shared.changed.notify_all();
                return Ok(Received::Message { len });
            }
            state = self.shared.changed.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn send_reply(&self, reply: &ExceptionReply) -> Result<(), KernReturn> {
        let mut state = self.lock();
        if let Some(kr) = state.injected.reply {
            return Err(kr);
        }
        state.replies.push(*reply);
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn forward_exception(
        &self,
        port: Port,
        thread: Port,
        task: Port,
        exception: i32,
        codes: &[i32],
    ) -> KernReturn {
        let mut state = self.lock();
        state.forwards.push(ForwardRecord {
            port,
            thread,
            task,
            exception,
            codes: codes.to_vec(),
        });
        let status = state
            .forward_status
            .get(&port)
            .copied()
            .unwrap_or(KernReturn::SUCCESS);
        drop(state);
        self.shared.changed.notify_all();
        status
    }

    fn spawn_receiver(
        &self,
        name: String,
        stack_size: Option<usize>,
        body: ReceiverBody,
    ) -> io::Result<()> {
        if self.lock().injected.spawn {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        let shared = Arc::clone(&self.shared);
        let mut builder = std::thread::Builder::new().name(name);
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        builder
            .spawn(move || {
                body();
                shared.lock().receivers_exited += 1;
                shared.changed.notify_all();
            })
            .map(drop)
    }
}
