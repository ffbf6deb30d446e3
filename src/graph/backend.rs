//! The backend interface consumed by nodes.
//!
//! A backend is the processing implementation behind a node. All control
//! methods are called on the main thread; only [`NodeBackend::process`] and
//! the `reuse_buffer` callback run in the realtime context. Backends report
//! back through a per-core event channel (the `add_listener` of the wire
//! protocol, reduced to a sum type) and wake the scheduler through
//! [`BackendCallbacks::ready`].

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::graph::error::Result;
use crate::graph::memblock::{Activation, MemBlock};
use crate::graph::params::{ParamId, ParamValue};
use crate::graph::types::{Direction, NodeId, PortId, Properties};

/// Commands the core sends to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCommand {
    Pause,
    Start,
    Suspend,
    Flush,
}

/// Result of one `process()` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Nothing further this cycle; for exported nodes the cycle continues
    /// asynchronously until their wake arrives.
    Ok,
    /// Produced a buffer downstream peers can consume.
    HaveBuffer,
    /// Needs more input before it can produce.
    NeedBuffer,
    /// The backend completes the cycle on its own later.
    Async,
    /// Processing failed with a backend error code.
    Error(i32),
}

impl ProcessStatus {
    /// Encoding stored into the activation status slot.
    pub fn as_i32(self) -> i32 {
        match self {
            ProcessStatus::Ok => 0,
            ProcessStatus::NeedBuffer => 1,
            ProcessStatus::HaveBuffer => 2,
            ProcessStatus::Async => 3,
            ProcessStatus::Error(code) => {
                if code < 0 {
                    code
                } else {
                    -code
                }
            }
        }
    }
}

/// High bit marking a sequence number as an asynchronous completion token.
pub const SEQ_ASYNC_BIT: u32 = 1 << 31;

pub fn seq_is_async(seq: u32) -> bool {
    seq & SEQ_ASYNC_BIT != 0
}

pub fn seq_async(seq: u32) -> u32 {
    seq | SEQ_ASYNC_BIT
}

pub fn seq_number(seq: u32) -> u32 {
    seq & !SEQ_ASYNC_BIT
}

/// Return value of control operations that may complete asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The operation finished synchronously.
    Done,
    /// The backend will deliver a `Result` event carrying this sequence.
    Async(u32),
}

impl Completion {
    pub fn async_seq(self) -> Option<u32> {
        match self {
            Completion::Async(seq) => Some(seq),
            Completion::Done => None,
        }
    }
}

/// Io channels the core can direct at a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// The driver position block inside the activation record.
    Position,
    /// The clock inside the activation record.
    Clock,
}

/// Per-port buffer io area shared with the realtime mix/tee processors.
#[derive(Debug)]
pub struct IoBuffers {
    status: AtomicI32,
    buffer_id: AtomicU32,
}

impl IoBuffers {
    pub const STATUS_NEED_BUFFER: i32 = 0;
    pub const STATUS_HAVE_BUFFER: i32 = 1;

    pub fn new() -> Self {
        Self {
            status: AtomicI32::new(Self::STATUS_NEED_BUFFER),
            buffer_id: AtomicU32::new(crate::graph::types::ID_INVALID),
        }
    }

    pub fn set(&self, status: i32, buffer_id: u32) {
        self.buffer_id.store(buffer_id, Ordering::Relaxed);
        self.status.store(status, Ordering::Release);
    }

    pub fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id.load(Ordering::Relaxed)
    }

    /// Copy another area into this one (tee/mix forwarding).
    pub fn copy_from(&self, other: &IoBuffers) {
        let status = other.status();
        self.set(status, other.buffer_id());
    }
}

impl Default for IoBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool of equally sized buffers living in one shared memory block,
/// negotiated per link and handed to both endpoint ports.
#[derive(Debug, Clone)]
pub struct BufferPool {
    mem: Arc<MemBlock>,
    n_buffers: u32,
    buffer_size: u32,
    stride: u32,
}

impl BufferPool {
    pub fn alloc(n_buffers: u32, buffer_size: u32, stride: u32, align: u32) -> Result<BufferPool> {
        let align = (align.max(8) as usize).next_power_of_two();
        let aligned = (buffer_size as usize + align - 1) & !(align - 1);
        let mem = MemBlock::alloc((aligned * n_buffers as usize).max(1))?;
        Ok(BufferPool {
            mem: Arc::new(mem),
            n_buffers,
            buffer_size: aligned as u32,
            stride,
        })
    }

    pub fn n_buffers(&self) -> u32 {
        self.n_buffers
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.mem.fd()
    }
}

/// Port description reported by a backend through `port_info` events.
#[derive(Debug, Clone)]
pub struct BackendPortInfo {
    pub flags: u32,
    pub properties: Properties,
}

/// Node-level description reported by a backend through `info` events.
#[derive(Debug, Clone, Default)]
pub struct BackendInfo {
    pub max_input_ports: u32,
    pub max_output_ports: u32,
    pub properties: Option<Properties>,
    pub changed_params: Vec<ParamId>,
}

/// Out-of-band notifications a backend can raise.
#[derive(Debug, Clone)]
pub enum BackendNotify {
    /// The backend hit an unrecoverable error.
    Error { message: String },
    /// The backend asks for an extra graph cycle.
    RequestProcess,
}

/// The event sum type a backend delivers to its node.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Info(BackendInfo),
    PortInfo {
        direction: Direction,
        port_id: PortId,
        /// `None` reports port removal.
        info: Option<BackendPortInfo>,
    },
    Result {
        seq: u32,
        res: i32,
        /// Present for parameter enumeration results.
        param: Option<(ParamId, u32, u32, ParamValue)>,
    },
    Event(BackendNotify),
}

/// Handle a backend uses to deliver events to the owning node.
///
/// Delivery is decoupled through the core's event channel; the core drains
/// it on the main thread during dispatch.
#[derive(Debug, Clone)]
pub struct BackendEventSender {
    node: NodeId,
    tx: Sender<(NodeId, BackendEvent)>,
}

impl BackendEventSender {
    pub fn new(node: NodeId, tx: Sender<(NodeId, BackendEvent)>) -> Self {
        Self { node, tx }
    }

    pub fn send(&self, event: BackendEvent) {
        // A closed channel means the core is shutting down.
        let _ = self.tx.send((self.node, event));
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// Realtime callbacks installed into a backend when it is attached.
#[derive(Clone)]
pub struct BackendCallbacks {
    ready: Arc<dyn Fn(ProcessStatus) + Send + Sync>,
    reuse_buffer: Arc<dyn Fn(PortId, u32) + Send + Sync>,
}

impl BackendCallbacks {
    pub fn new(
        ready: impl Fn(ProcessStatus) + Send + Sync + 'static,
        reuse_buffer: impl Fn(PortId, u32) + Send + Sync + 'static,
    ) -> Self {
        Self {
            ready: Arc::new(ready),
            reuse_buffer: Arc::new(reuse_buffer),
        }
    }

    /// Wake the scheduler: a driver starts a cycle, an exported node
    /// completes one. Realtime safe.
    pub fn ready(&self, status: ProcessStatus) {
        (self.ready)(status);
    }

    /// Recycle a buffer on an input port. Realtime safe.
    pub fn reuse_buffer(&self, port_id: PortId, buffer_id: u32) {
        (self.reuse_buffer)(port_id, buffer_id);
    }
}

impl std::fmt::Debug for BackendCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCallbacks").finish_non_exhaustive()
    }
}

/// The processing implementation behind a node.
///
/// Everything except `process` is main-thread only. Implementations must not
/// block in `process`.
pub trait NodeBackend: Send + Sync {
    /// Direct an io channel at the given activation record, or detach it.
    fn set_io(&self, kind: IoKind, activation: Option<Activation>) -> Result<()>;

    /// Send a state command. May return `Completion::Async`.
    fn send_command(&self, cmd: BackendCommand) -> Result<Completion>;

    /// Install or clear the realtime callbacks.
    fn set_callbacks(&self, callbacks: Option<BackendCallbacks>);

    /// Install the event channel used for info/port_info/result/event.
    fn set_event_sender(&self, sender: BackendEventSender);

    /// Enumerate node parameters; results arrive as `Result` events tagged
    /// with `seq`.
    fn enum_params(
        &self,
        seq: u32,
        id: ParamId,
        start: u32,
        num: u32,
        filter: Option<&ParamValue>,
    ) -> Result<Completion>;

    /// Set a node parameter.
    fn set_param(&self, id: ParamId, flags: u32, param: Option<&ParamValue>) -> Result<Completion>;

    /// Enumerate parameters of one port.
    fn port_enum_params(
        &self,
        seq: u32,
        direction: Direction,
        port_id: PortId,
        id: ParamId,
        start: u32,
        num: u32,
        filter: Option<&ParamValue>,
    ) -> Result<Completion>;

    /// Set a parameter on one port. Setting `Format` to `None` unsets it.
    fn port_set_param(
        &self,
        direction: Direction,
        port_id: PortId,
        id: ParamId,
        flags: u32,
        param: Option<&ParamValue>,
    ) -> Result<Completion>;

    /// Bind or release the negotiated buffer pool of one port.
    fn port_use_buffers(
        &self,
        direction: Direction,
        port_id: PortId,
        pool: Option<Arc<BufferPool>>,
    ) -> Result<Completion>;

    /// Direct a port's buffer io area, or detach it.
    fn port_set_io(
        &self,
        direction: Direction,
        port_id: PortId,
        io: Option<Arc<IoBuffers>>,
    ) -> Result<()>;

    /// Run one processing quantum. Realtime context only.
    fn process(&self) -> ProcessStatus;
}
