// Shared test harness: a scripted backend standing in for real device and
// filter implementations.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mediaflow::graph::backend::{
    seq_async, BackendCallbacks, BackendCommand, BackendEvent, BackendEventSender,
    BackendPortInfo, BufferPool, Completion, IoKind, NodeBackend, ProcessStatus,
};
use mediaflow::graph::error::Result;
use mediaflow::graph::memblock::Activation;
use mediaflow::graph::params::{BufferRequirements, MediaFormat, ParamId, ParamValue};
use mediaflow::graph::types::{Direction, PortId, Properties};

/// A fully scripted backend. All knobs are interior so tests can keep a
/// clone of the `Arc` after handing it to the core.
pub struct TestBackend {
    pub name: String,
    is_driver: bool,
    sender: Mutex<Option<BackendEventSender>>,
    callbacks: Mutex<Option<BackendCallbacks>>,
    position_io: Mutex<Option<Activation>>,
    ports: Mutex<Vec<(Direction, PortId, Vec<MediaFormat>)>>,
    commands: Mutex<Vec<BackendCommand>>,
    set_formats: Mutex<Vec<(Direction, PortId, Option<MediaFormat>)>>,
    buffer_reqs: Mutex<HashMap<(Direction, PortId), BufferRequirements>>,
    async_format_seq: Mutex<Option<u32>>,
    async_start_seq: Mutex<Option<u32>>,
    process_status: Mutex<ProcessStatus>,
    process_count: AtomicU64,
}

impl TestBackend {
    pub fn new(name: &str) -> Arc<TestBackend> {
        Arc::new(TestBackend {
            name: name.to_string(),
            is_driver: false,
            sender: Mutex::new(None),
            callbacks: Mutex::new(None),
            position_io: Mutex::new(None),
            ports: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            set_formats: Mutex::new(Vec::new()),
            buffer_reqs: Mutex::new(HashMap::new()),
            async_format_seq: Mutex::new(None),
            async_start_seq: Mutex::new(None),
            process_status: Mutex::new(ProcessStatus::HaveBuffer),
            process_count: AtomicU64::new(0),
        })
    }

    /// A driver backend: `process()` advances the clock in its position io.
    pub fn new_driver(name: &str) -> Arc<TestBackend> {
        let mut backend = TestBackend::new(name);
        Arc::get_mut(&mut backend).unwrap().is_driver = true;
        backend
    }

    pub fn add_output_port(self: &Arc<Self>, port_id: PortId, formats: Vec<MediaFormat>) {
        self.ports
            .lock()
            .unwrap()
            .push((Direction::Output, port_id, formats));
    }

    pub fn add_input_port(self: &Arc<Self>, port_id: PortId, formats: Vec<MediaFormat>) {
        self.ports
            .lock()
            .unwrap()
            .push((Direction::Input, port_id, formats));
    }

    /// Make the next Format set on a port answer asynchronously with `seq`.
    pub fn set_async_format(self: &Arc<Self>, seq: u32) {
        *self.async_format_seq.lock().unwrap() = Some(seq);
    }

    /// Make the next Start command answer asynchronously with `seq`.
    pub fn set_async_start(self: &Arc<Self>, seq: u32) {
        *self.async_start_seq.lock().unwrap() = Some(seq);
    }

    pub fn set_process_status(self: &Arc<Self>, status: ProcessStatus) {
        *self.process_status.lock().unwrap() = status;
    }

    pub fn process_count(&self) -> u64 {
        self.process_count.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<BackendCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn set_formats(&self) -> Vec<(Direction, PortId, Option<MediaFormat>)> {
        self.set_formats.lock().unwrap().clone()
    }

    /// Simulate the backend's clock source firing (driver) or an exported
    /// completion report.
    pub fn tick(&self, status: ProcessStatus) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        callbacks
            .expect("backend has no callbacks installed")
            .ready(status);
    }

    /// Deliver an asynchronous completion for a previously returned seq.
    pub fn complete(&self, seq: u32, res: i32) {
        let sender = self.sender.lock().unwrap().clone();
        sender
            .expect("backend has no event sender")
            .send(BackendEvent::Result {
                seq: seq_async(seq),
                res,
                param: None,
            });
    }

    /// Raise an unrecoverable backend error.
    pub fn emit_error(&self, message: &str) {
        let sender = self.sender.lock().unwrap().clone();
        sender
            .expect("backend has no event sender")
            .send(BackendEvent::Event(
                mediaflow::graph::backend::BackendNotify::Error {
                    message: message.to_string(),
                },
            ));
    }
}

impl NodeBackend for TestBackend {
    fn set_io(&self, kind: IoKind, activation: Option<Activation>) -> Result<()> {
        if kind == IoKind::Position {
            *self.position_io.lock().unwrap() = activation;
        }
        Ok(())
    }

    fn send_command(&self, cmd: BackendCommand) -> Result<Completion> {
        self.commands.lock().unwrap().push(cmd);
        if cmd == BackendCommand::Start {
            if let Some(seq) = self.async_start_seq.lock().unwrap().take() {
                return Ok(Completion::Async(seq));
            }
        }
        Ok(Completion::Done)
    }

    fn set_callbacks(&self, callbacks: Option<BackendCallbacks>) {
        *self.callbacks.lock().unwrap() = callbacks;
    }

    fn set_event_sender(&self, sender: BackendEventSender) {
        // Announce ports on attach, like a real implementation would.
        let ports = self.ports.lock().unwrap().clone();
        let (n_in, n_out) = ports.iter().fold((0, 0), |(i, o), (d, _, _)| match d {
            Direction::Input => (i + 1, o),
            Direction::Output => (i, o + 1),
        });
        sender.send(BackendEvent::Info(mediaflow::graph::backend::BackendInfo {
            max_input_ports: n_in.max(16),
            max_output_ports: n_out.max(16),
            properties: None,
            changed_params: Vec::new(),
        }));
        for (direction, port_id, _) in &ports {
            sender.send(BackendEvent::PortInfo {
                direction: *direction,
                port_id: *port_id,
                info: Some(BackendPortInfo {
                    flags: 0,
                    properties: Properties::new(),
                }),
            });
        }
        *self.sender.lock().unwrap() = Some(sender);
    }

    fn enum_params(
        &self,
        _seq: u32,
        _id: ParamId,
        _start: u32,
        _num: u32,
        _filter: Option<&ParamValue>,
    ) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn set_param(
        &self,
        _id: ParamId,
        _flags: u32,
        _param: Option<&ParamValue>,
    ) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn port_enum_params(
        &self,
        seq: u32,
        direction: Direction,
        port_id: PortId,
        id: ParamId,
        _start: u32,
        _num: u32,
        _filter: Option<&ParamValue>,
    ) -> Result<Completion> {
        let sender = self.sender.lock().unwrap().clone();
        let sender = match sender {
            Some(sender) => sender,
            None => return Ok(Completion::Done),
        };
        match id {
            ParamId::EnumFormat => {
                let ports = self.ports.lock().unwrap();
                if let Some((_, _, formats)) = ports
                    .iter()
                    .find(|(d, p, _)| *d == direction && *p == port_id)
                {
                    for (index, format) in formats.iter().enumerate() {
                        sender.send(BackendEvent::Result {
                            seq,
                            res: 0,
                            param: Some((
                                ParamId::EnumFormat,
                                index as u32,
                                index as u32 + 1,
                                ParamValue::Format(*format),
                            )),
                        });
                    }
                }
            }
            ParamId::Buffers => {
                if let Some(reqs) = self
                    .buffer_reqs
                    .lock()
                    .unwrap()
                    .get(&(direction, port_id))
                {
                    sender.send(BackendEvent::Result {
                        seq,
                        res: 0,
                        param: Some((ParamId::Buffers, 0, 1, ParamValue::Buffers(*reqs))),
                    });
                }
            }
            _ => {}
        }
        Ok(Completion::Done)
    }

    fn port_set_param(
        &self,
        direction: Direction,
        port_id: PortId,
        id: ParamId,
        _flags: u32,
        param: Option<&ParamValue>,
    ) -> Result<Completion> {
        if id == ParamId::Format {
            let format = param.and_then(|p| p.as_format().copied());
            self.set_formats
                .lock()
                .unwrap()
                .push((direction, port_id, format));
            if param.is_some() {
                if let Some(seq) = self.async_format_seq.lock().unwrap().take() {
                    return Ok(Completion::Async(seq));
                }
            }
        }
        Ok(Completion::Done)
    }

    fn port_use_buffers(
        &self,
        _direction: Direction,
        _port_id: PortId,
        _pool: Option<Arc<BufferPool>>,
    ) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn port_set_io(
        &self,
        _direction: Direction,
        _port_id: PortId,
        _io: Option<Arc<mediaflow::graph::backend::IoBuffers>>,
    ) -> Result<()> {
        Ok(())
    }

    fn process(&self) -> ProcessStatus {
        self.process_count.fetch_add(1, Ordering::SeqCst);
        if self.is_driver {
            if let Some(activation) = self.position_io.lock().unwrap().as_ref() {
                let record = activation.record();
                record
                    .position
                    .clock
                    .advance(record.position.size() as u64);
            }
        }
        *self.process_status.lock().unwrap()
    }
}

/// Poll until `cond` holds or panic after five seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timeout waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
