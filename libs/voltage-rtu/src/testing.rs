//! Scripted serial link and direction pin
//!
//! [`MockBus`] stands in for one RS-485 port: it hands out [`MockLink`]s and
//! [`MockPin`]s through [`MockOpener`], records every line event with a
//! timestamp, and answers each written frame from a reply queue or a
//! responder function.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::codec::{self, FunctionCode, EXCEPTION_FLAG};
use crate::config::SerialConfig;
use crate::error::TransportError;
use crate::transport::{DirectionPin, PortOpener, SerialLink};

/// Something that happened on the mock line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ClearInput,
    /// UART RTS set to the given level
    Rts(bool),
    /// GPIO direction pin set to the given level
    Pin(bool),
    Write(Vec<u8>),
    Read(Vec<u8>),
}

/// How the mock slave answers one written frame
#[derive(Debug, Clone)]
pub enum Reply {
    /// Bytes are readable immediately
    Frame(Vec<u8>),
    /// Bytes become readable after the delay
    Delayed(Duration, Vec<u8>),
    /// Nothing ever arrives
    Silence,
    /// The link reports end of stream
    Closed,
}

type Responder = Arc<dyn Fn(&[u8]) -> Reply + Send + Sync>;

#[derive(Default)]
struct BusState {
    replies: VecDeque<Reply>,
    responder: Option<Responder>,
    events: Vec<(Instant, LinkEvent)>,
    open_error: Option<String>,
    opened_links: usize,
    opened_pins: Vec<u32>,
}

/// Shared handle to one simulated port
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: LinkEvent) {
        self.state().events.push((Instant::now(), event));
    }

    /// Queue a reply for the next written frame
    pub fn push_reply(&self, reply: Reply) {
        self.state().replies.push_back(reply);
    }

    /// Answer frames not covered by the queue with `responder`
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Reply + Send + Sync + 'static,
    {
        self.state().responder = Some(Arc::new(responder));
    }

    /// Answer like a well-behaved slave, see [`simulate_slave`]
    pub fn simulate_slave(&self) {
        self.respond_with(simulate_slave);
    }

    /// Make every subsequent open fail
    pub fn fail_open(&self, reason: &str) {
        self.state().open_error = Some(reason.to_string());
    }

    pub fn opener(&self) -> MockOpener {
        MockOpener { bus: self.clone() }
    }

    pub fn events(&self) -> Vec<LinkEvent> {
        self.state().events.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn timed_events(&self) -> Vec<(Instant, LinkEvent)> {
        self.state().events.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state()
            .events
            .iter()
            .filter_map(|(_, e)| match e {
                LinkEvent::Write(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn opened_links(&self) -> usize {
        self.state().opened_links
    }

    pub fn opened_pins(&self) -> Vec<u32> {
        self.state().opened_pins.clone()
    }

    fn next_reply(&self, frame: &[u8]) -> Reply {
        let mut state = self.state();
        state
            .events
            .push((Instant::now(), LinkEvent::Write(frame.to_vec())));
        if let Some(reply) = state.replies.pop_front() {
            return reply;
        }
        let responder = state.responder.clone();
        drop(state);
        match responder {
            Some(responder) => responder(frame),
            None => Reply::Silence,
        }
    }
}

/// [`PortOpener`] that hands out links bound to a [`MockBus`]
#[derive(Clone)]
pub struct MockOpener {
    bus: MockBus,
}

impl PortOpener for MockOpener {
    fn open_link(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut state = self.bus.state();
        if let Some(reason) = state.open_error.clone() {
            return Err(TransportError::Open {
                device: config.device.clone(),
                reason,
            });
        }
        state.opened_links += 1;
        Ok(Box::new(MockLink::new(self.bus.clone())))
    }

    fn open_direction_pin(&self, pin: u32) -> Result<Box<dyn DirectionPin>, TransportError> {
        self.bus.state().opened_pins.push(pin);
        Ok(Box::new(MockPin {
            bus: self.bus.clone(),
        }))
    }
}

/// In-memory serial link
pub struct MockLink {
    bus: MockBus,
    pending: VecDeque<u8>,
    delay: Option<Pin<Box<Sleep>>>,
    closed: bool,
}

impl MockLink {
    pub fn new(bus: MockBus) -> Self {
        Self {
            bus,
            pending: VecDeque::new(),
            delay: None,
            closed: false,
        }
    }
}

impl SerialLink for MockLink {
    fn set_rts(&mut self, level: bool) -> Result<(), TransportError> {
        self.bus.record(LinkEvent::Rts(level));
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        self.bus.record(LinkEvent::ClearInput);
        Ok(())
    }
}

impl AsyncRead for MockLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(delay) = this.delay.as_mut() {
            if delay.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            this.delay = None;
        }

        if !this.pending.is_empty() {
            let n = buf.remaining().min(this.pending.len());
            let chunk: Vec<u8> = this.pending.drain(..n).collect();
            buf.put_slice(&chunk);
            this.bus.record(LinkEvent::Read(chunk));
            return Poll::Ready(Ok(()));
        }

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        // Silent line: only the caller's deadline ends the read
        Poll::Pending
    }
}

impl AsyncWrite for MockLink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pending.clear();
        this.delay = None;

        match this.bus.next_reply(buf) {
            Reply::Frame(bytes) => this.pending.extend(bytes),
            Reply::Delayed(delay, bytes) => {
                this.delay = Some(Box::pin(tokio::time::sleep(delay)));
                this.pending.extend(bytes);
            },
            Reply::Silence => {},
            Reply::Closed => this.closed = true,
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Direction pin that records its levels on the bus
pub struct MockPin {
    bus: MockBus,
}

impl DirectionPin for MockPin {
    fn set_level(&mut self, high: bool) -> Result<(), TransportError> {
        self.bus.record(LinkEvent::Pin(high));
        Ok(())
    }
}

// ============================================================================
// Frame helpers
// ============================================================================

/// Well-formed response frame
pub fn response(slave: u8, function: FunctionCode, payload: &[u8]) -> Vec<u8> {
    codec::encode(slave, function, payload)
}

/// Exception response frame for `function` with `code`
pub fn exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave, function | EXCEPTION_FLAG, code];
    let crc = codec::crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Coil value the simulated slave reports at `address`
pub fn simulated_coil(address: u16) -> bool {
    address % 3 == 0
}

/// Register value the simulated slave reports at `address`
pub fn simulated_register(address: u16) -> u16 {
    address.wrapping_mul(7).wrapping_add(1)
}

/// Answer a request frame the way a correct slave would
///
/// Reads return [`simulated_coil`] / [`simulated_register`] values, writes are
/// echoed, anything else gets exception 0x01. Broadcast requests get no answer.
pub fn simulate_slave(request: &[u8]) -> Reply {
    if request.len() < 8 || request[0] == 0 {
        return Reply::Silence;
    }

    let slave = request[0];
    let address = u16::from_be_bytes([request[2], request[3]]);
    let quantity = u16::from_be_bytes([request[4], request[5]]);

    let frame = match FunctionCode::from_u8(request[1]) {
        Some(fc @ FunctionCode::ReadCoils) => {
            let byte_count = usize::from(quantity).div_ceil(8);
            let mut payload = vec![0u8; 1 + byte_count];
            payload[0] = byte_count as u8;
            for i in 0..quantity {
                if simulated_coil(address.wrapping_add(i)) {
                    payload[1 + usize::from(i) / 8] |= 1 << (i % 8);
                }
            }
            response(slave, fc, &payload)
        },
        Some(fc @ (FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters)) => {
            let mut payload = vec![(usize::from(quantity) * 2) as u8];
            for i in 0..quantity {
                payload.extend_from_slice(&simulated_register(address.wrapping_add(i)).to_be_bytes());
            }
            response(slave, fc, &payload)
        },
        Some(FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister) => request.to_vec(),
        Some(fc @ FunctionCode::WriteMultipleRegisters) => response(slave, fc, &request[2..6]),
        None => exception(slave, request[1], 0x01),
    };
    Reply::Frame(frame)
}
