#![allow(dead_code)]

use std::cell::RefCell;
use std::cmp::min;
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::rc::Rc;

use seracc_proto::{crc16, MemoryAccess, Node, ParseOutcome, Peripheral};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Wire encoding of `payload`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    data.extend_from_slice(payload);
    data.extend_from_slice(&crc16(payload).to_le_bytes());
    data
}

/// State of a simulated UART with circular DMA reception.
#[derive(Default)]
pub struct LinkState {
    pub receiving: bool,
    pub fill: usize,
    pub starts: usize,
    pub tx: Vec<u8>,
    /// Whether reception was running at each transmission.
    pub receiving_at_tx: Vec<bool>,
}

impl LinkState {
    pub fn new() -> Rc<RefCell<LinkState>> {
        Default::default()
    }
}

pub struct SimLink(Rc<RefCell<LinkState>>);

impl SimLink {
    pub fn new(state: &Rc<RefCell<LinkState>>) -> SimLink {
        SimLink(Rc::clone(state))
    }

    pub fn state(&self) -> &Rc<RefCell<LinkState>> {
        &self.0
    }
}

impl Peripheral for SimLink {
    fn start_receive(&mut self, _buffer: &mut [u8]) {
        self.restart_receive();
    }

    fn restart_receive(&mut self) {
        let mut state = self.0.borrow_mut();
        state.receiving = true;
        state.fill = 0;
        state.starts += 1;
    }

    fn stop_receive(&mut self) {
        self.0.borrow_mut().receiving = false;
    }

    fn transmit_bytes(&mut self, data: &[u8]) {
        let mut state = self.0.borrow_mut();
        let receiving = state.receiving;
        state.receiving_at_tx.push(receiving);
        state.tx.extend_from_slice(data);
    }
}

/// Plays the DMA controller: writes `data` into the receive buffer at the
/// fill position, wrapping at the end, then raises the idle event.
pub fn deliver<const N: usize>(node: &mut Node<'_, SimLink, N>, data: &[u8]) -> ParseOutcome {
    let state = Rc::clone(node.peripheral().state());
    for &byte in data {
        if !state.borrow().receiving {
            continue;
        }
        let pos = state.borrow().fill;
        node.rx_buffer_mut()[pos] = byte;
        if pos + 1 == N {
            state.borrow_mut().fill = 0;
            node.on_transfer_complete();
        } else {
            state.borrow_mut().fill = pos + 1;
        }
    }
    let fill = state.borrow().fill;
    node.on_idle(fill)
}

/// Byte addressed memory, zero where never written.
#[derive(Default)]
pub struct SimMemory {
    bytes: RefCell<HashMap<u32, u8>>,
}

impl SimMemory {
    pub fn new() -> SimMemory {
        Default::default()
    }

    fn read(&self, address: u32, len: u32) -> u32 {
        let bytes = self.bytes.borrow();
        (0..len).rev().fold(0, |acc, i| {
            acc << 8 | u32::from(*bytes.get(&(address + i)).unwrap_or(&0))
        })
    }

    fn write(&self, address: u32, len: u32, value: u32) {
        let mut bytes = self.bytes.borrow_mut();
        for i in 0..len {
            bytes.insert(address + i, (value >> (8 * i)) as u8);
        }
    }

    pub fn get(&self, address: u32) -> u32 {
        self.read(address, 4)
    }

    pub fn set(&self, address: u32, value: u32) {
        self.write(address, 4, value)
    }
}

impl MemoryAccess for &SimMemory {
    fn read_u8(&mut self, address: u32) -> u8 {
        self.read(address, 1) as u8
    }
    fn read_u16(&mut self, address: u32) -> u16 {
        self.read(address, 2) as u16
    }
    fn read_u32(&mut self, address: u32) -> u32 {
        self.read(address, 4)
    }
    fn write_u8(&mut self, address: u32, value: u8) {
        self.write(address, 1, value.into())
    }
    fn write_u16(&mut self, address: u32, value: u16) {
        self.write(address, 2, value.into())
    }
    fn write_u32(&mut self, address: u32, value: u32) {
        self.write(address, 4, value)
    }
}

/// Host end of a serial line with a node on the other side. Writes are
/// delivered to the node in one DMA burst, reads return what it sent.
pub struct Loopback<'a, const N: usize> {
    pub node: Node<'a, SimLink, N>,
    pub outcomes: Vec<ParseOutcome>,
    pub do_write_error: bool,
}

impl<'a, const N: usize> Loopback<'a, N> {
    pub fn new(node: Node<'a, SimLink, N>) -> Self {
        Loopback {
            node,
            outcomes: Vec::new(),
            do_write_error: false,
        }
    }
}

impl<const N: usize> std::io::Read for Loopback<'_, N> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.node.peripheral().state().borrow_mut();
        let len = min(buf.len(), state.tx.len());
        buf[..len].copy_from_slice(&state.tx[..len]);
        state.tx.drain(..len);
        Ok(len)
    }
}

impl<const N: usize> std::io::Write for Loopback<'_, N> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.do_write_error {
            self.do_write_error = false;
            return Err(Error::new(ErrorKind::BrokenPipe, "IO write error"));
        }
        let outcome = deliver(&mut self.node, buf);
        self.outcomes.push(outcome);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
