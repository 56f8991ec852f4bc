//! A node on stdin/stdout, serving a simulated memory that reads as zero
//! until written. Every read from stdin counts as one DMA burst followed by
//! an idle line event.

use std::collections::HashMap;
use std::error::Error;
use std::io::{self, Read, Write};

use seracc_proto::{MemoryAccess, Node, ParseOutcome, Peripheral, RegisterAccess};

struct StdioLink {
    stdout: io::Stdout,
    receiving: bool,
    fill: usize,
    failed: Option<io::Error>,
}

impl Peripheral for StdioLink {
    fn start_receive(&mut self, _buffer: &mut [u8]) {
        self.restart_receive();
    }

    fn restart_receive(&mut self) {
        self.receiving = true;
        self.fill = 0;
    }

    fn stop_receive(&mut self) {
        self.receiving = false;
    }

    fn transmit_bytes(&mut self, data: &[u8]) {
        if let Err(err) = self.stdout.write_all(data).and_then(|()| self.stdout.flush()) {
            if self.failed.is_none() {
                self.failed = Some(err);
            }
        }
    }
}

#[derive(Default)]
struct SimMemory(HashMap<u32, u8>);

impl SimMemory {
    fn read(&self, address: u32, len: u32) -> u32 {
        (0..len).rev().fold(0, |acc, i| {
            acc << 8 | u32::from(*self.0.get(&address.wrapping_add(i)).unwrap_or(&0))
        })
    }

    fn write(&mut self, address: u32, len: u32, value: u32) {
        for i in 0..len {
            self.0.insert(address.wrapping_add(i), (value >> (8 * i)) as u8);
        }
    }
}

impl MemoryAccess for SimMemory {
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

fn node_main_loop() -> Result<(), Box<dyn Error>> {
    let link = StdioLink {
        stdout: io::stdout(),
        receiving: false,
        fill: 0,
        failed: None,
    };
    let mut regs = RegisterAccess::new(SimMemory::default());
    let mut node: Node<StdioLink> = Node::with_register_access(link, &mut regs)?;
    node.start();

    let capacity = node.capacity();
    let mut chunk = [0; 256];
    loop {
        let len = io::stdin().read(&mut chunk)?;
        if len == 0 {
            break;
        }

        for &byte in &chunk[..len] {
            let link = node.peripheral_mut();
            if !link.receiving {
                continue;
            }
            let pos = link.fill;
            link.fill = (pos + 1) % capacity;
            node.rx_buffer_mut()[pos] = byte;
            if pos + 1 == capacity {
                node.on_transfer_complete();
            }
        }

        let fill = node.peripheral().fill;
        match node.on_idle(fill) {
            ParseOutcome::NeedMoreBytes(_) => (),
            outcome => eprintln!("{:?}, cursor at {}", outcome, node.cursor()),
        }
        if let Some(err) = node.peripheral_mut().failed.take() {
            return Err(err.into());
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    node_main_loop()
}
