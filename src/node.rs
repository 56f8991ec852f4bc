//! See [`Node`] for more details.

use log::{debug, trace, warn};
use snafu::OptionExt;

use crate::buffer::RxBuffer;
use crate::nom_parser::node::{parse_frame, FrameToken};
use crate::peripheral::Peripheral;
use crate::registry::{Handler, Registry};
use crate::types::{Error, IntoKey, PayloadTooLargeSnafu};
use crate::{DEFAULT_RX_CAPACITY, SYNC_ACK, SYNC_MARKER, SYNC_PATTERN};

/// Result of one parser step over the unparsed part of the receive buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The next frame is incomplete, this many bytes are missing.
    NeedMoreBytes(usize),
    /// Reception was restarted, either by a resync marker or because a
    /// handler transmitted. The rest of the buffer was dropped.
    Sync,
    /// Bad CRC, illegal size field or overflow. The receiver is latched
    /// until the peer sends the resync pattern.
    TransportError,
    /// The frame was intact but unusable (no separator, key too long or
    /// unknown key). Skip this many bytes.
    FormatError(usize),
    /// A frame of this many bytes was dispatched.
    Consumed(usize),
}

/// Device (listener) side of the protocol.
///
/// The node owns the receive buffer the peripheral fills, the handler
/// registry and the error latch. Forward the UART interrupts to
/// [`on_idle()`](Self::on_idle) and
/// [`on_transfer_complete()`](Self::on_transfer_complete); everything runs to
/// completion inside those calls.
///
/// # Example
///
/// ```
/// use seracc_proto::{Node, ParseOutcome, Peripheral};
///
/// struct Uart {
///     sent: Vec<u8>,
/// }
///
/// impl Peripheral for Uart {
///     fn start_receive(&mut self, _buffer: &mut [u8]) {}
///     fn restart_receive(&mut self) {}
///     fn stop_receive(&mut self) {}
///     fn transmit_bytes(&mut self, data: &[u8]) {
///         self.sent.extend_from_slice(data)
///     }
/// }
///
/// let mut node: Node<Uart> = Node::new(Uart { sent: Vec::new() });
/// node.start();
///
/// // The DMA controller writes into the receive buffer...
/// node.rx_buffer_mut()[..2].copy_from_slice(&[0x55, 0xAA]);
/// // ...and the idle line interrupt reports how far it got.
/// assert_eq!(node.on_idle(2), ParseOutcome::Sync);
/// assert_eq!(node.peripheral().sent, b"OK");
/// ```
pub struct Node<'a, P: Peripheral, const N: usize = DEFAULT_RX_CAPACITY> {
    peripheral: P,
    registry: Registry<'a, P>,
    rx: RxBuffer<N>,
    latched: bool,
}

impl<'a, P: Peripheral, const N: usize> Node<'a, P, N> {
    /// Create a node without any handlers. Reception starts with
    /// [`start()`](Self::start).
    pub fn new(peripheral: P) -> Self {
        Self {
            peripheral,
            registry: Registry::new(),
            rx: RxBuffer::new(),
            latched: false,
        }
    }

    /// Create a node with `handler` bound to the register access key `"_"`.
    pub fn with_register_access(
        peripheral: P,
        handler: &'a mut dyn Handler<P>,
    ) -> Result<Self, Error> {
        let mut node = Self::new(peripheral);
        node.register(crate::regaccess::REGISTER_ACCESS_KEY, handler)?;
        Ok(node)
    }

    /// Bind a handler to a key. Registration is meant to happen once at
    /// startup; a rejected registration leaves the registry as it was.
    pub fn register(
        &mut self,
        key: impl IntoKey,
        handler: &'a mut dyn Handler<P>,
    ) -> Result<(), Error> {
        let result = self.registry.register(key, handler);
        if let Err(err) = &result {
            warn!("Handler registration rejected: {}", err);
        }
        result
    }

    /// Start (or restart) reception at the beginning of the buffer and clear
    /// the error latch.
    pub fn start(&mut self) {
        self.restart_receive();
    }

    /// Idle line event: the peripheral has written the buffer up to
    /// `write_pos`. Parses every complete frame and returns the outcome that
    /// ended processing, `TransportError` while the receiver stays latched.
    pub fn on_idle(&mut self, write_pos: usize) -> ParseOutcome {
        if self.latched {
            if self.rx.tail_matches(write_pos, &SYNC_PATTERN) {
                debug!("Resync pattern received while latched");
                self.resync();
                return ParseOutcome::Sync;
            }
            trace!("Receiver latched, ignoring data up to {}", write_pos);
            return ParseOutcome::TransportError;
        }

        self.process(write_pos)
    }

    /// Transfer complete event: the peripheral filled the buffer to the end
    /// and wraps to offset zero. Frames that ended exactly at the end are
    /// still processed, then the receiver is latched unless a handler
    /// restarted reception.
    pub fn on_transfer_complete(&mut self) -> ParseOutcome {
        if !self.latched && self.process(N) == ParseOutcome::Sync {
            return ParseOutcome::Sync;
        }
        if !self.latched {
            warn!("Receive buffer wrapped, receiver latched");
        }
        self.rx.mark_wrapped();
        self.latched = true;
        ParseOutcome::TransportError
    }

    fn process(&mut self, write_pos: usize) -> ParseOutcome {
        if !self.rx.set_filled(write_pos) {
            warn!(
                "Write position {} outside of [{}, {}], receiver latched",
                write_pos,
                self.rx.cursor(),
                N
            );
            self.latched = true;
            return ParseOutcome::TransportError;
        }

        loop {
            match self.step() {
                ParseOutcome::Consumed(len) | ParseOutcome::FormatError(len) => {
                    self.rx.consume(len)
                }
                ParseOutcome::NeedMoreBytes(missing) => {
                    let pending = self.rx.pending().len();
                    if pending > 0 && pending + missing > self.rx.space_after_cursor() {
                        warn!(
                            "Frame at {} needs {} more bytes than fit, receiver latched",
                            self.rx.cursor(),
                            missing
                        );
                        self.latched = true;
                        return ParseOutcome::TransportError;
                    }
                    return ParseOutcome::NeedMoreBytes(missing);
                }
                ParseOutcome::TransportError => {
                    self.latched = true;
                    return ParseOutcome::TransportError;
                }
                ParseOutcome::Sync => return ParseOutcome::Sync,
            }
        }
    }

    /// Send `data` as a frame. Reception is restarted first, so anything not
    /// yet parsed is dropped.
    pub fn transmit(&mut self, data: &[u8]) -> Result<(), Error> {
        let size = frame_size(data)?;
        self.peripheral.stop_receive();
        self.restart_receive();
        send_frame(&mut self.peripheral, size, data);
        Ok(())
    }

    /// True while the receiver waits for the resync pattern.
    pub const fn is_latched(&self) -> bool {
        self.latched
    }

    /// Offset of the first unparsed byte in the receive buffer.
    pub const fn cursor(&self) -> usize {
        self.rx.cursor()
    }

    /// The receive buffer, for the DMA controller (or a simulation of it)
    /// to write into.
    pub fn rx_buffer_mut(&mut self) -> &mut [u8] {
        self.rx.as_mut_slice()
    }

    pub const fn capacity(&self) -> usize {
        self.rx.capacity()
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.peripheral
    }

    fn step(&mut self) -> ParseOutcome {
        use FrameToken::*;

        let peripheral = &self.peripheral;
        let (consumed, token) = parse_frame(self.rx.pending(), |data| peripheral.crc16(data));

        match token {
            NeedData(missing) => {
                trace!("Partial frame at {}, {} bytes missing", self.rx.cursor(), missing);
                ParseOutcome::NeedMoreBytes(missing)
            }
            SyncMarker => {
                debug!("Resync marker received");
                self.resync();
                ParseOutcome::Sync
            }
            InvalidSize(size) => {
                warn!("Illegal frame size {}, receiver latched", size);
                ParseOutcome::TransportError
            }
            CrcMismatch => {
                warn!("CRC mismatch at {}, receiver latched", self.rx.cursor());
                ParseOutcome::TransportError
            }
            NoSeparator | KeyTooLong => {
                debug!("Malformed payload, skipping {} bytes", consumed);
                ParseOutcome::FormatError(consumed)
            }
            Command { key, body } => {
                let handler = match self.registry.lookup(key) {
                    Some(handler) => handler,
                    None => {
                        debug!("No handler for key {:?}", key);
                        return ParseOutcome::FormatError(consumed);
                    }
                };
                let mut tx = Transmitter::new(&mut self.peripheral);
                handler.handle(body, &mut tx);
                let transmitted = tx.transmitted();

                // the peripheral already restarted, catch up with it
                if transmitted {
                    self.rx.reset();
                    self.latched = false;
                    ParseOutcome::Sync
                } else {
                    ParseOutcome::Consumed(consumed)
                }
            }
        }
    }

    fn resync(&mut self) {
        self.peripheral.stop_receive();
        self.restart_receive();
        self.peripheral.transmit_bytes(SYNC_ACK);
    }

    fn restart_receive(&mut self) {
        self.rx.reset();
        self.latched = false;
        self.peripheral.start_receive(self.rx.as_mut_slice());
    }
}

/// Reply channel handed to a [`Handler`].
pub struct Transmitter<'p, P: Peripheral> {
    peripheral: &'p mut P,
    transmitted: bool,
}

impl<'p, P: Peripheral> Transmitter<'p, P> {
    pub(crate) fn new(peripheral: &'p mut P) -> Self {
        Self {
            peripheral,
            transmitted: false,
        }
    }

    /// Restart reception and send `data` as a frame. Bytes not yet parsed
    /// are dropped, the node rewinds its cursor once the handler returns.
    pub fn transmit(&mut self, data: &[u8]) -> Result<(), Error> {
        let size = frame_size(data)?;
        self.peripheral.stop_receive();
        self.peripheral.restart_receive();
        self.transmitted = true;
        send_frame(self.peripheral, size, data);
        Ok(())
    }

    /// Whether anything was sent through this transmitter.
    pub const fn transmitted(&self) -> bool {
        self.transmitted
    }
}

/// Size field for `data`. A size equal to the resync marker can't be sent.
fn frame_size(data: &[u8]) -> Result<u16, Error> {
    u16::try_from(data.len())
        .ok()
        .filter(|&size| size != SYNC_MARKER)
        .context(PayloadTooLargeSnafu { len: data.len() })
}

fn send_frame<P: Peripheral>(peripheral: &mut P, size: u16, data: &[u8]) {
    let crc = peripheral.crc16(data);
    peripheral.transmit_bytes(&size.to_le_bytes());
    peripheral.transmit_bytes(data);
    peripheral.transmit_bytes(&crc.to_le_bytes());
}
