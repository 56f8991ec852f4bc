//! Host side of the protocol, over any blocking byte stream.
//!
//! ```no_run
//! # fn main() -> Result<(), seracc_proto::master::Error> {
//! use seracc_proto::master::Master;
//! use seracc_proto::Width;
//! # let serial = std::io::Cursor::new(Vec::new());
//!
//! let mut master = Master::new(serial);
//! master.sync()?;
//! let id = master.read_register(0xE004_2000, Width::Word)?;
//! master.write_field(0x4800_0014, 0x0000_0030, 2)?;
//! # Ok(())
//! # }
//! ```

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::access_log::AccessLog;
use crate::nom_parser::master::{parse_reply, ReplyToken};
use crate::regaccess::{Instruction, REGISTER_ACCESS_KEY};
use crate::types::{IntoKey, Width};
use crate::{
    crc16, DEFAULT_RX_CAPACITY, FRAME_OVERHEAD, MIN_PAYLOAD, SYNC_ACK, SYNC_MARKER, SYNC_PATTERN,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("IO error: {}", source))]
    Io { source: std::io::Error },
    #[snafu(display("No response from node"))]
    NoResponse,
    #[snafu(display("Expected a reply of {} bytes, node sent {}", expected, size))]
    LengthMismatch { expected: usize, size: u16 },
    #[snafu(display("CRC mismatch in reply"))]
    CrcMismatch,
    #[snafu(display("Node did not acknowledge the resync"))]
    SyncFailed,
    #[snafu(display(
        "Frame of {} bytes doesn't fit the node buffer of {} bytes",
        len,
        capacity
    ))]
    FrameTooLarge { len: usize, capacity: usize },
    #[snafu(display("Payloads must be at least {} bytes long", MIN_PAYLOAD))]
    PayloadTooShort,
    #[snafu(display("Invalid command key: {}", source))]
    InvalidKey { source: crate::types::Error },
    #[snafu(display(
        "Timeout waiting for {:#010x} & {:#010x} to become {:#x}",
        address,
        mask,
        expected
    ))]
    Timeout {
        address: u32,
        mask: u32,
        expected: u32,
    },
}

/// Blocking host side driver for one node.
///
/// The master keeps count of the bytes it sent since the node last restarted
/// reception. A frame that would leave less room than the resync pattern
/// needs in the node's receive buffer is preceded by a resync, which makes
/// the node start over at offset zero.
/// Replies restart reception too, as does any error on the reply path (the
/// next transmission is then preceded by a resync).
///
/// Register accesses can be recorded as C code, see
/// [`start_logging()`](Self::start_logging).
#[derive(Debug)]
pub struct Master<IO> {
    io: IO,
    device_capacity: usize,
    outstanding: usize,
    needs_sync: bool,
    log: Option<AccessLog>,
}

impl<IO> Master<IO>
where
    IO: Read + Write,
{
    /// Create a master for a node with the default receive buffer size.
    pub fn new(io: IO) -> Self {
        Self::with_device_buffer(io, DEFAULT_RX_CAPACITY)
    }

    /// Create a master for a node with a receive buffer of `capacity` bytes.
    pub fn with_device_buffer(io: IO, capacity: usize) -> Self {
        Self {
            io,
            device_capacity: capacity,
            outstanding: 0,
            needs_sync: false,
            log: None,
        }
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn into_inner(self) -> IO {
        self.io
    }

    /// Record register reads, writes and waits from now on, dropping any
    /// earlier recording.
    pub fn start_logging(&mut self) {
        self.log = Some(AccessLog::new());
    }

    /// The recording in progress, to label accesses or place barriers.
    pub fn access_log_mut(&mut self) -> Option<&mut AccessLog> {
        self.log.as_mut()
    }

    /// Stop recording and return what was recorded.
    pub fn stop_logging(&mut self) -> Option<AccessLog> {
        self.log.take()
    }

    fn record(&mut self, access: impl FnOnce(&mut AccessLog)) {
        if let Some(log) = &mut self.log {
            access(log);
        }
    }

    /// Bytes sent since the node last restarted reception.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Send `payload` as one frame, resyncing first if the node buffer might
    /// overflow.
    pub fn transmit(&mut self, payload: &[u8]) -> Result<(), Error> {
        let len = payload.len() + FRAME_OVERHEAD;
        ensure!(payload.len() >= MIN_PAYLOAD, PayloadTooShortSnafu);
        // there must always be room left for the resync pattern
        let limit = self.device_capacity.saturating_sub(SYNC_PATTERN.len());
        ensure!(
            len < limit
                && u16::try_from(payload.len()).map_or(false, |size| size != SYNC_MARKER),
            FrameTooLargeSnafu {
                len,
                capacity: self.device_capacity
            }
        );

        if self.needs_sync || self.outstanding + len >= limit {
            self.sync()?;
        }

        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc16(payload).to_le_bytes());
        trace!("Sending frame {:02x?}", frame);

        self.io.write_all(&frame).context(IoSnafu)?;
        self.io.flush().context(IoSnafu)?;
        self.outstanding += len;
        Ok(())
    }

    /// Send `body` to the handler registered for `key`.
    pub fn command(&mut self, key: impl IntoKey, body: &[u8]) -> Result<(), Error> {
        let key = key.into_key().context(InvalidKeySnafu)?;
        let mut payload = Vec::with_capacity(key.len() + 1 + body.len());
        payload.extend_from_slice(&key);
        payload.push(b':');
        payload.extend_from_slice(body);
        self.transmit(&payload)
    }

    /// Read a reply frame carrying exactly `len` payload bytes.
    pub fn receive(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let result = self.receive_frame(len);
        // The node restarted reception to send anything at all.
        self.outstanding = 0;
        if let Err(err) = &result {
            warn!("Receive failed: {}", err);
            self.needs_sync = true;
        }
        result
    }

    fn receive_frame(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut frame = Vec::with_capacity(len + FRAME_OVERHEAD);
        let mut missing = 2;
        loop {
            let start = frame.len();
            frame.resize(start + missing, 0);
            self.read_exact(&mut frame[start..])?;

            match parse_reply(&frame, len) {
                ReplyToken::NeedData(more) => missing = more,
                ReplyToken::Reply(payload) => return Ok(payload.to_vec()),
                ReplyToken::UnexpectedLength(size) => {
                    return LengthMismatchSnafu {
                        expected: len,
                        size,
                    }
                    .fail()
                }
                ReplyToken::CrcMismatch => return CrcMismatchSnafu.fail(),
            }
        }
    }

    /// Send the resync pattern and wait for the node to acknowledge it.
    pub fn sync(&mut self) -> Result<(), Error> {
        debug!("Resyncing node after {} bytes", self.outstanding);
        if self.needs_sync {
            // a reply may have arrived after we gave up on it
            self.clear_input()?;
        }
        self.io.write_all(&SYNC_PATTERN).context(IoSnafu)?;
        self.io.flush().context(IoSnafu)?;

        let mut ack = [0; 2];
        match self.read_exact(&mut ack) {
            Ok(()) => (),
            Err(Error::NoResponse) => return SyncFailedSnafu.fail(),
            Err(err) => return Err(err),
        }
        ensure!(&ack == SYNC_ACK, SyncFailedSnafu);

        // each marker the node saw is acknowledged
        self.clear_input()?;
        self.outstanding = 0;
        self.needs_sync = false;
        Ok(())
    }

    /// Discard whatever the node sent that wasn't read yet. Returns once a
    /// read comes back empty or times out, so this waits for one read
    /// timeout on a serial port.
    pub fn clear_input(&mut self) -> Result<(), Error> {
        let mut buf = [0; 64];
        loop {
            match self.io.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(len) => trace!("Discarding {:02x?}", &buf[..len]),
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(())
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => (),
                Err(source) => return Err(Error::Io { source }),
            }
        }
    }

    /// Run a register access instruction on the node, returning the value
    /// for reads.
    pub fn execute(&mut self, instruction: Instruction) -> Result<Option<u32>, Error> {
        let reply_len = instruction.reply_len();
        self.command(REGISTER_ACCESS_KEY, &instruction.encode())?;
        if reply_len == 0 {
            return Ok(None);
        }

        let reply = self.receive(reply_len)?;
        let mut value = [0; 4];
        value[..reply_len].copy_from_slice(&reply);
        Ok(Some(u32::from_le_bytes(value)))
    }

    pub fn read_register(&mut self, address: u32, width: Width) -> Result<u32, Error> {
        let value = self
            .execute(Instruction::Read { address, width })?
            .context(NoResponseSnafu)?;
        self.record(|log| log.read(address, width));
        Ok(value)
    }

    pub fn write_register(&mut self, address: u32, value: u32, width: Width) -> Result<(), Error> {
        self.execute(Instruction::Write {
            address,
            width,
            value,
        })?;
        self.record(|log| log.write(address, u32::MAX, value, width));
        Ok(())
    }

    /// Change the bits of `mask` in the register at `address` to those of
    /// `value`, with the smallest instruction that does it. Nothing is sent
    /// for an empty mask.
    pub fn write_masked(&mut self, address: u32, mask: u32, value: u32) -> Result<(), Error> {
        if let Some(instruction) = Instruction::for_masked_write(address, mask, value) {
            self.execute(instruction)?;
            self.record(|log| log.write(address, mask, value & mask, Width::Word));
        }
        Ok(())
    }

    /// Read the bit field `mask`, right aligned.
    pub fn read_field(&mut self, address: u32, mask: u32) -> Result<u32, Error> {
        let reg = self.read_register(address, Width::Word)?;
        Ok(extract_bits(reg, mask))
    }

    /// Write the right aligned `value` to the bit field `mask`.
    pub fn write_field(&mut self, address: u32, mask: u32, value: u32) -> Result<(), Error> {
        self.write_masked(address, mask, deposit_bits(value, mask))
    }

    /// Poll the bit field `mask` until it reads `expected`.
    pub fn wait_until(
        &mut self,
        address: u32,
        mask: u32,
        expected: u32,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.record(AccessLog::begin_wait);
        let result = self.poll_field(address, mask, expected, timeout);
        match &result {
            Ok(()) => {
                let value = deposit_bits(expected, mask);
                self.record(|log| log.end_wait(address, mask, value))
            }
            Err(_) => self.record(AccessLog::abort_wait),
        }
        result
    }

    fn poll_field(
        &mut self,
        address: u32,
        mask: u32,
        expected: u32,
        timeout: Duration,
    ) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            if self.read_field(address, mask)? == expected {
                return Ok(());
            }
            ensure!(
                start.elapsed() < timeout,
                TimeoutSnafu {
                    address,
                    mask,
                    expected
                }
            );
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.io.read_exact(buf).map_err(|err| match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::UnexpectedEof => {
                Error::NoResponse
            }
            _ => Error::Io { source: err },
        })
    }
}

/// Gather the bits of `value` selected by `mask` into the low bits of the
/// result.
pub fn extract_bits(value: u32, mask: u32) -> u32 {
    let mut result = 0;
    let mut out = 0;
    for bit in (0..32).filter(|bit| mask >> bit & 1 != 0) {
        result |= (value >> bit & 1) << out;
        out += 1;
    }
    result
}

/// Scatter the low bits of `value` into the positions selected by `mask`.
pub fn deposit_bits(value: u32, mask: u32) -> u32 {
    let mut result = 0;
    let mut from = 0;
    for bit in (0..32).filter(|bit| mask >> bit & 1 != 0) {
        result |= (value >> from & 1) << bit;
        from += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use Width::Word;

    /// Canned replies, each released by one write, and recorded output.
    #[derive(Default)]
    struct Script {
        replies: VecDeque<Vec<u8>>,
        input: VecDeque<u8>,
        output: Vec<u8>,
        empty_reads: usize,
    }

    impl Script {
        fn replying(replies: &[&[u8]]) -> Self {
            Self {
                replies: replies.iter().map(|reply| reply.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let len = buf.len().min(self.input.len());
            if len == 0 {
                self.empty_reads += 1;
            }
            for (dst, src) in buf.iter_mut().zip(self.input.drain(..len)) {
                *dst = src;
            }
            Ok(len)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            if let Some(reply) = self.replies.pop_front() {
                self.input.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut data = (payload.len() as u16).to_le_bytes().to_vec();
        data.extend_from_slice(payload);
        data.extend_from_slice(&crc16(payload).to_le_bytes());
        data
    }

    #[test]
    fn test_read_register() {
        let reply = frame(&0xCAFE_F00Du32.to_le_bytes());
        let mut master = Master::new(Script::replying(&[reply.as_slice()]));
        assert_eq!(master.read_register(0x1000, Word).unwrap(), 0xCAFE_F00D);
        assert_eq!(master.get_ref().output, frame(b"_:\x00\x10\x00\x00"));
        assert_eq!(master.outstanding(), 0);
        // nothing to drain, nothing waited for
        assert_eq!(master.get_ref().empty_reads, 0);
    }

    #[test]
    fn test_late_reply_drained() {
        let mut master = Master::new(Script::default());
        assert!(matches!(master.receive(4), Err(Error::NoResponse)));

        let reply = frame(&7u32.to_le_bytes());
        let script = master.get_mut();
        script.input.extend(frame(&6u32.to_le_bytes()));
        script.replies.push_back(b"OK".to_vec());
        script.replies.push_back(reply);
        assert_eq!(master.read_register(0x1000, Word).unwrap(), 7);
        assert!(master.get_ref().output.starts_with(&SYNC_PATTERN));
    }

    #[test]
    fn test_reply_errors() {
        let mut master = Master::new(Script::replying(&[frame(b"\x01\x02").as_slice()]));
        assert!(matches!(
            master.read_register(0x1000, Width::Word),
            Err(Error::LengthMismatch {
                expected: 4,
                size: 2
            })
        ));

        let mut reply = frame(b"\x01");
        reply[3] ^= 0xFF;
        let mut master = Master::new(Script::replying(&[reply.as_slice()]));
        assert!(matches!(
            master.read_register(0x1000, Width::Byte),
            Err(Error::CrcMismatch)
        ));

        let mut master = Master::new(Script::default());
        assert!(matches!(
            master.read_register(0x1000, Width::Byte),
            Err(Error::NoResponse)
        ));
    }

    #[test]
    fn test_sync_after_error() {
        let mut master = Master::new(Script::default());
        assert!(master.receive(1).is_err());
        master.get_mut().replies.push_back(b"OK".to_vec());
        master.write_register(0x1000, 1, Word).unwrap();
        let output = &master.get_ref().output;
        assert_eq!(&output[..4], &SYNC_PATTERN);
        assert_eq!(&output[4..], frame(b"_:\x00\x10\x00\x00\x01\x00\x00\x00"));
    }

    #[test]
    fn test_sync_before_overflow() {
        let mut master = Master::with_device_buffer(Script::replying(&[b"", b"", b"OKOK"]), 36);
        master.transmit(b"0123456789").unwrap();
        master.transmit(b"0123456789").unwrap();
        assert_eq!(master.outstanding(), 28);
        assert_eq!(master.get_ref().output.len(), 28);

        master.transmit(b"0123456789").unwrap();
        assert_eq!(master.outstanding(), 14);
        assert_eq!(&master.get_ref().output[28..32], &SYNC_PATTERN);
        // the second acknowledgement was drained
        assert!(master.get_ref().input.is_empty());

        assert!(matches!(
            master.transmit(&[0; 28]),
            Err(Error::FrameTooLarge { len: 32, .. })
        ));
        assert!(matches!(master.transmit(b"x"), Err(Error::PayloadTooShort)));

        let mut master = Master::with_device_buffer(Script::default(), 0x2_0000);
        assert!(matches!(
            master.transmit(&vec![0; usize::from(SYNC_MARKER)]),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_sync_failed() {
        let mut master = Master::new(Script::replying(&[b"NO"]));
        assert!(matches!(master.sync(), Err(Error::SyncFailed)));
        let mut master = Master::new(Script::default());
        assert!(matches!(master.sync(), Err(Error::SyncFailed)));
    }

    #[test]
    fn test_write_masked() {
        let mut master = Master::new(Script::default());
        master.write_masked(0x1000, 0, 0xFF).unwrap();
        assert!(master.get_ref().output.is_empty());

        master.write_field(0x1000, 0x0000_0030, 2).unwrap();
        assert_eq!(
            master.get_ref().output,
            frame(b"_:\x00\x10\x00\x00\x30\x00\x00\x00\x20\x00\x00\x00")
        );
        assert!(matches!(
            master.command("bad:key", b"x"),
            Err(Error::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_access_log() {
        let mut master = Master::new(Script::replying(&[
            b"",
            b"",
            b"",
            b"",
            frame(&0x0000_0002u32.to_le_bytes()).as_slice(),
            frame(&0x0000_0055u32.to_le_bytes()).as_slice(),
        ]));
        master.write_register(0x0FFC, 1, Word).unwrap();
        master.start_logging();

        master.write_field(0x1000, 0x0000_0004, 1).unwrap();
        master.access_log_mut().unwrap().barrier();
        master.write_masked(0x1000, 0x0000_0F00, 0).unwrap();
        master.write_field(0x2000, 0x0000_00F0, 3).unwrap();
        master
            .wait_until(0x3000, 0x0000_0002, 1, Duration::from_millis(100))
            .unwrap();
        assert_eq!(master.read_register(0x3004, Word).unwrap(), 0x55);

        let log = master.stop_logging().unwrap();
        assert_eq!(log.len(), 5);
        let mut code = Vec::new();
        log.render(&mut code).unwrap();
        assert_eq!(
            String::from_utf8(code).unwrap(),
            "*(volatile uint32_t*)0x00001000 |= 1u << 2;\n\
             *(volatile uint32_t*)0x00001000 &= ~0x00000F00;\n\
             volatile uint32_t* _reg = (volatile uint32_t*)0x00002000;\n\
             *_reg = (*_reg & ~0x000000F0) | 0x00000030;\n\
             _reg = (volatile uint32_t*)0x00003000;\n\
             while ((*_reg & 0x00000002) != 0x00000002);\n\
             (void) *(volatile uint32_t*)0x00003004;\n"
        );
    }

    #[test]
    fn test_bit_fields() {
        assert_eq!(extract_bits(0xABCD, 0x0FF0), 0xBC);
        assert_eq!(extract_bits(0b1010_0101, 0b1000_0001), 0b11);
        assert_eq!(deposit_bits(0b11, 0b1000_0001), 0b1000_0001);
        assert_eq!(deposit_bits(0xBC, 0x0FF0), 0x0BC0);
        assert_eq!(deposit_bits(0xFF, 0), 0);
    }
}
