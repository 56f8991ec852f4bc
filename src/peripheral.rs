//! The serial peripheral seen from the protocol.
//!
//! Implement [`Peripheral`] on top of the UART/DMA driver of the target and
//! forward its interrupts to [`Node::on_idle`](crate::Node::on_idle) and
//! [`Node::on_transfer_complete`](crate::Node::on_transfer_complete).

/// Capabilities the node needs from the UART driver.
pub trait Peripheral {
    /// Start continuous reception into `buffer`, with the fill position at
    /// offset zero. Called again to restart an ongoing reception.
    ///
    /// A DMA backed implementation keeps writing into `buffer` after this
    /// returns, wrapping around at the end, and reports its progress through
    /// the idle and transfer complete events.
    fn start_receive(&mut self, buffer: &mut [u8]);

    /// Restart reception into the buffer given to the last
    /// [`start_receive()`](Self::start_receive), at offset zero. A handler
    /// reply calls this while the node's buffer is still borrowed.
    fn restart_receive(&mut self);

    /// Halt reception. The buffer contents stay as they are.
    fn stop_receive(&mut self);

    /// Send `data` and return once it is on the wire.
    fn transmit_bytes(&mut self, data: &[u8]);

    /// CRC-16 of `data`. Override to use a hardware CRC unit, the result
    /// must match [`crc16`](crate::crc16).
    fn crc16(&self, data: &[u8]) -> u16 {
        crate::crc16(data)
    }
}

impl<P: Peripheral + ?Sized> Peripheral for &mut P {
    fn start_receive(&mut self, buffer: &mut [u8]) {
        (**self).start_receive(buffer)
    }

    fn restart_receive(&mut self) {
        (**self).restart_receive()
    }

    fn stop_receive(&mut self) {
        (**self).stop_receive()
    }

    fn transmit_bytes(&mut self, data: &[u8]) {
        (**self).transmit_bytes(data)
    }

    fn crc16(&self, data: &[u8]) -> u16 {
        (**self).crc16(data)
    }
}
