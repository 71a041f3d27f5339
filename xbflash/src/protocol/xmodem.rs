//! Non-blocking XMODEM / XMODEM-CRC sender.
//!
//! Used to stream `.ebl` images to the Ember bootloader.
//!
//! ## Protocol Overview
//!
//! ```text
//! Block format:
//! +---------+-----+------+----------------------+-------------------+
//! | SOH/STX | SEQ | ~SEQ | DATA (64/128/1024)   | SUM (1) / CRC (2) |
//! +---------+-----+------+----------------------+-------------------+
//! ```
//!
//! The receiver picks the trailer: NAK asks for the 8-bit checksum, `C` asks
//! for CRC-16/XMODEM (sent big-endian). A short final block is padded with
//! 0xFF. After the last block the sender sends EOT and waits for a final ACK.
//!
//! [`XmodemSender::tick`] does one bounded unit of work per call. The packet
//! buffer, the firmware source and the stream are lent to every call, so the
//! sender itself owns no I/O resources.

use log::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    image::source::FirmwareSource,
    port::Stream,
    protocol::{
        Status, Step,
        crc::{checksum8, crc16_xmodem},
    },
    timer::Deadline,
};

/// XMODEM control characters.
pub mod control {
    /// Start of Header (64/128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Attempts per packet (and for the final EOT).
const TRIES: u8 = 3;

/// Wait for a data block ACK.
const ACK_TIMEOUT_MS: u32 = 10_000;

/// Wait for the ACK of EOT.
const EOT_TIMEOUT_MS: u32 = 3_000;

/// Header bytes in front of the data: start byte, block number, complement.
const HEADER_LEN: usize = 3;

/// Largest packet: header, 1024 data bytes and a 2-byte CRC.
pub const MAX_PACKET_SIZE: usize = HEADER_LEN + 1024 + 2;

/// Data bytes per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockSize {
    /// 64-byte blocks.
    Small,
    /// 128-byte blocks.
    #[default]
    Standard,
    /// 1024-byte blocks (XMODEM-1K).
    Large,
}

impl BlockSize {
    /// Size in bytes.
    pub const fn len(self) -> usize {
        match self {
            Self::Small => 64,
            Self::Standard => 128,
            Self::Large => 1024,
        }
    }

    const fn start_byte(self) -> u8 {
        match self {
            Self::Large => control::STX,
            Self::Small | Self::Standard => control::SOH,
        }
    }
}

/// Sender options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XmodemFlags {
    /// Data bytes per block.
    pub block_size: BlockSize,
    /// Ignore NAK start requests and only start on `C`.
    pub force_crc: bool,
}

impl XmodemFlags {
    /// Options with the given block size and checksum negotiation.
    pub const fn new(block_size: BlockSize, force_crc: bool) -> Self {
        Self {
            block_size,
            force_crc,
        }
    }
}

/// Integrity trailer chosen by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Sum,
    Crc,
}

/// Sender state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemState {
    /// Discard stale bytes from the receiver before starting.
    Flush,
    /// Waiting for NAK or `C`.
    Start,
    /// Assemble the next packet.
    Send,
    /// Start (re)transmitting the assembled packet.
    Resend,
    /// Packet partially written.
    Sending,
    /// Waiting for the receiver to ACK the packet.
    WaitAck,
    /// Send EOT.
    Eof,
    /// Waiting for the ACK of EOT.
    FinalAck,
    /// Transfer complete.
    Success,
    /// Transfer aborted; CAN CAN was sent.
    Failure,
}

/// XMODEM sender state machine.
#[derive(Debug, Clone)]
pub struct XmodemSender {
    flags: XmodemFlags,
    check: Option<Check>,
    state: XmodemState,
    packet_num: u32,
    tries: u8,
    offset: usize,
    deadline: Deadline,
}

impl XmodemSender {
    /// Create a sender waiting for the receiver's start character.
    pub fn new(flags: XmodemFlags) -> Self {
        Self {
            flags,
            check: None,
            state: XmodemState::Start,
            packet_num: 0,
            tries: TRIES,
            offset: 0,
            deadline: Deadline::default(),
        }
    }

    /// Drain whatever the receiver already sent before waiting to start.
    #[must_use]
    pub fn with_flush(mut self) -> Self {
        self.state = XmodemState::Flush;
        self
    }

    /// Reset for a new transfer.
    pub fn init(&mut self, flags: XmodemFlags) {
        *self = Self::new(flags);
    }

    /// Current state.
    pub fn state(&self) -> XmodemState {
        self.state
    }

    /// Number of the packet being sent; 0 before the transfer starts.
    pub fn packet_num(&self) -> u32 {
        self.packet_num
    }

    /// Data bytes per block.
    pub fn block_size(&self) -> usize {
        self.flags
            .block_size
            .len()
    }

    /// Whether the receiver asked for CRC-16 trailers.
    pub fn uses_crc(&self) -> bool {
        self.check == Some(Check::Crc)
    }

    /// Bytes on the wire per packet once the trailer is negotiated.
    pub fn packet_size(&self) -> usize {
        let trailer = if self.uses_crc() { 2 } else { 1 };
        HEADER_LEN + self.block_size() + trailer
    }

    /// Feed a start character the caller already consumed.
    ///
    /// NAK selects checksum trailers (unless CRC is forced), `C` selects
    /// CRC-16. Returns `false` and changes nothing for any other byte or when
    /// the transfer is already running.
    pub fn accept_start(&mut self, byte: u8) -> bool {
        if !matches!(self.state, XmodemState::Flush | XmodemState::Start) {
            return false;
        }
        let check = match byte {
            control::NAK if !self.flags.force_crc => Check::Sum,
            control::C => Check::Crc,
            _ => return false,
        };
        debug!(
            "Starting XMODEM{} send",
            if check == Check::Crc { "-CRC" } else { "" }
        );
        self.check = Some(check);
        self.packet_num = 1;
        self.state = XmodemState::Send;
        true
    }

    /// Advance the transfer.
    ///
    /// `buffer` must hold at least [`XmodemSender::packet_size`] bytes (use
    /// [`MAX_PACKET_SIZE`] for any block size) and must be the same buffer on
    /// every call, since it carries the packet between retransmissions.
    /// Returns `Ok(Status::Complete)` once the final ACK arrives. An `Err`
    /// is terminal: CAN CAN has been sent and every later call fails.
    pub fn tick<F, S>(
        &mut self,
        buffer: &mut [u8],
        source: &mut F,
        stream: &mut S,
        now: u32,
    ) -> Result<Status>
    where
        F: FirmwareSource + ?Sized,
        S: Stream + ?Sized,
    {
        match self.state {
            XmodemState::Success => return Ok(Status::Complete),
            XmodemState::Failure => return Err(Error::Cancelled),
            _ => {},
        }
        if buffer.len() < HEADER_LEN + self.block_size() + 2 {
            return Err(Error::InvalidState(format!(
                "XMODEM buffer of {} bytes cannot hold a {}-byte block",
                buffer.len(),
                self.block_size()
            )));
        }

        loop {
            match self.step(buffer, source, stream, now) {
                Ok(Step::Continue) => {},
                Ok(Step::Yield) => {
                    return Ok(if self.state == XmodemState::Success {
                        Status::Complete
                    } else {
                        Status::Pending
                    });
                },
                Err(e) => {
                    self.abort(stream);
                    return Err(e);
                },
            }
        }
    }

    fn step<F, S>(
        &mut self,
        buffer: &mut [u8],
        source: &mut F,
        stream: &mut S,
        now: u32,
    ) -> Result<Step>
    where
        F: FirmwareSource + ?Sized,
        S: Stream + ?Sized,
    {
        match self.state {
            XmodemState::Flush => {
                let dropped = stream.drain()?;
                if dropped > 0 {
                    trace!("Flushed {dropped} stale bytes");
                }
                self.state = XmodemState::Start;
                Ok(Step::Continue)
            },
            XmodemState::Start => match stream.read_byte()? {
                Some(byte) if self.accept_start(byte) => Ok(Step::Continue),
                Some(byte) => {
                    trace!("Ignoring 0x{byte:02X} while waiting to start");
                    Ok(Step::Yield)
                },
                None => Ok(Step::Yield),
            },
            XmodemState::Send => {
                self.tries = TRIES;
                if !self.assemble(buffer, source)? {
                    self.state = XmodemState::Eof;
                    return Ok(Step::Continue);
                }
                stream.drain()?;
                self.state = XmodemState::Resend;
                Ok(Step::Continue)
            },
            XmodemState::Resend => {
                self.offset = 0;
                self.state = XmodemState::Sending;
                Ok(Step::Continue)
            },
            XmodemState::Sending => {
                let size = self.packet_size();
                let sent = stream.write(&buffer[self.offset..size])?;
                self.offset += sent;
                if self.offset == size {
                    trace!("Packet {} sent, waiting for ACK", self.packet_num);
                    self.deadline = Deadline::arm(now, ACK_TIMEOUT_MS);
                    self.state = XmodemState::WaitAck;
                }
                Ok(Step::Yield)
            },
            XmodemState::WaitAck => {
                match stream.read_byte()? {
                    Some(control::ACK) => {
                        trace!("Packet {} ACKed", self.packet_num);
                        self.packet_num += 1;
                        self.state = XmodemState::Send;
                        return Ok(Step::Yield);
                    },
                    Some(byte) => debug!("Packet {} got 0x{byte:02X}", self.packet_num),
                    None if !self.deadline.elapsed(now) => return Ok(Step::Yield),
                    None => debug!("Packet {} timed out", self.packet_num),
                }
                self.tries -= 1;
                if self.tries == 0 {
                    warn!("Packet {} failed {TRIES} times", self.packet_num);
                    return Err(Error::Cancelled);
                }
                self.state = XmodemState::Resend;
                Ok(Step::Yield)
            },
            XmodemState::Eof => {
                if stream.write(&[control::EOT])? == 0 {
                    debug!("No room for EOT, retrying after timeout");
                }
                self.deadline = Deadline::arm(now, EOT_TIMEOUT_MS);
                self.state = XmodemState::FinalAck;
                Ok(Step::Yield)
            },
            XmodemState::FinalAck => {
                match stream.read_byte()? {
                    Some(control::ACK) => {
                        debug!("EOT ACKed, transfer complete");
                        self.state = XmodemState::Success;
                        return Ok(Step::Yield);
                    },
                    Some(byte) => debug!("EOT got 0x{byte:02X}"),
                    None if !self.deadline.elapsed(now) => return Ok(Step::Yield),
                    None => debug!("EOT timed out"),
                }
                self.tries -= 1;
                if self.tries == 0 {
                    warn!("No ACK for EOT");
                    return Err(Error::Cancelled);
                }
                self.state = XmodemState::Eof;
                Ok(Step::Yield)
            },
            XmodemState::Success | XmodemState::Failure => Ok(Step::Yield),
        }
    }

    /// Fill `buffer` with the next packet. Returns `false` at end of data.
    fn assemble<F>(&mut self, buffer: &mut [u8], source: &mut F) -> Result<bool>
    where
        F: FirmwareSource + ?Sized,
    {
        let block_size = self.block_size();
        let data = &mut buffer[HEADER_LEN..HEADER_LEN + block_size];
        let read = source.read(data)?;
        if read == 0 {
            return Ok(false);
        }
        if read < block_size {
            let mut probe = [0u8; 1];
            if source.read(&mut probe)? != 0 {
                return Err(Error::Protocol(format!(
                    "firmware source returned {read} of {block_size} bytes before end of image"
                )));
            }
            data[read..].fill(0xFF);
        }

        #[allow(clippy::cast_possible_truncation)]
        let seq = self.packet_num as u8;
        buffer[0] = self
            .flags
            .block_size
            .start_byte();
        buffer[1] = seq;
        buffer[2] = !seq;

        let trailer = HEADER_LEN + block_size;
        let data = &buffer[HEADER_LEN..trailer];
        if self.uses_crc() {
            let crc = crc16_xmodem(data);
            buffer[trailer..trailer + 2].copy_from_slice(&crc.to_be_bytes());
        } else {
            buffer[trailer] = checksum8(data);
        }
        Ok(true)
    }

    fn abort<S: Stream + ?Sized>(&mut self, stream: &mut S) {
        self.state = XmodemState::Failure;
        if let Err(e) = stream.write(&[control::CAN, control::CAN]) {
            warn!("Failed to send CAN: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{image::source::BufferSource, testing::MockPort};

    fn payload(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i % 251) as u8)
            .collect()
    }

    fn crc_sender() -> XmodemSender {
        XmodemSender::new(XmodemFlags::new(BlockSize::Standard, true))
    }

    fn tick(
        tx: &mut XmodemSender,
        buf: &mut [u8],
        src: &mut BufferSource,
        port: &mut MockPort,
    ) -> Result<Status> {
        let now = port.now;
        tx.tick(buf, src, port, now)
    }

    #[test]
    fn test_crc_packet_layout() {
        let data = payload(100);
        let mut src = BufferSource::new(data.clone());
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        assert_eq!(tick(&mut tx, &mut buf, &mut src, &mut port).unwrap(), Status::Pending);
        assert!(port.tx.is_empty());

        port.push_rx(&[control::C]);
        assert_eq!(tick(&mut tx, &mut buf, &mut src, &mut port).unwrap(), Status::Pending);
        assert_eq!(tx.state(), XmodemState::WaitAck);

        let pkt = port.take_tx();
        assert_eq!(pkt.len(), 133);
        assert_eq!(&pkt[..3], &[control::SOH, 0x01, 0xFE]);
        assert_eq!(&pkt[3..103], &data[..]);
        assert!(pkt[103..131].iter().all(|&b| b == 0xFF));
        let crc = crc16_xmodem(&pkt[3..131]);
        assert_eq!(&pkt[131..], &crc.to_be_bytes());
    }

    #[test]
    fn test_checksum_mode_small_blocks() {
        let data = payload(64);
        let mut src = BufferSource::new(data.clone());
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = XmodemSender::new(XmodemFlags::new(BlockSize::Small, false));

        port.push_rx(&[control::NAK]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert!(!tx.uses_crc());

        let pkt = port.take_tx();
        assert_eq!(pkt.len(), 68);
        assert_eq!(pkt[0], control::SOH);
        assert_eq!(pkt[67], checksum8(&data));
    }

    #[test]
    fn test_large_blocks_use_stx() {
        let mut src = BufferSource::new(payload(2000));
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = XmodemSender::new(XmodemFlags::new(BlockSize::Large, false));

        port.push_rx(&[control::C]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        let pkt = port.take_tx();
        assert_eq!(pkt.len(), MAX_PACKET_SIZE);
        assert_eq!(pkt[0], control::STX);
    }

    #[test]
    fn test_forced_crc_ignores_nak() {
        let mut src = BufferSource::new(payload(10));
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        port.push_rx(&[control::NAK]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.state(), XmodemState::Start);
        assert!(port.tx.is_empty());

        port.push_rx(&[control::C]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.state(), XmodemState::WaitAck);
    }

    #[test]
    fn test_nak_twice_resends_identical_packet() {
        let mut src = BufferSource::new(payload(128));
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        port.push_rx(&[control::C]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        let first = port.take_tx();

        for _ in 0..2 {
            port.push_rx(&[control::NAK]);
            tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
            assert_eq!(tx.state(), XmodemState::Resend);
            tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
            assert_eq!(port.take_tx(), first);
            assert_eq!(tx.packet_num(), 1);
        }

        port.push_rx(&[control::ACK]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.packet_num(), 2);

        // no data left: EOT goes out
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(port.take_tx(), vec![control::EOT]);

        port.push_rx(&[control::ACK]);
        assert_eq!(tick(&mut tx, &mut buf, &mut src, &mut port).unwrap(), Status::Complete);
        assert_eq!(tick(&mut tx, &mut buf, &mut src, &mut port).unwrap(), Status::Complete);
    }

    #[test]
    fn test_never_acked_cancels() {
        let mut src = BufferSource::new(payload(300));
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        port.push_rx(&[control::C]);
        let mut result = Ok(Status::Pending);
        for _ in 0..100 {
            result = tick(&mut tx, &mut buf, &mut src, &mut port);
            if result.is_err() {
                break;
            }
            port.advance(ACK_TIMEOUT_MS);
        }

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(tx.state(), XmodemState::Failure);
        let wire = port.take_tx();
        assert_eq!(&wire[wire.len() - 2..], &[control::CAN, control::CAN]);
        // three transmissions of packet 1, then the cancel
        assert_eq!(wire.len(), 3 * 133 + 2);

        assert!(matches!(
            tick(&mut tx, &mut buf, &mut src, &mut port),
            Err(Error::Cancelled)
        ));
        assert!(port.tx.is_empty());
    }

    #[test]
    fn test_ack_timeout_counts_as_retry() {
        let mut src = BufferSource::new(payload(128));
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        port.push_rx(&[control::C]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();

        port.advance(ACK_TIMEOUT_MS - 1);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.state(), XmodemState::WaitAck);

        port.advance(1);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.state(), XmodemState::Resend);
    }

    #[test]
    fn test_partial_writes_resume() {
        let data = payload(128);
        let mut src = BufferSource::new(data.clone());
        let mut port = MockPort::new();
        port.write_chunk = Some(50);
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        port.push_rx(&[control::C]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.state(), XmodemState::Sending);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.state(), XmodemState::WaitAck);

        let pkt = port.take_tx();
        assert_eq!(pkt.len(), 133);
        assert_eq!(&pkt[3..131], &data[..]);
    }

    #[test]
    fn test_eot_retried_then_acked() {
        let mut src = BufferSource::new(Vec::new());
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        port.push_rx(&[control::C]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(port.take_tx(), vec![control::EOT]);

        port.push_rx(&[control::NAK]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(port.take_tx(), vec![control::EOT]);

        port.push_rx(&[control::ACK]);
        assert_eq!(tick(&mut tx, &mut buf, &mut src, &mut port).unwrap(), Status::Complete);
    }

    /// Source that hands out at most `chunk` bytes per read.
    struct ChunkySource {
        inner: BufferSource,
        chunk: usize,
    }

    impl FirmwareSource for ChunkySource {
        fn seek(&mut self, offset: u32) -> Result<()> {
            self.inner.seek(offset)
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_short_read_before_end_is_fatal() {
        let mut src = ChunkySource {
            inner: BufferSource::new(payload(200)),
            chunk: 50,
        };
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        port.push_rx(&[control::C]);
        let now = port.now;
        let result = tx.tick(&mut buf, &mut src, &mut port, now);
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(port.take_tx(), vec![control::CAN, control::CAN]);
    }

    #[test]
    fn test_accept_start_consumed_by_caller() {
        let mut src = BufferSource::new(payload(10));
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender();

        assert!(!tx.accept_start(b'x'));
        assert!(!tx.accept_start(control::NAK));
        assert!(tx.accept_start(control::C));
        assert!(!tx.accept_start(control::C));

        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(port.tx.len(), 133);
    }

    #[test]
    fn test_flush_drops_stale_bytes() {
        let mut src = BufferSource::new(payload(10));
        let mut port = MockPort::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut tx = crc_sender().with_flush();

        // a stale 'C' from before the transfer is not a start request
        port.push_rx(&[control::C, b'>', control::C]);
        tick(&mut tx, &mut buf, &mut src, &mut port).unwrap();
        assert_eq!(tx.state(), XmodemState::Start);
        assert!(port.tx.is_empty());
    }

    #[test]
    fn test_buffer_too_small() {
        let mut src = BufferSource::new(payload(10));
        let mut port = MockPort::new();
        let mut buf = [0u8; 64];
        let mut tx = crc_sender();
        assert!(matches!(
            tick(&mut tx, &mut buf, &mut src, &mut port),
            Err(Error::InvalidState(_))
        ));
    }
}
