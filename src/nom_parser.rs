use nom::bytes::complete::take_till;
use nom::bytes::streaming::take;
use nom::character::complete::char;
use nom::number::streaming::le_u16;
use nom::sequence::terminated;
use nom::IResult;

use crate::types::MAX_KEY_LEN;
use crate::{FRAME_OVERHEAD, SYNC_MARKER};

type Buf = [u8];
type Res<'a, O> = IResult<&'a Buf, O>;

#[derive(PartialEq, Debug, Copy, Clone)]
enum Envelope<'a> {
    Sync,
    InvalidSize(u16),
    Frame { payload: &'a Buf, crc: u16 },
}

pub(crate) mod node {
    use super::*;
    use FrameToken::*;

    #[derive(PartialEq, Debug, Copy, Clone)]
    pub(crate) enum FrameToken<'a> {
        /// This many more bytes are needed before the frame is complete.
        NeedData(usize),
        SyncMarker,
        InvalidSize(u16),
        CrcMismatch,
        NoSeparator,
        KeyTooLong,
        Command { key: &'a Buf, body: &'a Buf },
    }

    /// Parse the frame at the start of `buf`. Returns the number of bytes the
    /// frame occupies on the wire along with the token, zero when more data is
    /// needed.
    pub(crate) fn parse_frame<F>(buf: &Buf, crc: F) -> (usize, FrameToken<'_>)
    where
        F: Fn(&Buf) -> u16,
    {
        match envelope(buf, crate::MIN_PAYLOAD) {
            Ok((remaining, env)) => {
                let token = match env {
                    Envelope::Sync => SyncMarker,
                    Envelope::InvalidSize(size) => InvalidSize(size),
                    Envelope::Frame { payload, crc: received } if crc(payload) != received => {
                        CrcMismatch
                    }
                    Envelope::Frame { payload, .. } => command(payload),
                };
                (buf.len() - remaining.len(), token)
            }
            Err(_) => (0, NeedData(shortfall(buf))),
        }
    }

    fn command(payload: &Buf) -> FrameToken<'_> {
        match key_separator(payload) {
            Ok((_, key)) if key.len() > MAX_KEY_LEN => KeyTooLong,
            Ok((body, key)) => Command { key, body },
            Err(_) => NoSeparator,
        }
    }

    fn key_separator(payload: &Buf) -> Res<&Buf> {
        terminated(take_till(|c: u8| c == b':'), char(':'))(payload)
    }

}

pub(crate) mod master {
    use super::*;

    #[derive(PartialEq, Debug, Copy, Clone)]
    pub(crate) enum ReplyToken<'a> {
        NeedData(usize),
        Reply(&'a Buf),
        UnexpectedLength(u16),
        CrcMismatch,
    }

    /// Parse a reply frame that should carry exactly `expected` payload bytes.
    pub(crate) fn parse_reply(buf: &Buf, expected: usize) -> ReplyToken<'_> {
        match size_field(buf) {
            Ok((_, size)) if usize::from(size) != expected => {
                return ReplyToken::UnexpectedLength(size)
            }
            Ok(_) => (),
            Err(_) => return ReplyToken::NeedData(shortfall(buf)),
        }
        match envelope(buf, 0) {
            Ok((_, Envelope::Frame { payload, crc })) if crate::crc16(payload) == crc => {
                ReplyToken::Reply(payload)
            }
            Ok((_, Envelope::Frame { .. })) => ReplyToken::CrcMismatch,
            Ok((_, _)) => ReplyToken::UnexpectedLength(crate::SYNC_MARKER),
            Err(_) => ReplyToken::NeedData(shortfall(buf)),
        }
    }

}

fn envelope(buf: &Buf, min_size: usize) -> Res<Envelope<'_>> {
    let (buf, size) = size_field(buf)?;
    if size == SYNC_MARKER {
        return Ok((buf, Envelope::Sync));
    }
    if usize::from(size) < min_size {
        return Ok((buf, Envelope::InvalidSize(size)));
    }
    let (buf, payload) = payload(buf, size)?;
    let (buf, crc) = size_field(buf)?;
    Ok((buf, Envelope::Frame { payload, crc }))
}

fn size_field(buf: &Buf) -> Res<u16> {
    le_u16(buf)
}

fn payload(buf: &Buf, size: u16) -> Res<&Buf> {
    take(size)(buf)
}

/// Bytes missing from `buf` before the frame it starts with is complete.
fn shortfall(buf: &Buf) -> usize {
    match buf {
        [lo, hi, ..] => {
            let total = usize::from(u16::from_le_bytes([*lo, *hi])) + FRAME_OVERHEAD;
            total.saturating_sub(buf.len())
        }
        _ => 2 - buf.len(),
    }
}
