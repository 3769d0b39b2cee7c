use anyhow::bail;
use bytes::{BufMut, BytesMut};

/// frame boundary byte - a frame is `END .. escaped payload .. END`
pub const END: u8 = 0xC0;
/// escape introducer inside a frame
pub const ESC: u8 = 0xDB;
/// second byte of the escape sequence standing in for a literal `END`
pub const ESC_END: u8 = 0xDC;
/// second byte of the escape sequence standing in for a literal `ESC`
pub const ESC_ESC: u8 = 0xDD;

/// Wraps a payload in SLIP framing: an `END` delimiter on both sides, with
///  every payload occurrence of `END` and `ESC` replaced by its two-byte
///  escape sequence. This guarantees that `END` appears on the wire only at
///  frame boundaries.
pub fn encode(payload: &[u8], buf: &mut BytesMut) {
    buf.put_u8(END);
    for &b in payload {
        match b {
            END => {
                buf.put_u8(ESC);
                buf.put_u8(ESC_END);
            }
            ESC => {
                buf.put_u8(ESC);
                buf.put_u8(ESC_ESC);
            }
            _ => buf.put_u8(b),
        }
    }
    buf.put_u8(END);
}

/// Strips the delimiters off a complete frame and resolves escape sequences.
///
/// The input must be a single whole frame including both `END` delimiters,
///  which is what the frame assembler emits.
pub fn decode(frame: &[u8]) -> anyhow::Result<Vec<u8>> {
    if frame.len() < 2 {
        bail!("frame is too short to be SLIP encoded: {} bytes", frame.len());
    }
    if frame[0] != END || frame[frame.len() - 1] != END {
        bail!("frame is not delimited by END bytes");
    }

    let mut payload = Vec::with_capacity(frame.len() - 2);
    let mut bytes = frame[1..frame.len() - 1].iter();

    while let Some(&b) = bytes.next() {
        match b {
            END => bail!("unescaped END byte inside a frame"),
            ESC => match bytes.next() {
                Some(&ESC_END) => payload.push(END),
                Some(&ESC_ESC) => payload.push(ESC),
                Some(&other) => bail!("invalid escape sequence 0x{:02x} 0x{:02x}", ESC, other),
                None => bail!("frame ends in the middle of an escape sequence"),
            },
            _ => payload.push(b),
        }
    }

    Ok(payload)
}
