use std::io::{self, Read, Write};

/// Upper bound on a single response; a status report is far smaller.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Write `payload` as one framed message: little-endian u32 length, then bytes.
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_MESSAGE_BYTES)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads exactly one framed message and then reports end of stream, no
/// matter what else the transport still has or whether it stays open.
pub struct MessageReader<R> {
    inner: R,
    remaining: Option<usize>,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, remaining: None }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == Some(0)
    }
}

impl<R: Read> Read for MessageReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => {
                let mut header = [0u8; 4];
                self.inner.read_exact(&mut header)?;
                let len = u32::from_le_bytes(header) as usize;
                if len > MAX_MESSAGE_BYTES {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
                }
                self.remaining = Some(len);
                len
            }
        };
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = remaining.min(buf.len());
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed before the message was complete",
            ));
        }
        self.remaining = Some(remaining - n);
        Ok(n)
    }
}
