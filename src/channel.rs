use std::fmt;
use std::io::{self, ErrorKind, Read, Write};

/// Size of the little-endian length prefix in front of every frame.
pub const PREFIX_LEN: usize = 4;

/// Errors that can occur while moving frames over the byte streams.
#[derive(Debug)]
pub enum ChannelError {
    Io(io::Error),
    /// The peer announced a frame larger than we are willing to buffer. The
    /// payload has already been skipped, so the stream is still in sync.
    Oversized { len: usize, max: usize },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Io(err) => write!(f, "channel io error: {err}"),
            ChannelError::Oversized { len, max } => {
                write!(f, "frame of {len} bytes exceeds the {max} byte limit")
            }
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(err) => Some(err),
            ChannelError::Oversized { .. } => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(value: io::Error) -> Self {
        ChannelError::Io(value)
    }
}

/// Progress through the frame currently being read. Kept across calls so a
/// transient read error resumes the same frame instead of losing sync.
enum ReadState {
    Prefix { buf: [u8; PREFIX_LEN], filled: usize },
    Payload { buf: Vec<u8>, filled: usize },
    Skip { len: usize, remaining: usize },
}

impl ReadState {
    fn start() -> Self {
        ReadState::Prefix {
            buf: [0; PREFIX_LEN],
            filled: 0,
        }
    }
}

/// Length-prefixed duplex channel: `[u32 LE length][payload]` in both directions.
pub struct FramedChannel<R, W> {
    reader: R,
    writer: W,
    max_message_bytes: usize,
    state: ReadState,
}

impl<R: Read, W: Write> FramedChannel<R, W> {
    pub fn new(reader: R, writer: W, max_message_bytes: usize) -> Self {
        Self {
            reader,
            writer,
            max_message_bytes,
            state: ReadState::start(),
        }
    }

    /// Blocks until a whole frame arrives.
    ///
    /// Returns `Ok(None)` when the input ends cleanly on a frame boundary. A
    /// stream that ends part way through a prefix or payload is an error, and
    /// the partial frame is dropped. Any other read error leaves the partial
    /// frame in place, and the next call carries on from where it stopped.
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        loop {
            match &mut self.state {
                ReadState::Prefix { buf, filled } => {
                    if *filled == PREFIX_LEN {
                        let len = u32::from_le_bytes(*buf) as usize;
                        self.state = if len > self.max_message_bytes {
                            ReadState::Skip {
                                len,
                                remaining: len,
                            }
                        } else {
                            ReadState::Payload {
                                buf: vec![0; len],
                                filled: 0,
                            }
                        };
                        continue;
                    }
                    if !fill(&mut self.reader, buf, filled)? {
                        if *filled == 0 {
                            return Ok(None);
                        }
                        let msg = format!("stream closed after {filled} of {PREFIX_LEN} prefix bytes");
                        return Err(self.truncated(msg));
                    }
                }
                ReadState::Payload { buf, filled } => {
                    if *filled == buf.len() {
                        let payload = std::mem::take(buf);
                        self.state = ReadState::start();
                        return Ok(Some(payload));
                    }
                    if !fill(&mut self.reader, buf, filled)? {
                        let msg = format!("stream closed after {filled} of {} payload bytes", buf.len());
                        return Err(self.truncated(msg));
                    }
                }
                ReadState::Skip { len, remaining } => {
                    if *remaining == 0 {
                        let len = *len;
                        self.state = ReadState::start();
                        return Err(ChannelError::Oversized {
                            len,
                            max: self.max_message_bytes,
                        });
                    }
                    let mut scratch = [0u8; 8192];
                    let want = (*remaining).min(scratch.len());
                    match self.reader.read(&mut scratch[..want]) {
                        Ok(0) => {
                            let msg = format!(
                                "stream closed after {} of {len} payload bytes",
                                *len - *remaining
                            );
                            return Err(self.truncated(msg));
                        }
                        Ok(n) => *remaining -= n,
                        Err(err) if err.kind() == ErrorKind::Interrupted => {}
                        Err(err) => return Err(ChannelError::Io(err)),
                    }
                }
            }
        }
    }

    /// Writes the prefix, then the payload, then flushes.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let len = u32::try_from(payload.len()).map_err(|_| ChannelError::Oversized {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }

    /// Drops the partial frame; the next call starts at a fresh prefix.
    fn truncated(&mut self, msg: String) -> ChannelError {
        self.state = ReadState::start();
        ChannelError::Io(io::Error::new(ErrorKind::UnexpectedEof, msg))
    }
}

/// Reads into `buf[*filled..]` until it is full. Returns false on EOF.
fn fill(reader: &mut impl Read, buf: &mut [u8], filled: &mut usize) -> io::Result<bool> {
    while *filled < buf.len() {
        match reader.read(&mut buf[*filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => *filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}
