//! Frame codec for the sprite exec stream.
//!
//! The sprite API multiplexes stdout, stderr and the process exit code onto
//! one byte stream. Each frame starts with a one-byte tag:
//!
//!   1 + data  = stdout chunk (until the next tag byte or end of input)
//!   2 + data  = stderr chunk
//!   3 + code  = exit marker, exactly one payload byte
//!
//! Frames may be split arbitrarily across network reads, so the decoder is a
//! streaming state machine fed with whatever slice arrived.

/// Tag byte for stdout chunks.
pub const TAG_STDOUT: u8 = 1;
/// Tag byte for stderr chunks.
pub const TAG_STDERR: u8 = 2;
/// Tag byte for the exit marker.
pub const TAG_EXIT: u8 = 3;

/// Single byte written to the agent to request an interrupt.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// A decoded frame from the sprite stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// No tag seen yet. Untagged leading bytes are treated as stdout.
    Idle,
    Stdout,
    Stderr,
    /// Exit tag seen, the next byte is the exit code.
    AwaitExitCode,
}

/// Streaming decoder for the multiplexed sprite stream.
///
/// Feed it byte slices as they arrive; it emits complete frames and carries
/// channel state across read boundaries. Zero-length chunks (a tag byte
/// immediately followed by another tag) emit nothing.
#[derive(Debug)]
pub struct FrameDecoder {
    state: ChannelState,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Idle,
        }
    }

    /// Decode as many frames as `bytes` completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            if self.state == ChannelState::AwaitExitCode {
                frames.push(Frame::Exit(bytes[i]));
                self.state = ChannelState::Idle;
                i += 1;
                continue;
            }

            match bytes[i] {
                TAG_STDOUT => {
                    self.state = ChannelState::Stdout;
                    i += 1;
                }
                TAG_STDERR => {
                    self.state = ChannelState::Stderr;
                    i += 1;
                }
                TAG_EXIT => {
                    self.state = ChannelState::AwaitExitCode;
                    i += 1;
                }
                _ => {
                    let end = bytes[i..]
                        .iter()
                        .position(|&b| b == TAG_STDOUT || b == TAG_STDERR || b == TAG_EXIT)
                        .map(|p| i + p)
                        .unwrap_or(bytes.len());
                    let chunk = bytes[i..end].to_vec();
                    match self.state {
                        ChannelState::Stderr => frames.push(Frame::Stderr(chunk)),
                        // Untagged bytes before any tag surface as stdout.
                        ChannelState::Idle | ChannelState::Stdout => {
                            frames.push(Frame::Stdout(chunk))
                        }
                        ChannelState::AwaitExitCode => unreachable!(),
                    }
                    i = end;
                }
            }
        }

        frames
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles newline-delimited text from stdout chunks.
///
/// Output chunks may end mid-line; partial trailing text is buffered until a
/// newline arrives. On stream end the remainder is flushed as-is.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and drain every complete line it finishes.
    ///
    /// Lines are returned without their trailing newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop(); // trailing newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush buffered partial text, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let buf = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}
