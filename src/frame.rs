//! Inbound byte-stream framing for the text protocols.
//!
//! - [`LineSplitter`]: buffers partial lines across reads and splits on CR
//!   and/or LF.
//! - [`TelnetFilter`]: removes telnet option negotiation from the inbound
//!   stream and produces the refusals to send back.

/// Longest line kept in the buffer before it is flushed unterminated.
pub const MAX_LINE: usize = 4096;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Splits a byte stream into lines. Buffers partial data across calls, so it
/// can be fed arbitrary read boundaries.
///
/// Any run of CR/LF bytes terminates a line; empty lines are dropped.
/// Invalid UTF-8 is replaced rather than rejected so that nothing received is
/// lost.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }

    /// Feed new data and extract any complete lines, without terminators.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();

        loop {
            let Some(end) = self.buf.iter().position(|&b| b == CR || b == LF) else {
                if self.buf.len() > MAX_LINE {
                    lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                    self.buf.clear();
                }
                break;
            };
            if end > 0 {
                lines.push(String::from_utf8_lossy(&self.buf[..end]).into_owned());
            }
            // Swallow the terminator run ("\r\n", "\r\r\n", ...).
            let skip = self.buf[end..].iter().take_while(|&&b| b == CR || b == LF).count();
            self.buf.drain(..end + skip);
        }
        lines
    }

    /// Bytes received after the last terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Discard buffered data (after a reconnect).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ---------------------------------------------------------------------------
// Telnet
// ---------------------------------------------------------------------------

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum State {
    #[default]
    Data,
    Iac,
    Verb(u8),
    Sub,
    SubIac,
}

/// Output of [`TelnetFilter::filter`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Filtered {
    /// Application data with all negotiation removed.
    pub data: Vec<u8>,
    /// Negotiation replies to write back to the peer.
    pub replies: Vec<u8>,
}

/// Stateful telnet option filter that refuses every option.
///
/// `DO x` is answered with `WONT x` and `WILL x` with `DONT x`; subnegotiation
/// blocks and other commands are dropped. State carries over between calls,
/// so a sequence split across reads is handled.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: State,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&mut self, input: &[u8]) -> Filtered {
        let mut out = Filtered::default();
        for &b in input {
            self.state = match (self.state, b) {
                (State::Data, IAC) => State::Iac,
                (State::Data, _) => {
                    out.data.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.data.push(IAC);
                    State::Data
                }
                (State::Iac, DO | DONT | WILL | WONT) => State::Verb(b),
                (State::Iac, SB) => State::Sub,
                (State::Iac, _) => State::Data,
                (State::Verb(verb), option) => {
                    match verb {
                        DO => out.replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => out.replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
        out
    }

    pub fn reset(&mut self) {
        self.state = State::Data;
    }
}

/// Escape outbound data: a literal 0xFF is sent as `IAC IAC`.
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
