//! Host commands: line assembly from the serial byte stream, and `NMR(pulse_ms,read_ms)` parsing.

use core::fmt;

/// Longest accepted command line, terminator excluded
pub const MAX_LINE_LEN: usize = 63;

/// Reply sent for any line which is not a valid command
pub const USAGE_ERROR: &str = "ERROR: Invalid command format. Use: NMR(pulse_ms,read_ms)";

/// A rejected command line
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// The line does not match `NMR(<pulse_ms>,<read_ms>)`
    Malformed,
    /// The line exceeded [`MAX_LINE_LEN`] bytes and was discarded
    LineTooLong,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Malformed => f.write_str("malformed command"),
            CommandError::LineTooLong => {
                write!(f, "command longer than {MAX_LINE_LEN} bytes")
            }
        }
    }
}

/// A full excitation + acquisition run request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NmrCommand {
    /// Length of the excitation pulse, in milliseconds
    pub pulse_ms: u32,
    /// Length of the acquisition window, in milliseconds
    pub read_ms: u32,
}

impl NmrCommand {
    /// Parse `NMR(<pulse_ms>,<read_ms>)`. Whitespace is allowed around the line and around
    /// each number.
    ///
    /// ```
    /// use nmr_pulse_engine::command::NmrCommand;
    ///
    /// let cmd = NmrCommand::parse("NMR(5, 100)").unwrap();
    /// assert_eq!((cmd.pulse_ms, cmd.read_ms), (5, 100));
    /// ```
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let (pulse, read) = line
            .trim()
            .strip_prefix("NMR(")
            .and_then(|args| args.strip_suffix(')'))
            .and_then(|args| args.split_once(','))
            .ok_or(CommandError::Malformed)?;
        Ok(Self {
            pulse_ms: parse_ms(pulse)?,
            read_ms: parse_ms(read)?,
        })
    }
}

/// Parse a non-negative decimal duration
fn parse_ms(field: &str) -> Result<u32, CommandError> {
    let digits = field.trim();
    // `u32::from_str` would also take a leading '+'
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CommandError::Malformed);
    }
    digits.parse().map_err(|_| CommandError::Malformed)
}

/// Assembles command lines from serial bytes. Lines end at `\n` or `\r`; empty lines are
/// skipped.
pub struct LineReader {
    /// Bytes of the current line
    line: [u8; MAX_LINE_LEN],
    /// Used length of `line`
    len: usize,
    /// The current line is too long and is being skipped
    overflowed: bool,
}

impl LineReader {
    /// Empty reader
    pub const fn new() -> Self {
        Self {
            line: [0; MAX_LINE_LEN],
            len: 0,
            overflowed: false,
        }
    }

    /// Feed one byte. Returns the parsed command when `byte` ends a non-empty line.
    pub fn push(&mut self, byte: u8) -> Option<Result<NmrCommand, CommandError>> {
        match byte {
            b'\n' | b'\r' => {
                let len = core::mem::take(&mut self.len);
                if core::mem::take(&mut self.overflowed) {
                    return Some(Err(CommandError::LineTooLong));
                }
                if len == 0 {
                    return None;
                }
                Some(
                    core::str::from_utf8(&self.line[..len])
                        .map_err(|_| CommandError::Malformed)
                        .and_then(NmrCommand::parse),
                )
            }
            _ if self.overflowed => None,
            _ if self.len == MAX_LINE_LEN => {
                self.overflowed = true;
                None
            }
            _ => {
                self.line[self.len] = byte;
                self.len += 1;
                None
            }
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}
