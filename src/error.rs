use std::io;

use thiserror::Error;

/// Everything that can go wrong inside the messaging core.
///
/// Driver operations report failure through their boolean / `Option`
/// results and the event callbacks; this type surfaces only where a caller
/// can actually act on it (`RockBlock::open`, the serial layer, the store).
#[derive(Debug, Error)]
pub enum Error {
    /// The serial port has been closed (or never opened).
    #[error("serial port is closed")]
    PortClosed,

    /// The modem did not come up through the initial AT handshake.
    #[error("failed to initialise the RockBLOCK modem: {0}")]
    DriverInit(String),

    /// A command echo did not match what was sent.
    #[error("incorrect echo for {command}: {response}")]
    EchoMismatch { command: String, response: String },

    /// The modem answered with something the dialogue does not allow here.
    #[error("unexpected response to {command}: {response}")]
    UnexpectedResponse { command: String, response: String },

    /// An SBD payload exceeded the 340-byte MO limit.
    #[error("message is {0} bytes, longer than the 340-byte SBD limit")]
    MessageTooLong(usize),

    /// An SBD session did not complete.
    #[error("SBD session failed")]
    SessionFailed,

    /// No usable signal after the full rescan schedule.
    #[error("no usable satellite signal")]
    NoSignal,

    /// Low-level serial I/O failure, surfaced after the power backoff retries.
    #[error("serial I/O error: {0}")]
    SerialIo(String),

    /// Mailbox store I/O failure.
    #[error("filesystem error on {path}: {source}")]
    FilesystemIo {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A received blob or modem response that could not be parsed.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Board I/O (ring indicator / LED) setup failure.
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::SerialIo(e.to_string())
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::SerialIo(e.to_string())
    }
}
