use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use crate::error::Error;

/// Wire settings for the RockBLOCK: 19200 8-N-1.
pub const BAUD_RATE: u32 = 19200;

/// Default read timeout. The driver raises this to 60 s once the modem is
/// configured, because SBD sessions can hold the line for tens of seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait that hides the serial transport from the driver.
///
/// The driver only ever needs framed CR-terminated lines plus a couple of
/// port controls, so that is all this trait exposes. Production code uses
/// [`UartLine`]; tests script the dialogue with a stub.
pub trait SerialLine: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Read one line, with trailing CR/LF stripped.
    ///
    /// A read timeout with nothing buffered is an error. A timeout after
    /// some bytes arrived returns the partial buffer as a line: the binary
    /// `AT+SBDRB` response carries no terminator of its own, and the
    /// driver reassembles it from exactly this behaviour.
    fn read_line(&mut self) -> Result<Vec<u8>, Error>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Discard anything sitting in the input buffer.
    fn reset_input_buffer(&mut self) -> Result<(), Error>;

    fn is_open(&self) -> bool;
}

/// [`SerialLine`] over a real UART.
pub struct UartLine {
    port: Box<dyn serialport::SerialPort>,
}

impl UartLine {
    /// Open `device` at 19200 8-N-1 with the default timeout.
    pub fn open(device: &str) -> Result<UartLine, Error> {
        let port = serialport::new(device, BAUD_RATE)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;
        Ok(UartLine { port })
    }
}

impl SerialLine for UartLine {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, Error> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => {
                    if line.is_empty() {
                        return Err(Error::SerialIo("end of stream".to_string()));
                    }
                    break;
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if line.is_empty() {
                        return Err(Error::SerialIo("read timed out".to_string()));
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        while let Some(&last) = line.last() {
            if last == b'\r' || last == b'\n' {
                line.pop();
            } else {
                break;
            }
        }
        Ok(line)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Candidate serial devices for modem probing, most likely first.
///
/// `COM1`..`COM256` on Windows, `/dev/tty[A-Za-z]*` on Linux and Cygwin,
/// `/dev/tty.*` on macOS. The queue manager opens each in turn and keeps
/// the first that succeeds.
pub fn candidate_ports() -> Vec<String> {
    #[cfg(windows)]
    {
        (1..=256).map(|i| format!("COM{}", i)).collect()
    }
    #[cfg(not(windows))]
    {
        let mut ports: Vec<String> = Vec::new();
        let entries = match std::fs::read_dir("/dev") {
            Ok(entries) => entries,
            Err(_) => return ports,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let matches = if cfg!(target_os = "macos") {
                name.starts_with("tty.")
            } else {
                name.strip_prefix("tty")
                    .and_then(|rest| rest.chars().next())
                    .map(|c| c.is_ascii_alphabetic())
                    .unwrap_or(false)
            };
            if matches {
                ports.push(format!("/dev/{}", name));
            }
        }
        ports.sort();
        ports
    }
}
