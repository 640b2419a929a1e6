//! RockBLOCK 9602/9603 AT-protocol driver.
//!
//! The modem speaks a half-duplex, line-oriented AT dialect over the
//! serial line. Every command is written as `<CMD>\r` and answered, in
//! order, by the exact command echo, zero or more response lines, a blank
//! line and the literal `OK`. Anything else means the dialogue is out of
//! sync, and the driver either resynchronises with pings or fails the
//! operation.
//!
//! All operations block the calling thread; the queue-manager worker is
//! the only caller in the appliance, which keeps at most one AT dialogue
//! in flight at a time.

use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::Error;
use crate::serial::{SerialLine, UartLine};

/// Largest mobile-originated SBD payload the 9602/9603 accepts.
pub const MAX_PAYLOAD: usize = 340;

/// Signal bars needed before a session is worth attempting.
pub const SIGNAL_THRESHOLD: i32 = 2;

// Retry schedule. The Iridium constellation comes and goes overhead, so
// most failures are cured by waiting, not by hammering the modem.
const TIME_ATTEMPTS: u32 = 20;
const TIME_DELAY: Duration = Duration::from_secs(1);
const SIGNAL_ATTEMPTS: u32 = 10;
const RESCAN_DELAY: Duration = Duration::from_secs(10);
const SYNC_COMMS_ATTEMPTS: u32 = 3;
const SESSION_ATTEMPTS: u32 = 3;
const SESSION_DELAY: Duration = Duration::from_secs(1);

/// Backoff after a hard serial error; under-powered boards drop the UART
/// when the modem draws transmit current.
const POWER_BACKOFF: Duration = Duration::from_secs(40);

/// Timeout once the modem is configured. SBD sessions can hold the line
/// for tens of seconds.
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Callbacks fired while driver operations run.
///
/// All methods have empty default bodies; implement the ones you care
/// about. `()` implements the trait for operations where nobody is
/// listening.
pub trait RockBlockEvents {
    /// The modem answered the startup handshake.
    fn connected(&mut self) {}
    /// A fresh signal reading, 0-5 bars, or -1 for a failed reading.
    fn signal_update(&mut self, _signal: i32) {}
    fn rx_started(&mut self) {}
    fn rx_failed(&mut self) {}
    /// A mobile-terminated message arrived, still in wire form.
    fn rx_received(&mut self, _mtmsn: i32, _data: &[u8]) {}
    /// Messages still queued at the gateway after a session.
    fn rx_message_queue(&mut self, _count: i32) {}
    fn tx_started(&mut self) {}
    /// MO status code of a failed send, or -1 when the whole operation
    /// gave up.
    fn tx_failed(&mut self, _mo_status: i32) {}
    fn tx_success(&mut self, _momsn: i32) {}
}

impl RockBlockEvents for () {}

/// Where the driver sits in the SBD session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    OpenUnconfigured,
    Ready,
    InSession,
}

/// Driver for a RockBLOCK 9602/9603 on a serial line.
pub struct RockBlock {
    line: Box<dyn SerialLine>,
    state: SessionState,
    /// Keep running sessions while the gateway reports more queued MT
    /// messages.
    pub auto_session: bool,
}

impl RockBlock {
    /// Open `device` and bring the modem up.
    ///
    /// Enables echo and ring alerts, disables flow control, consumes any
    /// stale output with a sacrificial ping, then confirms the modem
    /// answers with the 60-second session timeout in place. Fires
    /// `connected` on success.
    ///
    /// # Errors
    ///
    /// [`Error::SerialIo`] when the port cannot be opened,
    /// [`Error::DriverInit`] when the handshake fails.
    pub fn open(device: &str, events: &mut dyn RockBlockEvents) -> Result<RockBlock, Error> {
        let line = UartLine::open(device)?;
        RockBlock::from_line(Box::new(line), events)
    }

    /// Bring the modem up on an already-open [`SerialLine`].
    pub fn from_line(
        line: Box<dyn SerialLine>,
        events: &mut dyn RockBlockEvents,
    ) -> Result<RockBlock, Error> {
        let mut modem = RockBlock {
            line,
            state: SessionState::OpenUnconfigured,
            auto_session: true,
        };

        if !modem.configure_port() {
            return Err(Error::DriverInit("port configuration failed".to_string()));
        }

        // Sacrificial ping: the response may be garbled by whatever was
        // in flight before we attached, so the result is ignored.
        let _ = modem.ping();

        modem.line.set_timeout(SESSION_TIMEOUT)?;
        if !modem.ping() {
            return Err(Error::DriverInit(
                "modem did not answer the confirming ping".to_string(),
            ));
        }

        modem.state = SessionState::Ready;
        events.connected();
        Ok(modem)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != SessionState::Closed && self.line.is_open()
    }

    /// Stop talking to the modem. Further operations fail with
    /// [`Error::PortClosed`].
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Check the modem still answers.
    pub fn ping(&mut self) -> bool {
        self.send_and_ack(b"AT")
    }

    /// Measure signal strength: 0-5 bars, -1 on failure. Fires
    /// `signal_update` with the reading either way.
    pub fn request_signal_strength(&mut self, events: &mut dyn RockBlockEvents) -> i32 {
        let signal = self.do_request_signal_strength();
        debug!("signal strength is {}", signal);
        events.signal_update(signal);
        signal
    }

    /// Poll signal strength until it reaches [`SIGNAL_THRESHOLD`], up to
    /// 10 tries 10 seconds apart.
    pub fn wait_for_good_signal(&mut self, events: &mut dyn RockBlockEvents) -> bool {
        let mut retries = 0;
        loop {
            if self.request_signal_strength(events) >= SIGNAL_THRESHOLD {
                return true;
            }
            retries += 1;
            if retries == SIGNAL_ATTEMPTS {
                warn!("failed to get good signal after {} retries; giving up", retries);
                return false;
            }
            debug!(
                "no good signal on try {}; will retry after {:?}",
                retries, RESCAN_DELAY
            );
            thread::sleep(RESCAN_DELAY);
        }
    }

    /// Read the modem's serial identifier (IMEI).
    pub fn get_serial_identifier(&mut self) -> Option<String> {
        let command = b"AT+GSN";
        if !self.send_and_read_echo(command) {
            return None;
        }
        let response = self.read_next_line().ok()?;
        if !self.read_ok(command) {
            return None;
        }
        String::from_utf8(response).ok()
    }

    /// Run an SBD session to collect waiting mobile-terminated messages.
    ///
    /// `ack_ring` acknowledges a ring alert by using `AT+SBDIXA` instead
    /// of `AT+SBDIX`. Received messages arrive through `rx_received`;
    /// `rx_failed` fires when no session could be established.
    pub fn message_check(&mut self, ack_ring: bool, events: &mut dyn RockBlockEvents) -> bool {
        events.rx_started();

        if self.attempt_connection(events) && self.attempt_session(ack_ring, events) {
            return true;
        }

        events.rx_failed();
        false
    }

    /// Send one mobile-originated payload of at most [`MAX_PAYLOAD`]
    /// bytes.
    ///
    /// Queues the payload in the MO buffer, waits for network time and a
    /// usable signal, then attempts up to 3 sessions with 1-second pauses
    /// between failures. Fires `tx_success(momsn)` on any successful
    /// session; `tx_failed(-1)` when the operation gives up.
    pub fn send_message(&mut self, message: &[u8], events: &mut dyn RockBlockEvents) -> bool {
        events.tx_started();

        if self.queue_message(message) && self.attempt_connection(events) {
            for attempt in 1..=SESSION_ATTEMPTS {
                if self.attempt_session(false, events) {
                    return true;
                }
                if attempt < SESSION_ATTEMPTS {
                    thread::sleep(SESSION_DELAY);
                }
            }
        }

        events.tx_failed(-1);
        false
    }

    /// One-time non-volatile setup: disable flow control and store the
    /// configuration as the default profile.
    ///
    /// Disconnect the RockBLOCK from power for a few minutes after this
    /// has been issued, so the stored profile takes effect.
    pub fn setup(&mut self) -> bool {
        for command in [
            b"AT&K0".as_slice(), // disable flow control
            b"AT&W0",            // store configuration as profile 0
            b"AT&Y0",            // use profile 0 as default
            b"AT*F",             // flush to non-volatile memory
        ] {
            if !self.send_and_ack(command) {
                return false;
            }
        }
        true
    }

    fn configure_port(&mut self) -> bool {
        self.enable_echo() && self.disable_flow_control() && self.enable_ring_alerts()
    }

    fn enable_echo(&mut self) -> bool {
        let command = b"ATE1";
        if !self.write_command(command) {
            return false;
        }
        match self.read_next_line() {
            Ok(response) if response == command => self.read_ok(command),
            Ok(response) => {
                error!("failed to enable echo; got response {}", lossy(&response));
                false
            }
            Err(err) => {
                error!("failed to enable echo: {}", err);
                false
            }
        }
    }

    fn disable_flow_control(&mut self) -> bool {
        self.send_and_ack(b"AT&K0")
    }

    fn enable_ring_alerts(&mut self) -> bool {
        self.send_and_ack(b"AT+SBDMTA=1")
    }

    /// Wait for valid network time, then for a usable signal.
    fn attempt_connection(&mut self, events: &mut dyn RockBlockEvents) -> bool {
        self.wait_for_network_time(events) && self.wait_for_good_signal(events)
    }

    fn wait_for_network_time(&mut self, events: &mut dyn RockBlockEvents) -> bool {
        let mut retries = 0;
        loop {
            if self.is_network_time_valid() {
                return true;
            }
            retries += 1;
            if retries == TIME_ATTEMPTS {
                warn!("failed to get network time after {} retries; giving up", retries);
                events.signal_update(0);
                return false;
            }
            debug!(
                "failed to get network time on try {}; will retry after {:?}",
                retries, TIME_DELAY
            );
            thread::sleep(TIME_DELAY);
        }
    }

    fn is_network_time_valid(&mut self) -> bool {
        let command = b"AT-MSSTM";
        if !self.send_and_read_echo(command) && !self.resync(command) {
            return false;
        }

        let response = match self.read_next_line() {
            Ok(response) => response,
            Err(err) => {
                error!("failed to read network time: {}", err);
                return false;
            }
        };
        // -MSSTM: a5cb42ad  /  -MSSTM: no network service
        if response.starts_with(b"-MSSTM") {
            if !self.read_ok(command) {
                return false;
            }
            return response.len() == 16;
        }
        false
    }

    /// Up to 3 `+SBDIX`/`+SBDIXA` exchanges. Returns true as soon as one
    /// reports a delivered (or empty) MO buffer.
    fn attempt_session(&mut self, ack_ring: bool, events: &mut dyn RockBlockEvents) -> bool {
        let previous = self.state;
        self.state = SessionState::InSession;
        let result = self.run_session(ack_ring, events);
        if self.state == SessionState::InSession {
            self.state = previous;
        }
        result
    }

    fn run_session(&mut self, ack_ring: bool, events: &mut dyn RockBlockEvents) -> bool {
        let command: &[u8] = if ack_ring { b"AT+SBDIXA" } else { b"AT+SBDIX" };

        for _ in 0..SESSION_ATTEMPTS {
            if !self.send_and_read_echo(command) && !self.resync(command) {
                return false;
            }

            let response = match self.read_next_line() {
                Ok(response) => response,
                Err(err) => {
                    error!("failed to read session response: {}", err);
                    return false;
                }
            };
            if !self.read_ok(command) {
                return false;
            }

            // +SBDIX: <MO status>, <MOMSN>, <MT status>, <MTMSN>,
            //         <MT length>, <MT queued>
            let fields = match parse_sbdix(&response) {
                Some(fields) => fields,
                None => {
                    error!(
                        "got bad response when creating session: {}",
                        lossy(&response)
                    );
                    continue;
                }
            };
            let [mo_status, mo_msn, mt_status, mt_msn, mt_length, mt_queued] = fields;

            if mo_status <= 4 {
                self.clear_mo_buffer();
                events.tx_success(mo_msn);
            } else {
                warn!("got MO status {}", mo_status);
                events.tx_failed(mo_status);
            }

            if mt_status == 1 && mt_length > 0 {
                debug!(
                    "will process message {}; {} additional messages queued",
                    mt_msn, mt_queued
                );
                self.process_mt_message(mt_msn, events);
            }

            events.rx_message_queue(mt_queued);

            if mt_queued > 0 && self.auto_session {
                debug!(
                    "checking signal before retrieving the remaining {} messages",
                    mt_queued
                );
                if self.wait_for_good_signal(events) {
                    self.attempt_session(false, events);
                } else {
                    // The rest stays queued at the gateway for the next
                    // session.
                    warn!(
                        "failed to get good signal; aborting retrieval with {} messages queued",
                        mt_queued
                    );
                }
            }

            if mo_status <= 4 {
                return true;
            }
        }
        false
    }

    /// Load one payload into the MO buffer via `AT+SBDWB`.
    fn queue_message(&mut self, message: &[u8]) -> bool {
        if message.len() > MAX_PAYLOAD {
            warn!(
                "message is {} bytes, longer than {}; rejecting it",
                message.len(),
                MAX_PAYLOAD
            );
            return false;
        }

        let command = format!("AT+SBDWB={}", message.len()).into_bytes();
        if !self.send_and_read_echo(&command) {
            return false;
        }
        match self.read_next_line() {
            Ok(response) if response == b"READY" => {}
            Ok(response) => {
                error!("modem not ready for the payload: {}", lossy(&response));
                return false;
            }
            Err(err) => {
                error!("modem not ready for the payload: {}", err);
                return false;
            }
        }

        let checksum = sbd_checksum(message);
        if self.line.write_all(message).is_err()
            || self.line.write_all(&checksum.to_be_bytes()).is_err()
        {
            error!("failed to write the payload");
            return false;
        }

        // 0 = accepted; 1 = timeout, 2 = bad checksum, 3 = wrong length.
        let accepted = matches!(self.read_next_line(), Ok(response) if response == b"0");
        if !self.read_ok(&command) {
            return false;
        }
        accepted
    }

    /// Read the MT buffer via `AT+SBDRB`.
    ///
    /// The response is binary on the echo's own line: a 2-byte big-endian
    /// length, the message, then a 2-byte big-endian checksum. The modem
    /// sometimes splits the frame, in which case one more line is
    /// appended after a short wait. A checksum mismatch is logged and the
    /// message is delivered anyway.
    fn process_mt_message(&mut self, mtmsn: i32, events: &mut dyn RockBlockEvents) {
        const LEN_FIELD: usize = 2;
        const CSUM_FIELD: usize = 2;

        let command = b"AT+SBDRB";
        if !self.write_command(command) {
            return;
        }
        let response = match self.read_next_line() {
            Ok(response) => response,
            Err(err) => {
                error!("failed to read the MT buffer: {}", err);
                return;
            }
        };

        let mut payload = match response.strip_prefix(b"AT+SBDRB\r") {
            Some(rest) => rest.to_vec(),
            None => {
                error!("incorrect echo for {}: {}", lossy(command), lossy(&response));
                return;
            }
        };
        if payload == b"OK" {
            warn!("no message content in the MT buffer");
            return;
        }
        if payload.len() < LEN_FIELD {
            error!("MT response too short: {} bytes", payload.len());
            return;
        }

        let reported = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if payload.len() < LEN_FIELD + reported + CSUM_FIELD {
            warn!(
                "incomplete message received; holding off {:?} for the rest",
                TIME_DELAY
            );
            thread::sleep(TIME_DELAY);
            match self.read_next_line() {
                Ok(more) => payload.extend_from_slice(&more),
                Err(err) => warn!("no continuation arrived: {}", err),
            }
        }

        let available = payload.len().saturating_sub(LEN_FIELD + CSUM_FIELD);
        let taken = reported.min(available);
        if taken < reported {
            warn!(
                "ignoring message length mismatch: {} available != {} reported",
                available, reported
            );
            if taken == 0 {
                error!("MT payload never arrived");
                return;
            }
        }
        let message = payload[LEN_FIELD..LEN_FIELD + taken].to_vec();

        let checksum_at = LEN_FIELD + taken;
        if payload.len() >= checksum_at + CSUM_FIELD {
            let read_sum = u16::from_be_bytes([payload[checksum_at], payload[checksum_at + 1]]);
            let our_sum = sbd_checksum(&message);
            if read_sum != our_sum {
                warn!(
                    "ignoring checksum failure: computed {:#06x} != reported {:#06x}",
                    our_sum, read_sum
                );
            }
        }

        if !self.read_ok(command) {
            warn!("missing OK after the MT read");
        }

        events.rx_received(mtmsn, &message);
    }

    fn clear_mo_buffer(&mut self) -> bool {
        let command = b"AT+SBDD0";
        if !self.send_and_read_echo(command) {
            return false;
        }
        match self.read_next_line() {
            Ok(response) if response == b"0" => {}
            _ => return false,
        }
        self.read_ok(command)
    }

    fn do_request_signal_strength(&mut self) -> i32 {
        let command = b"AT+CSQ";
        if !self.send_and_read_echo(command) {
            return -1;
        }

        let response = match self.read_next_line() {
            Ok(response) => response,
            Err(err) => {
                error!("failed to read signal strength: {}", err);
                return -1;
            }
        };
        // +CSQ:<n>, always exactly 6 bytes.
        if !response.starts_with(b"+CSQ") || response.len() != 6 {
            error!("incorrect response to {}: {}", lossy(command), lossy(&response));
            return -1;
        }
        if !self.read_ok(command) {
            return -1;
        }
        i32::from(response[5]) - i32::from(b'0')
    }

    /// Out-of-sync recovery: let the modem settle, flush stale input,
    /// confirm it answers pings, then re-issue the command and its echo
    /// read.
    fn resync(&mut self, command: &[u8]) -> bool {
        warn!(
            "comms with the modem out of sync while sending {}; pinging after {:?} sleep",
            lossy(command),
            RESCAN_DELAY
        );
        thread::sleep(RESCAN_DELAY);
        if let Err(err) = self.line.reset_input_buffer() {
            error!("failed to flush the input buffer: {}", err);
            return false;
        }

        let mut synced = false;
        for _ in 0..SYNC_COMMS_ATTEMPTS {
            synced = self.ping();
            if synced {
                break;
            }
        }
        if !synced {
            error!("modem resync failed");
            return false;
        }
        info!("modem resync successful");
        self.send_and_read_echo(command)
    }

    fn send_and_ack(&mut self, command: &[u8]) -> bool {
        self.write_command(command) && self.read_ack(command)
    }

    fn send_and_read_echo(&mut self, command: &[u8]) -> bool {
        self.write_command(command) && self.read_echo(command)
    }

    fn write_command(&mut self, command: &[u8]) -> bool {
        match self.send_command(command) {
            Ok(()) => true,
            Err(err) => {
                error!("failed to send {}: {}", lossy(command), err);
                false
            }
        }
    }

    fn send_command(&mut self, command: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        let mut framed = Vec::with_capacity(command.len() + 1);
        framed.extend_from_slice(command);
        framed.push(b'\r');
        self.line.write_all(&framed)
    }

    /// Read the next meaningful line.
    ///
    /// Blank lines are dropped: the modem frames responses in CR/LF pairs
    /// and the dialogue treats the resulting empties as padding.
    /// Unsolicited `SBDRING` notifications are dropped too; the GPIO ring
    /// line is authoritative, this copy is noise.
    fn read_next_line(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            let line = self.try_read_line()?;
            if line.is_empty() {
                continue;
            }
            if line == b"SBDRING" {
                debug!("ignoring unsolicited ring notification on the serial line");
                continue;
            }
            return Ok(line);
        }
    }

    /// One line from the port, with the power-brownout backoff: a hard
    /// serial error earns a 40-second sleep and another try, three times,
    /// before the failure surfaces.
    fn try_read_line(&mut self) -> Result<Vec<u8>, Error> {
        self.ensure_open()?;
        let mut attempts = 0;
        loop {
            match self.line.read_line() {
                Ok(line) => return Ok(line),
                Err(err) => {
                    attempts += 1;
                    if attempts > SYNC_COMMS_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(
                        "serial read failed ({}); check power and cabling; backing off {:?} (attempt {}/{})",
                        err, POWER_BACKOFF, attempts, SYNC_COMMS_ATTEMPTS
                    );
                    thread::sleep(POWER_BACKOFF);
                }
            }
        }
    }

    fn read_ack(&mut self, command: &[u8]) -> bool {
        self.read_echo(command) && self.read_ok(command)
    }

    fn read_echo(&mut self, command: &[u8]) -> bool {
        match self.read_next_line() {
            Ok(response) if response == command => true,
            Ok(response) => {
                error!(
                    "incorrect echo for {}: {}",
                    lossy(command),
                    lossy(&response)
                );
                false
            }
            Err(err) => {
                error!("failed to read echo for {}: {}", lossy(command), err);
                false
            }
        }
    }

    fn read_ok(&mut self, command: &[u8]) -> bool {
        match self.read_next_line() {
            Ok(response) if response == b"OK" => true,
            Ok(response) => {
                error!(
                    "got {} when expecting OK in response to {}",
                    lossy(&response),
                    lossy(command)
                );
                false
            }
            Err(err) => {
                error!("failed to read OK for {}: {}", lossy(command), err);
                false
            }
        }
    }

    fn ensure_open(&mut self) -> Result<(), Error> {
        if self.state == SessionState::Closed || !self.line.is_open() {
            return Err(Error::PortClosed);
        }
        Ok(())
    }
}

/// Unsigned sum of the payload bytes modulo 2^16; big-endian on the wire.
pub(crate) fn sbd_checksum(data: &[u8]) -> u16 {
    (data.iter().map(|&b| u32::from(b)).sum::<u32>() & 0xffff) as u16
}

fn parse_sbdix(response: &[u8]) -> Option<[i32; 6]> {
    let fields = response.strip_prefix(b"+SBDIX: ")?;
    let text = std::str::from_utf8(fields).ok()?;
    let parts: Option<Vec<i32>> = text.split(',').map(|p| p.trim().parse().ok()).collect();
    parts?.try_into().ok()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
