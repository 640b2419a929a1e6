//! The queue manager: one worker thread that owns the modem and the
//! board I/O.
//!
//! UI handlers never touch the driver. They post [`Task`]s through the
//! [`QueueManager`] handle and read results from the shared
//! [`StatusCache`]; the worker drains the channel in FIFO order and runs
//! each task to completion, so at most one AT dialogue is ever in flight.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::driver::{RockBlock, RockBlockEvents, SIGNAL_THRESHOLD};
use crate::error::Error;
use crate::gpio::{ConnectionStatus, Gpio};
use crate::mailboxes::Mailboxes;
use crate::serial::candidate_ports;
use crate::status::{RockBlockStatus, Status, StatusCache};

/// How often the worker re-checks signal strength on its own.
pub const SIGNAL_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Work items executed on the worker thread, in submission order.
#[derive(Debug, Clone, PartialEq)]
enum Task {
    CheckOutbox,
    GetMessages { ack_ring: bool },
    RequestSignalStrength,
    GetSerialIdentifier,
    ClearMessagePending { sender: String },
    Ring { asserted: bool },
    Shutdown,
}

/// Handle for submitting work to the queue-manager worker.
///
/// Every method returns immediately; results surface through
/// [`QueueManager::status`] and the mailbox tree. Dropping the handle
/// shuts the worker down.
pub struct QueueManager {
    tasks: Sender<Task>,
    status: StatusCache,
    worker: Option<JoinHandle<()>>,
}

impl QueueManager {
    /// Spawn the worker: probe for a modem, wire up the ring indicator,
    /// and start serving tasks.
    ///
    /// When no modem can be opened the worker runs degraded: tasks are
    /// still accepted, the status cache reports `Missing` or `Broken`,
    /// and the connection LED goes red.
    pub fn start(config: &Config, gpio: Box<dyn Gpio>) -> QueueManager {
        let mailboxes = Mailboxes::new(config.mailboxes_root.clone());
        let status = StatusCache::new();
        let (tasks, queue) = mpsc::channel();

        let device = config.device.clone();
        let worker_status = status.clone();
        let worker_tasks = tasks.clone();
        let worker = thread::spawn(move || {
            let mut worker = Worker::new(device, mailboxes, gpio, worker_status, worker_tasks);
            worker.startup();
            worker.serve(&queue);
        });

        QueueManager {
            tasks,
            status,
            worker: Some(worker),
        }
    }

    /// Drain the outbox over the satellite link.
    pub fn check_outbox(&self) {
        self.submit(Task::CheckOutbox);
    }

    /// Run an SBD session for waiting messages, then accept everything in
    /// the inbox. UI calls pass `ack_ring = false`.
    pub fn get_messages(&self, ack_ring: bool) {
        self.submit(Task::GetMessages { ack_ring });
    }

    /// Refresh the signal-strength reading in the status cache.
    pub fn request_signal_strength(&self) {
        self.submit(Task::RequestSignalStrength);
    }

    /// The user has looked at `sender`'s thread; drop it from the pending
    /// set and update the pending LED.
    pub fn clear_message_pending(&self, sender: &str) {
        self.submit(Task::ClearMessagePending {
            sender: sender.to_string(),
        });
    }

    /// Best-effort snapshot of the modem and link state.
    pub fn status(&self) -> Status {
        self.status.snapshot()
    }

    fn submit(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            error!("queue-manager worker is gone; dropping task");
        }
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        let _ = self.tasks.send(Task::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Worker-side state. Owns the only references to the driver and the
/// GPIO adapter.
struct Worker {
    device: Option<String>,
    modem: Option<RockBlock>,
    mailboxes: Mailboxes,
    gpio: Box<dyn Gpio>,
    status: StatusCache,
    tasks: Sender<Task>,
    next_signal_check: Instant,
}

impl Worker {
    fn new(
        device: Option<String>,
        mailboxes: Mailboxes,
        gpio: Box<dyn Gpio>,
        status: StatusCache,
        tasks: Sender<Task>,
    ) -> Worker {
        Worker {
            device,
            modem: None,
            mailboxes,
            gpio,
            status,
            tasks,
            next_signal_check: Instant::now() + SIGNAL_CHECK_INTERVAL,
        }
    }

    fn startup(&mut self) {
        self.gpio.set_connection_status(ConnectionStatus::Blue);

        let ring_tasks = self.tasks.clone();
        self.gpio.subscribe_ring(Box::new(move |asserted| {
            let _ = ring_tasks.send(Task::Ring { asserted });
        }));

        self.init_modem();
        if self.modem.is_some() {
            self.run_task(Task::GetSerialIdentifier);
            self.run_task(Task::RequestSignalStrength);
        }
    }

    fn serve(&mut self, queue: &Receiver<Task>) {
        loop {
            let wait = self.next_signal_check.saturating_duration_since(Instant::now());
            match queue.recv_timeout(wait) {
                Ok(Task::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(task) => self.run_task(task),
                Err(RecvTimeoutError::Timeout) => {
                    self.next_signal_check = Instant::now() + SIGNAL_CHECK_INTERVAL;
                    if self.signal_check_due() {
                        self.run_task(Task::RequestSignalStrength);
                    }
                }
            }
        }
        debug!("queue-manager worker stopping");
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::CheckOutbox => self.check_outbox(),
            Task::GetMessages { ack_ring } => self.get_messages(ack_ring),
            Task::RequestSignalStrength => self.request_signal_strength(),
            Task::GetSerialIdentifier => self.get_serial_identifier(),
            Task::ClearMessagePending { sender } => self.clear_message_pending(&sender),
            Task::Ring { asserted } => self.ring_indicator_changed(asserted),
            Task::Shutdown => {}
        }
    }

    /// Probe for the modem and classify the outcome. A port that fails to
    /// open reads as `Missing`; a port that opens but fails the handshake
    /// reads as `Broken`.
    fn init_modem(&mut self) {
        let candidates = match &self.device {
            Some(device) => vec![device.clone()],
            None => candidate_ports(),
        };

        let mut outcome = RockBlockStatus::Missing;
        for device in &candidates {
            let mut sink = EventSink {
                mailboxes: &self.mailboxes,
                status: &self.status,
                gpio: &mut *self.gpio,
            };
            match RockBlock::open(device, &mut sink) {
                Ok(modem) => {
                    info!("RockBLOCK modem is on {}", device);
                    self.modem = Some(modem);
                    outcome = RockBlockStatus::Installed;
                    break;
                }
                Err(Error::SerialIo(err)) => {
                    debug!("no modem on {}: {}", device, err);
                }
                Err(err) => {
                    warn!("modem on {} failed to initialise: {}", device, err);
                    outcome = RockBlockStatus::Broken;
                }
            }
        }

        self.status.update(|s| s.rockblock = outcome);
        if self.modem.is_none() {
            error!("failed to initialise the RockBLOCK; will muddle on without it");
            self.gpio.set_connection_status(ConnectionStatus::Red);
        }
    }

    /// Try to send every queued outbound message, oldest first. Files are
    /// removed from the outbox only after the satellite accepted them;
    /// failures stay queued for the next pass.
    fn check_outbox(&mut self) {
        for message in self.mailboxes.read_outbox() {
            let Some(modem) = self.modem.as_mut() else {
                info!("cannot send messages: we have no RockBLOCK");
                return;
            };
            let Some(payload) = message.sbd_payload() else {
                warn!("outbox entry {} has no recipient; skipping it", message.filename);
                continue;
            };

            debug!("trying to send {}", message.filename);
            let mut sink = EventSink {
                mailboxes: &self.mailboxes,
                status: &self.status,
                gpio: &mut *self.gpio,
            };
            if modem.send_message(&payload, &mut sink) {
                self.mailboxes.remove_from_outbox(&message.filename);
                info!("successfully sent and removed {}", message.filename);
            } else {
                warn!("failed to send {}; it stays queued", message.filename);
            }
        }
    }

    /// Run a session for waiting messages, then file whatever landed in
    /// the inbox, including blobs left over from earlier runs.
    fn get_messages(&mut self, ack_ring: bool) {
        if let Some(modem) = self.modem.as_mut() {
            let mut sink = EventSink {
                mailboxes: &self.mailboxes,
                status: &self.status,
                gpio: &mut *self.gpio,
            };
            modem.message_check(ack_ring, &mut sink);
        } else {
            info!("cannot get messages: we have no RockBLOCK");
        }

        let accepted = self.mailboxes.accept_all_inbox_messages();
        if accepted.is_empty() {
            return;
        }
        self.status.update(|s| {
            for message in &accepted {
                if let Some(sender) = &message.sender {
                    s.pending_senders.insert(sender.clone());
                }
            }
        });
        self.gpio.set_message_pending(true);
    }

    fn request_signal_strength(&mut self) {
        self.next_signal_check = Instant::now() + SIGNAL_CHECK_INTERVAL;

        let Some(modem) = self.modem.as_mut() else {
            info!("cannot request signal strength: we have no RockBLOCK");
            return;
        };

        let was_good = self.status.snapshot().signal_good;
        let mut sink = EventSink {
            mailboxes: &self.mailboxes,
            status: &self.status,
            gpio: &mut *self.gpio,
        };
        modem.request_signal_strength(&mut sink);

        if !was_good && self.status.snapshot().signal_good {
            debug!("signal came back; draining the outbox");
            let _ = self.tasks.send(Task::CheckOutbox);
        }
    }

    fn get_serial_identifier(&mut self) {
        let Some(modem) = self.modem.as_mut() else {
            return;
        };
        match modem.get_serial_identifier() {
            Some(id) => {
                info!("RockBLOCK serial identifier is {}", id);
                self.status.update(|s| s.serial_identifier = Some(id));
            }
            None => warn!("failed to read the serial identifier"),
        }
    }

    fn clear_message_pending(&mut self, sender: &str) {
        let any_left = self.status.update(|s| {
            s.pending_senders.remove(sender);
            !s.pending_senders.is_empty()
        });
        self.gpio.set_message_pending(any_left);
    }

    fn ring_indicator_changed(&mut self, asserted: bool) {
        if asserted {
            debug!("ring indicator asserted; acknowledging and collecting");
            self.get_messages(true);
        } else {
            debug!("ring indicator released");
        }
    }

    fn signal_check_due(&self) -> bool {
        let interval = chrono::Duration::seconds(SIGNAL_CHECK_INTERVAL.as_secs() as i64);
        match self.status.snapshot().signal_time {
            Some(t) => Utc::now().signed_duration_since(t) >= interval,
            None => true,
        }
    }
}

/// The worker's implementation of the driver callbacks: update the status
/// cache and the LEDs, and stash received payloads in the inbox.
struct EventSink<'a> {
    mailboxes: &'a Mailboxes,
    status: &'a StatusCache,
    gpio: &'a mut dyn Gpio,
}

impl RockBlockEvents for EventSink<'_> {
    fn connected(&mut self) {
        info!("RockBLOCK connected");
    }

    fn signal_update(&mut self, signal: i32) {
        debug!("signal strength updated: {}", signal);
        let good = signal >= SIGNAL_THRESHOLD;
        self.status.update(|s| {
            s.signal_strength = signal;
            s.signal_good = good;
            s.signal_time = Some(Utc::now());
        });
        self.gpio.set_connection_status(if good {
            ConnectionStatus::Green
        } else {
            ConnectionStatus::Yellow
        });
    }

    fn rx_started(&mut self) {
        debug!("inbound session started");
    }

    fn rx_failed(&mut self) {
        warn!("inbound session failed");
    }

    fn rx_received(&mut self, mtmsn: i32, data: &[u8]) {
        debug!("received MT message {} ({} bytes)", mtmsn, data.len());
        self.mailboxes.save_message_to_inbox(data);
    }

    fn rx_message_queue(&mut self, count: i32) {
        debug!("{} MT messages still queued at the gateway", count);
    }

    fn tx_started(&mut self) {
        debug!("outbound session started");
    }

    fn tx_failed(&mut self, mo_status: i32) {
        warn!("send failed with MO status {}", mo_status);
        self.status.update(|s| s.last_txfailed_mo_status = mo_status);
    }

    fn tx_success(&mut self, momsn: i32) {
        info!("send succeeded, MOMSN {}", momsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::{connection_prelude, ready_modem};
    use crate::driver::sbd_checksum;
    use crate::serial::testing::MockLine;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct GpioLog {
        statuses: Vec<ConnectionStatus>,
        pending: Vec<bool>,
    }

    #[derive(Clone, Default)]
    struct MockGpio {
        inner: Arc<Mutex<GpioLog>>,
    }

    impl MockGpio {
        fn statuses(&self) -> Vec<ConnectionStatus> {
            self.inner.lock().unwrap().statuses.clone()
        }

        fn pending(&self) -> Vec<bool> {
            self.inner.lock().unwrap().pending.clone()
        }
    }

    impl Gpio for MockGpio {
        fn subscribe_ring(&mut self, _callback: crate::gpio::RingCallback) {}

        fn set_connection_status(&mut self, status: ConnectionStatus) {
            self.inner.lock().unwrap().statuses.push(status);
        }

        fn set_message_pending(&mut self, pending: bool) {
            self.inner.lock().unwrap().pending.push(pending);
        }
    }

    struct Fixture {
        worker: Worker,
        queue: Receiver<Task>,
        gpio: MockGpio,
        _root: TempDir,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let gpio = MockGpio::default();
        let (tasks, queue) = mpsc::channel();
        let worker = Worker::new(
            None,
            Mailboxes::new(root.path()),
            Box::new(gpio.clone()),
            StatusCache::new(),
            tasks,
        );
        Fixture {
            worker,
            queue,
            gpio,
            _root: root,
        }
    }

    /// S2: a ring edge acknowledges the alert, pulls the message down and
    /// files it into the sender's thread.
    #[test]
    fn ring_edge_collects_and_files_the_message() {
        let mut fx = fixture();

        let body = b"alice:hi";
        let mut frame = b"AT+SBDRB\r".to_vec();
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(body);
        frame.extend_from_slice(&sbd_checksum(body).to_be_bytes());

        let mut script = connection_prelude(3);
        script.extend([
            b"AT+SBDIXA".to_vec(),
            b"+SBDIX: 0, 3, 1, 7, 8, 0".to_vec(),
            b"OK".to_vec(),
            b"AT+SBDD0".to_vec(),
            b"0".to_vec(),
            b"OK".to_vec(),
            frame,
            b"OK".to_vec(),
        ]);
        let line = MockLine::new(script);
        fx.worker.modem = Some(ready_modem(line));

        fx.worker.run_task(Task::Ring { asserted: true });

        let thread = fx.worker.mailboxes.get_thread("local", "alice");
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].sender.as_deref(), Some("alice"));
        assert_eq!(thread[0].body.as_deref(), Some("hi"));
        assert!(fx.worker.mailboxes.read_inbox().is_empty());

        let status = fx.worker.status.snapshot();
        assert!(status.pending_senders.contains("alice"));
        assert_eq!(fx.gpio.pending(), [true]);
    }

    /// S3: a low reading shows yellow; the next good reading shows green
    /// and auto-submits an outbox drain.
    #[test]
    fn signal_transition_drains_the_outbox() {
        let mut fx = fixture();
        let line = MockLine::new(["AT+CSQ", "+CSQ:1", "OK"]);
        let handle = line.clone();
        fx.worker.modem = Some(ready_modem(line));

        fx.worker.run_task(Task::RequestSignalStrength);
        let status = fx.worker.status.snapshot();
        assert_eq!(status.signal_strength, 1);
        assert!(!status.signal_good);
        assert!(status.signal_time.is_some());
        assert_eq!(fx.gpio.statuses(), [ConnectionStatus::Yellow]);
        assert!(fx.queue.try_recv().is_err(), "no outbox drain while signal is low");

        handle.push_lines(["AT+CSQ", "+CSQ:3", "OK"]);
        fx.worker.run_task(Task::RequestSignalStrength);
        let status = fx.worker.status.snapshot();
        assert_eq!(status.signal_strength, 3);
        assert!(status.signal_good);
        assert_eq!(
            fx.gpio.statuses(),
            [ConnectionStatus::Yellow, ConnectionStatus::Green]
        );
        assert_eq!(fx.queue.try_recv(), Ok(Task::CheckOutbox));
    }

    /// S1 at the worker level: a queued message is sent and leaves the
    /// outbox; the thread copy stays.
    #[test]
    fn check_outbox_sends_and_removes() {
        let mut fx = fixture();
        fx.worker
            .mailboxes
            .queue_message_send("local", "+14158008000", "Hi");

        let payload = b"+14158008000:Hi";
        let mut script: Vec<Vec<u8>> = vec![
            format!("AT+SBDWB={}", payload.len()).into_bytes(),
            b"READY".to_vec(),
            b"0".to_vec(),
            b"OK".to_vec(),
        ];
        script.extend(connection_prelude(4));
        script.extend([
            b"AT+SBDIX".to_vec(),
            b"+SBDIX: 1,42,0,0,0,0".to_vec(),
            b"OK".to_vec(),
            b"AT+SBDD0".to_vec(),
            b"0".to_vec(),
            b"OK".to_vec(),
        ]);
        let line = MockLine::new(script);
        let handle = line.clone();
        fx.worker.modem = Some(ready_modem(line));

        fx.worker.run_task(Task::CheckOutbox);

        assert!(fx.worker.mailboxes.read_outbox().is_empty());
        let thread = fx.worker.mailboxes.get_thread("local", "+14158008000");
        assert_eq!(thread.len(), 1);
        assert!(!thread[0].not_yet_sent);
        assert!(handle.writes().contains(&payload.to_vec()));
    }

    #[test]
    fn check_outbox_without_modem_leaves_the_queue() {
        let mut fx = fixture();
        fx.worker
            .mailboxes
            .queue_message_send("local", "+14158008000", "Hi");

        fx.worker.run_task(Task::CheckOutbox);

        assert_eq!(fx.worker.mailboxes.read_outbox().len(), 1);
    }

    #[test]
    fn failed_session_records_the_mo_status() {
        let mut fx = fixture();
        fx.worker
            .mailboxes
            .queue_message_send("local", "+14158008000", "Hi");

        // MO status 13: gateway reported the session failed. Three session
        // attempts inside the driver, then the send gives up; the driver's
        // outer loop would retry with 1 s pauses, so script all of them.
        let payload_len = b"+14158008000:Hi".len();
        let mut script: Vec<Vec<u8>> = vec![
            format!("AT+SBDWB={}", payload_len).into_bytes(),
            b"READY".to_vec(),
            b"0".to_vec(),
            b"OK".to_vec(),
        ];
        script.extend(connection_prelude(5));
        for _ in 0..9 {
            script.extend([
                b"AT+SBDIX".to_vec(),
                b"+SBDIX: 13,0,0,0,0,0".to_vec(),
                b"OK".to_vec(),
            ]);
        }
        let line = MockLine::new(script);
        fx.worker.modem = Some(ready_modem(line));

        fx.worker.run_task(Task::CheckOutbox);

        assert_eq!(fx.worker.mailboxes.read_outbox().len(), 1, "message stays queued");
        let status = fx.worker.status.snapshot();
        assert_eq!(status.last_txfailed_mo_status, -1);
    }

    #[test]
    fn get_messages_without_modem_still_accepts_the_inbox() {
        let mut fx = fixture();
        fx.worker.mailboxes.save_message_to_inbox(b"bob:hello");

        fx.worker.run_task(Task::GetMessages { ack_ring: false });

        assert!(fx.worker.mailboxes.read_inbox().is_empty());
        assert_eq!(
            fx.worker.mailboxes.get_thread("local", "bob").len(),
            1
        );
        assert!(fx.worker.status.snapshot().pending_senders.contains("bob"));
        assert_eq!(fx.gpio.pending(), [true]);
    }

    #[test]
    fn clearing_pending_senders_tracks_the_led() {
        let mut fx = fixture();
        fx.worker.status.update(|s| {
            s.pending_senders.insert("alice".to_string());
            s.pending_senders.insert("bob".to_string());
        });

        fx.worker.run_task(Task::ClearMessagePending {
            sender: "alice".to_string(),
        });
        assert_eq!(fx.gpio.pending(), [true], "bob is still pending");

        fx.worker.run_task(Task::ClearMessagePending {
            sender: "bob".to_string(),
        });
        assert_eq!(fx.gpio.pending(), [true, false]);
        assert!(fx.worker.status.snapshot().pending_senders.is_empty());
    }

    #[test]
    fn released_ring_line_is_ignored() {
        let mut fx = fixture();
        fx.worker.run_task(Task::Ring { asserted: false });
        assert!(fx.worker.mailboxes.read_inbox().is_empty());
        assert!(fx.gpio.pending().is_empty());
    }

    #[test]
    fn scheduled_signal_check_due_logic() {
        let fx = fixture();
        assert!(fx.worker.signal_check_due(), "never measured means due");

        fx.worker.status.update(|s| s.signal_time = Some(Utc::now()));
        assert!(!fx.worker.signal_check_due());

        fx.worker.status.update(|s| {
            s.signal_time = Some(Utc::now() - chrono::Duration::seconds(301));
        });
        assert!(fx.worker.signal_check_due());
    }

    /// Degraded end-to-end: no modem opens, the manager still serves
    /// tasks and reports `Missing`.
    #[test]
    fn starts_degraded_without_a_modem() {
        let root = TempDir::new().unwrap();
        let config = Config {
            device: Some("/dev/nonexistent-rockblock".to_string()),
            mailboxes_root: root.path().to_path_buf(),
        };
        let manager = QueueManager::start(&config, Box::new(crate::gpio::NullGpio));

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.status().rockblock == RockBlockStatus::Unknown {
            assert!(Instant::now() < deadline, "worker never classified the modem");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.status().rockblock, RockBlockStatus::Missing);

        // Tasks are accepted and do not wedge the worker.
        manager.request_signal_strength();
        manager.check_outbox();
        manager.get_messages(false);
        manager.clear_message_pending("nobody");
        drop(manager); // joins the worker
    }
}
