//! A pure Rust user space satellite messaging core for RockBLOCK 9602/9603
//! SBD modems on Linux.
//!
//! This crate is the heart of a small field appliance: it sends and
//! receives short text messages over the Iridium Short Burst Data service
//! and buffers them on local storage, so the user-facing web UI stays
//! decoupled from the slow, intermittent satellite link. It provides
//!
//! * a driver for the RockBLOCK's half-duplex AT dialogue, including the
//!   SBD session state machine and ring-alert handling ([`RockBlock`]),
//! * a crash-safe, filesystem-backed mailbox store with per-peer threads,
//!   an outbox and an inbox ([`Mailboxes`]),
//! * a single worker thread that owns the modem and the indicator LEDs,
//!   serialises all driver I/O and publishes a status snapshot for the UI
//!   ([`QueueManager`]).
//!
//! On a Raspberry Pi, enable the `rpi` feature (on by default) and hand
//! the queue manager an [`RpiGpio`]: the modem's ring-indicator line then
//! triggers collection automatically and the status LEDs follow the link
//! state. On other hardware use [`NullGpio`].
//!
//! # Running the appliance core
//!
//! ```rust,no_run
//! use rockblock::{Config, Mailboxes, NullGpio, QueueManager};
//!
//! fn main() {
//!     let config = Config::from_env();
//!     let mailboxes = Mailboxes::new(config.mailboxes_root.clone());
//!     let manager = QueueManager::start(&config, Box::new(NullGpio));
//!
//!     // Queue a message; the worker sends it when the link allows.
//!     mailboxes.queue_message_send("local", "415-800-8000", "made it to camp");
//!     manager.check_outbox();
//!
//!     // Collect whatever the gateway is holding for us.
//!     manager.get_messages(false);
//!     for msg in mailboxes.get_thread("local", "+14158008000") {
//!         let state = if msg.not_yet_sent { "queued" } else { "sent" };
//!         println!("[{}] {}", state, msg.body.as_deref().unwrap_or(""));
//!     }
//!
//!     println!("signal: {} bars", manager.status().signal_strength);
//! }
//! ```
//!
//! # Talking to the modem directly
//!
//! The driver can also be used on its own, for instance from a bench
//! test. Callbacks arrive through [`RockBlockEvents`]; every method has
//! an empty default body, so implement only what you need.
//!
//! ```rust,no_run
//! use rockblock::{RockBlock, RockBlockEvents};
//!
//! struct Printer;
//!
//! impl RockBlockEvents for Printer {
//!     fn tx_success(&mut self, momsn: i32) {
//!         println!("message sent, MOMSN {}", momsn);
//!     }
//!     fn tx_failed(&mut self, mo_status: i32) {
//!         println!("send failed with MO status {}", mo_status);
//!     }
//! }
//!
//! fn main() {
//!     let mut printer = Printer;
//!     let mut modem = RockBlock::open("/dev/ttyUSB0", &mut printer).unwrap();
//!     modem.send_message(b"+14158008000:Hello from the field", &mut printer);
//!     modem.close();
//! }
//! ```
//!
//! Messages ride the link as `<recipient>:<body>` in UTF-8, at most 340
//! bytes. Outbound messages are retried until the gateway accepts them;
//! the outbox file is removed only after a successful session, and the
//! thread copy is kept either way.

pub mod config;
pub mod driver;
pub mod error;
pub mod gpio;
pub mod mailboxes;
pub mod message;
pub mod phone;
pub mod queue;
pub mod serial;
pub mod status;

pub use config::Config;
pub use driver::{RockBlock, RockBlockEvents, SessionState, MAX_PAYLOAD, SIGNAL_THRESHOLD};
pub use error::Error;
#[cfg(feature = "rpi")]
pub use gpio::RpiGpio;
pub use gpio::{ConnectionStatus, Gpio, NullGpio};
pub use mailboxes::{InboxEntry, Mailboxes, LOCAL_USER};
pub use message::{Direction, Message};
pub use queue::{QueueManager, SIGNAL_CHECK_INTERVAL};
pub use status::{RockBlockStatus, Status, StatusCache};
