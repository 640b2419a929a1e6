//! Board I/O: the ring-indicator input and the four indicator LEDs.
//!
//! The queue manager drives everything through the [`Gpio`] trait.
//! On a Raspberry Pi the [`RpiGpio`] backend (feature `rpi`) talks to the
//! SysFS GPIO interface; everywhere else [`NullGpio`] stands in so the
//! core can run headless.

/// Colour shown on the tricolour connection-status LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No modem.
    Red,
    /// Modem present, signal below the send threshold.
    Yellow,
    /// Good signal.
    Green,
    /// Starting up.
    Blue,
}

/// (R, G, B) legs to light for a status colour.
fn legs(status: ConnectionStatus) -> (bool, bool, bool) {
    match status {
        ConnectionStatus::Red => (true, false, false),
        ConnectionStatus::Yellow => (true, true, false),
        ConnectionStatus::Green => (false, true, false),
        ConnectionStatus::Blue => (false, false, true),
    }
}

/// Callback fired on a ring-indicator edge with the new pin level.
pub type RingCallback = Box<dyn FnMut(bool) + Send>;

/// Minimal board-I/O surface the queue manager needs.
pub trait Gpio: Send {
    /// Register `callback` to run on every ring-indicator edge.
    fn subscribe_ring(&mut self, callback: RingCallback);

    fn set_connection_status(&mut self, status: ConnectionStatus);

    fn set_message_pending(&mut self, pending: bool);
}

/// No-op backend for hardware without the indicator board.
#[derive(Debug, Default)]
pub struct NullGpio;

impl Gpio for NullGpio {
    fn subscribe_ring(&mut self, _callback: RingCallback) {}

    fn set_connection_status(&mut self, _status: ConnectionStatus) {}

    fn set_message_pending(&mut self, _pending: bool) {}
}

#[cfg(feature = "rpi")]
pub use self::rpi::RpiGpio;

#[cfg(feature = "rpi")]
mod rpi {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use log::error;
    use sysfs_gpio::{Direction, Edge, Pin};

    use crate::error::Error;

    // Kernel GPIO numbers; the matching header pins are in parentheses.
    const RING_INDICATOR: u64 = 18; // header pin 12, input from the modem
    const STATUS_RED: u64 = 25; // header pin 22
    const STATUS_GREEN: u64 = 8; // header pin 24
    const STATUS_BLUE: u64 = 7; // header pin 26
    const MESSAGE_PENDING: u64 = 23; // header pin 16

    /// SysFS GPIO backend for the Raspberry Pi indicator board.
    pub struct RpiGpio {
        red: Pin,
        green: Pin,
        blue: Pin,
        pending: Pin,
        ring: Pin,
        poller: Option<JoinHandle<()>>,
        shutdown: Arc<AtomicBool>,
    }

    impl RpiGpio {
        /// Export and configure all five pins.
        pub fn new() -> Result<RpiGpio, Error> {
            let red = output_pin(STATUS_RED)?;
            let green = output_pin(STATUS_GREEN)?;
            let blue = output_pin(STATUS_BLUE)?;
            let pending = output_pin(MESSAGE_PENDING)?;

            let ring = Pin::new(RING_INDICATOR);
            ring.export()
                .map_err(|e| gpio_err(RING_INDICATOR, "export", e))?;
            ring.set_direction(Direction::In)
                .map_err(|e| gpio_err(RING_INDICATOR, "set direction on", e))?;
            ring.set_edge(Edge::BothEdges)
                .map_err(|e| gpio_err(RING_INDICATOR, "set edge on", e))?;

            Ok(RpiGpio {
                red,
                green,
                blue,
                pending,
                ring,
                poller: None,
                shutdown: Arc::new(AtomicBool::new(false)),
            })
        }

        fn set(&self, pin: Pin, value: bool) {
            if let Err(err) = pin.set_value(value as u8) {
                error!("failed to drive GPIO {}: {}", pin.get_pin_num(), err);
            }
        }
    }

    impl Gpio for RpiGpio {
        fn subscribe_ring(&mut self, mut callback: RingCallback) {
            let ring = self.ring;
            let shutdown = Arc::clone(&self.shutdown);
            self.poller = Some(thread::spawn(move || {
                let mut poller = match ring.get_poller() {
                    Ok(poller) => poller,
                    Err(err) => {
                        error!("cannot poll the ring indicator: {}", err);
                        return;
                    }
                };
                while !shutdown.load(Ordering::Relaxed) {
                    match poller.poll(1000) {
                        Ok(Some(value)) => callback(value != 0),
                        Ok(None) => {} // poll timeout, check shutdown and go again
                        Err(err) => {
                            error!("ring indicator poll failed: {}", err);
                            thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            }));
        }

        fn set_connection_status(&mut self, status: ConnectionStatus) {
            let (r, g, b) = legs(status);
            self.set(self.red, r);
            self.set(self.green, g);
            self.set(self.blue, b);
        }

        fn set_message_pending(&mut self, pending: bool) {
            self.set(self.pending, pending);
        }
    }

    impl Drop for RpiGpio {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Relaxed);
            if let Some(poller) = self.poller.take() {
                let _ = poller.join();
            }
            for pin in [self.red, self.green, self.blue, self.pending] {
                let _ = pin.set_value(0);
                let _ = pin.unexport();
            }
            let _ = self.ring.unexport();
        }
    }

    fn output_pin(number: u64) -> Result<Pin, Error> {
        let pin = Pin::new(number);
        pin.export().map_err(|e| gpio_err(number, "export", e))?;
        // Direction::Low configures an output already driven low.
        pin.set_direction(Direction::Low)
            .map_err(|e| gpio_err(number, "set direction on", e))?;
        Ok(pin)
    }

    fn gpio_err(pin: u64, action: &str, err: sysfs_gpio::Error) -> Error {
        Error::Gpio(format!("unable to {} GPIO {}: {}", action, pin, err))
    }
}
