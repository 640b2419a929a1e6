//! Report the modem's serial identifier and current signal strength.
//!
//! Usage:
//!
//! ```text
//! cargo run --example signal_strength -- [DEVICE]
//! ```

use std::env;
use std::process;

use rockblock::{RockBlock, RockBlockEvents};

struct Printer;

impl RockBlockEvents for Printer {
    fn connected(&mut self) {
        println!("connected");
    }
    fn signal_update(&mut self, signal: i32) {
        println!("signal: {} bars", signal);
    }
}

fn main() {
    env_logger::init();

    let device = env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    let mut printer = Printer;
    let mut modem = match RockBlock::open(&device, &mut printer) {
        Ok(modem) => modem,
        Err(err) => {
            eprintln!("cannot bring up the modem on {}: {}", device, err);
            process::exit(1);
        }
    };

    match modem.get_serial_identifier() {
        Some(id) => println!("serial identifier: {}", id),
        None => println!("serial identifier: unavailable"),
    }
    modem.request_signal_strength(&mut printer);
    modem.close();
}
