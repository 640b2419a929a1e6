//! Send one test message through a RockBLOCK.
//!
//! Usage:
//!
//! ```text
//! cargo run --example send_message -- [DEVICE] [RECIPIENT]
//! ```
//!
//! Defaults to `/dev/ttyUSB0`. Needs open sky.

use std::env;
use std::process;

use rockblock::{RockBlock, RockBlockEvents};

struct Printer;

impl RockBlockEvents for Printer {
    fn connected(&mut self) {
        println!("connected");
    }
    fn signal_update(&mut self, signal: i32) {
        println!("signal: {}", signal);
    }
    fn tx_started(&mut self) {
        println!("tx started");
    }
    fn tx_failed(&mut self, mo_status: i32) {
        println!("tx failed, MO status {}", mo_status);
    }
    fn tx_success(&mut self, momsn: i32) {
        println!("tx success, MOMSN {}", momsn);
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let device = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let recipient = args.next().unwrap_or_else(|| "+14158008000".to_string());

    let mut printer = Printer;
    let mut modem = match RockBlock::open(&device, &mut printer) {
        Ok(modem) => modem,
        Err(err) => {
            eprintln!("cannot bring up the modem on {}: {}", device, err);
            process::exit(1);
        }
    };

    let payload = format!("{}:Hello from the messaging core! (test)", recipient);
    modem.send_message(payload.as_bytes(), &mut printer);
    modem.close();
}
