//! `log` backend writing to ITM stimulus port 0.
//!
//! Output goes nowhere unless a debugger has enabled the ITM and port 0, in
//! which case records are dropped instead of stalling on a FIFO nobody
//! drains.

use cortex_m::peripheral::{itm, ITM};
use log::{LevelFilter, Log, Metadata, Record};

struct ItmLogger;

static LOGGER: ItmLogger = ItmLogger;

impl Log for ItmLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        cortex_m::interrupt::free(|_| {
            // SAFETY: interrupts are masked, so nothing else writes the port.
            let itm = unsafe { &mut *(ITM::PTR as *mut itm::RegisterBlock) };
            if itm.tcr.read() & 1 == 0 || itm.ter[0].read() & 1 == 0 {
                return;
            }
            cortex_m::itm::write_fmt(
                &mut itm.stim[0],
                format_args!("[{:<5} {}] {}\n", record.level(), record.target(), record.args()),
            );
        });
    }

    fn flush(&self) {}
}

/// Install the ITM logger. Later calls are ignored.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
