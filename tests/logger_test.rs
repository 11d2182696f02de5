//! Testing of the logger.

use kmem::{
    logger::{Console, init_logger},
    sync::IrqSpinLock,
};

struct Capture(IrqSpinLock<String>);
impl Console for Capture {
    fn write_str(&self, s: &str) {
        self.0.lock().push_str(s);
    }
}

static CAPTURE: Capture = Capture(IrqSpinLock::new(String::new()));

#[test]
fn test_lines_reach_the_console() {
    init_logger(log::LevelFilter::Info, &CAPTURE);
    let line = line!() + 1;
    log::info!("heap up at {:#x}", 0xd000_0000_u32);
    log::debug!("filtered out");

    let out = CAPTURE.0.lock().clone();
    assert_eq!(
        out,
        format!("    INFO - tests/logger_test.rs:{line} - heap up at 0xd0000000\n")
    );
}
