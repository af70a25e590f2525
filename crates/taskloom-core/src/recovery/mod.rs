//! Time-driven repair of stuck runs, coordinator handoff and timer firing.
//!
//! Both scanners run under a ticker identity registered in the ownership
//! table. Each responsibility is a separate method so callers and tests can
//! drive them independently of the loops.

pub mod scanner;
pub mod timer;

pub use scanner::{RecoveryScanner, ScanReport, select_freshest_peer};
pub use timer::{TimerReport, TimerScanner};
