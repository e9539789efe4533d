//! Process-level plumbing shared by the front ends:
//! - Worker threads with bounded joins
//! - Null-modem provisioning via `socat`

pub mod null_modem;
pub mod task;

pub use null_modem::{should_run_vcom_tests, socat_available, NullModem, NullModemConfig};
pub use task::BackgroundTask;
