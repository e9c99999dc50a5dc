// ABOUTME: Command implementations for each CLI subcommand
// ABOUTME: Exports status, sync, regenerate, probe, trigger and serve commands

pub mod probe;
pub mod regenerate;
pub mod serve;
pub mod status;
pub mod sync;
pub mod trigger;

pub use probe::{test_auth, test_fetch};
pub use regenerate::regenerate;
pub use serve::serve;
pub use status::status;
pub use sync::{sync, sync_all};
pub use trigger::trigger_sync;
