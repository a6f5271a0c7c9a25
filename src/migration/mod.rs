pub mod executor;
pub mod ledger;
pub mod primitive;

pub use executor::{ExecutorOptions, MigrationExecutor};
pub use ledger::{MigrationLedger, MigrationRecord, MigrationStatus};
pub use primitive::{
    CommandRelocator, PollStatus, Preflight, RelocationHandle, RelocationPrimitive, RelocationRequest,
    RelocationStatus,
};
