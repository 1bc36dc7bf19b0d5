//! Domain model (task, task run, lease, instance, errors).

pub mod errors;
pub mod instance;
pub mod lease;
pub mod state;
pub mod task;

pub use self::errors::{ErrorKind, StoreError};
pub use self::instance::Instance;
pub use self::lease::{
    LEASE_ANCHOR, LeaseAction, LeaseClaim, LeaseOutcome, LeaseRecord, decide, resolve,
};
pub use self::state::TaskStatus;
pub use self::task::{Metadata, Task, TaskFilter, TaskRun};
