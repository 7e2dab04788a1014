//! Domain model (ids, status, task record, errors).

pub mod errors;
pub mod ids;
pub mod state;
pub mod task;

pub use self::errors::{ErrorKind, GridError, Result};
pub use self::ids::{ClaimId, SessionId, TaskId, WorkerId};
pub use self::state::TaskStatus;
pub use self::task::{
    BlobRef, ExpiryIndexEntry, NewTask, PayloadRef, SessionIndexEntry, TaskRecord, TaskUpdate,
};
