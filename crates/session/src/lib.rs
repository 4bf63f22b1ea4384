//! Session - Checkpointing for one process of a training job
//!
//! Provides:
//! - [`Communicator`]: rank, world size and role derived from the launcher
//! - [`Session`]: a training node agent or a remote node, chosen by rank
//! - [`RecoveryCoordinator`]: consistent restore point selection
//! - [`BlockingSession`]: the same API for synchronous training loops

pub mod blocking;
pub mod communicator;
pub mod recovery;
pub mod session;

pub use blocking::BlockingSession;
pub use communicator::Communicator;
pub use recovery::{
    load_persisted, restore_persisted, RecoveredCheckpoint, RecoveryCoordinator, RecoveryOutcome,
};
pub use session::{Role, Session};
