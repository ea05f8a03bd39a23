//! Turn orchestration: the controller actor and the messages it accepts.

pub mod coordinator;
pub mod messages;

pub use coordinator::{Collaborators, ControllerHandle, TurnController};
pub use messages::{ControlCommand, EnqueueAction, PendingQueue, Snapshot, SubmitOutcome};
