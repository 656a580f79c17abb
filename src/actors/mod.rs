//! Actor hierarchy.
//!
//! One `CoordinatorActor` owns N `RoomActor`s; cancellation flows down the
//! token tree. Room state is only ever touched by its own actor task, which
//! is what serializes arbitration per room.

pub mod coordinator;
pub mod metrics;
pub mod room;

pub use coordinator::{CoordinatorActor, CoordinatorHandle};
pub use metrics::CoordinatorMetrics;
pub use room::{
    JoinSnapshot, LeaveReply, Member, RoomActor, RoomHandle, RoomState, SpeakDecision,
    SpeakerSnapshot,
};
