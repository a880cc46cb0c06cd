//! Shard placement, fan-out and result merging.

pub mod coordinator;
pub mod membership;
pub mod merge;

pub use coordinator::FanOutCoordinator;
pub use membership::{ClusterMembership, MembershipEvent, MembershipListener, MembershipPublisher};
pub use merge::ResultMerger;
