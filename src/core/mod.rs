pub mod guest;
pub mod node;
pub mod resources;
pub mod snapshot;

pub use guest::{Constraint, GroupId, Guest, GuestId, GuestKind, GuestState};
pub use node::Node;
pub use resources::{Resource, Resources};
pub use snapshot::{ClusterInventory, ClusterSnapshot, HaRule, HaRuleKind};
