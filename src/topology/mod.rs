mod node_selector;
mod server_node;
mod topology;

pub use node_selector::NodeSelector;
pub use server_node::ServerNode;
pub use topology::{ReadBehavior, Topology, WriteBehavior};
