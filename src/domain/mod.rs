//! Domain layer: the coordinator's data model and the ports it depends on.
//!
//! - [`model`] - blocks, stripes, clusters, nodes, the EC schema.
//! - [`ports`] - the `ProxyClient` and `EventPublisher` trait abstractions.
//! - [`events`] - domain events published for audit.

pub mod events;
pub mod model;
pub mod ports;

pub use events::DomainEvent;
pub use model::{
    Block, BlockType, Cluster, ClusterId, EcSchema, EncodeType, MultiStripePlacement, Node,
    NodeId, Operation, SingleStripePlacement, Stripe, StripeId,
};
pub use ports::{EventPublisher, ProxyClient};
