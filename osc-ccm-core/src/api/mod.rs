//! Narrow seams over the remote IaaS API. Production bindings and the
//! in-memory fakes both implement these.

mod compute;
mod load_balancing;
mod metadata;

pub use compute::Compute;
pub use load_balancing::LoadBalancing;
pub use metadata::Metadata;
