//! Reconciliation engines of the Outscale cloud controller: instances and zones,
//! load balancers, routes and block volumes.

pub mod cloud;
pub mod devices;
pub mod events;
pub mod helpers;
pub mod instances;
pub mod load_balancer;
pub mod nodes;
pub mod routes;
pub mod security_groups;
pub mod volumes;

#[cfg(test)]
mod test_support;

pub use cloud::{Cloud, CloudServices};
