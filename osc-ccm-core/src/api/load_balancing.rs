use async_trait::async_trait;

use crate::{
    error::ApiError,
    model::{
        CreateLoadBalancerRequest, HealthCheck, Listener, LoadBalancerAttributes,
        LoadBalancerDescription, PolicyDescription, Tags,
    },
};

#[async_trait]
pub trait LoadBalancing: Send + Sync {
    /// Fails with `LoadBalancerNotFound` when any of the names is unknown
    async fn describe_load_balancers(
        &self,
        names: &[String],
    ) -> Result<Vec<LoadBalancerDescription>, ApiError>;

    /// Returns the DNS name of the new load balancer
    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> Result<String, ApiError>;

    async fn delete_load_balancer(&self, name: &str) -> Result<(), ApiError>;

    async fn create_load_balancer_listeners(
        &self,
        name: &str,
        listeners: &[Listener],
    ) -> Result<(), ApiError>;

    async fn delete_load_balancer_listeners(&self, name: &str, ports: &[i64])
        -> Result<(), ApiError>;

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<(), ApiError>;

    async fn deregister_instances(&self, name: &str, instance_ids: &[String])
        -> Result<(), ApiError>;

    async fn configure_health_check(
        &self,
        name: &str,
        health_check: &HealthCheck,
    ) -> Result<(), ApiError>;

    async fn describe_load_balancer_attributes(
        &self,
        name: &str,
    ) -> Result<LoadBalancerAttributes, ApiError>;

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> Result<(), ApiError>;

    /// Fails with `PolicyNotFound` when any of the policies is unknown
    async fn describe_load_balancer_policies(
        &self,
        name: &str,
        policy_names: &[String],
    ) -> Result<Vec<PolicyDescription>, ApiError>;

    async fn create_load_balancer_policy(
        &self,
        name: &str,
        policy: &PolicyDescription,
    ) -> Result<(), ApiError>;

    async fn set_load_balancer_policies_of_listener(
        &self,
        name: &str,
        load_balancer_port: i64,
        policy_names: &[String],
    ) -> Result<(), ApiError>;

    async fn set_load_balancer_policies_for_backend_server(
        &self,
        name: &str,
        instance_port: i64,
        policy_names: &[String],
    ) -> Result<(), ApiError>;

    async fn add_tags(&self, name: &str, tags: &Tags) -> Result<(), ApiError>;
}
