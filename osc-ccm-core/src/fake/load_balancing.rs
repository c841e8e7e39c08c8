use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    api::LoadBalancing,
    error::{codes, ApiError},
    model::{
        BackendServerDescription, CreateLoadBalancerRequest, HealthCheck, Listener,
        ListenerDescription, LoadBalancerAttributes, LoadBalancerDescription, PolicyDescription,
        Tags,
    },
};

use super::{not_found, Recorder};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeLoadBalancer {
    pub description: LoadBalancerDescription,
    pub attributes: LoadBalancerAttributes,
    pub policies: Vec<PolicyDescription>,
}

#[derive(Debug, Default)]
pub struct LoadBalancingState {
    pub load_balancers: BTreeMap<String, FakeLoadBalancer>,
}

impl LoadBalancingState {
    fn get_mut(&mut self, name: &str) -> Result<&mut FakeLoadBalancer, ApiError> {
        self.load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(codes::LOAD_BALANCER_NOT_FOUND, name))
    }
}

#[derive(Debug, Default)]
pub struct FakeLoadBalancing {
    pub recorder: Recorder,
    state: Mutex<LoadBalancingState>,
}

impl FakeLoadBalancing {
    pub async fn state(&self) -> MutexGuard<'_, LoadBalancingState> {
        self.state.lock().await
    }

    pub async fn load_balancer(&self, name: &str) -> Option<FakeLoadBalancer> {
        self.state().await.load_balancers.get(name).cloned()
    }
}

/// Health check a freshly created load balancer starts with
fn default_health_check(listeners: &[Listener]) -> HealthCheck {
    let port = listeners
        .first()
        .map(|listener| listener.instance_port)
        .unwrap_or(80);

    HealthCheck {
        target: format!("TCP:{port}"),
        healthy_threshold: 10,
        unhealthy_threshold: 2,
        timeout: 5,
        interval: 30,
    }
}

#[async_trait]
impl LoadBalancing for FakeLoadBalancing {
    async fn describe_load_balancers(
        &self,
        names: &[String],
    ) -> Result<Vec<LoadBalancerDescription>, ApiError> {
        self.recorder
            .record("describe_load_balancers", &names.join(","))
            .await?;
        let state = self.state().await;

        if names.is_empty() {
            return Ok(state
                .load_balancers
                .values()
                .map(|load_balancer| load_balancer.description.clone())
                .collect());
        }

        names
            .iter()
            .map(|name| {
                state
                    .load_balancers
                    .get(name)
                    .map(|load_balancer| load_balancer.description.clone())
                    .ok_or_else(|| not_found(codes::LOAD_BALANCER_NOT_FOUND, name))
            })
            .collect()
    }

    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> Result<String, ApiError> {
        self.recorder
            .record("create_load_balancer", &request.name)
            .await?;
        let mut state = self.state().await;

        if state.load_balancers.contains_key(&request.name) {
            return Err(ApiError::new(
                "DuplicateLoadBalancerName",
                format!("Load balancer '{}' already exists", request.name),
            ));
        }

        let dns_name = format!("{}.lbu.example", request.name);
        let description = LoadBalancerDescription {
            name: request.name.to_owned(),
            dns_name: dns_name.to_owned(),
            scheme: request.scheme.to_owned(),
            listener_descriptions: request
                .listeners
                .iter()
                .map(|listener| ListenerDescription {
                    listener: listener.to_owned(),
                    policy_names: Vec::new(),
                })
                .collect(),
            backend_server_descriptions: Vec::new(),
            availability_zones: request.availability_zones.to_owned(),
            subnets: request.subnets.to_owned(),
            security_groups: request.security_groups.to_owned(),
            instances: Vec::new(),
            health_check: default_health_check(&request.listeners),
            tags: request.tags.to_owned(),
        };

        state.load_balancers.insert(
            request.name.to_owned(),
            FakeLoadBalancer {
                description,
                ..Default::default()
            },
        );

        Ok(dns_name)
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<(), ApiError> {
        self.recorder.record("delete_load_balancer", name).await?;
        self.state().await.load_balancers.remove(name);

        Ok(())
    }

    async fn create_load_balancer_listeners(
        &self,
        name: &str,
        listeners: &[Listener],
    ) -> Result<(), ApiError> {
        self.recorder
            .record("create_load_balancer_listeners", name)
            .await?;
        let mut state = self.state().await;
        let description = &mut state.get_mut(name)?.description;

        for listener in listeners {
            if description
                .listener_descriptions
                .iter()
                .any(|existing| existing.listener.load_balancer_port == listener.load_balancer_port)
            {
                return Err(ApiError::new(
                    "DuplicateListener",
                    format!("A listener already uses port {}", listener.load_balancer_port),
                ));
            }

            description.listener_descriptions.push(ListenerDescription {
                listener: listener.to_owned(),
                policy_names: Vec::new(),
            });
        }

        Ok(())
    }

    async fn delete_load_balancer_listeners(&self, name: &str, ports: &[i64]) -> Result<(), ApiError> {
        self.recorder
            .record("delete_load_balancer_listeners", name)
            .await?;
        let mut state = self.state().await;

        state
            .get_mut(name)?
            .description
            .listener_descriptions
            .retain(|existing| !ports.contains(&existing.listener.load_balancer_port));

        Ok(())
    }

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<(), ApiError> {
        self.recorder.record("register_instances", name).await?;
        let mut state = self.state().await;
        let instances = &mut state.get_mut(name)?.description.instances;

        for instance_id in instance_ids {
            if !instances.contains(instance_id) {
                instances.push(instance_id.to_owned());
            }
        }

        Ok(())
    }

    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<(), ApiError> {
        self.recorder.record("deregister_instances", name).await?;
        let mut state = self.state().await;

        state
            .get_mut(name)?
            .description
            .instances
            .retain(|instance_id| !instance_ids.contains(instance_id));

        Ok(())
    }

    async fn configure_health_check(
        &self,
        name: &str,
        health_check: &HealthCheck,
    ) -> Result<(), ApiError> {
        self.recorder.record("configure_health_check", name).await?;
        let mut state = self.state().await;
        state.get_mut(name)?.description.health_check = health_check.to_owned();

        Ok(())
    }

    async fn describe_load_balancer_attributes(
        &self,
        name: &str,
    ) -> Result<LoadBalancerAttributes, ApiError> {
        self.recorder
            .record("describe_load_balancer_attributes", name)
            .await?;
        let mut state = self.state().await;

        Ok(state.get_mut(name)?.attributes.clone())
    }

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> Result<(), ApiError> {
        self.recorder
            .record("modify_load_balancer_attributes", name)
            .await?;
        let mut state = self.state().await;
        state.get_mut(name)?.attributes = attributes.to_owned();

        Ok(())
    }

    async fn describe_load_balancer_policies(
        &self,
        name: &str,
        policy_names: &[String],
    ) -> Result<Vec<PolicyDescription>, ApiError> {
        self.recorder
            .record("describe_load_balancer_policies", name)
            .await?;
        let mut state = self.state().await;
        let policies = &state.get_mut(name)?.policies;

        if policy_names.is_empty() {
            return Ok(policies.clone());
        }

        policy_names
            .iter()
            .map(|policy_name| {
                policies
                    .iter()
                    .find(|policy| &policy.name == policy_name)
                    .cloned()
                    .ok_or_else(|| not_found(codes::POLICY_NOT_FOUND, policy_name))
            })
            .collect()
    }

    async fn create_load_balancer_policy(
        &self,
        name: &str,
        policy: &PolicyDescription,
    ) -> Result<(), ApiError> {
        self.recorder
            .record("create_load_balancer_policy", &policy.name)
            .await?;
        let mut state = self.state().await;
        let policies = &mut state.get_mut(name)?.policies;

        if policies.iter().any(|existing| existing.name == policy.name) {
            return Err(ApiError::new(
                codes::DUPLICATE_POLICY_NAME,
                format!("Policy '{}' already exists", policy.name),
            ));
        }

        policies.push(policy.to_owned());
        Ok(())
    }

    async fn set_load_balancer_policies_of_listener(
        &self,
        name: &str,
        load_balancer_port: i64,
        policy_names: &[String],
    ) -> Result<(), ApiError> {
        self.recorder
            .record("set_load_balancer_policies_of_listener", name)
            .await?;
        let mut state = self.state().await;
        let listener = state
            .get_mut(name)?
            .description
            .listener_descriptions
            .iter_mut()
            .find(|description| description.listener.load_balancer_port == load_balancer_port)
            .ok_or_else(|| {
                ApiError::new(
                    "ListenerNotFound",
                    format!("No listener on port {load_balancer_port}"),
                )
            })?;

        listener.policy_names = policy_names.to_vec();
        Ok(())
    }

    async fn set_load_balancer_policies_for_backend_server(
        &self,
        name: &str,
        instance_port: i64,
        policy_names: &[String],
    ) -> Result<(), ApiError> {
        self.recorder
            .record("set_load_balancer_policies_for_backend_server", name)
            .await?;
        let mut state = self.state().await;
        let backends = &mut state.get_mut(name)?.description.backend_server_descriptions;

        backends.retain(|backend| backend.instance_port != instance_port);
        if !policy_names.is_empty() {
            backends.push(BackendServerDescription {
                instance_port,
                policy_names: policy_names.to_vec(),
            });
        }

        Ok(())
    }

    async fn add_tags(&self, name: &str, tags: &Tags) -> Result<(), ApiError> {
        self.recorder.record("add_tags", name).await?;
        let mut state = self.state().await;
        state.get_mut(name)?.description.tags.extend(tags.clone());

        Ok(())
    }
}
