//! Models and client trait for the managed load balancer API.
//!
//! The hierarchy is load balancer → listener port → pool → origin. Ports reference pools by ID,
//! origins belong to exactly one pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoadBalancer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub ports: Vec<ListenerPort>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListenerPort {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub number: u16,
    #[serde(default)]
    pub pool_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Origin {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub target: String,
    pub port_number: u16,
    #[serde(default)]
    pub active: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub location_id: String,
    pub provider_id: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CreatePortRequest {
    pub name: String,
    pub number: u16,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CreatePoolRequest {
    pub name: String,
    pub protocol: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CreateOriginRequest {
    pub name: String,
    pub target: String,
    pub port_number: u16,
    pub active: bool,
}

/// CRUD for load balancers, listener ports, pools and origins.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    async fn create_load_balancer(
        &self,
        project_id: &str,
        request: &CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer>;

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer>;

    async fn delete_load_balancer(&self, id: &str) -> Result<()>;

    async fn create_port(
        &self,
        load_balancer_id: &str,
        request: &CreatePortRequest,
    ) -> Result<ListenerPort>;

    async fn list_ports(&self, load_balancer_id: &str) -> Result<Vec<ListenerPort>>;

    /// Adds `pool_id` to the pools served by the port. Adding a pool twice is accepted by the
    /// server and leaves the port unchanged.
    async fn add_pool_to_port(&self, port_id: &str, pool_id: &str) -> Result<ListenerPort>;

    async fn create_pool(&self, project_id: &str, request: &CreatePoolRequest) -> Result<Pool>;

    async fn get_pool(&self, id: &str) -> Result<Pool>;

    async fn delete_pool(&self, id: &str) -> Result<()>;

    async fn create_origin(&self, pool_id: &str, request: &CreateOriginRequest) -> Result<Origin>;

    async fn get_origin(&self, id: &str) -> Result<Origin>;

    async fn delete_origin(&self, id: &str) -> Result<()>;
}
