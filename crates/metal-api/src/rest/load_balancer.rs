use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{TokenSource, Transport};
use crate::{
    error::Result,
    load_balancer::{
        CreateLoadBalancerRequest, CreateOriginRequest, CreatePoolRequest, CreatePortRequest,
        ListenerPort, LoadBalancer, LoadBalancerApi, Origin, Pool,
    },
};

#[derive(Deserialize)]
struct PortList {
    #[serde(default)]
    ports: Vec<ListenerPort>,
}

#[derive(Serialize)]
struct UpdatePortRequest<'a> {
    add_pool_ids: [&'a str; 1],
}

/// [`LoadBalancerApi`] over the load balancer REST API.
///
/// Every request carries a bearer token obtained from the shared [`TokenSource`]. A `401`
/// answer invalidates the cached token so that the next request exchanges a fresh one.
#[derive(Clone, Debug)]
pub struct LoadBalancerClient {
    transport: Transport,
    tokens: Arc<TokenSource>,
}

impl LoadBalancerClient {
    pub fn new(base_url: &str, tokens: Arc<TokenSource>) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(base_url)?,
            tokens,
        })
    }

    async fn call<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.tokens.token().await?;
        let url = self.transport.url(&format!("v1/{path}"))?;
        let result = self
            .transport
            .send_json(method, url, |request| request.bearer_auth(token), body)
            .await;
        self.forget_rejected_token(result).await
    }

    async fn call_empty(&self, method: Method, path: &str) -> Result<()> {
        let token = self.tokens.token().await?;
        let url = self.transport.url(&format!("v1/{path}"))?;
        let result = self
            .transport
            .send_empty::<()>(method, url, |request| request.bearer_auth(token), None)
            .await;
        self.forget_rejected_token(result).await
    }

    async fn forget_rejected_token<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                tracing::debug!("load balancer API rejected the token, dropping it");
                self.tokens.invalidate().await;
            }
        }
        result
    }
}

#[async_trait]
impl LoadBalancerApi for LoadBalancerClient {
    async fn create_load_balancer(
        &self,
        project_id: &str,
        request: &CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer> {
        self.call(
            Method::POST,
            &format!("projects/{project_id}/loadbalancers"),
            Some(request),
        )
        .await
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        self.call::<(), _>(Method::GET, &format!("loadbalancers/{id}"), None)
            .await
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<()> {
        self.call_empty(Method::DELETE, &format!("loadbalancers/{id}"))
            .await
    }

    async fn create_port(
        &self,
        load_balancer_id: &str,
        request: &CreatePortRequest,
    ) -> Result<ListenerPort> {
        self.call(
            Method::POST,
            &format!("loadbalancers/{load_balancer_id}/ports"),
            Some(request),
        )
        .await
    }

    async fn list_ports(&self, load_balancer_id: &str) -> Result<Vec<ListenerPort>> {
        let list: PortList = self
            .call::<(), _>(
                Method::GET,
                &format!("loadbalancers/{load_balancer_id}/ports"),
                None,
            )
            .await?;
        Ok(list.ports)
    }

    async fn add_pool_to_port(&self, port_id: &str, pool_id: &str) -> Result<ListenerPort> {
        self.call(
            Method::PATCH,
            &format!("loadbalancers/ports/{port_id}"),
            Some(&UpdatePortRequest {
                add_pool_ids: [pool_id],
            }),
        )
        .await
    }

    async fn create_pool(&self, project_id: &str, request: &CreatePoolRequest) -> Result<Pool> {
        self.call(
            Method::POST,
            &format!("projects/{project_id}/loadbalancers/pools"),
            Some(request),
        )
        .await
    }

    async fn get_pool(&self, id: &str) -> Result<Pool> {
        self.call::<(), _>(Method::GET, &format!("loadbalancers/pools/{id}"), None)
            .await
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        self.call_empty(Method::DELETE, &format!("loadbalancers/pools/{id}"))
            .await
    }

    async fn create_origin(&self, pool_id: &str, request: &CreateOriginRequest) -> Result<Origin> {
        self.call(
            Method::POST,
            &format!("loadbalancers/pools/{pool_id}/origins"),
            Some(request),
        )
        .await
    }

    async fn get_origin(&self, id: &str) -> Result<Origin> {
        self.call::<(), _>(
            Method::GET,
            &format!("loadbalancers/pools/origins/{id}"),
            None,
        )
        .await
    }

    async fn delete_origin(&self, id: &str) -> Result<()> {
        self.call_empty(Method::DELETE, &format!("loadbalancers/pools/origins/{id}"))
            .await
    }
}
