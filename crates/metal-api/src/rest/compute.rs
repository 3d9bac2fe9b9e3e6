use async_trait::async_trait;
use http::Method;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};

use super::Transport;
use crate::{
    compute::{ComputeApi, CreateDeviceRequest, CreateIpReservationRequest, Device, IpReservation},
    error::Result,
};

const AUTH_HEADER: &str = "X-Auth-Token";
const DEVICE_PAGE_SIZE: &str = "1000";
const BGP_ASN: u32 = 65000;

#[derive(Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    meta: PageMeta,
}

/// Pagination metadata of list responses, `next` is absent on the last page.
#[derive(Default, Deserialize)]
struct PageMeta {
    #[serde(default)]
    next: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct IpReservationList {
    #[serde(default)]
    ip_addresses: Vec<IpReservation>,
}

#[derive(Deserialize)]
struct BgpConfig {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct BgpSessionList {
    #[serde(default)]
    bgp_sessions: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct CreateBgpConfigRequest<'a> {
    deployment_type: &'a str,
    asn: u32,
}

#[derive(Serialize)]
struct CreateBgpSessionRequest<'a> {
    address_family: &'a str,
}

#[derive(Serialize)]
struct CreateIpAssignmentRequest<'a> {
    address: &'a str,
}

/// [`ComputeApi`] over the provider's REST API, authenticated with a static API key.
#[derive(Clone)]
pub struct MetalClient {
    transport: Transport,
    api_key: String,
}

impl std::fmt::Debug for MetalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetalClient")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl MetalClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(base_url)?,
            api_key: api_key.into(),
        })
    }

    fn authenticate(&self) -> impl FnOnce(RequestBuilder) -> RequestBuilder + '_ {
        move |request| request.header(AUTH_HEADER, &self.api_key)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.transport.url(path)?;
        self.transport
            .send_json::<(), T>(Method::GET, url, self.authenticate(), None)
            .await
    }
}

#[async_trait]
impl ComputeApi for MetalClient {
    async fn find_devices_by_project(
        &self,
        project_id: &str,
        tags: &[String],
    ) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for page in 1.. {
            let mut url = self.transport.url(&format!("projects/{project_id}/devices"))?;
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("per_page", DEVICE_PAGE_SIZE)
                .append_pair("include", "facility,metro");

            let list: DeviceList = self
                .transport
                .send_json::<(), _>(Method::GET, url, self.authenticate(), None)
                .await?;
            let last_page = list.meta.next.is_none() || list.devices.is_empty();
            devices.extend(list.devices.into_iter().filter(|device| device.has_tags(tags)));
            if last_page {
                break;
            }
            tracing::trace!(project.id = project_id, page, "fetching next page of devices");
        }
        Ok(devices)
    }

    async fn get_device(&self, device_id: &str) -> Result<Device> {
        self.get(&format!("devices/{device_id}?include=facility,metro"))
            .await
    }

    async fn create_device(
        &self,
        project_id: &str,
        request: &CreateDeviceRequest,
    ) -> Result<Device> {
        let url = self.transport.url(&format!("projects/{project_id}/devices"))?;
        self.transport
            .send_json(Method::POST, url, self.authenticate(), Some(request))
            .await
    }

    async fn delete_device(&self, device_id: &str, force: bool) -> Result<()> {
        let mut url = self.transport.url(&format!("devices/{device_id}"))?;
        if force {
            url.query_pairs_mut().append_pair("force_delete", "true");
        }
        self.transport
            .send_empty::<()>(Method::DELETE, url, self.authenticate(), None)
            .await
    }

    async fn create_ip_assignment(&self, device_id: &str, address: &str) -> Result<()> {
        let url = self.transport.url(&format!("devices/{device_id}/ips"))?;
        self.transport
            .send_empty(
                Method::POST,
                url,
                self.authenticate(),
                Some(&CreateIpAssignmentRequest { address }),
            )
            .await
    }

    async fn get_ip_by_tag(&self, project_id: &str, tag: &str) -> Result<Option<IpReservation>> {
        let list: IpReservationList = self
            .get(&format!("projects/{project_id}/ips?types=public_ipv4"))
            .await?;

        Ok(list
            .ip_addresses
            .into_iter()
            .find(|reservation| reservation.tags.iter().any(|own| own == tag)))
    }

    async fn create_ip_reservation(
        &self,
        project_id: &str,
        request: &CreateIpReservationRequest,
    ) -> Result<IpReservation> {
        let url = self.transport.url(&format!("projects/{project_id}/ips"))?;
        self.transport
            .send_json(Method::POST, url, self.authenticate(), Some(request))
            .await
    }

    async fn enable_project_bgp(&self, project_id: &str) -> Result<()> {
        let config: BgpConfig = self
            .get(&format!("projects/{project_id}/bgp-config"))
            .await?;
        if config.status.as_deref() == Some("enabled") {
            tracing::debug!(project.id = project_id, "project BGP already enabled");
            return Ok(());
        }

        let url = self
            .transport
            .url(&format!("projects/{project_id}/bgp-configs"))?;
        self.transport
            .send_empty(
                Method::POST,
                url,
                self.authenticate(),
                Some(&CreateBgpConfigRequest {
                    deployment_type: "local",
                    asn: BGP_ASN,
                }),
            )
            .await
    }

    async fn enable_device_bgp(&self, device_id: &str) -> Result<()> {
        let sessions: BgpSessionList = self
            .get(&format!("devices/{device_id}/bgp/sessions"))
            .await?;
        if !sessions.bgp_sessions.is_empty() {
            return Ok(());
        }

        let url = self
            .transport
            .url(&format!("devices/{device_id}/bgp/sessions"))?;
        self.transport
            .send_empty(
                Method::POST,
                url,
                self.authenticate(),
                Some(&CreateBgpSessionRequest {
                    address_family: "ipv4",
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    use super::*;

    async fn client(server: &MockServer) -> MetalClient {
        MetalClient::new(&format!("{}/metal/v1", server.uri()), "secret")
            .expect("mock server URI is valid")
    }

    #[tokio::test]
    async fn get_device_sends_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/devices/d1"))
            .and(header("X-Auth-Token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "d1",
                "state": "active",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let device = client(&server).await.get_device("d1").await.expect("device");
        assert_eq!(device.state, "active");
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/devices/gone"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"errors": ["Not found"]})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .get_device("gone")
            .await
            .expect_err("device is missing");
        assert!(err.is_not_found());
        assert!(err.to_string().ends_with("Not found"), "{err}");
    }

    #[tokio::test]
    async fn find_devices_filters_by_every_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/projects/p1/devices"))
            .and(query_param("per_page", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [
                    {"id": "a", "tags": ["cluster", "machine-a"]},
                    {"id": "b", "tags": ["cluster", "machine-b"]},
                    {"id": "c", "tags": ["machine-a"]},
                ]
            })))
            .mount(&server)
            .await;

        let devices = client(&server)
            .await
            .find_devices_by_project("p1", &["cluster".to_owned(), "machine-a".to_owned()])
            .await
            .expect("devices");
        let ids: Vec<_> = devices.iter().map(|device| device.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn find_devices_reads_every_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/projects/p1/devices"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [{"id": "a", "tags": ["cluster", "machine-a"]}],
                "meta": {
                    "current_page": 1,
                    "last_page": 2,
                    "next": {"href": "/projects/p1/devices?page=2"},
                },
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/projects/p1/devices"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "devices": [{"id": "b", "tags": ["cluster", "machine-b"]}],
                "meta": {"current_page": 2, "last_page": 2, "next": null},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let devices = client(&server)
            .await
            .find_devices_by_project("p1", &["cluster".to_owned(), "machine-b".to_owned()])
            .await
            .expect("devices");
        let ids: Vec<_> = devices.iter().map(|device| device.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn project_bgp_is_only_created_when_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/projects/p1/bgp-config"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "enabled"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/metal/v1/projects/p1/bgp-configs"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        client(&server)
            .await
            .enable_project_bgp("p1")
            .await
            .expect("BGP already enabled");
    }

    #[tokio::test]
    async fn device_bgp_session_is_created_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/devices/d1/bgp/sessions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"bgp_sessions": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/metal/v1/devices/d1/bgp/sessions"))
            .and(body_json(serde_json::json!({"address_family": "ipv4"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .enable_device_bgp("d1")
            .await
            .expect("session created");
    }

    #[tokio::test]
    async fn ip_lookup_matches_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metal/v1/projects/p1/ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ip_addresses": [
                    {"id": "r1", "address": "1.1.1.1", "tags": ["other"]},
                    {"id": "r2", "address": "2.2.2.2", "tags": ["mine"]},
                ]
            })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let found = client.get_ip_by_tag("p1", "mine").await.expect("lookup");
        assert_eq!(found.map(|ip| ip.address), Some("2.2.2.2".to_owned()));

        let missing = client.get_ip_by_tag("p1", "nobody").await.expect("lookup");
        assert_eq!(missing, None);
    }
}
