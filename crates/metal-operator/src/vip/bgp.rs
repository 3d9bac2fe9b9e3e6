use metal_api::{ComputeApi, compute::Device};
use snafu::ResultExt;

use super::{ElasticIp, EnableDeviceBgpSnafu, EnableProjectBgpSnafu, Error, MachineContext};
use crate::scope::ClusterScope;

/// The cluster's elastic IP, announced over BGP by the control plane devices themselves.
pub struct Bgp<'a> {
    compute: &'a dyn ComputeApi,
    elastic_ip: ElasticIp<'a>,
}

impl<'a> Bgp<'a> {
    pub fn new(compute: &'a dyn ComputeApi) -> Self {
        Self {
            compute,
            elastic_ip: ElasticIp::new(compute),
        }
    }

    pub(super) async fn acquire_endpoint(
        &self,
        cluster: &mut ClusterScope,
        cluster_name: &str,
    ) -> Result<(), Error> {
        let project_id = cluster.project_id().to_owned();
        self.compute
            .enable_project_bgp(&project_id)
            .await
            .context(EnableProjectBgpSnafu {
                project_id: &project_id,
            })?;

        self.elastic_ip.acquire_endpoint(cluster, cluster_name).await
    }

    pub(super) async fn on_device(
        &self,
        device: &Device,
        machine: &MachineContext<'_>,
    ) -> Result<(), Error> {
        if !machine.is_control_plane {
            return Ok(());
        }
        self.compute
            .enable_device_bgp(&device.id)
            .await
            .context(EnableDeviceBgpSnafu {
                device_id: &device.id,
            })
    }
}
