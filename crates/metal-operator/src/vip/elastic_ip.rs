use metal_api::{
    ComputeApi,
    compute::{CreateIpReservationRequest, Device, IpReservation},
};
use snafu::{OptionExt, ResultExt};

use super::{
    AssignIpSnafu, CreateReservationSnafu, Error, GetReservationSnafu, MachineContext,
    MissingReservationSnafu,
};
use crate::{
    crd::{ApiEndpoint, MetalCluster, cluster::DEFAULT_API_SERVER_PORT},
    device::cluster_tag,
    scope::ClusterScope,
};

/// An elastic IP reserved per cluster and assigned to a control plane device.
pub struct ElasticIp<'a> {
    compute: &'a dyn ComputeApi,
}

impl<'a> ElasticIp<'a> {
    pub fn new(compute: &'a dyn ComputeApi) -> Self {
        Self { compute }
    }

    pub(super) async fn reservation(
        &self,
        project_id: &str,
        cluster_name: &str,
    ) -> Result<Option<IpReservation>, Error> {
        self.compute
            .get_ip_by_tag(project_id, &cluster_tag(cluster_name))
            .await
            .context(GetReservationSnafu {
                cluster: cluster_name,
            })
    }

    pub(super) async fn acquire_endpoint(
        &self,
        cluster: &mut ClusterScope,
        cluster_name: &str,
    ) -> Result<(), Error> {
        if cluster.control_plane_endpoint().is_some() {
            return Ok(());
        }

        let project_id = cluster.project_id().to_owned();
        let reservation = match self.reservation(&project_id, cluster_name).await? {
            Some(reservation) => reservation,
            None => {
                let (facility, metro) = cluster.resource().locality();
                let request = CreateIpReservationRequest::single_public_ipv4(
                    facility.map(str::to_owned),
                    metro.map(str::to_owned),
                    vec![cluster_tag(cluster_name)],
                );
                let reservation = self
                    .compute
                    .create_ip_reservation(&project_id, &request)
                    .await
                    .context(CreateReservationSnafu {
                        cluster: cluster_name,
                    })?;
                tracing::info!(
                    cluster = cluster_name,
                    reservation.id = reservation.id,
                    reservation.address = reservation.address,
                    "reserved elastic IP"
                );
                reservation
            }
        };

        cluster.set_control_plane_endpoint(ApiEndpoint::new(
            reservation.address,
            DEFAULT_API_SERVER_PORT,
        ));
        Ok(())
    }

    /// Assigns the cluster's elastic IP to a control plane device unless it is assigned already.
    pub(super) async fn post_device_ready(
        &self,
        cluster: &MetalCluster,
        device: &Device,
        machine: &MachineContext<'_>,
    ) -> Result<(), Error> {
        if !machine.is_control_plane {
            return Ok(());
        }

        let reservation = self
            .reservation(&cluster.spec.project_id, machine.cluster_name)
            .await?
            .context(MissingReservationSnafu {
                cluster: machine.cluster_name,
            })?;
        if !reservation.assignments.is_empty() {
            return Ok(());
        }

        self.compute
            .create_ip_assignment(&device.id, &reservation.address)
            .await
            .context(AssignIpSnafu {
                device_id: &device.id,
                address: &reservation.address,
            })?;
        tracing::info!(
            device.id = device.id,
            reservation.address = reservation.address,
            "assigned elastic IP to control plane device"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use metal_api::compute::Href;

    use super::*;
    use crate::{
        crd::{MetalClusterSpec, VipManager},
        testing::FakeCompute,
    };

    fn cluster() -> MetalCluster {
        MetalCluster::new(
            "c1",
            MetalClusterSpec {
                project_id: "p1".to_owned(),
                facility: Some("da11".to_owned()),
                metro: None,
                vip_manager: VipManager::ManagedElasticIp,
                control_plane_endpoint: None,
            },
        )
    }

    fn control_plane() -> MachineContext<'static> {
        MachineContext {
            cluster_name: "c1",
            is_control_plane: true,
        }
    }

    #[tokio::test]
    async fn endpoint_reuses_tagged_reservation() {
        let compute = FakeCompute::default();
        compute.insert_reservation(IpReservation {
            id: "ip-0".to_owned(),
            address: "147.75.9.9".to_owned(),
            tags: vec![cluster_tag("c1")],
            ..IpReservation::default()
        });
        let mut scope = ClusterScope::open(cluster());

        ElasticIp::new(&compute)
            .acquire_endpoint(&mut scope, "c1")
            .await
            .expect("endpoint is acquired");

        assert_eq!(
            scope.control_plane_endpoint(),
            Some(&ApiEndpoint::new("147.75.9.9", 6443))
        );
        assert_eq!(compute.calls("create_ip_reservation"), 0);
    }

    #[tokio::test]
    async fn endpoint_reserves_ip_once() {
        let compute = FakeCompute::default();
        let strategy = ElasticIp::new(&compute);

        let mut scope = ClusterScope::open(cluster());
        strategy
            .acquire_endpoint(&mut scope, "c1")
            .await
            .expect("endpoint is acquired");
        let mut again = ClusterScope::open(cluster());
        strategy
            .acquire_endpoint(&mut again, "c1")
            .await
            .expect("endpoint is acquired");

        assert_eq!(compute.calls("create_ip_reservation"), 1);
        assert_eq!(scope.control_plane_endpoint(), again.control_plane_endpoint());
        assert_eq!(compute.reservations()[0].tags, vec![cluster_tag("c1")]);
    }

    #[tokio::test]
    async fn unassigned_ip_is_assigned_exactly_once() {
        let compute = FakeCompute::default();
        compute.insert_reservation(IpReservation {
            id: "ip-0".to_owned(),
            address: "147.75.9.9".to_owned(),
            tags: vec![cluster_tag("c1")],
            ..IpReservation::default()
        });
        let strategy = ElasticIp::new(&compute);
        let device = Device {
            id: "d1".to_owned(),
            ..Device::default()
        };

        for _ in 0..2 {
            strategy
                .post_device_ready(&cluster(), &device, &control_plane())
                .await
                .expect("assignment succeeds");
        }

        assert_eq!(compute.calls("create_ip_assignment"), 1);
        assert_eq!(
            compute.reservations()[0].assignments,
            vec![Href {
                href: "/devices/d1".to_owned()
            }]
        );
    }

    #[tokio::test]
    async fn workers_are_never_assigned() {
        let compute = FakeCompute::default();
        let worker = MachineContext {
            cluster_name: "c1",
            is_control_plane: false,
        };

        ElasticIp::new(&compute)
            .post_device_ready(&cluster(), &Device::default(), &worker)
            .await
            .expect("nothing to do");

        assert_eq!(compute.calls("get_ip_by_tag"), 0);
        assert_eq!(compute.calls("create_ip_assignment"), 0);
    }
}
