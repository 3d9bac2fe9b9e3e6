use super::Scope;
use crate::{
    crd::{ApiEndpoint, MetalCluster, MetalClusterStatus},
    status::conditions::{self, Condition},
};

pub type ClusterScope = Scope<MetalCluster>;

impl Scope<MetalCluster> {
    fn status_mut(&mut self) -> &mut MetalClusterStatus {
        self.resource_mut().status.get_or_insert_default()
    }

    pub fn project_id(&self) -> &str {
        &self.resource().spec.project_id
    }

    pub fn control_plane_endpoint(&self) -> Option<&ApiEndpoint> {
        self.resource()
            .spec
            .control_plane_endpoint
            .as_ref()
            .filter(|endpoint| endpoint.is_valid())
    }

    /// Sets the control plane endpoint unless a valid one is already present.
    pub fn set_control_plane_endpoint(&mut self, endpoint: ApiEndpoint) {
        if self.control_plane_endpoint().is_none() {
            self.resource_mut().spec.control_plane_endpoint = Some(endpoint);
        }
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.status_mut().ready = ready;
    }

    /// Sets `condition` and refreshes the `Ready` summary.
    pub fn set_condition(&mut self, condition: Condition) {
        let conditions = &mut self.status_mut().conditions;
        conditions::set(conditions, condition);
        conditions::set_summary(conditions);
    }
}
