use super::Scope;
use crate::{
    crd::{
        FailureReason, InstanceState, MachineAddress, MetalMachine, MetalMachineStatus,
        machine::provider_id,
    },
    status::conditions::{self, Condition},
};

pub type MachineScope = Scope<MetalMachine>;

impl Scope<MetalMachine> {
    fn status_mut(&mut self) -> &mut MetalMachineStatus {
        self.resource_mut().status.get_or_insert_default()
    }

    pub fn has_failed(&self) -> bool {
        self.resource().failure_reason().is_some()
    }

    /// Records a terminal failure. The first failure wins, later ones are ignored.
    pub fn set_failure(&mut self, reason: FailureReason, message: impl Into<String>) -> bool {
        if self.has_failed() {
            return false;
        }
        let status = self.status_mut();
        status.failure_reason = Some(reason);
        status.failure_message = Some(message.into());
        true
    }

    /// Records the device backing this machine. A provider ID that is already set is kept.
    pub fn set_provider_id(&mut self, device_id: &str) {
        let spec = &mut self.resource_mut().spec;
        if spec.provider_id.is_none() {
            spec.provider_id = Some(provider_id(device_id));
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        self.resource().device_id()
    }

    pub fn set_instance_state(&mut self, state: InstanceState) {
        self.status_mut().instance_state = Some(state);
    }

    pub fn set_addresses(&mut self, addresses: Vec<MachineAddress>) {
        self.status_mut().addresses = addresses;
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

    pub fn conditions(&self) -> &[Condition] {
        self.resource()
            .status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }
}
