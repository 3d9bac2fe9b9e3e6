//! Reconciles [`MetalMachine`]s into devices.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, ResourceExt,
    core::DynamicObject,
    runtime::{
        Controller,
        controller::Action,
        finalizer::{self, finalizer},
        reflector::{ObjectRef, Store},
        watcher,
    },
};
use metal_api::{ComputeApi, LoadBalancerApi, compute::Device};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{BGP_REQUEUE, Ctx, ERROR_REQUEUE, PROVISIONING_REQUEUE};
use crate::{
    crd::{
        CLUSTER_NAME_LABEL, FailureReason, InstanceState, MACHINE_FINALIZER, MetalCluster,
        MetalMachine, MetalMachineSpec,
        capi::{self, Cluster, Machine},
        validation,
    },
    device::{self, CreateFailure, DeviceRequest, DeviceTags},
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
    scope::{self, MachineScope},
    status::conditions::{Condition, ConditionReason, ConditionSeverity, ConditionType},
    vip::{self, MachineContext, PostReady, VipStrategy},
};

pub const CONTROLLER_NAME: &str = "metalmachine";

/// Key of the bootstrap data in the secret named by the owning `Machine`.
const BOOTSTRAP_DATA_KEY: &str = "value";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get owner {machine}"))]
    GetOwner {
        source: kube::Error,
        machine: ObjectRef<Machine>,
    },

    #[snafu(display("failed to get {cluster}"))]
    GetCluster {
        source: kube::Error,
        cluster: ObjectRef<Cluster>,
    },

    #[snafu(display("failed to get {metal_cluster}"))]
    GetMetalCluster {
        source: kube::Error,
        metal_cluster: ObjectRef<MetalCluster>,
    },

    #[snafu(display("failed to get bootstrap data secret {secret}"))]
    GetBootstrapSecret {
        source: kube::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("bootstrap data secret {secret} has no UTF-8 {BOOTSTRAP_DATA_KEY:?} entry"))]
    MissingBootstrapValue { secret: ObjectRef<Secret> },

    #[snafu(display("rejected change of MetalMachine spec"))]
    InvalidUpdate { source: validation::Errors },

    #[snafu(display("failed to record the applied MetalMachine spec"))]
    RecordSpec { source: serde_json::Error },

    #[snafu(display("failed to look up device"))]
    FindDevice { source: metal_api::Error },

    #[snafu(display("failed to create device"))]
    CreateDevice { source: metal_api::Error },

    #[snafu(display("failed to delete device {device_id:?}"))]
    DeleteDevice {
        source: metal_api::Error,
        device_id: String,
    },

    #[snafu(display("failed to set up the control plane VIP"))]
    Vip { source: vip::Error },

    #[snafu(display("device is not where it was requested"))]
    Location { source: device::Error },

    #[snafu(display("device {device_id:?} is in unknown state {state:?}"))]
    UnknownDeviceState { device_id: String, state: String },

    #[snafu(display("failed to persist MetalMachine changes"))]
    PersistChanges { source: scope::Error },

    #[snafu(display("failed to run finalizer"))]
    Finalizer {
        #[snafu(source(from(finalizer::Error<Error>, Box::new)))]
        source: Box<finalizer::Error<Error>>,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn is_terminal(&self) -> bool {
        match self {
            Self::InvalidUpdate { .. } | Self::UnknownDeviceState { .. } => true,
            Self::Finalizer { source } => match source.as_ref() {
                finalizer::Error::ApplyFailed(error) | finalizer::Error::CleanupFailed(error) => {
                    error.is_terminal()
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::GetOwner { machine, .. } => Some(machine.clone().erase()),
            Self::GetCluster { cluster, .. } => Some(cluster.clone().erase()),
            Self::GetMetalCluster { metal_cluster, .. } => Some(metal_cluster.clone().erase()),
            Self::GetBootstrapSecret { secret, .. } | Self::MissingBootstrapValue { secret } => {
                Some(secret.clone().erase())
            }
            _ => None,
        }
    }
}

/// The objects a [`MetalMachine`] depends on, each `None` until it exists.
#[derive(Clone, Debug, Default)]
pub struct MachineInputs {
    /// The owning Cluster API `Machine`.
    pub machine: Option<Machine>,
    pub cluster: Option<Cluster>,
    pub metal_cluster: Option<MetalCluster>,
    pub bootstrap_data: Option<String>,
}

impl MachineInputs {
    fn is_paused(&self, metal_machine: &MetalMachine) -> bool {
        self.cluster
            .as_ref()
            .is_some_and(|cluster| capi::is_paused(cluster, metal_machine))
    }

    /// Name of the Cluster API cluster, from the owner or from the machine's own label.
    fn cluster_name(&self, metal_machine: &MetalMachine) -> Option<String> {
        self.machine
            .as_ref()
            .map(|machine| machine.cluster_name().to_owned())
            .or_else(|| metal_machine.labels().get(CLUSTER_NAME_LABEL).cloned())
    }
}

fn waiting(reason: ConditionReason, message: &str) -> Condition {
    Condition::false_(
        ConditionType::DeviceReady,
        reason,
        ConditionSeverity::Info,
        message,
    )
}

pub struct MachineReconciler<'a> {
    compute: &'a dyn ComputeApi,
    load_balancers: &'a dyn LoadBalancerApi,
}

impl<'a> MachineReconciler<'a> {
    pub fn new(compute: &'a dyn ComputeApi, load_balancers: &'a dyn LoadBalancerApi) -> Self {
        Self {
            compute,
            load_balancers,
        }
    }

    pub async fn reconcile(
        &self,
        scope: &mut MachineScope,
        inputs: &MachineInputs,
    ) -> Result<Action, Error> {
        if scope.has_failed() {
            tracing::debug!(machine = scope.name(), "machine has failed, nothing to do");
            return Ok(Action::await_change());
        }

        let spec = scope.resource().spec.clone();
        let applied = validation::last_applied_spec::<MetalMachineSpec, _>(scope.resource());
        if let Some(applied) = applied {
            if let Err(source) = validation::validate_machine_update(&applied, &spec) {
                scope.set_condition(Condition::false_(
                    ConditionType::DeviceReady,
                    ConditionReason::InvalidConfiguration,
                    ConditionSeverity::Error,
                    source.to_string(),
                ));
                return Err(Error::InvalidUpdate { source });
            }
        }

        let outcome = self.reconcile_device(scope, inputs).await;

        let spec = scope.resource().spec.clone();
        validation::record_applied_spec(scope.resource_mut(), &spec).context(RecordSpecSnafu)?;
        outcome
    }

    async fn reconcile_device(
        &self,
        scope: &mut MachineScope,
        inputs: &MachineInputs,
    ) -> Result<Action, Error> {
        let Some(owner) = &inputs.machine else {
            scope.set_condition(waiting(
                ConditionReason::WaitingForOwner,
                "waiting for the owning Machine",
            ));
            return Ok(Action::await_change());
        };
        let (Some(cluster), Some(metal_cluster)) = (&inputs.cluster, &inputs.metal_cluster) else {
            scope.set_condition(waiting(
                ConditionReason::WaitingForClusterInfrastructure,
                "waiting for the cluster",
            ));
            return Ok(Action::await_change());
        };
        if !cluster.infrastructure_ready() {
            scope.set_condition(waiting(
                ConditionReason::WaitingForClusterInfrastructure,
                "waiting for the cluster infrastructure to be ready",
            ));
            return Ok(Action::await_change());
        }
        let Some(bootstrap_data) = &inputs.bootstrap_data else {
            scope.set_condition(waiting(
                ConditionReason::WaitingForBootstrapData,
                "waiting for bootstrap data",
            ));
            return Ok(Action::await_change());
        };

        let machine = MachineContext {
            cluster_name: owner.cluster_name(),
            is_control_plane: owner.is_control_plane(),
        };
        let strategy = VipStrategy::select(
            metal_cluster.spec.vip_manager,
            self.compute,
            self.load_balancers,
        );
        let tags =
            DeviceTags::for_machine(&scope.namespace(), &scope.name(), machine.cluster_name);

        let found = device::find_device(
            self.compute,
            &metal_cluster.spec.project_id,
            scope.device_id(),
            &tags,
        )
        .await;
        let device = match found {
            Ok(Some(device)) => device,
            Ok(None) => {
                let request = DeviceRequest {
                    machine: scope.resource(),
                    cluster: metal_cluster,
                    tags,
                    user_data: bootstrap_data.clone(),
                    custom_data: strategy
                        .pre_device_create(metal_cluster, &machine)
                        .context(VipSnafu)?,
                }
                .build();
                match self.create_device(scope, metal_cluster, &request).await? {
                    Some(device) => device,
                    None => return Ok(Action::requeue(PROVISIONING_REQUEUE)),
                }
            }
            Err(error) if error.is_not_found() => {
                let message = format!("device not found: {}", error.full_message());
                scope.set_failure(FailureReason::UpdateMachineError, &message);
                scope.set_condition(Condition::false_(
                    ConditionType::DeviceReady,
                    ConditionReason::InstanceNotFound,
                    ConditionSeverity::Error,
                    message,
                ));
                return Ok(Action::await_change());
            }
            Err(error) if error.is_forbidden() => {
                let message = format!("device is not accessible: {}", error.full_message());
                scope.set_failure(FailureReason::InstanceProvisionFailed, &message);
                scope.set_condition(Condition::false_(
                    ConditionType::DeviceReady,
                    ConditionReason::InstanceProvisionFailed,
                    ConditionSeverity::Error,
                    message,
                ));
                return Ok(Action::await_change());
            }
            Err(source) => return Err(Error::FindDevice { source }),
        };

        let state = InstanceState::from_provider(&device.state);
        scope.set_provider_id(&device.id);
        scope.set_instance_state(state);
        scope.set_addresses(device::machine_addresses(&device));

        let (facility, metro) = device::locality(scope.resource(), metal_cluster);
        device::check_location(&device, facility, metro).context(LocationSnafu)?;

        if let Err(error) = strategy.on_device(&device, &machine).await {
            tracing::warn!(
                device.id = device.id,
                error = &error as &dyn std::error::Error,
                "failed to enable BGP, retrying later"
            );
            return Ok(Action::requeue(BGP_REQUEUE));
        }

        match state {
            InstanceState::New | InstanceState::Queued | InstanceState::Provisioning => {
                tracing::debug!(device.id = device.id, %state, "device is not running yet");
                scope.set_ready(false);
                Ok(Action::requeue(PROVISIONING_REQUEUE))
            }
            InstanceState::Running => {
                let post_ready = strategy
                    .post_device_ready(metal_cluster, scope, &device, &machine)
                    .await
                    .context(VipSnafu)?;
                match post_ready {
                    PostReady::Done => {
                        scope.set_ready(true);
                        scope.set_condition(Condition::true_(ConditionType::DeviceReady));
                        Ok(Action::await_change())
                    }
                    PostReady::Requeue(delay) => {
                        scope.set_ready(false);
                        Ok(Action::requeue(delay))
                    }
                }
            }
            InstanceState::Undefined => {
                let message = format!("device reported unknown state {:?}", device.state);
                scope.set_ready(false);
                scope.set_failure(FailureReason::UpdateMachineError, &message);
                scope.set_condition(Condition::unknown(
                    ConditionType::DeviceReady,
                    ConditionReason::InstanceStateUnknown,
                    message,
                ));
                UnknownDeviceStateSnafu {
                    device_id: device.id,
                    state: device.state,
                }
                .fail()
            }
        }
    }

    /// Requests a new device, `None` if it will show up by its tags later.
    async fn create_device(
        &self,
        scope: &mut MachineScope,
        metal_cluster: &MetalCluster,
        request: &metal_api::compute::CreateDeviceRequest,
    ) -> Result<Option<Device>, Error> {
        let error = match self
            .compute
            .create_device(&metal_cluster.spec.project_id, request)
            .await
        {
            Ok(device) => {
                tracing::info!(
                    machine = scope.name(),
                    device.id = device.id,
                    "created device"
                );
                scope.set_condition(Condition::false_(
                    ConditionType::DeviceReady,
                    ConditionReason::InstanceProvisionStarted,
                    ConditionSeverity::Info,
                    "device is being provisioned",
                ));
                return Ok(Some(device));
            }
            Err(error) => error,
        };

        match device::classify_create_error(&error) {
            CreateFailure::Retry => Err(Error::CreateDevice { source: error }),
            CreateFailure::Ignore => {
                tracing::warn!(
                    machine = scope.name(),
                    error = &error as &dyn std::error::Error,
                    "device creation was interrupted, looking it up again later"
                );
                Ok(None)
            }
            CreateFailure::Fatal => {
                let message = format!("failed to create device: {}", error.full_message());
                scope.set_failure(FailureReason::CreateMachineError, &message);
                scope.set_condition(Condition::false_(
                    ConditionType::DeviceReady,
                    ConditionReason::InstanceProvisionFailed,
                    ConditionSeverity::Error,
                    message,
                ));
                Err(Error::CreateDevice { source: error })
            }
        }
    }

    /// Tears down the VIP resources of the machine and deletes its device.
    pub async fn cleanup(
        &self,
        scope: &mut MachineScope,
        inputs: &MachineInputs,
    ) -> Result<Action, Error> {
        let Some(metal_cluster) = &inputs.metal_cluster else {
            // Without its cluster only a device known by ID can be found.
            if let Some(device_id) = scope.device_id() {
                self.delete_device(device_id).await?;
            }
            return Ok(Action::await_change());
        };
        let cluster_name = inputs
            .cluster_name(scope.resource())
            .unwrap_or_else(|| metal_cluster.name_any());
        let tags = DeviceTags::for_machine(&scope.namespace(), &scope.name(), &cluster_name);

        let found = device::find_device(
            self.compute,
            &metal_cluster.spec.project_id,
            scope.device_id(),
            &tags,
        )
        .await;
        let device = match found {
            Ok(device) => device,
            Err(error) if error.is_not_found() || error.is_forbidden() => {
                tracing::info!(
                    machine = scope.name(),
                    error = &error as &dyn std::error::Error,
                    "device is gone"
                );
                None
            }
            Err(source) => return Err(Error::FindDevice { source }),
        };

        // Load balancer origins and pools outlive their device until removed here.
        VipStrategy::select(
            metal_cluster.spec.vip_manager,
            self.compute,
            self.load_balancers,
        )
        .teardown(metal_cluster, scope)
        .await
        .context(VipSnafu)?;

        match device {
            Some(device) => self.delete_device(&device.id).await?,
            None => tracing::info!(machine = scope.name(), "no device left to delete"),
        }
        Ok(Action::await_change())
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), Error> {
        match self.compute.delete_device(device_id, true).await {
            Ok(()) => {
                tracing::info!(device.id = device_id, "deleted device");
                Ok(())
            }
            Err(error) if error.is_not_found() => Ok(()),
            Err(source) => Err(source).context(DeleteDeviceSnafu { device_id }),
        }
    }
}

async fn fetch_inputs(
    client: &kube::Client,
    metal_machine: &MetalMachine,
) -> Result<MachineInputs, Error> {
    let namespace = metal_machine.namespace().unwrap_or_default();
    let mut inputs = MachineInputs::default();

    if let Some(name) = capi::cluster_api_owner(metal_machine, "Machine") {
        inputs.machine = Api::<Machine>::namespaced(client.clone(), &namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetOwnerSnafu {
                machine: ObjectRef::new(name).within(&namespace),
            })?;
    }

    if let Some(name) = inputs.cluster_name(metal_machine) {
        inputs.cluster = Api::<Cluster>::namespaced(client.clone(), &namespace)
            .get_opt(&name)
            .await
            .with_context(|_| GetClusterSnafu {
                cluster: ObjectRef::new(&name).within(&namespace),
            })?;
    }

    if let Some(cluster) = &inputs.cluster {
        let name = capi::referenced_name(cluster.spec.infrastructure_ref.as_ref(), "MetalCluster")
            .map_or_else(|| cluster.name_any(), str::to_owned);
        inputs.metal_cluster = Api::<MetalCluster>::namespaced(client.clone(), &namespace)
            .get_opt(&name)
            .await
            .with_context(|_| GetMetalClusterSnafu {
                metal_cluster: ObjectRef::new(&name).within(&namespace),
            })?;
    }

    let secret_name = inputs
        .machine
        .as_ref()
        .and_then(|machine| machine.spec.bootstrap.data_secret_name.clone());
    if let Some(name) = secret_name {
        let secret_ref = ObjectRef::<Secret>::new(&name).within(&namespace);
        let secret = Api::<Secret>::namespaced(client.clone(), &namespace)
            .get_opt(&name)
            .await
            .with_context(|_| GetBootstrapSecretSnafu {
                secret: secret_ref.clone(),
            })?;
        if let Some(secret) = secret {
            let value = secret
                .data
                .as_ref()
                .and_then(|data| data.get(BOOTSTRAP_DATA_KEY))
                .and_then(|value| String::from_utf8(value.0.clone()).ok())
                .context(MissingBootstrapValueSnafu { secret: secret_ref })?;
            inputs.bootstrap_data = Some(value);
        }
    }

    Ok(inputs)
}

pub async fn reconcile(metal_machine: Arc<MetalMachine>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    tracing::info!(machine = metal_machine.name_any(), "starting reconcile");

    let inputs = fetch_inputs(&ctx.client, &metal_machine).await?;
    if inputs.is_paused(&metal_machine) {
        tracing::info!(
            machine = metal_machine.name_any(),
            "reconciliation is paused"
        );
        return Ok(Action::await_change());
    }

    let api = Api::<MetalMachine>::namespaced(
        ctx.client.clone(),
        &metal_machine.namespace().unwrap_or_default(),
    );
    let reconciler = MachineReconciler::new(ctx.compute.as_ref(), ctx.load_balancers.as_ref());
    let (reconciler, inputs, ctx) = (&reconciler, &inputs, &ctx);

    finalizer(&api, MACHINE_FINALIZER, metal_machine, move |event| async move {
        let (resource, cleanup) = match event {
            finalizer::Event::Apply(resource) => (resource, false),
            finalizer::Event::Cleanup(resource) => (resource, true),
        };
        let mut scope = MachineScope::open(Arc::unwrap_or_clone(resource));
        let outcome = if cleanup {
            reconciler.cleanup(&mut scope, inputs).await
        } else {
            reconciler.reconcile(&mut scope, inputs).await
        };
        scope
            .close_with(&ctx.patcher, outcome, |source| Error::PersistChanges {
                source,
            })
            .await
    })
    .await
    .context(FinalizerSnafu)
}

pub fn error_policy(_metal_machine: Arc<MetalMachine>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    if error.is_terminal() {
        Action::await_change()
    } else {
        Action::requeue(ERROR_REQUEUE)
    }
}

/// The [`MetalMachine`] a `Machine` points to as its infrastructure.
fn infrastructure_of(machine: &Machine) -> Option<ObjectRef<MetalMachine>> {
    let name = capi::referenced_name(machine.spec.infrastructure_ref.as_ref(), "MetalMachine")?;
    Some(ObjectRef::new(name).within(&machine.namespace()?))
}

/// All known [`MetalMachine`]s of the cluster `metal_cluster` belongs to.
fn machines_of(
    store: &Store<MetalMachine>,
    metal_cluster: &MetalCluster,
) -> Vec<ObjectRef<MetalMachine>> {
    let namespace = metal_cluster.namespace();
    let cluster_name = capi::cluster_api_owner(metal_cluster, "Cluster")
        .map_or_else(|| metal_cluster.name_any(), str::to_owned);
    store
        .state()
        .into_iter()
        .filter(|machine| {
            machine.namespace() == namespace
                && machine.labels().get(CLUSTER_NAME_LABEL) == Some(&cluster_name)
        })
        .map(|machine| ObjectRef::from_obj(machine.as_ref()))
        .collect()
}

pub async fn run(ctx: Arc<Ctx>, watch_namespace: &WatchNamespace) {
    let client = ctx.client.clone();
    let controller = Controller::new(
        watch_namespace.get_api::<MetalMachine>(&client),
        watcher::Config::default(),
    );
    let store = controller.store();

    controller
        .watches(
            watch_namespace.get_api::<Machine>(&client),
            watcher::Config::default(),
            |machine| infrastructure_of(&machine),
        )
        .watches(
            watch_namespace.get_api::<MetalCluster>(&client),
            watcher::Config::default(),
            move |metal_cluster| machines_of(&store, &metal_cluster),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            report_controller_reconciled(&client, CONTROLLER_NAME, &result);
            futures::future::ready(())
        })
        .await;
}
