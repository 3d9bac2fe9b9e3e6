//! Checks run once before the controllers start.
//!
//! Nothing in here stops the operator from starting, problems are only logged.

use std::fmt::Display;

use itertools::Itertools;
use kube::{ResourceExt, api::ListParams};
use metal_api::ComputeApi;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::{MetalCluster, VipManager, capi, validation},
    device::cluster_tag,
    namespace::WatchNamespace,
    provisioner,
};

const SUPPORTED_KUBERNETES_VERSIONS: &str = r#"[
    { "major": "1", "minor": "30" },
    { "major": "1", "minor": "31" },
    { "major": "1", "minor": "32" },
    { "major": "1", "minor": "33" },
    { "major": "1", "minor": "34" },
    { "major": "1", "minor": "35" }
]"#;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse list of supported Kubernetes versions"))]
    ParseSupportedKubernetesVersions { source: serde_json::Error },

    #[snafu(display("failed to determine the current Kubernetes versions"))]
    DetermineCurrentKubernetesVersion { source: kube::Error },

    #[snafu(display("failed to list MetalClusters"))]
    ListClusters { source: kube::Error },
}

/// Why a single [`MetalCluster`] would not reconcile.
#[derive(Debug, Snafu)]
pub enum ClusterProblem {
    #[snafu(display("invalid locality"))]
    Locality { source: validation::Errors },

    #[snafu(display("an external load balancer needs a metro"))]
    MissingMetro,

    #[snafu(display("metro {metro:?} has no load balancer location"))]
    UnknownMetro { metro: String },

    #[snafu(display("failed to look up the elastic IP"))]
    LookupElasticIp { source: metal_api::Error },
}

/// [`k8s_openapi::apimachinery::pkg::version::Info`] tracks these fields as Strings, so let's stick to that
#[derive(Deserialize, PartialEq)]
struct K8sVersion {
    major: String,
    minor: String,
}

impl Display for K8sVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{major}.{minor}", major = self.major, minor = self.minor)
    }
}

#[derive(Deserialize, PartialEq)]
struct K8sVersionList(Vec<K8sVersion>);

impl Display for K8sVersionList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().join(","))
    }
}

pub async fn warn_if_unsupported_k8s_version(client: &kube::Client) -> Result<(), Error> {
    let supported_versions: K8sVersionList = serde_json::from_str(SUPPORTED_KUBERNETES_VERSIONS)
        .context(ParseSupportedKubernetesVersionsSnafu)?;

    let current_version = client
        .apiserver_version()
        .await
        .context(DetermineCurrentKubernetesVersionSnafu)?;

    let current_version = K8sVersion {
        major: current_version.major,
        minor: current_version.minor,
    };

    if !supported_versions.0.contains(&current_version) {
        tracing::warn!(
            %current_version,
            %supported_versions,
            "You are running an unsupported Kubernetes version. Things might work - but are not guaranteed to! Please consider switching to a supported Kubernetes version"
        );
    }

    Ok(())
}

/// How many clusters passed their checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub checked: usize,
    pub total: usize,
}

impl Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.checked, self.total)
    }
}

pub async fn check_cluster(
    compute: &dyn ComputeApi,
    cluster: &MetalCluster,
) -> Result<(), ClusterProblem> {
    let (facility, metro) = cluster.locality();
    validation::validate_locality(facility, metro).context(LocalitySnafu)?;

    match cluster.spec.vip_manager {
        VipManager::ExternalLoadBalancer => {
            let metro = metro.context(MissingMetroSnafu)?;
            provisioner::location_id(metro).context(UnknownMetroSnafu { metro })?;
        }
        VipManager::ManagedElasticIp | VipManager::BgpAnnounced => {
            let cluster_name = capi::cluster_api_owner(cluster, "Cluster")
                .map_or_else(|| cluster.name_any(), str::to_owned);
            compute
                .get_ip_by_tag(&cluster.spec.project_id, &cluster_tag(&cluster_name))
                .await
                .context(LookupElasticIpSnafu)?;
        }
    }
    Ok(())
}

/// Checks all `clusters` concurrently and logs the outcome of each.
pub async fn check_clusters(compute: &dyn ComputeApi, clusters: &[MetalCluster]) -> Summary {
    let results = futures::future::join_all(
        clusters
            .iter()
            .map(|cluster| async move { (cluster, check_cluster(compute, cluster).await) }),
    )
    .await;

    let mut summary = Summary {
        checked: 0,
        total: clusters.len(),
    };
    for (cluster, result) in results {
        match result {
            Ok(()) => {
                summary.checked += 1;
                tracing::debug!(cluster = cluster.name_any(), "cluster passed preflight checks");
            }
            Err(problem) => tracing::warn!(
                cluster = cluster.name_any(),
                namespace = ?cluster.namespace(),
                error = &problem as &dyn std::error::Error,
                "cluster failed preflight checks"
            ),
        }
    }
    summary
}

/// Runs all checks, returning an error only if the checks themselves could not run.
pub async fn run(
    client: &kube::Client,
    compute: &dyn ComputeApi,
    watch_namespace: &WatchNamespace,
) -> Result<Summary, Error> {
    if let Err(error) = warn_if_unsupported_k8s_version(client).await {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to check the Kubernetes version"
        );
    }

    let clusters = watch_namespace
        .get_api::<MetalCluster>(client)
        .list(&ListParams::default())
        .await
        .context(ListClustersSnafu)?
        .items;
    let summary = check_clusters(compute, &clusters).await;
    tracing::info!(%summary, "preflight checks finished");
    Ok(summary)
}
