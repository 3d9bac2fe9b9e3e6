//! Command line interface of the operator.
//!
//! ```text
//! metal-operator crd
//! metal-operator run --metal-api-key <KEY> [--watch-namespace <NS>] [--skip-preflight]
//! ```
//!
//! Every `run` option can also be given through the environment variable named after it.
use clap::{Args, Parser};
use metal_api::rest::{
    DEFAULT_LOAD_BALANCER_API_URL, DEFAULT_METAL_API_URL, DEFAULT_TOKEN_EXCHANGE_URL,
};

use crate::namespace::WatchNamespace;

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(name = "metal-operator", author, version, about)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(Run),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// API key of the Equinix Metal API
    #[arg(long, env, hide_env_values = true)]
    pub metal_api_key: Option<String>,

    /// Deprecated name of `--metal-api-key`
    #[arg(long, env, hide = true, hide_env_values = true)]
    pub packet_api_key: Option<String>,

    /// Base URL of the Equinix Metal API
    #[arg(long, env, default_value = DEFAULT_METAL_API_URL)]
    pub metal_api_url: String,

    /// Base URL of the load balancer API
    #[arg(long, env, default_value = DEFAULT_LOAD_BALANCER_API_URL)]
    pub lb_api_url: String,

    /// URL the API key is exchanged at for load balancer API tokens
    #[arg(long, env, default_value = DEFAULT_TOKEN_EXCHANGE_URL)]
    pub lb_token_url: String,

    /// Start the controllers without checking the existing clusters first
    #[arg(long, env)]
    pub skip_preflight: bool,
}

impl RunArguments {
    /// The API key, preferring the current option over the deprecated one.
    pub fn api_key(&self) -> Option<&str> {
        self.metal_api_key
            .as_deref()
            .or(self.packet_api_key.as_deref())
            .filter(|key| !key.is_empty())
    }
}
