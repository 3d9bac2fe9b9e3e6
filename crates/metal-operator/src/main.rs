use std::sync::Arc;

use clap::Parser;
use metal_api::rest::{LoadBalancerClient, MetalClient, TokenSource};
use metal_operator::{
    cli::{Command, Opts, RunArguments},
    controller::{self, Ctx, OPERATOR_NAME},
    crd, logging, preflight,
};
use snafu::{OptionExt, ResultExt, Snafu};

const LOG_ENV: &str = "METAL_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print CRDs"))]
    PrintCrds { source: crd::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("no API key given, set --metal-api-key or METAL_API_KEY"))]
    MissingApiKey,

    #[snafu(display("failed to create Kubernetes client"))]
    CreateKubeClient { source: kube::Error },

    #[snafu(display("failed to create client for {url:?}"))]
    CreateApiClient {
        source: metal_api::Error,
        url: String,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    match opts.command {
        Command::Crd => crd::print_crds().context(PrintCrdsSnafu),
        Command::Run(run) => run_operator(run).await,
    }
}

async fn run_operator(run: RunArguments) -> Result<(), Error> {
    logging::initialize_logging(LOG_ENV, OPERATOR_NAME).context(InitializeLoggingSnafu)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        watch_namespace = ?run.watch_namespace,
        "starting {OPERATOR_NAME}"
    );

    let api_key = run.api_key().context(MissingApiKeySnafu)?;
    let client = kube::Client::try_default()
        .await
        .context(CreateKubeClientSnafu)?;

    let compute = MetalClient::new(&run.metal_api_url, api_key).context(CreateApiClientSnafu {
        url: &run.metal_api_url,
    })?;
    let tokens = TokenSource::new(&run.lb_token_url, api_key).context(CreateApiClientSnafu {
        url: &run.lb_token_url,
    })?;
    let load_balancers = LoadBalancerClient::new(&run.lb_api_url, Arc::new(tokens))
        .context(CreateApiClientSnafu {
            url: &run.lb_api_url,
        })?;

    if run.skip_preflight {
        tracing::info!("skipping preflight checks");
    } else if let Err(error) = preflight::run(&client, &compute, &run.watch_namespace).await {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to run preflight checks"
        );
    }

    let ctx = Ctx::new(client, Arc::new(compute), Arc::new(load_balancers));
    controller::run(ctx, &run.watch_namespace).await;
    tracing::info!("controllers stopped");
    Ok(())
}
