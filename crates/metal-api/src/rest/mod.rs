//! `reqwest` implementations of [`ComputeApi`](crate::ComputeApi) and
//! [`LoadBalancerApi`](crate::LoadBalancerApi).

use http::Method;
use reqwest::{RequestBuilder, Response};
use serde::{Serialize, de::DeserializeOwned};
use snafu::ResultExt;
use url::Url;

use crate::error::{
    DecodeResponseSnafu, ErrorBody, JoinUrlSnafu, ParseUrlSnafu, Result, SendRequestSnafu,
    UnexpectedStatusSnafu,
};

mod compute;
mod load_balancer;
mod token;

pub use compute::MetalClient;
pub use load_balancer::LoadBalancerClient;
pub use token::TokenSource;

pub const DEFAULT_METAL_API_URL: &str = "https://api.equinix.com/metal/v1/";
pub const DEFAULT_LOAD_BALANCER_API_URL: &str = "https://lb.metalctrl.io/";
pub const DEFAULT_TOKEN_EXCHANGE_URL: &str = "https://iam.metalctrl.io/";

const USER_AGENT: &str = concat!("metal-operator/", env!("CARGO_PKG_VERSION"));

/// A base URL plus a shared [`reqwest::Client`].
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    http: reqwest::Client,
    base_url: Url,
}

impl Transport {
    pub(crate) fn new(base_url: &str) -> Result<Self> {
        // Url::join drops the last path segment unless the base ends with a slash
        let normalized = if base_url.ends_with('/') {
            base_url.to_owned()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).context(ParseUrlSnafu { input: base_url })?;

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .context(JoinUrlSnafu {
                base: self.base_url.as_str(),
                path,
            })
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(http::header::USER_AGENT, USER_AGENT)
            .header(http::header::ACCEPT, "application/json")
    }

    /// Sends the request and turns non-success responses into errors.
    pub(crate) async fn send(
        &self,
        method: Method,
        url: &Url,
        request: RequestBuilder,
    ) -> Result<Response> {
        let response = request.send().await.context(SendRequestSnafu {
            method: method.clone(),
            url: url.as_str(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // Bodies of error responses are best effort, a proxy may not answer with JSON at all
        let body = response.json::<ErrorBody>().await.unwrap_or_default();
        let code = body.code.clone();
        let messages = body.into_messages();
        UnexpectedStatusSnafu {
            method,
            url: url.as_str(),
            status,
            code,
            messages,
        }
        .fail()
    }

    pub(crate) async fn send_json<B, T>(
        &self,
        method: Method,
        url: Url,
        configure: impl FnOnce(RequestBuilder) -> RequestBuilder,
        body: Option<&B>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = configure(self.request(method.clone(), url.clone()));
        if let Some(body) = body {
            request = request.json(body);
        }

        self.send(method, &url, request)
            .await?
            .json()
            .await
            .context(DecodeResponseSnafu { url: url.as_str() })
    }

    pub(crate) async fn send_empty<B>(
        &self,
        method: Method,
        url: Url,
        configure: impl FnOnce(RequestBuilder) -> RequestBuilder,
        body: Option<&B>,
    ) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        let mut request = configure(self.request(method.clone(), url.clone()));
        if let Some(body) = body {
            request = request.json(body);
        }

        self.send(method, &url, request).await.map(|_| ())
    }
}
