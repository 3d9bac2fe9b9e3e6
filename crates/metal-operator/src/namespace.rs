//! This module provides helpers to deal with the namespaces watched by the controllers
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            WatchNamespace::All
        } else {
            WatchNamespace::One(s.to_string())
        }
    }
}

impl WatchNamespace {
    /// Gets an API object for the namespace in question or for all namespaces,
    /// depending on which variant we are.
    pub fn get_api<T>(&self, client: &kube::Client) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            WatchNamespace::All => Api::all(client.clone()),
            WatchNamespace::One(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty("", WatchNamespace::All)]
    #[case::named("capi-system", WatchNamespace::One("capi-system".to_owned()))]
    fn parses_from_flag_value(#[case] input: &str, #[case] expected: WatchNamespace) {
        assert_eq!(WatchNamespace::from(input), expected);
    }
}
