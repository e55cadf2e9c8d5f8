//! Metrics pipeline: operators, the prometheus stack and the metrics API.

use kon_core::{VersionPolicy, VersionTable};

use crate::{AssetManifests, UrlManifest};

pub const KUBE_PROMETHEUS_VERSIONS: VersionTable = VersionTable::new(&[("1.16", "0.4"), ("1.17", "0.4"), ("1.18", "0.6")]);

/// The operator's CRDs must be served before the stack's custom resources apply, hence retried.
pub fn kube_prometheus() -> AssetManifests {
    AssetManifests::new(
        "kube-prometheus",
        VersionPolicy::ByKube(KUBE_PROMETHEUS_VERSIONS),
        &["kube-prometheus/{version}/prometheus-operator.yaml", "kube-prometheus/{version}/prometheus-k8s.yaml"],
    )
    .retried()
}

pub fn prometheus_operator() -> UrlManifest {
    UrlManifest::new("prometheus-operator", "0.38", "https://raw.githubusercontent.com/coreos/prometheus-operator/release-{version}/bundle.yaml")
}

pub fn grafana_operator() -> AssetManifests {
    AssetManifests::new("grafana-operator", VersionPolicy::Fixed("3.4.0"), &["grafana/operator.yaml", "grafana/dashboards.yaml"]).retried()
}

pub fn metrics_server() -> UrlManifest {
    UrlManifest::new("metrics-server", "0.3.6", "https://github.com/kubernetes-sigs/metrics-server/releases/download/v{version}/components.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kube_prometheus_assets_follow_version() {
        assert_eq!(
            kube_prometheus().asset_names("0.6"),
            vec!["kube-prometheus/0.6/prometheus-operator.yaml".to_string(), "kube-prometheus/0.6/prometheus-k8s.yaml".to_string()]
        );
        assert_eq!(KUBE_PROMETHEUS_VERSIONS.lookup("v1.17.4"), Some("0.4"));
        assert_eq!(KUBE_PROMETHEUS_VERSIONS.lookup("1.15"), None);
    }

    #[test]
    fn url_manifests_substitute_version() {
        assert_eq!(prometheus_operator().url(), "https://raw.githubusercontent.com/coreos/prometheus-operator/release-0.38/bundle.yaml");
        assert_eq!(metrics_server().url(), "https://github.com/kubernetes-sigs/metrics-server/releases/download/v0.3.6/components.yaml");
    }
}
