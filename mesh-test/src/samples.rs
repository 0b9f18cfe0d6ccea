//! Sample workloads used by the mesh scenarios.

use crate::{kubectl::quote, Kubectl, Result};
use k8s_openapi::{
    api::core::v1::{Container, ContainerPort, Pod, PodSpec, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use maplit::{btreemap, convert_args};
use std::fmt;

/// Whether a workload gets a sidecar proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SidecarInject {
    Enabled,
    Disabled,
}

impl SidecarInject {
    /// Value of the `istio-injection` namespace label.
    pub fn namespace_label(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

/// Renders the value of the `sidecar.istio.io/inject` annotation.
impl fmt::Display for SidecarInject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("true"),
            Self::Disabled => f.write_str("false"),
        }
    }
}

fn meta(ns: &str, name: &str, app: &str, inject: SidecarInject) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        annotations: Some(convert_args!(btreemap!(
            "sidecar.istio.io/inject" => inject.to_string(),
        ))),
        labels: Some(convert_args!(btreemap!(
            "app" => app,
        ))),
        ..Default::default()
    }
}

/// A pod that idles so tests can `exec` curl from inside the cluster.
pub mod sleep {
    use super::*;

    pub const IMAGE: &str = "docker.io/curlimages/curl:latest";

    pub fn pod(ns: &str, name: &str, inject: SidecarInject) -> Pod {
        Pod {
            metadata: meta(ns, name, "sleep", inject),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "sleep".to_string(),
                    image: Some(IMAGE.to_string()),
                    command: Some(vec!["/bin/sleep".to_string(), "infinity".to_string()]),
                    ..Default::default()
                }],
                termination_grace_period_seconds: Some(0),
                ..Default::default()
            }),
            ..Pod::default()
        }
    }

    /// Curls `url` from the `sleep` container of `pod` and returns the HTTP
    /// status code. A request that cannot complete (e.g. the connection is
    /// reset) fails with the curl exit code.
    pub async fn curl_status(kubectl: &Kubectl, ns: &str, pod: &str, url: &str) -> Result<String> {
        kubectl
            .exec(
                ns,
                pod,
                Some("sleep"),
                &format!("curl -sS -o /dev/null -w '%{{http_code}}' {}", quote(url)),
            )
            .await
    }
}

/// The httpbin echo service.
pub mod httpbin {
    use super::*;

    pub const IMAGE: &str = "docker.io/kong/httpbin:0.1.0";
    pub const PORT: i32 = 8000;

    pub fn pod(ns: &str, inject: SidecarInject) -> Pod {
        Pod {
            metadata: meta(ns, "httpbin", "httpbin", inject),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "httpbin".to_string(),
                    image: Some(IMAGE.to_string()),
                    ports: Some(vec![ContainerPort {
                        name: Some("http".to_string()),
                        container_port: 80,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Pod::default()
        }
    }

    pub fn service(ns: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some("httpbin".to_string()),
                labels: Some(convert_args!(btreemap!(
                    "app" => "httpbin",
                ))),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(convert_args!(btreemap!(
                    "app" => "httpbin",
                ))),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: PORT,
                    target_port: Some(IntOrString::String("http".to_string())),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// In-cluster URL of `path` on the service in `ns`.
    pub fn url(ns: &str, path: &str) -> String {
        format!("http://httpbin.{ns}:{PORT}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_annotation() {
        let pod = sleep::pod("foo", "sleep", SidecarInject::Disabled);
        let annotations = pod.metadata.annotations.unwrap();
        assert_eq!(annotations["sidecar.istio.io/inject"], "false");
        assert_eq!(pod.metadata.labels.unwrap()["app"], "sleep");

        let pod = httpbin::pod("foo", SidecarInject::Enabled);
        assert_eq!(pod.metadata.annotations.unwrap()["sidecar.istio.io/inject"], "true");
        assert_eq!(SidecarInject::Enabled.namespace_label(), "enabled");
    }

    #[test]
    fn httpbin_service_targets_named_port() {
        let svc = httpbin::service("bar");
        let spec = svc.spec.unwrap();
        let ports = spec.ports.unwrap();
        let port = &ports[0];
        assert_eq!(port.port, 8000);
        assert_eq!(
            port.target_port,
            Some(IntOrString::String("http".to_string()))
        );
        assert_eq!(httpbin::url("bar", "/ip"), "http://httpbin.bar:8000/ip");
    }
}
