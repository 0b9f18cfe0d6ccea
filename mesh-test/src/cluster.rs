//! Typed access to the cluster under test.

use crate::{
    retry::{self, RetryOptions},
    samples::SidecarInject,
    Env, Error, Kubectl, Result,
};
use k8s_openapi::{
    api::core::v1::{ConfigMap, Namespace, Pod},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    NamespaceResourceScope,
};
use kube::{api::PostParams, ResourceExt};
use maplit::{btreemap, convert_args};
use std::{fmt::Debug, path::Path, time::Duration};

const FIELD_MANAGER: &str = "mesh-test";

/// How long typed waits block before failing.
pub const AWAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Name of the config map that marks a cluster as in use by a test run.
pub const LOCK_NAME: &str = "mesh-test-lock";

/// A Kubernetes client and the matching CLI.
#[derive(Clone)]
pub struct Cluster {
    client: kube::Client,
    kubectl: Kubectl,
}

/// Exclusive use of a cluster, held as a config map in the control-plane
/// namespace. Concurrent test runs against the same cluster wait for each
/// other instead of interleaving mesh-wide configuration changes.
#[must_use]
pub struct ClusterLock {
    api: kube::Api<ConfigMap>,
    holder: String,
    released: bool,
}

// === impl Cluster ===

impl Cluster {
    /// Connects with the client's default configuration discovery, or with
    /// the given kubeconfig file.
    pub async fn connect(kubeconfig: Option<&Path>, kubectl: Kubectl) -> Result<Self> {
        tracing::debug!(?kubeconfig, "initializing client");
        let client = match kubeconfig {
            None => kube::Client::try_default().await?,
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
                let config = kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &kube::config::KubeConfigOptions::default(),
                )
                .await?;
                kube::Client::try_from(config)?
            }
        };
        Ok(Self { client, kubectl })
    }

    pub async fn from_env(env: &Env) -> Result<Self> {
        Self::connect(env.kubeconfig.as_deref(), Kubectl::from_env(env)).await
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    pub fn kubectl(&self) -> &Kubectl {
        &self.kubectl
    }

    /// Creates a namespaced object.
    pub async fn create<T>(&self, obj: T) -> Result<T>
    where
        T: kube::Resource<Scope = NamespaceResourceScope>
            + serde::Serialize
            + serde::de::DeserializeOwned
            + Clone
            + Debug,
        T::DynamicType: Default,
    {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let api = obj
            .namespace()
            .map(|ns| kube::Api::<T>::namespaced(self.client.clone(), &ns))
            .unwrap_or_else(|| kube::Api::<T>::default_namespaced(self.client.clone()));
        tracing::trace!(name = %obj.name_any(), "creating");
        let created = api.create(&params, &obj).await?;
        tracing::debug!(
            ns = ?created.namespace(),
            name = %created.name_any(),
            "created"
        );
        Ok(created)
    }

    /// Creates a pod and waits for it to become ready.
    pub async fn create_ready_pod(&self, pod: Pod) -> Result<Pod> {
        let pod = self.create(pod).await?;
        let ns = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();
        tracing::trace!(%ns, %name, "waiting for pod to be ready");
        let ready = self.await_condition(&ns, &name, pod_ready).await?;
        tracing::debug!(%ns, %name, "ready");
        Ok(ready.unwrap_or(pod))
    }

    /// Waits up to [`AWAIT_TIMEOUT`] for `cond` to hold for the named object.
    pub async fn await_condition<T>(
        &self,
        ns: &str,
        name: &str,
        cond: impl kube::runtime::wait::Condition<T>,
    ) -> Result<Option<T>>
    where
        T: kube::Resource<Scope = NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + Debug
            + Send
            + 'static,
        T::DynamicType: Default,
    {
        let api = kube::Api::<T>::namespaced(self.client.clone(), ns);
        let what = format!("{}/{}", T::kind(&T::DynamicType::default()), name);
        match tokio::time::timeout(
            AWAIT_TIMEOUT,
            kube::runtime::wait::await_condition(api, name, cond),
        )
        .await
        {
            Ok(Ok(obj)) => Ok(obj),
            Ok(Err(source)) => Err(Error::Wait { what, source }),
            Err(_) => Err(Error::WaitTimeout {
                what,
                timeout: AWAIT_TIMEOUT,
            }),
        }
    }

    /// Creates a namespace labeled for (or excluded from) sidecar injection.
    pub async fn create_namespace(&self, name: &str, inject: SidecarInject) -> Result<Namespace> {
        let api = kube::Api::<Namespace>::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(convert_args!(btreemap!(
                    "istio-injection" => inject.namespace_label(),
                    "mesh-test" => "true",
                ))),
                ..Default::default()
            },
            ..Default::default()
        };
        tracing::debug!(%name, %inject, "creating namespace");
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, &ns).await?)
    }

    /// Deletes a namespace in the background. A missing namespace is not an
    /// error.
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api = kube::Api::<Namespace>::all(self.client.clone());
        tracing::debug!(%name, "deleting namespace");
        match api
            .delete(name, &kube::api::DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Takes the cluster lock in `ns`, waiting up to `wait` for another
    /// holder to release it.
    pub async fn lock(&self, ns: &str, wait: Duration) -> Result<ClusterLock> {
        ClusterLock::acquire(self.client.clone(), ns, wait).await
    }
}

impl Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("kubectl", &self.kubectl)
            .finish_non_exhaustive()
    }
}

/// Holds when a pod reports the `Ready` condition.
pub fn pod_ready(pod: Option<&Pod>) -> bool {
    pod.and_then(|pod| pod.status.as_ref())
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

// === impl ClusterLock ===

impl ClusterLock {
    const POLL_INTERVAL: Duration = Duration::from_secs(5);

    async fn acquire(client: kube::Client, ns: &str, wait: Duration) -> Result<Self> {
        let api = kube::Api::<ConfigMap>::namespaced(client, ns);
        let holder = format!(
            "{}-{}",
            std::process::id(),
            crate::random_suffix(6)
        );
        let lock = ConfigMap {
            metadata: ObjectMeta {
                name: Some(LOCK_NAME.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            data: Some(convert_args!(btreemap!(
                "holder" => holder.clone(),
            ))),
            ..Default::default()
        };
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let attempts = (wait.as_secs() / Self::POLL_INTERVAL.as_secs()).max(1) as u32 + 1;
        let options = RetryOptions::default()
            .max_attempts(attempts)
            .delay_between_attempts(Self::POLL_INTERVAL)
            .log_attempts(false);
        retry::until_success_with_options(&options, "acquire cluster lock", |attempt| {
            let (api, lock, params) = (&api, &lock, &params);
            async move {
                match api.create(params, lock).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        tracing::info!(
                            attempt = attempt.number(),
                            "cluster is locked by another test run; waiting"
                        );
                        Err(Error::Kube(kube::Error::Api(ae)))
                    }
                    Err(error) => Err(error.into()),
                }
            }
        })
        .await?;

        tracing::info!(%ns, %holder, "acquired cluster lock");
        Ok(Self {
            api,
            holder,
            released: false,
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Deletes the lock object.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match self
            .api
            .delete(LOCK_NAME, &kube::api::DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(error) => return Err(error.into()),
        }
        tracing::info!(holder = %self.holder, "released cluster lock");
        Ok(())
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Release in the background when dropped during unwinding or
        // without an explicit release.
        let api = self.api.clone();
        let holder = self.holder.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = api.delete(LOCK_NAME, &kube::api::DeleteParams::default()).await {
                    tracing::warn!(%holder, %error, "failed to release cluster lock");
                }
            });
        } else {
            tracing::warn!(%holder, "cluster lock dropped outside of a runtime; it must be deleted manually");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::client::Body;
    use serde_json::json;

    type ApiHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;

    fn mock_client() -> (kube::Client, ApiHandle) {
        let (svc, handle) = tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
        (kube::Client::new(svc, "default"), handle)
    }

    fn respond(status: u16, body: serde_json::Value) -> http::Response<Body> {
        http::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn already_exists() -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "configmaps \"mesh-test-lock\" already exists",
            "reason": "AlreadyExists",
            "details": { "name": LOCK_NAME, "kind": "configmaps" },
            "code": 409,
        })
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn lock_waits_for_the_holder_and_is_released() {
        let (client, mut handle) = mock_client();
        let apiserver = tokio::spawn(async move {
            let (req, send) = handle.next_request().await.expect("first create");
            assert_eq!(req.method(), http::Method::POST);
            assert_eq!(req.uri().path(), "/api/v1/namespaces/istio-system/configmaps");
            send.send_response(respond(409, already_exists()));

            let (req, send) = handle.next_request().await.expect("second create");
            assert_eq!(req.method(), http::Method::POST);
            assert_eq!(req.uri().path(), "/api/v1/namespaces/istio-system/configmaps");
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let cm = serde_json::from_slice::<ConfigMap>(&body).unwrap();
            assert_eq!(cm.metadata.name.as_deref(), Some(LOCK_NAME));
            let holder = cm
                .data
                .as_ref()
                .and_then(|data| data.get("holder"))
                .cloned()
                .unwrap_or_default();
            send.send_response(respond(201, serde_json::to_value(&cm).unwrap()));

            let (req, send) = handle.next_request().await.expect("delete");
            assert_eq!(req.method(), http::Method::DELETE);
            assert_eq!(
                req.uri().path(),
                "/api/v1/namespaces/istio-system/configmaps/mesh-test-lock"
            );
            send.send_response(respond(
                200,
                json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "metadata": {},
                    "status": "Success",
                    "details": { "name": LOCK_NAME, "kind": "configmaps" },
                }),
            ));
            holder
        });

        let start = tokio::time::Instant::now();
        let lock = ClusterLock::acquire(client, "istio-system", Duration::from_secs(30))
            .await
            .expect("the lock must be acquired once the other run is gone");
        assert!(start.elapsed() >= ClusterLock::POLL_INTERVAL);
        let holder = lock.holder().to_string();
        assert!(holder.starts_with(&format!("{}-", std::process::id())), "{holder}");
        lock.release().await.expect("release must delete the lock");

        assert_eq!(apiserver.await.expect("api server must not panic"), holder);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn lock_gives_up_after_the_wait() {
        let (client, mut handle) = mock_client();
        let apiserver = tokio::spawn(async move {
            let mut creates = 0;
            while let Some((req, send)) = handle.next_request().await {
                assert_eq!(req.method(), http::Method::POST);
                creates += 1;
                send.send_response(respond(409, already_exists()));
            }
            creates
        });

        let err = ClusterLock::acquire(client, "istio-system", Duration::from_secs(10))
            .await
            .err()
            .expect("the lock is held for the whole wait");
        assert!(matches!(err, Error::RetryExhausted { attempts: 3, .. }), "{err}");
        assert_eq!(apiserver.await.expect("api server must not panic"), 3);
    }

    fn pod_with(conditions: Vec<(&str, &str)>) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(type_, status)| PodCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn readiness() {
        assert!(!pod_ready(None));
        assert!(!pod_ready(Some(&Pod::default())));
        assert!(!pod_ready(Some(&pod_with(vec![("Ready", "False")]))));
        assert!(pod_ready(Some(&pod_with(vec![
            ("PodScheduled", "True"),
            ("Ready", "True"),
        ]))));
    }
}
