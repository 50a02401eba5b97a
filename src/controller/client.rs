//! Kubernetes access for the reconciler
//!
//! [`ProxyKubeClient`] is the only way the reconciler touches the cluster, so
//! tests can swap in a mock or an in-memory fake.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::ObjectKey;
use crate::builder::{proxy_selector, Child, ChildId, ChildKind};
use crate::crd::{MemcachedProxy, MemcachedProxySpec, MemcachedProxyStatus};
use crate::{Error, CONTROLLER_NAME};

/// Cluster operations the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyKubeClient: Send + Sync {
    /// Read a proxy from the local cache
    async fn get_proxy(&self, key: &ObjectKey) -> Result<Option<Arc<MemcachedProxy>>, Error>;

    /// Get the Endpoints of a backend service, `None` if it does not exist
    async fn get_endpoints(&self, namespace: &str, name: &str)
        -> Result<Option<Endpoints>, Error>;

    /// List every child labelled as belonging to the proxy
    async fn list_children(&self, namespace: &str, proxy_name: &str)
        -> Result<Vec<Child>, Error>;

    /// Create a child
    async fn create_child(&self, child: &Child) -> Result<(), Error>;

    /// Bring an existing child to the given content
    async fn update_child(&self, child: &Child) -> Result<(), Error>;

    /// Delete a child; a child that is already gone is not an error
    async fn delete_child(&self, namespace: &str, id: &ChildId) -> Result<(), Error>;

    /// Persist the defaulted spec on the proxy
    async fn update_spec(
        &self,
        namespace: &str,
        name: &str,
        spec: &MemcachedProxySpec,
    ) -> Result<(), Error>;

    /// Write the proxy status through the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MemcachedProxyStatus,
    ) -> Result<(), Error>;
}

/// Production client over `kube::Client` and the proxy reflector cache
pub struct KubeProxyClient {
    client: Client,
    proxies: Store<MemcachedProxy>,
}

impl KubeProxyClient {
    /// Create a client reading proxies from `proxies`
    pub fn new(client: Client, proxies: Store<MemcachedProxy>) -> Self {
        Self { client, proxies }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list<K>(&self, namespace: &str, selector: &str) -> Result<Vec<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let params = ListParams::default().labels(selector);
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K>(&self, object: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = object.meta().namespace.as_deref().unwrap_or_default();
        let params = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        };
        self.api::<K>(namespace).create(&params, object).await?;
        Ok(())
    }

    async fn apply<K>(&self, object: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = object.meta().namespace.as_deref().unwrap_or_default();
        let name = object.meta().name.as_deref().unwrap_or_default();
        let params = PatchParams::apply(CONTROLLER_NAME).force();
        self.api::<K>(namespace)
            .patch(name, &params, &Patch::Apply(object))
            .await?;
        Ok(())
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace, name, "child already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProxyKubeClient for KubeProxyClient {
    async fn get_proxy(&self, key: &ObjectKey) -> Result<Option<Arc<MemcachedProxy>>, Error> {
        let reference = ObjectRef::new(&key.name).within(&key.namespace);
        Ok(self.proxies.get(&reference))
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, Error> {
        Ok(self.api::<Endpoints>(namespace).get_opt(name).await?)
    }

    async fn list_children(
        &self,
        namespace: &str,
        proxy_name: &str,
    ) -> Result<Vec<Child>, Error> {
        let selector = proxy_selector(proxy_name);
        let mut children = Vec::new();
        children.extend(
            self.list::<ConfigMap>(namespace, &selector)
                .await?
                .into_iter()
                .map(Child::ConfigMap),
        );
        children.extend(
            self.list::<Deployment>(namespace, &selector)
                .await?
                .into_iter()
                .map(Child::Deployment),
        );
        children.extend(
            self.list::<Service>(namespace, &selector)
                .await?
                .into_iter()
                .map(Child::Service),
        );
        Ok(children)
    }

    async fn create_child(&self, child: &Child) -> Result<(), Error> {
        match child {
            Child::ConfigMap(cm) => self.create(cm).await,
            Child::Deployment(d) => self.create(d).await,
            Child::Service(s) => self.create(s).await,
        }
    }

    async fn update_child(&self, child: &Child) -> Result<(), Error> {
        match child {
            Child::ConfigMap(cm) => self.apply(cm).await,
            Child::Deployment(d) => self.apply(d).await,
            Child::Service(s) => self.apply(s).await,
        }
    }

    async fn delete_child(&self, namespace: &str, id: &ChildId) -> Result<(), Error> {
        match id.kind {
            ChildKind::ConfigMap => self.delete::<ConfigMap>(namespace, &id.name).await,
            ChildKind::Deployment => self.delete::<Deployment>(namespace, &id.name).await,
            ChildKind::Service => self.delete::<Service>(namespace, &id.name).await,
        }
    }

    async fn update_spec(
        &self,
        namespace: &str,
        name: &str,
        spec: &MemcachedProxySpec,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "spec": spec });
        self.api::<MemcachedProxy>(namespace)
            .patch(
                name,
                &PatchParams::apply(CONTROLLER_NAME),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MemcachedProxyStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.api::<MemcachedProxy>(namespace)
            .patch_status(
                name,
                &PatchParams::apply(CONTROLLER_NAME),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
