//! Orchestrator boundary used by the reconciler.
//!
//! Manifests travel as `serde_json::Value` so the object builder stays pure and
//! byte-stable; [`KubeCluster`] turns them into `DynamicObject`s.
use async_trait::async_trait;
use kube::{Api, Client, api::{ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams}};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind { Secret, PersistentVolumeClaim, Deployment, Service, Middleware, IngressRoute, ScaledObject }

impl ObjectKind {
    pub fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = match self {
            Self::Secret => ("", "v1", "Secret", "secrets"),
            Self::PersistentVolumeClaim => ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims"),
            Self::Deployment => ("apps", "v1", "Deployment", "deployments"),
            Self::Service => ("", "v1", "Service", "services"),
            Self::Middleware => ("traefik.io", "v1alpha1", "Middleware", "middlewares"),
            Self::IngressRoute => ("traefik.io", "v1alpha1", "IngressRoute", "ingressroutes"),
            Self::ScaledObject => ("keda.sh", "v1alpha1", "ScaledObject", "scaledobjects"),
        };
        let api_version = if group.is_empty() { version.to_string() } else { format!("{group}/{version}") };
        ApiResource { group: group.into(), version: version.into(), api_version, kind: kind.into(), plural: plural.into() }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Secret => "secret",
            Self::PersistentVolumeClaim => "pvc",
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::Middleware => "middleware",
            Self::IngressRoute => "ingressroute",
            Self::ScaledObject => "scaledobject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Watch bookmark no longer served (HTTP 410); the caller must re-list.
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("orchestrator returned {code}: {message}")]
    Upstream { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Target is gone or was never valid for this application.
    pub fn is_gone(&self) -> bool { matches!(self, Self::NotFound(_) | Self::BadRequest(_)) }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                409 => Self::Conflict(ae.message),
                404 => Self::NotFound(ae.message),
                400 => Self::BadRequest(ae.message),
                410 => Self::Expired(ae.message),
                code => Self::Upstream { code, message: ae.message },
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create(&self, namespace: &str, kind: ObjectKind, manifest: &Value) -> Result<(), ClusterError>;
    async fn replace(&self, namespace: &str, kind: ObjectKind, name: &str, manifest: &Value) -> Result<(), ClusterError>;
    async fn delete(&self, namespace: &str, kind: ObjectKind, name: &str) -> Result<(), ClusterError>;
    /// JSON merge patch.
    async fn patch(&self, namespace: &str, kind: ObjectKind, name: &str, patch: &Value) -> Result<(), ClusterError>;
}

pub struct KubeCluster { client: Client }

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, ClusterError> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, namespace: &str, kind: ObjectKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

fn to_object(manifest: &Value) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(manifest.clone()).map_err(|e| ClusterError::BadRequest(format!("manifest: {e}")))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create(&self, namespace: &str, kind: ObjectKind, manifest: &Value) -> Result<(), ClusterError> {
        let obj = to_object(manifest)?;
        self.api(namespace, kind).create(&PostParams::default(), &obj).await?;
        Ok(())
    }

    async fn replace(&self, namespace: &str, kind: ObjectKind, name: &str, manifest: &Value) -> Result<(), ClusterError> {
        let api = self.api(namespace, kind);
        let mut obj = to_object(manifest)?;
        // PUT needs the live resourceVersion for optimistic concurrency.
        let current = api.get(name).await?;
        obj.metadata.resource_version = current.metadata.resource_version;
        api.replace(name, &PostParams::default(), &obj).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        self.api(namespace, kind).delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn patch(&self, namespace: &str, kind: ObjectKind, name: &str, patch: &Value) -> Result<(), ClusterError> {
        self.api(namespace, kind).patch(name, &PatchParams::default(), &Patch::Merge(patch)).await?;
        Ok(())
    }
}
