//! Converges cluster objects onto an application's desired state.
//!
//! Every operation runs its steps strictly in order and stops at the first
//! unrecoverable one. Nothing is rolled back: a re-run converges from whatever
//! partial state is left. The caller serializes operations per application.
use serde::Serialize;
use serde_json::Value;
use std::{collections::{BTreeMap, BTreeSet}, sync::Arc};
use tracing::{info, warn};
use crate::builder::{self, names, BuildContext};
use crate::cluster::{ClusterApi, ClusterError, ObjectKind};
use crate::error::{Error, Result};
use crate::models::{AppState, Application, VolumeType};
use crate::ports::PortAllocator;
use crate::registry::{self, TokenCache};
use crate::store::{AppStore, StoreError};
use crate::telemetry::{RECONCILE_OPERATIONS, RECONCILE_STEPS};
use crate::validate::{validate_application, ValidationError};

const DOCKERCONFIG_KEY: &str = ".dockerconfigjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step { PullSecret, DeleteVolume, Claim, Secret, Workload, Service, Firewall, Ingress, Autoscaler, Redeploy, Scale }

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PullSecret => "pull_secret",
            Self::DeleteVolume => "delete_volume",
            Self::Claim => "claim",
            Self::Secret => "secret",
            Self::Workload => "workload",
            Self::Service => "service",
            Self::Firewall => "firewall",
            Self::Ingress => "ingress",
            Self::Autoscaler => "autoscaler",
            Self::Redeploy => "redeploy",
            Self::Scale => "scale",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Created,
    Replaced,
    /// Claim already present; bound claims cannot be replaced in place.
    Kept,
    Patched,
    Deleted,
    /// Delete target was already gone.
    Absent,
    Failed(String),
}

impl StepOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Replaced => "replaced",
            Self::Kept => "kept",
            Self::Patched => "patched",
            Self::Deleted => "deleted",
            Self::Absent => "absent",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: &'static str,
    /// `<kind>/<name>`
    pub object: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub appid: String,
    /// Final state; `None` once the record has been removed.
    pub state: Option<AppState>,
    pub steps: Vec<StepRecord>,
}

/// Platform registry host plus the credential cache used for its pull secrets.
pub struct RegistryAuth { pub host: String, pub tokens: Arc<TokenCache> }

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn AppStore>,
    ctx: BuildContext,
    ports: Arc<PortAllocator>,
    registry: Option<RegistryAuth>,
}

/// Step log for one operation against one namespace.
struct Run<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: String,
    steps: Vec<StepRecord>,
}

impl<'a> Run<'a> {
    fn new(cluster: &'a dyn ClusterApi, namespace: &str) -> Self { Self { cluster, namespace: namespace.to_string(), steps: Vec::new() } }

    async fn upsert(&mut self, step: Step, kind: ObjectKind, manifest: &Value) -> Result<()> {
        let name = manifest["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let res = match self.cluster.create(&self.namespace, kind, manifest).await {
            Ok(()) => Ok(StepOutcome::Created),
            Err(ClusterError::Conflict(_)) if kind == ObjectKind::PersistentVolumeClaim => Ok(StepOutcome::Kept),
            Err(ClusterError::Conflict(_)) => self.cluster.replace(&self.namespace, kind, &name, manifest).await.map(|_| StepOutcome::Replaced),
            Err(e) => Err(e),
        };
        self.record(step, kind, &name, res)
    }

    async fn remove(&mut self, step: Step, kind: ObjectKind, name: &str) -> Result<()> {
        let res = match self.cluster.delete(&self.namespace, kind, name).await {
            Ok(()) => Ok(StepOutcome::Deleted),
            Err(ClusterError::NotFound(_)) => Ok(StepOutcome::Absent),
            Err(e) => Err(e),
        };
        self.record(step, kind, name, res)
    }

    async fn patch(&mut self, step: Step, kind: ObjectKind, name: &str, patch: &Value) -> Result<()> {
        let res = self.cluster.patch(&self.namespace, kind, name, patch).await.map(|_| StepOutcome::Patched);
        self.record(step, kind, name, res)
    }

    fn record(&mut self, step: Step, kind: ObjectKind, name: &str, res: std::result::Result<StepOutcome, ClusterError>) -> Result<()> {
        let (outcome, ret) = match res {
            Ok(o) => (o, Ok(())),
            Err(e) => (StepOutcome::Failed(e.to_string()), Err(Error::from(e))),
        };
        RECONCILE_STEPS.with_label_values(&[step.as_str(), outcome.label()]).inc();
        info!(step = step.as_str(), kind = kind.as_str(), object = name, outcome = outcome.label(), "reconcile_step");
        self.steps.push(StepRecord { step: step.as_str(), object: format!("{}/{}", kind.as_str(), name), outcome });
        ret
    }
}

fn count(op: &str, res: &Result<()>) {
    let outcome = match res { Ok(()) => "ok", Err(e) => e.code() };
    RECONCILE_OPERATIONS.with_label_values(&[op, outcome]).inc();
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, store: Arc<dyn AppStore>, ctx: BuildContext, ports: Arc<PortAllocator>) -> Self {
        Self { cluster, store, ctx, ports, registry: None }
    }

    pub fn with_registry(mut self, host: impl Into<String>, tokens: Arc<TokenCache>) -> Self {
        self.registry = Some(RegistryAuth { host: host.into(), tokens });
        self
    }

    /// Create or replace every object the application needs, then mark it `active`.
    /// Any failure marks it `error` and returns the first unrecoverable error.
    #[tracing::instrument(skip(self))]
    pub async fn apply(&self, appid: &str) -> Result<ReconcileReport> {
        let mut app = self.store.load(appid).await?;
        let mut run = Run::new(self.cluster.as_ref(), &app.namespace);
        let res = self.apply_steps(&mut app, &mut run).await;
        count("apply", &res);
        self.settle(appid, run, res, AppState::Active, AppState::Error).await
    }

    /// Tear down in reverse dependency order, then drop the record. A failure
    /// leaves the application in `deleting` so a retry resumes the teardown.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, appid: &str) -> Result<ReconcileReport> {
        let app = match self.store.load(appid).await {
            Ok(app) => app,
            Err(StoreError::NotFound(_)) => {
                info!(appid, "delete_record_already_gone");
                return Ok(ReconcileReport { appid: appid.to_string(), state: None, steps: Vec::new() });
            }
            Err(e) => return Err(e.into()),
        };
        self.store.set_state(appid, AppState::Deleting).await?;
        let mut run = Run::new(self.cluster.as_ref(), &app.namespace);
        let res = self.delete_steps(&app, &mut run).await;
        count("delete", &res);
        match res {
            Ok(()) => {
                if let Some(port) = app.connection.port.filter(|_| !app.is_http()) { self.ports.release(port); }
                info!(appid, steps = run.steps.len(), "app_deleted");
                Ok(ReconcileReport { appid: appid.to_string(), state: None, steps: run.steps })
            }
            Err(e) => {
                warn!(appid, error = %e, steps = ?run.steps, "delete_failed");
                Err(e)
            }
        }
    }

    /// Rolling restart of every instance.
    #[tracing::instrument(skip(self))]
    pub async fn redeploy(&self, appid: &str) -> Result<ReconcileReport> {
        let app = self.store.load(appid).await?;
        let mut run = Run::new(self.cluster.as_ref(), &app.namespace);
        let patch = builder::build_restart_patch(&chrono::Utc::now().to_rfc3339());
        let res = run.patch(Step::Redeploy, ObjectKind::Deployment, &names::workload(appid), &patch).await;
        count("redeploy", &res);
        self.settle(appid, run, res, AppState::Active, AppState::Error).await
    }

    /// Set the replica count. Out-of-range counts are rejected before any side effect.
    #[tracing::instrument(skip(self))]
    pub async fn scale(&self, appid: &str, replicas: u32) -> Result<ReconcileReport> {
        let app = self.store.load(appid).await?;
        if replicas > app.scaler.max_replicas {
            let err = ValidationError::new("replicas", format!("must be between 0 and {}", app.scaler.max_replicas));
            count("scale", &Err(Error::Validation(err.clone())));
            return Err(err.into());
        }
        let mut run = Run::new(self.cluster.as_ref(), &app.namespace);
        let res = run.patch(Step::Scale, ObjectKind::Deployment, &names::workload(appid), &builder::build_scale_patch(replicas)).await;
        count("scale", &res);
        self.settle(appid, run, res, AppState::Active, AppState::Error).await
    }

    async fn settle(&self, appid: &str, run: Run<'_>, res: Result<()>, ok: AppState, failed: AppState) -> Result<ReconcileReport> {
        match res {
            Ok(()) => {
                self.store.set_state(appid, ok).await?;
                info!(appid, state = ok.as_str(), steps = run.steps.len(), "reconcile_ok");
                Ok(ReconcileReport { appid: appid.to_string(), state: Some(ok), steps: run.steps })
            }
            Err(e) => {
                warn!(appid, error = %e, steps = ?run.steps, "reconcile_failed");
                if let Err(se) = self.store.set_state(appid, failed).await { warn!(appid, error = %se, "state_update_failed"); }
                Err(e)
            }
        }
    }

    async fn apply_steps(&self, app: &mut Application, run: &mut Run<'_>) -> Result<()> {
        validate_application(app)?;
        if !app.is_http() && app.connection.port.is_none() {
            let port = self.ports.allocate(self.store.as_ref()).await?;
            // The reservation outlives the write: a concurrent allocation may
            // have read the stored ports before this one landed.
            if let Err(e) = self.store.set_connection_port(&app.appid, port).await {
                self.ports.release(port);
                return Err(e.into());
            }
            app.connection.port = Some(port);
        }

        // 1. pull secrets
        let pull_secrets = self.pull_secret_configs(app).await?;
        for (name, config) in &pull_secrets {
            run.upsert(Step::PullSecret, ObjectKind::Secret, &builder::build_pull_secret_spec(name, app, config)).await?;
        }

        // 2. volumes flagged for removal, before any claim is created
        if !app.volumes_to_delete.is_empty() {
            let doomed = app.volumes_to_delete.clone();
            for volid in &doomed {
                let is_claim = app.volumes.iter().find(|v| &v.volid == volid).map(|v| v.kind.is_claim()).unwrap_or(true);
                if is_claim { run.remove(Step::DeleteVolume, ObjectKind::PersistentVolumeClaim, &names::claim(volid)).await?; }
            }
            self.store.remove_volumes(&app.appid, &doomed).await?;
            app.volumes.retain(|v| !doomed.contains(&v.volid));
            app.volumes_to_delete.clear();
        }

        // 3. claims
        for v in &app.volumes {
            if let Some(claim) = builder::build_volume_spec(&self.ctx, app, v) {
                run.upsert(Step::Claim, ObjectKind::PersistentVolumeClaim, &claim).await?;
            }
        }

        // 4. opaque secrets for secret volumes and env injection
        let secret_ids: BTreeSet<&str> = app.volumes.iter()
            .filter(|v| v.kind == VolumeType::Secret)
            .filter_map(|v| v.secretid.as_deref())
            .chain(app.containers.iter().filter_map(|c| c.env_secret.as_deref()))
            .collect();
        for id in secret_ids {
            match self.store.secret(id).await? {
                Some(secret) => run.upsert(Step::Secret, ObjectKind::Secret, &builder::build_opaque_secret_spec(app, &secret)).await?,
                None => warn!(appid = %app.appid, secretid = id, "secret_missing_skipped"),
            }
        }

        // 5. workload
        let pull_names: Vec<String> = pull_secrets.keys().cloned().collect();
        run.upsert(Step::Workload, ObjectKind::Deployment, &builder::build_workload_spec(&self.ctx, app, &pull_names)).await?;

        // 6. service
        run.upsert(Step::Service, ObjectKind::Service, &builder::build_service_spec(app)).await?;

        // 7. firewall middlewares; stale ones go when the app stops qualifying
        for mw in builder::build_firewall_spec(&self.ctx, app) {
            run.upsert(Step::Firewall, ObjectKind::Middleware, &mw).await?;
        }
        if !app.is_http() { run.remove(Step::Firewall, ObjectKind::Middleware, &names::ip_rules(&app.appid)).await?; }
        if !app.is_http() || !app.firewall.extra_allow_list {
            run.remove(Step::Firewall, ObjectKind::Middleware, &names::allow_list(&app.appid)).await?;
        }

        // 8. ingress
        match builder::build_ingress_spec(&self.ctx, app) {
            Some(route) => run.upsert(Step::Ingress, ObjectKind::IngressRoute, &route).await?,
            None => run.remove(Step::Ingress, ObjectKind::IngressRoute, &names::ingress(&app.appid)).await?,
        }

        // 9. autoscaler exists iff there are triggers
        match builder::build_autoscaler_spec(app) {
            Some(scaler) => run.upsert(Step::Autoscaler, ObjectKind::ScaledObject, &scaler).await?,
            None => run.remove(Step::Autoscaler, ObjectKind::ScaledObject, &names::autoscaler(&app.appid)).await?,
        }
        Ok(())
    }

    async fn delete_steps(&self, app: &Application, run: &mut Run<'_>) -> Result<()> {
        let id = app.appid.as_str();
        run.remove(Step::Ingress, ObjectKind::IngressRoute, &names::ingress(id)).await?;
        run.remove(Step::Autoscaler, ObjectKind::ScaledObject, &names::autoscaler(id)).await?;
        run.remove(Step::Firewall, ObjectKind::Middleware, &names::ip_rules(id)).await?;
        run.remove(Step::Firewall, ObjectKind::Middleware, &names::allow_list(id)).await?;
        run.remove(Step::Service, ObjectKind::Service, &names::service(id)).await?;
        run.remove(Step::Workload, ObjectKind::Deployment, &names::workload(id)).await?;
        let claims: BTreeSet<&str> = app.volumes.iter().filter(|v| v.kind.is_claim()).map(|v| v.volid.as_str())
            .chain(app.volumes_to_delete.iter().map(String::as_str))
            .collect();
        for volid in claims {
            run.remove(Step::DeleteVolume, ObjectKind::PersistentVolumeClaim, &names::claim(volid)).await?;
        }
        let all: Vec<String> = app.volumes.iter().map(|v| v.volid.clone()).collect();
        self.store.remove_volumes(id, &all).await?;
        self.store.delete_app(id).await?;
        Ok(())
    }

    /// Secret name -> docker config JSON, ordered by name.
    async fn pull_secret_configs(&self, app: &Application) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for c in &app.containers {
            if let Some(id) = &c.pull_secret {
                let name = names::pull_secret(id);
                if out.contains_key(&name) { continue; }
                match self.store.secret(id).await?.and_then(|s| s.data.get(DOCKERCONFIG_KEY).cloned()) {
                    Some(config) => { out.insert(name, config); }
                    None => warn!(appid = %app.appid, secretid = %id, "pull_secret_unusable_skipped"),
                }
            } else if let (Some(reg), Some(auth)) = (&c.registry, &self.registry) {
                let name = names::pull_secret(reg);
                if out.contains_key(&name) { continue; }
                let token = auth.tokens.get_or_issue(&registry::pull_scope(reg));
                out.insert(name, registry::dockerconfigjson(&auth.host, &token));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, ConnectionProtocol, MountModes, SecretRecord, SecretType, Trigger, Volume};
    use crate::store::MemoryStore;
    use crate::test_support::{fixture_app, fixture_ctx, MemoryCluster};
    use std::time::Duration;

    fn setup(app: Application) -> (Arc<MemoryCluster>, Arc<MemoryStore>, Reconciler) {
        let cluster = Arc::new(MemoryCluster::new());
        let store = Arc::new(MemoryStore::new());
        store.insert_app(app);
        let r = Reconciler::new(cluster.clone(), store.clone(), fixture_ctx(), Arc::new(PortAllocator::new(31000..=31999)));
        (cluster, store, r)
    }

    #[tokio::test]
    async fn apply_walks_steps_in_order() {
        let mut app = fixture_app("o1");
        app.scaler.max_replicas = 3;
        app.scaler.triggers.push(Trigger { kind: "cpu".into(), target: 60 });
        let (cluster, store, r) = setup(app);
        let report = r.apply("o1").await.unwrap();
        let order: Vec<&str> = report.steps.iter().filter(|s| s.outcome == StepOutcome::Created).map(|s| s.step).collect();
        assert_eq!(order, ["workload", "service", "firewall", "ingress", "autoscaler"]);
        assert_eq!(store.get("o1").unwrap().state, AppState::Active);
        assert!(cluster.contains(ObjectKind::ScaledObject, "scaler-o1"));
    }

    #[tokio::test]
    async fn removing_triggers_deletes_autoscaler() {
        let mut app = fixture_app("o2");
        app.scaler.max_replicas = 2;
        app.scaler.triggers.push(Trigger { kind: "memory".into(), target: 80 });
        let (cluster, store, r) = setup(app.clone());
        r.apply("o2").await.unwrap();
        app.scaler.triggers.clear();
        store.insert_app(app);
        r.apply("o2").await.unwrap();
        assert!(!cluster.contains(ObjectKind::ScaledObject, "scaler-o2"));
    }

    #[tokio::test]
    async fn invalid_app_marks_error_without_cluster_calls() {
        let mut app = fixture_app("bad");
        app.containers.clear();
        let (cluster, store, r) = setup(app);
        assert!(matches!(r.apply("bad").await, Err(Error::Validation(_))));
        assert!(cluster.calls().is_empty());
        assert_eq!(store.get("bad").unwrap().state, AppState::Error);
    }

    #[tokio::test]
    async fn upstream_failure_stops_and_marks_error() {
        let (cluster, store, r) = setup(fixture_app("f1"));
        cluster.fail_on(ObjectKind::Service, "svc-f1", ClusterError::Upstream { code: 500, message: "boom".into() });
        assert!(matches!(r.apply("f1").await, Err(Error::Upstream(_))));
        assert_eq!(store.get("f1").unwrap().state, AppState::Error);
        assert!(cluster.contains(ObjectKind::Deployment, "app-f1"));
        assert!(!cluster.contains(ObjectKind::IngressRoute, "ingress-f1"));
    }

    #[tokio::test]
    async fn tcp_app_gets_port_and_node_port_service() {
        let mut app = fixture_app("t1");
        app.connection = Connection { protocol: ConnectionProtocol::Tcp, port: None };
        let (cluster, store, r) = setup(app);
        r.apply("t1").await.unwrap();
        let port = store.get("t1").unwrap().connection.port.unwrap();
        assert!((31000..=31999).contains(&port));
        let svc = cluster.object(ObjectKind::Service, "svc-t1").unwrap();
        assert_eq!(svc["spec"]["ports"][0]["nodePort"], port);
        assert!(!cluster.contains(ObjectKind::IngressRoute, "ingress-t1"));
    }

    #[tokio::test]
    async fn secrets_are_rendered_but_never_deleted() {
        let mut app = fixture_app("s1");
        app.containers[0].env_secret = Some("env1".into());
        app.containers[0].pull_secret = Some("pull1".into());
        let (cluster, store, r) = setup(app);
        store.insert_secret(SecretRecord { secretid: "env1".into(), kind: SecretType::Opaque, data: BTreeMap::from([("A".to_string(), "1".to_string())]) });
        store.insert_secret(SecretRecord { secretid: "pull1".into(), kind: SecretType::Dockerconfig, data: BTreeMap::from([(DOCKERCONFIG_KEY.to_string(), "{}".to_string())]) });
        r.apply("s1").await.unwrap();
        let w = cluster.object(ObjectKind::Deployment, "app-s1").unwrap();
        assert_eq!(w["spec"]["template"]["spec"]["imagePullSecrets"][0]["name"], "pull-secret-pull1");
        r.delete("s1").await.unwrap();
        assert!(cluster.contains(ObjectKind::Secret, "secret-env1"));
        assert!(cluster.contains(ObjectKind::Secret, "pull-secret-pull1"));
    }

    #[tokio::test]
    async fn registry_images_get_generated_pull_secret() {
        let mut app = fixture_app("g1");
        app.containers[0].registry = Some("cr1".into());
        let (cluster, _store, r) = setup(app);
        let tokens = Arc::new(TokenCache::new(Duration::from_secs(600), Box::new(registry::SigningIssuer::new("k"))));
        let r = r.with_registry("registry.test", tokens);
        r.apply("g1").await.unwrap();
        assert!(cluster.contains(ObjectKind::Secret, "pull-secret-cr1"));
    }

    #[tokio::test]
    async fn delete_failure_leaves_deleting() {
        let (cluster, store, r) = setup(fixture_app("d1"));
        cluster.fail_on(ObjectKind::Service, "svc-d1", ClusterError::Transport("reset".into()));
        assert!(r.delete("d1").await.is_err());
        assert_eq!(store.get("d1").unwrap().state, AppState::Deleting);
    }

    #[tokio::test]
    async fn delete_removes_claims_and_record() {
        let mut app = fixture_app("d2");
        app.volumes.push(Volume { volid: "v1".into(), kind: VolumeType::Block, size: 2, mount_path: "/b".into(), modes: MountModes::default(), secretid: None });
        let (cluster, store, r) = setup(app);
        r.apply("d2").await.unwrap();
        assert!(cluster.contains(ObjectKind::PersistentVolumeClaim, "vol-v1"));
        let report = r.delete("d2").await.unwrap();
        assert_eq!(report.state, None);
        assert!(cluster.is_empty());
        assert!(store.get("d2").is_none());
        assert!(r.delete("d2").await.unwrap().steps.is_empty());
    }

    #[tokio::test]
    async fn scale_rejects_above_max_without_side_effects() {
        let (cluster, store, r) = setup(fixture_app("sc"));
        assert!(matches!(r.scale("sc", 5).await, Err(Error::Validation(_))));
        assert!(cluster.calls().is_empty());
        assert_eq!(store.get("sc").unwrap().state, AppState::Creating);
    }

    #[tokio::test]
    async fn scale_and_redeploy_patch_workload() {
        let (cluster, store, r) = setup(fixture_app("p1"));
        r.apply("p1").await.unwrap();
        r.scale("p1", 0).await.unwrap();
        assert_eq!(cluster.object(ObjectKind::Deployment, "app-p1").unwrap()["spec"]["replicas"], 0);
        r.redeploy("p1").await.unwrap();
        let w = cluster.object(ObjectKind::Deployment, "app-p1").unwrap();
        assert!(w["spec"]["template"]["metadata"]["annotations"][builder::RESTARTED_AT_ANNOTATION].is_string());
        assert_eq!(store.get("p1").unwrap().state, AppState::Active);
    }

    #[tokio::test]
    async fn redeploy_of_missing_workload_marks_error() {
        let (_cluster, store, r) = setup(fixture_app("p2"));
        assert!(matches!(r.redeploy("p2").await, Err(Error::NotFound(_))));
        assert_eq!(store.get("p2").unwrap().state, AppState::Error);
    }
}
