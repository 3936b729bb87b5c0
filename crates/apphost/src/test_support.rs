//! Test harness utilities for unit and integration tests.
//! In-memory stand-ins for the orchestrator boundaries plus canned records, so
//! reconciler and gateway suites run without a cluster.
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::{Event, Pod}};
use kube::api::WatchEvent;
use serde_json::{json, Value};
use std::{collections::{BTreeMap, HashMap, VecDeque}, sync::{atomic::{AtomicBool, Ordering}, Mutex, MutexGuard}, time::Duration};
use tokio::sync::mpsc;
use crate::builder::{names, BuildContext, APP_LABEL};
use crate::cluster::{ClusterApi, ClusterError, ObjectKind};
use crate::gateway::source::{ClusterFeeds, ExecStream, InstanceList, InstanceUsage, Watch, WorkloadEvent};
use crate::gateway::terminal::{ERROR_CHANNEL, STDERR_CHANNEL, STDOUT_CHANNEL};
use crate::models::{AppState, Application, Connection, ConnectionProtocol, Container, ContainerType, FirewallRule, Scaler, UpdateStrategy};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

/// Single http app with one main container, as the API layer would create it.
pub fn fixture_app(appid: &str) -> Application {
    Application {
        appid: appid.into(),
        name: "demo".into(),
        slug: "demo".into(),
        namespace: "ns-test".into(),
        containers: vec![Container {
            containerid: "c1".into(),
            kind: ContainerType::Main,
            image: "nginx:1.25".into(),
            port: Some(8080),
            port_protocol: Some(crate::models::PortProtocol::Tcp),
            cpu: 0.5,
            memory: 0.5,
            command: vec![],
            args: vec![],
            pull_secret: None,
            env_secret: None,
            registry: None,
        }],
        volumes: vec![],
        scaler: Scaler::default(),
        firewall: FirewallRule::default(),
        custom_domains: vec![],
        connection: Connection { protocol: ConnectionProtocol::Http, port: None },
        update_strategy: UpdateStrategy::default(),
        pass_tls: false,
        state: AppState::Creating,
        volumes_to_delete: vec![],
        metadata: BTreeMap::new(),
    }
}

pub fn fixture_ctx() -> BuildContext {
    BuildContext {
        apps_domain: "apps.test".into(),
        storage_class: "fast".into(),
        runtime_class: None,
        extra_allow_cidrs: vec!["10.0.0.0/8".into()],
    }
}

/// Instance of `appid`'s workload. `running` pods have a populated status;
/// others look like they were just scheduled.
pub fn fixture_pod(appid: &str, suffix: &str, created: &str, running: bool) -> Pod {
    let mut pod = json!({
        "metadata": {
            "name": format!("{}-{suffix}", names::workload(appid)),
            "namespace": "ns-test",
            "labels": {APP_LABEL: appid},
            "creationTimestamp": created,
        },
        "spec": {"containers": [{"name": "main-c1", "image": "nginx:1.25", "ports": [{"containerPort": 8080, "protocol": "TCP"}]}]},
    });
    if running {
        pod["status"] = json!({
            "startTime": created,
            "conditions": [{"type": "Ready", "status": "True", "lastTransitionTime": created}],
            "containerStatuses": [{
                "name": "main-c1", "image": "nginx:1.25", "imageID": "", "ready": true, "restartCount": 0,
                "state": {"running": {"startedAt": created}},
            }],
        });
    }
    serde_json::from_value(pod).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCall { pub op: &'static str, pub kind: ObjectKind, pub name: String }

/// In-memory orchestrator keyed by (kind, name). Every call is logged;
/// `fail_on` makes all calls against one object fail.
#[derive(Default)]
pub struct MemoryCluster {
    objects: Mutex<BTreeMap<(ObjectKind, String), Value>>,
    calls: Mutex<Vec<ClusterCall>>,
    failures: Mutex<HashMap<(ObjectKind, String), ClusterError>>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    pub fn fail_on(&self, kind: ObjectKind, name: &str, err: ClusterError) {
        guard(&self.failures).insert((kind, name.to_string()), err);
    }

    pub fn clear_failures(&self) { guard(&self.failures).clear(); }

    pub fn insert(&self, kind: ObjectKind, name: &str, manifest: Value) {
        guard(&self.objects).insert((kind, name.to_string()), manifest);
    }

    pub fn contains(&self, kind: ObjectKind, name: &str) -> bool { guard(&self.objects).contains_key(&(kind, name.to_string())) }

    pub fn object(&self, kind: ObjectKind, name: &str) -> Option<Value> { guard(&self.objects).get(&(kind, name.to_string())).cloned() }

    pub fn count(&self, kind: ObjectKind) -> usize { guard(&self.objects).keys().filter(|(k, _)| *k == kind).count() }

    pub fn is_empty(&self) -> bool { guard(&self.objects).is_empty() }

    pub fn calls(&self) -> Vec<ClusterCall> { guard(&self.calls).clone() }

    pub fn reset_calls(&self) { guard(&self.calls).clear(); }

    fn enter(&self, op: &'static str, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        guard(&self.calls).push(ClusterCall { op, kind, name: name.to_string() });
        match guard(&self.failures).get(&(kind, name.to_string())) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

fn manifest_name(manifest: &Value) -> String { manifest["metadata"]["name"].as_str().unwrap_or_default().to_string() }

/// RFC 7386 merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(p) = patch else { *target = patch.clone(); return };
    if !target.is_object() { *target = json!({}); }
    if let Value::Object(t) = target {
        for (k, v) in p {
            if v.is_null() { t.remove(k); } else { merge_patch(t.entry(k.clone()).or_insert(Value::Null), v); }
        }
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn create(&self, _namespace: &str, kind: ObjectKind, manifest: &Value) -> Result<(), ClusterError> {
        let name = manifest_name(manifest);
        self.enter("create", kind, &name)?;
        let mut objects = guard(&self.objects);
        if objects.contains_key(&(kind, name.clone())) { return Err(ClusterError::Conflict(name)); }
        objects.insert((kind, name), manifest.clone());
        Ok(())
    }

    async fn replace(&self, _namespace: &str, kind: ObjectKind, name: &str, manifest: &Value) -> Result<(), ClusterError> {
        self.enter("replace", kind, name)?;
        match guard(&self.objects).get_mut(&(kind, name.to_string())) {
            Some(slot) => { *slot = manifest.clone(); Ok(()) }
            None => Err(ClusterError::NotFound(name.to_string())),
        }
    }

    async fn delete(&self, _namespace: &str, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        self.enter("delete", kind, name)?;
        guard(&self.objects).remove(&(kind, name.to_string())).map(|_| ()).ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn patch(&self, _namespace: &str, kind: ObjectKind, name: &str, patch: &Value) -> Result<(), ClusterError> {
        self.enter("patch", kind, name)?;
        match guard(&self.objects).get_mut(&(kind, name.to_string())) {
            Some(slot) => { merge_patch(slot, patch); Ok(()) }
            None => Err(ClusterError::NotFound(name.to_string())),
        }
    }
}

/// Client-facing half of a scripted exec session.
pub struct ScriptedExec {
    pub to_client: mpsc::Sender<Vec<u8>>,
    pub from_client: mpsc::Receiver<Vec<u8>>,
}

impl ScriptedExec {
    pub fn pair() -> (ExecStream, ScriptedExec) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        (ExecStream { frames: out_rx, input: in_tx, pump: None }, ScriptedExec { to_client: out_tx, from_client: in_rx })
    }

    async fn emit(&self, channel: u8, payload: &[u8]) {
        let mut frame = vec![channel];
        frame.extend_from_slice(payload);
        let _ = self.to_client.send(frame).await;
    }

    pub async fn stdout(&self, bytes: &[u8]) { self.emit(STDOUT_CHANNEL, bytes).await }
    pub async fn stderr(&self, bytes: &[u8]) { self.emit(STDERR_CHANNEL, bytes).await }
    pub async fn status(&self, status: Value) { self.emit(ERROR_CHANNEL, status.to_string().as_bytes()).await }
}

/// Scripted cluster streams. Watch scripts are consumed one per watch call;
/// once a script runs out the stream stays open and silent.
#[derive(Default)]
pub struct ScriptedFeeds {
    pub pods: Mutex<Vec<Pod>>,
    /// Replaces `pods` after each list call, one entry per call.
    pub next_pods: Mutex<VecDeque<Vec<Pod>>>,
    pub list_version: Mutex<String>,
    pub list_calls: Mutex<usize>,
    pub instance_watches: Mutex<VecDeque<Vec<Result<WatchEvent<Pod>, ClusterError>>>>,
    pub workload_watches: Mutex<VecDeque<Vec<Result<WorkloadEvent, ClusterError>>>>,
    pub events: Mutex<Option<Result<Vec<Event>, ClusterError>>>,
    pub traffic: Mutex<HashMap<String, f64>>,
    pub traffic_error: Mutex<Option<ClusterError>>,
    pub usage: Mutex<HashMap<String, InstanceUsage>>,
    pub log_lines: Mutex<Vec<String>>,
    pub log_error: Mutex<Option<ClusterError>>,
    pub log_requests: Mutex<Vec<i64>>,
    pub container_gone: AtomicBool,
    pub exec: Mutex<Option<ExecStream>>,
    pub exec_error: Mutex<Option<ClusterError>>,
    /// How long the exec handshake takes.
    pub exec_delay: Mutex<Option<Duration>>,
}

impl ScriptedFeeds {
    pub fn with_pods(pods: Vec<Pod>, resource_version: &str) -> Self {
        let s = Self::default();
        *guard(&s.pods) = pods;
        *guard(&s.list_version) = resource_version.to_string();
        s
    }

    pub fn push_instance_watch(&self, script: Vec<Result<WatchEvent<Pod>, ClusterError>>) { guard(&self.instance_watches).push_back(script); }

    pub fn push_workload_watch(&self, script: Vec<Result<WorkloadEvent, ClusterError>>) { guard(&self.workload_watches).push_back(script); }

    pub fn set_events(&self, events: Result<Vec<Event>, ClusterError>) { *guard(&self.events) = Some(events); }

    pub fn set_usage(&self, instance: &str, usage: InstanceUsage) { guard(&self.usage).insert(instance.to_string(), usage); }

    pub fn set_exec(&self, exec: ExecStream) { *guard(&self.exec) = Some(exec); }

    pub fn set_exec_delay(&self, delay: Duration) { *guard(&self.exec_delay) = Some(delay); }

    /// What the next list call sees after the current one.
    pub fn queue_pods(&self, pods: Vec<Pod>) { guard(&self.next_pods).push_back(pods); }

    pub fn list_calls(&self) -> usize { *guard(&self.list_calls) }

    pub fn log_requests(&self) -> Vec<i64> { guard(&self.log_requests).clone() }
}

fn scripted<T: Send + 'static>(items: Vec<Result<T, ClusterError>>) -> Watch<T> {
    stream::iter(items).chain(stream::pending()).boxed()
}

#[async_trait]
impl ClusterFeeds for ScriptedFeeds {
    async fn list_instances(&self, _namespace: &str, _appid: &str) -> Result<InstanceList, ClusterError> {
        *guard(&self.list_calls) += 1;
        let items = guard(&self.pods).clone();
        if let Some(next) = guard(&self.next_pods).pop_front() { *guard(&self.pods) = next; }
        Ok(InstanceList { items, resource_version: guard(&self.list_version).clone() })
    }

    async fn watch_instances(&self, _namespace: &str, _appid: &str, _resource_version: &str) -> Result<Watch<WatchEvent<Pod>>, ClusterError> {
        Ok(scripted(guard(&self.instance_watches).pop_front().unwrap_or_default()))
    }

    async fn watch_workload(&self, _namespace: &str, _appid: &str) -> Result<Watch<WorkloadEvent>, ClusterError> {
        Ok(scripted(guard(&self.workload_watches).pop_front().unwrap_or_default()))
    }

    async fn list_events(&self, _namespace: &str, _appid: &str) -> Result<Vec<Event>, ClusterError> {
        guard(&self.events).clone().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn traffic_counter(&self, query: &str) -> Result<f64, ClusterError> {
        if let Some(e) = guard(&self.traffic_error).clone() { return Err(e); }
        Ok(guard(&self.traffic).iter().find(|(metric, _)| query.contains(metric.as_str())).map(|(_, v)| *v).unwrap_or(0.0))
    }

    async fn instance_names(&self, _namespace: &str, _appid: &str) -> Result<Vec<String>, ClusterError> {
        let mut names: Vec<String> = guard(&self.usage).keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn instance_usage(&self, _namespace: &str, instance: &str) -> Result<InstanceUsage, ClusterError> {
        guard(&self.usage).get(instance).copied().ok_or_else(|| ClusterError::NotFound(instance.to_string()))
    }

    async fn log_lines(&self, _namespace: &str, _instance: &str, _container: &str, tail_lines: i64) -> Result<Watch<String>, ClusterError> {
        guard(&self.log_requests).push(tail_lines);
        if let Some(e) = guard(&self.log_error).clone() { return Err(e); }
        let lines = guard(&self.log_lines).clone();
        let skip = lines.len().saturating_sub(tail_lines.max(0) as usize);
        Ok(scripted(lines.into_iter().skip(skip).map(Ok).collect()))
    }

    async fn container_exists(&self, _namespace: &str, _instance: &str, _container: &str) -> Result<bool, ClusterError> {
        Ok(!self.container_gone.load(Ordering::SeqCst))
    }

    async fn open_exec(&self, _namespace: &str, instance: &str, _container: &str, _command: &[&str]) -> Result<ExecStream, ClusterError> {
        let delay = *guard(&self.exec_delay);
        if let Some(d) = delay { tokio::time::sleep(d).await; }
        if let Some(e) = guard(&self.exec_error).clone() { return Err(e); }
        guard(&self.exec).take().ok_or_else(|| ClusterError::NotFound(instance.to_string()))
    }
}

/// Deployment as the workload watch reports it.
pub fn fixture_deployment(appid: &str, available: i32) -> Deployment {
    serde_json::from_value(json!({
        "metadata": {"name": names::workload(appid), "namespace": "ns-test"},
        "spec": {
            "replicas": available,
            "selector": {"matchLabels": {APP_LABEL: appid}},
            "template": {"spec": {"containers": [{"name": "main-c1", "image": "nginx:1.25", "resources": {"limits": {"cpu": "0.50", "memory": "512M"}}}]}},
        },
        "status": {
            "availableReplicas": available,
            "updatedReplicas": available,
            "conditions": [{"type": "Available", "status": "True", "lastTransitionTime": "2024-05-01T10:00:00Z"}],
        },
    })).unwrap_or_default()
}
