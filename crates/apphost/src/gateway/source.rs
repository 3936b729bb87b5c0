//! Orchestrator-side streams the feeds consume.
//!
//! [`ClusterFeeds`] is the seam between the gateway and the cluster: list+watch
//! bookmarked by resource version, periodic polls, the log stream and the exec
//! primitive. [`KubeFeeds`] is the live implementation.
use async_trait::async_trait;
use futures_util::{stream::{self, BoxStream}, AsyncBufReadExt, SinkExt, StreamExt, TryStreamExt};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::{Event, Pod}};
use kube::{Api, Client, ResourceExt, api::{ApiResource, AttachParams, DynamicObject, ListParams, LogParams, TerminalSize, WatchEvent, WatchParams}};
use kube_runtime::watcher;
use serde::Deserialize;
use std::time::Duration;
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, sync::mpsc, task::JoinHandle};
use crate::builder::APP_LABEL;
use crate::cluster::ClusterError;
use super::podinfo::{cpu_to_cores, memory_to_mib, round_to};
use super::terminal::{ERROR_CHANNEL, RESIZE_CHANNEL, STDIN_CHANNEL, STDOUT_CHANNEL};

pub struct InstanceList { pub items: Vec<Pod>, pub resource_version: String }

pub enum WorkloadEvent { Applied(Box<Deployment>), Deleted }

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InstanceUsage { pub cpu: f64, pub memory: f64 }

/// Remote exec session as channel-tagged byte frames: the first byte of every
/// frame names the channel, the rest is payload.
pub struct ExecStream {
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Sender<Vec<u8>>,
    /// Remote pump; aborting it closes the remote session.
    pub pump: Option<JoinHandle<()>>,
}

impl Drop for ExecStream {
    fn drop(&mut self) { if let Some(p) = self.pump.take() { p.abort(); } }
}

pub type Watch<T> = BoxStream<'static, Result<T, ClusterError>>;

#[async_trait]
pub trait ClusterFeeds: Send + Sync {
    async fn list_instances(&self, namespace: &str, appid: &str) -> Result<InstanceList, ClusterError>;
    async fn watch_instances(&self, namespace: &str, appid: &str, resource_version: &str) -> Result<Watch<WatchEvent<Pod>>, ClusterError>;
    async fn watch_workload(&self, namespace: &str, appid: &str) -> Result<Watch<WorkloadEvent>, ClusterError>;
    async fn list_events(&self, namespace: &str, appid: &str) -> Result<Vec<Event>, ClusterError>;
    /// Scalar result of a traffic-proxy counter query.
    async fn traffic_counter(&self, query: &str) -> Result<f64, ClusterError>;
    /// Instances not marked for deletion.
    async fn instance_names(&self, namespace: &str, appid: &str) -> Result<Vec<String>, ClusterError>;
    async fn instance_usage(&self, namespace: &str, instance: &str) -> Result<InstanceUsage, ClusterError>;
    async fn log_lines(&self, namespace: &str, instance: &str, container: &str, tail_lines: i64) -> Result<Watch<String>, ClusterError>;
    async fn container_exists(&self, namespace: &str, instance: &str, container: &str) -> Result<bool, ClusterError>;
    async fn open_exec(&self, namespace: &str, instance: &str, container: &str, command: &[&str]) -> Result<ExecStream, ClusterError>;
}

/// Client-side resize message carried on the resize channel.
#[derive(Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeMessage {
    #[serde(rename = "Width")]
    pub width: u16,
    #[serde(rename = "Height")]
    pub height: u16,
}

pub struct KubeFeeds {
    client: Client,
    http: reqwest::Client,
    prometheus_url: Option<String>,
}

fn selector(appid: &str) -> String { format!("{APP_LABEL}={appid}") }

fn watch_err(e: watcher::Error) -> ClusterError { ClusterError::Transport(e.to_string()) }

fn pod_metrics_resource() -> ApiResource {
    ApiResource { group: "metrics.k8s.io".into(), version: "v1beta1".into(), api_version: "metrics.k8s.io/v1beta1".into(), kind: "PodMetrics".into(), plural: "pods".into() }
}

impl KubeFeeds {
    pub fn new(client: Client, prometheus_url: Option<String>) -> Self {
        Self { client, http: reqwest::Client::new(), prometheus_url }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), namespace) }
}

#[async_trait]
impl ClusterFeeds for KubeFeeds {
    async fn list_instances(&self, namespace: &str, appid: &str) -> Result<InstanceList, ClusterError> {
        let list = self.pods(namespace).list(&ListParams::default().labels(&selector(appid)).timeout(5)).await?;
        Ok(InstanceList { resource_version: list.metadata.resource_version.unwrap_or_default(), items: list.items })
    }

    async fn watch_instances(&self, namespace: &str, appid: &str, resource_version: &str) -> Result<Watch<WatchEvent<Pod>>, ClusterError> {
        let wp = WatchParams::default().labels(&selector(appid));
        let s = self.pods(namespace).watch(&wp, resource_version).await?;
        Ok(s.map_err(ClusterError::from).boxed())
    }

    async fn watch_workload(&self, namespace: &str, appid: &str) -> Result<Watch<WorkloadEvent>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let s = watcher(api, watcher::Config::default().labels(&selector(appid)))
            .map_ok(|ev| {
                let items = match ev {
                    watcher::Event::Applied(d) => vec![WorkloadEvent::Applied(Box::new(d))],
                    watcher::Event::Deleted(_) => vec![WorkloadEvent::Deleted],
                    // Relist after a desync: every listed object counts as applied.
                    watcher::Event::Restarted(ds) => ds.into_iter().map(|d| WorkloadEvent::Applied(Box::new(d))).collect(),
                };
                stream::iter(items.into_iter().map(Ok::<_, ClusterError>))
            })
            .map_err(watch_err)
            .try_flatten();
        Ok(s.boxed())
    }

    async fn list_events(&self, namespace: &str, appid: &str) -> Result<Vec<Event>, ClusterError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&format!("involvedObject.name={}", crate::builder::names::workload(appid))).timeout(5);
        Ok(api.list(&lp).await?.items)
    }

    async fn traffic_counter(&self, query: &str) -> Result<f64, ClusterError> {
        let Some(base) = &self.prometheus_url else { return Ok(0.0) };
        let resp = self.http.get(format!("{}/api/v1/query", base.trim_end_matches('/')))
            .query(&[("query", query)])
            .timeout(Duration::from_secs(10))
            .send().await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| ClusterError::Transport(e.to_string()))?;
        let value = body["data"]["result"].get(0).and_then(|r| r["value"].get(1)).and_then(|v| v.as_str());
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0.0))
    }

    async fn instance_names(&self, namespace: &str, appid: &str) -> Result<Vec<String>, ClusterError> {
        let list = self.pods(namespace).list(&ListParams::default().labels(&selector(appid))).await?;
        Ok(list.items.into_iter().filter(|p| p.metadata.deletion_timestamp.is_none()).map(|p| p.name_any()).collect())
    }

    async fn instance_usage(&self, namespace: &str, instance: &str) -> Result<InstanceUsage, ClusterError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &pod_metrics_resource());
        let m = api.get(instance).await?;
        let mut usage = InstanceUsage::default();
        for c in m.data["containers"].as_array().into_iter().flatten() {
            usage.cpu += round_to(cpu_to_cores(c["usage"]["cpu"].as_str().unwrap_or_default()), 4);
            usage.memory += round_to(memory_to_mib(c["usage"]["memory"].as_str().unwrap_or_default()).unwrap_or(0.0), 4);
        }
        Ok(usage)
    }

    async fn log_lines(&self, namespace: &str, instance: &str, container: &str, tail_lines: i64) -> Result<Watch<String>, ClusterError> {
        let lp = LogParams { container: Some(container.to_string()), follow: true, tail_lines: Some(tail_lines), timestamps: true, ..Default::default() };
        let reader = self.pods(namespace).log_stream(instance, &lp).await?;
        Ok(reader.lines().map_err(|e| ClusterError::Transport(e.to_string())).boxed())
    }

    async fn container_exists(&self, namespace: &str, instance: &str, container: &str) -> Result<bool, ClusterError> {
        let pod = match self.pods(namespace).get(instance).await {
            Ok(p) => p,
            Err(e) => return match ClusterError::from(e) { ClusterError::NotFound(_) => Ok(false), other => Err(other) },
        };
        let Some(spec) = pod.spec else { return Ok(false) };
        Ok(spec.containers.iter().chain(spec.init_containers.iter().flatten()).any(|c| c.name == container))
    }

    async fn open_exec(&self, namespace: &str, instance: &str, container: &str, command: &[&str]) -> Result<ExecStream, ClusterError> {
        let ap = AttachParams::interactive_tty().container(container);
        let mut proc = self.pods(namespace).exec(instance, command.to_vec(), &ap).await?;
        let mut stdout = proc.stdout().ok_or_else(|| ClusterError::Transport("exec without stdout".into()))?;
        let mut stdin = proc.stdin().ok_or_else(|| ClusterError::Transport("exec without stdin".into()))?;
        let mut resize = proc.terminal_size();
        let status = proc.take_status();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(64);

        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    n = stdout.read(&mut buf) => match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut frame = Vec::with_capacity(n + 1);
                            frame.push(STDOUT_CHANNEL);
                            frame.extend_from_slice(&buf[..n]);
                            if out_tx.send(frame).await.is_err() { break; }
                        }
                    },
                    input = in_rx.recv() => match input.as_deref().and_then(|f| f.split_first()) {
                        None => break,
                        Some((&STDIN_CHANNEL, data)) => { if stdin.write_all(data).await.is_err() { break; } }
                        Some((&RESIZE_CHANNEL, data)) => {
                            if let (Some(tx), Ok(m)) = (resize.as_mut(), serde_json::from_slice::<ResizeMessage>(data)) {
                                if let Err(e) = tx.send(TerminalSize { width: m.width, height: m.height }).await { tracing::debug!(error=%e, "exec_resize_dropped"); }
                            }
                        }
                        Some(_) => {}
                    },
                }
            }
            if let Some(status) = status {
                if let Ok(Some(st)) = tokio::time::timeout(Duration::from_secs(2), status).await {
                    let mut frame = vec![ERROR_CHANNEL];
                    frame.extend(serde_json::to_vec(&st).unwrap_or_default());
                    let _ = out_tx.send(frame).await;
                }
            }
            proc.abort();
        });
        Ok(ExecStream { frames: out_rx, input: in_tx, pump: Some(pump) })
    }
}
