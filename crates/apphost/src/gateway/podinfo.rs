//! Reduces orchestrator objects to the compact summaries clients receive.
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::{ContainerStatus, Event, Pod}};
use serde::Serialize;

/// Native condition type -> platform state.
const STATE_TRANSLATIONS: &[(&str, &str)] = &[
    ("Available", "active"),
    ("Running", "active"),
    ("Ready", "active"),
    ("ContainersReady", "active"),
    ("Succeeded", "success"),
    ("Pending", "creating"),
    ("Initialized", "creating"),
    ("PodScheduled", "creating"),
    ("PodReadyToStartContainers", "pending"),
    ("Progressing", "updating"),
    ("Failed", "error"),
];

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerPhase { Creating, Pending, Running, Crash, Terminated, Terminating }

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ContainerPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restarts: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_protocol: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub iref: String,
    /// `None` until at least one container status is populated.
    pub state: Option<String>,
    pub started_at: String,
    pub main: ContainerSummary,
    pub sidecar: ContainerSummary,
    pub init: ContainerSummary,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatusSummary {
    pub app_state: Option<String>,
    /// Cores across available replicas, `-1` when none are available.
    pub cpu_limit: f64,
    /// MiB across available replicas, `-1` when none are available.
    pub memory_limit: f64,
    pub running: i32,
    pub pending: i32,
    pub desired: i32,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
    pub time: Option<String>,
}

fn iso(t: &DateTime<Utc>) -> String { t.to_rfc3339_opts(SecondsFormat::Secs, true) }

/// Newest-first condition scan: a true `Ready` wins, otherwise the newest true
/// condition is translated. `None` when no condition holds.
pub fn state_from_conditions<'a>(conditions: impl IntoIterator<Item = (&'a str, &'a str, Option<DateTime<Utc>>)>) -> Option<String> {
    let mut conds: Vec<_> = conditions.into_iter().collect();
    conds.sort_by(|a, b| b.2.cmp(&a.2));
    if conds.iter().any(|(t, s, _)| *t == "Ready" && *s == "True") { return Some("active".into()); }
    conds.iter().find(|(_, s, _)| *s == "True").map(|(t, _, _)| {
        STATE_TRANSLATIONS.iter().find(|(k, _)| k == t).map(|(_, v)| *v).unwrap_or("unknown").to_string()
    })
}

fn crash_detail(message: &str) -> String {
    message.split_once(':').map(|(_, rest)| rest.replace(": unknown", "").trim().to_string()).unwrap_or_else(|| message.to_string())
}

pub fn container_summary(cs: &ContainerStatus) -> ContainerSummary {
    let mut out = ContainerSummary {
        image: Some(cs.image.clone()),
        ready: Some(cs.ready),
        restarts: Some(cs.restart_count),
        started: cs.started,
        message: Some(String::new()),
        ..Default::default()
    };
    let state = cs.state.as_ref();
    if let Some(w) = state.and_then(|s| s.waiting.as_ref()) {
        let msg = w.message.as_deref().unwrap_or_default();
        match w.reason.as_deref().unwrap_or_default() {
            "ImagePullBackOff" | "ErrImagePull" => {
                out.state = Some(ContainerPhase::Creating);
                out.message = Some("Image pull error".into());
            }
            "CrashLoopBackOff" => {
                out.state = Some(ContainerPhase::Crash);
                let head = msg.split("container").next().unwrap_or_default().replace(": unknown", "");
                out.message = Some(format!("Container crashed: {}", head.trim()));
            }
            "RunContainerError" | "StartError" => {
                out.state = Some(ContainerPhase::Crash);
                out.message = Some(format!("Container crashed: {}", crash_detail(msg)));
            }
            "PodInitializing" => out.state = Some(ContainerPhase::Pending),
            _ => out.state = Some(ContainerPhase::Creating),
        }
    } else if let Some(r) = state.and_then(|s| s.running.as_ref()) {
        out.state = Some(ContainerPhase::Running);
        out.started_at = r.started_at.as_ref().map(|t| iso(&t.0));
    } else if state.and_then(|s| s.terminated.as_ref()).is_some() {
        out.state = Some(ContainerPhase::Terminated);
    }
    if out.state == Some(ContainerPhase::Crash) {
        if let Some(last) = cs.last_state.as_ref().and_then(|s| s.terminated.as_ref()) {
            match last.reason.as_deref() {
                Some("Error") => {
                    let m = out.message.get_or_insert_with(String::new);
                    m.push_str(&format!(" (received exit code {})", last.exit_code));
                }
                Some("StartError") => {
                    out.message = Some(format!("Container crashed: {}", crash_detail(last.message.as_deref().unwrap_or_default())));
                }
                _ => {}
            }
        }
    }
    out
}

pub fn instance_summary(pod: &Pod) -> InstanceSummary {
    let terminating = pod.metadata.deletion_timestamp.is_some();
    let status = pod.status.as_ref();
    let mut info = InstanceSummary {
        iref: pod.metadata.name.clone().unwrap_or_default(),
        state: None,
        started_at: status.and_then(|s| s.start_time.as_ref()).map(|t| iso(&t.0)).unwrap_or_default(),
        main: ContainerSummary::default(),
        sidecar: ContainerSummary::default(),
        init: ContainerSummary::default(),
    };
    if let Some(c) = pod.spec.as_ref().and_then(|s| s.containers.iter().find(|c| c.name.starts_with("main"))) {
        if let Some(p) = c.ports.as_ref().and_then(|p| p.first()) {
            info.main.port = Some(p.container_port);
            info.main.port_protocol = Some(p.protocol.as_deref().unwrap_or("TCP").to_lowercase());
        }
    }
    let mark = |mut s: ContainerSummary| { if terminating { s.state = Some(ContainerPhase::Terminating); } s };
    for cs in status.and_then(|s| s.container_statuses.as_ref()).into_iter().flatten() {
        let summary = mark(container_summary(cs));
        if cs.name.starts_with("main") {
            let (port, proto) = (info.main.port, info.main.port_protocol.take());
            info.main = ContainerSummary { port, port_protocol: proto, ..summary };
        } else if cs.name.starts_with("sidecar") {
            info.sidecar = summary;
        }
    }
    if let Some(first) = status.and_then(|s| s.init_container_statuses.as_ref()).and_then(|v| v.first()) {
        info.init = mark(container_summary(first));
    }

    let populated: Vec<ContainerPhase> = [&info.main, &info.sidecar, &info.init].iter().filter_map(|c| c.state).collect();
    if populated.is_empty() { return info; }
    if populated.contains(&ContainerPhase::Crash) {
        info.state = Some("crash".into());
        return info;
    }
    let derived = if terminating {
        Some("terminating".to_string())
    } else {
        let conds = status.and_then(|s| s.conditions.as_ref()).into_iter().flatten()
            .map(|c| (c.type_.as_str(), c.status.as_str(), c.last_transition_time.as_ref().map(|t| t.0)));
        state_from_conditions(conds)
    };
    let init_running = info.init.state == Some(ContainerPhase::Running);
    info.state = match derived {
        Some(s) if s == "pending" => Some(if init_running { s } else { "creating".into() }),
        other => other,
    };
    info
}

pub fn workload_status(d: &Deployment) -> StatusSummary {
    let (mut cpu, mut mem) = (0.0, 0.0);
    let containers = d.spec.as_ref().and_then(|s| s.template.spec.as_ref()).map(|p| p.containers.as_slice()).unwrap_or_default();
    for c in containers {
        if let Some(limits) = c.resources.as_ref().and_then(|r| r.limits.as_ref()) {
            cpu += limits.get("cpu").map(|q| cpu_to_cores(&q.0)).unwrap_or(0.0);
            mem += limits.get("memory").and_then(|q| memory_to_mib(&q.0)).unwrap_or(0.0);
        }
    }
    let st = d.status.as_ref();
    let available = st.and_then(|s| s.available_replicas).unwrap_or(0);
    let unavailable = st.and_then(|s| s.unavailable_replicas).unwrap_or(0);
    let updated = st.and_then(|s| s.updated_replicas).unwrap_or(available);
    let conds = st.and_then(|s| s.conditions.as_ref()).into_iter().flatten()
        .map(|c| (c.type_.as_str(), c.status.as_str(), c.last_transition_time.as_ref().map(|t| t.0)));
    StatusSummary {
        app_state: state_from_conditions(conds),
        cpu_limit: if available > 0 { cpu * available as f64 } else { -1.0 },
        memory_limit: if available > 0 { mem * available as f64 } else { -1.0 },
        running: available,
        pending: unavailable,
        desired: if updated > 0 { updated } else { available + unavailable },
    }
}

/// Newest first; events without a timestamp sort ahead of everything.
pub fn event_summaries(events: &[Event]) -> Vec<EventSummary> {
    let mut out: Vec<EventSummary> = events.iter().map(|e| {
        let time = e.last_timestamp.as_ref().map(|t| t.0).or_else(|| e.event_time.as_ref().map(|t| t.0)).map(|t| iso(&t));
        let message = e.message.clone().unwrap_or_default();
        if e.reason.as_deref() == Some("ScalingReplicaSet") {
            let words: Vec<&str> = message.split_whitespace().collect();
            let rewritten: Vec<&str> = words.iter().take(2).copied().chain(["app instances"]).chain(words.iter().skip(5).copied()).collect();
            EventSummary { reason: None, message: rewritten.join(" "), time }
        } else {
            EventSummary { reason: e.reason.clone(), message, time }
        }
    }).collect();
    out.sort_by(|a, b| (b.time.is_none(), &b.time).cmp(&(a.time.is_none(), &a.time)));
    out
}

/// `250m` -> 0.25, `12000000n` -> 0.012, `2` -> 2.0. Rounded to three places.
pub fn cpu_to_cores(value: &str) -> f64 {
    let (num, factor) = match value.chars().last() {
        Some('n') => (&value[..value.len() - 1], 1e-9),
        Some('u') => (&value[..value.len() - 1], 1e-6),
        Some('m') => (&value[..value.len() - 1], 1e-3),
        _ => (value, 1.0),
    };
    num.parse::<f64>().map(|n| round_to(n * factor, 3)).unwrap_or(0.0)
}

/// Memory quantity in MiB; binary suffixes are exact, decimal ones treat `M` as 1.
pub fn memory_to_mib(value: &str) -> Option<f64> {
    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(value.len());
    let (num, unit) = value.split_at(split);
    let num: f64 = num.parse().ok()?;
    let factor = match unit {
        "" => 1.0 / (1024.0 * 1024.0),
        "K" | "k" => 1e-3,
        "Ki" => 1.0 / 1024.0,
        "M" | "Mi" => 1.0,
        "G" => 1e3,
        "Gi" => 1024.0,
        "T" => 1e6,
        "Ti" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(round_to(num * factor, 3))
}

pub fn round_to(v: f64, places: i32) -> f64 {
    let m = 10f64.powi(places);
    (v * m).round() / m
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(v: serde_json::Value) -> Pod { serde_json::from_value(v).unwrap() }

    #[test]
    fn pod_without_statuses_has_null_state() {
        let p = pod(json!({"metadata": {"name": "app-a1-x"}, "spec": {"containers": [{"name": "main-c1", "ports": [{"containerPort": 8080, "protocol": "TCP"}]}]}}));
        let s = instance_summary(&p);
        assert_eq!(s.state, None);
        assert_eq!(s.main.port, Some(8080));
        assert_eq!(serde_json::to_value(&s).unwrap()["main"], json!({"port": 8080, "port_protocol": "tcp"}));
    }

    #[test]
    fn running_pod_is_active() {
        let p = pod(json!({
            "metadata": {"name": "app-a1-y"},
            "spec": {"containers": [{"name": "main-c1"}]},
            "status": {
                "startTime": "2024-05-01T10:00:00Z",
                "conditions": [
                    {"type": "PodScheduled", "status": "True", "lastTransitionTime": "2024-05-01T10:00:00Z"},
                    {"type": "Ready", "status": "True", "lastTransitionTime": "2024-05-01T10:00:05Z"}
                ],
                "containerStatuses": [{"name": "main-c1", "image": "nginx", "imageID": "", "ready": true, "restartCount": 0, "state": {"running": {"startedAt": "2024-05-01T10:00:03Z"}}}]
            }
        }));
        let s = instance_summary(&p);
        assert_eq!(s.state.as_deref(), Some("active"));
        assert_eq!(s.main.state, Some(ContainerPhase::Running));
        assert_eq!(s.started_at, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn crash_loop_reports_exit_code() {
        let p = pod(json!({
            "metadata": {"name": "app-a1-z"},
            "status": {"containerStatuses": [{
                "name": "main-c1", "image": "nginx", "imageID": "", "ready": false, "restartCount": 4,
                "state": {"waiting": {"reason": "CrashLoopBackOff", "message": "back-off 40s restarting failed container=main"}},
                "lastState": {"terminated": {"exitCode": 137, "reason": "Error"}}
            }]}
        }));
        let s = instance_summary(&p);
        assert_eq!(s.state.as_deref(), Some("crash"));
        assert_eq!(s.main.message.as_deref(), Some("Container crashed: back-off 40s restarting failed (received exit code 137)"));
    }

    #[test]
    fn terminating_overrides_state() {
        let p = pod(json!({
            "metadata": {"name": "app-a1-t", "deletionTimestamp": "2024-05-01T10:00:00Z"},
            "status": {"containerStatuses": [{"name": "main-c1", "image": "nginx", "imageID": "", "ready": true, "restartCount": 0, "state": {"running": {}}}]}
        }));
        let s = instance_summary(&p);
        assert_eq!(s.state.as_deref(), Some("terminating"));
        assert_eq!(s.main.state, Some(ContainerPhase::Terminating));
    }

    #[test]
    fn deployment_status_multiplies_by_available() {
        let d: Deployment = serde_json::from_value(json!({
            "metadata": {"name": "app-a1"},
            "spec": {"selector": {}, "template": {"spec": {"containers": [{"name": "main-c1", "resources": {"limits": {"cpu": "0.50", "memory": "512M"}}}]}}},
            "status": {"availableReplicas": 2, "updatedReplicas": 2, "conditions": [{"type": "Available", "status": "True", "lastTransitionTime": "2024-05-01T10:00:00Z"}]}
        })).unwrap();
        let s = workload_status(&d);
        assert_eq!(s.cpu_limit, 1.0);
        assert_eq!(s.memory_limit, 1024.0);
        assert_eq!(s.app_state.as_deref(), Some("active"));
        assert_eq!((s.running, s.pending, s.desired), (2, 0, 2));
    }

    #[test]
    fn scaling_events_are_rewritten_and_sorted() {
        let events: Vec<Event> = serde_json::from_value(json!([
            {"metadata": {"name": "e1"}, "involvedObject": {}, "reason": "ScalingReplicaSet", "message": "Scaled up replica set app-a1-5d9 to 2", "lastTimestamp": "2024-05-01T10:00:00Z"},
            {"metadata": {"name": "e2"}, "involvedObject": {}, "reason": "Pulled", "message": "pulled", "lastTimestamp": "2024-05-01T11:00:00Z"}
        ])).unwrap();
        let out = event_summaries(&events);
        assert_eq!(out[0].reason.as_deref(), Some("Pulled"));
        assert_eq!(out[1].message, "Scaled up app instances to 2");
    }

    #[test]
    fn quantities() {
        assert_eq!(cpu_to_cores("250m"), 0.25);
        assert_eq!(cpu_to_cores("12000000n"), 0.012);
        assert_eq!(memory_to_mib("2048Ki"), Some(2.0));
        assert_eq!(memory_to_mib("1Gi"), Some(1024.0));
        assert_eq!(memory_to_mib("bogus"), None);
    }
}
