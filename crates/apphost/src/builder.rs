//! Pure mapping from domain records to cluster object manifests.
//!
//! Nothing here touches the network. Manifests are `serde_json::Value` whose maps
//! are ordered, so the same input always serializes to the same bytes.
use serde_json::{json, Map, Value};
use crate::config::Settings;
use crate::models::{Application, Container, ConnectionProtocol, MountMode, PortProtocol, SecretRecord, UpdateStrategy, Volume, VolumeType, HTTP_PORT};

pub const APP_LABEL: &str = "appid";
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
const TERMINATION_GRACE_SECS: u32 = 15;
const TEMP_VOLUME_LIMIT: &str = "100Mi";

/// Object names derived from kind prefix and owning id.
pub mod names {
    pub fn workload(appid: &str) -> String { format!("app-{appid}") }
    pub fn service(appid: &str) -> String { format!("svc-{appid}") }
    pub fn ingress(appid: &str) -> String { format!("ingress-{appid}") }
    pub fn autoscaler(appid: &str) -> String { format!("scaler-{appid}") }
    pub fn ip_rules(appid: &str) -> String { format!("iprules-{appid}") }
    pub fn allow_list(appid: &str) -> String { format!("allowlist-{appid}") }
    pub fn claim(volid: &str) -> String { format!("vol-{volid}") }
    pub fn temp_volume(volid: &str) -> String { format!("temp-{volid}") }
    pub fn secret(secretid: &str) -> String { format!("secret-{secretid}") }
    pub fn pull_secret(id: &str) -> String { format!("pull-secret-{id}") }
}

/// Deployment-wide inputs the builders need besides the application itself.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub apps_domain: String,
    pub storage_class: String,
    pub runtime_class: Option<String>,
    pub extra_allow_cidrs: Vec<String>,
}

impl From<&Settings> for BuildContext {
    fn from(s: &Settings) -> Self {
        Self { apps_domain: s.apps_domain.clone(), storage_class: s.storage_class.clone(), runtime_class: s.runtime_class.clone(), extra_allow_cidrs: s.extra_allow_cidrs.clone() }
    }
}

/// Two decimal cores, e.g. `0.50`.
pub fn render_cpu(cores: f64) -> String { format!("{cores:.2}") }

/// Whole megabytes from GiB, e.g. `0.5` -> `512M`.
pub fn render_memory(gib: f64) -> String { format!("{}M", (gib * 1024.0) as i64) }

fn metadata(name: &str, namespace: &str, appid: &str) -> Value {
    json!({"name": name, "namespace": namespace, "labels": {APP_LABEL: appid}})
}

/// Pod-level volume name a mount refers to.
pub fn pod_volume_name(v: &Volume) -> String {
    match v.kind {
        VolumeType::Fs | VolumeType::Block => names::claim(&v.volid),
        VolumeType::Temp => names::temp_volume(&v.volid),
        VolumeType::Secret => names::secret(v.secretid.as_deref().unwrap_or(&v.volid)),
    }
}

pub fn build_container_spec(container: &Container, volumes: &[Volume]) -> Value {
    let mut spec = Map::new();
    spec.insert("name".into(), json!(format!("{}-{}", container.kind.as_str(), container.containerid)));
    spec.insert("image".into(), json!(container.image));
    spec.insert("imagePullPolicy".into(), json!("Always"));
    spec.insert("resources".into(), json!({
        "requests": {"cpu": render_cpu(container.cpu / 2.0), "memory": render_memory(container.memory / 2.0)},
        "limits": {"cpu": render_cpu(container.cpu), "memory": render_memory(container.memory)},
    }));
    if let Some(port) = container.port {
        let proto = container.port_protocol.unwrap_or(PortProtocol::Tcp);
        spec.insert("ports".into(), json!([{"containerPort": port, "protocol": proto.as_k8s()}]));
    }
    let mounts: Vec<Value> = volumes.iter().filter_map(|v| {
        let mode = v.modes.for_type(container.kind);
        (mode != MountMode::None).then(|| json!({"name": pod_volume_name(v), "mountPath": v.mount_path, "readOnly": mode == MountMode::Ro}))
    }).collect();
    spec.insert("volumeMounts".into(), Value::Array(mounts));
    if !container.command.is_empty() { spec.insert("command".into(), json!(container.command)); }
    if !container.args.is_empty() { spec.insert("args".into(), json!(container.args)); }
    if let Some(secretid) = &container.env_secret {
        spec.insert("envFrom".into(), json!([{"secretRef": {"name": names::secret(secretid)}}]));
    }
    Value::Object(spec)
}

/// Persistent claim for `fs`/`block` volumes; `None` for the rest.
pub fn build_volume_spec(ctx: &BuildContext, app: &Application, volume: &Volume) -> Option<Value> {
    if !volume.kind.is_claim() { return None; }
    Some(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": metadata(&names::claim(&volume.volid), &app.namespace, &app.appid),
        "spec": {
            "accessModes": ["ReadWriteMany", "ReadWriteOnce"],
            "volumeMode": if volume.kind == VolumeType::Block { "Block" } else { "Filesystem" },
            "resources": {"requests": {"storage": format!("{}Gi", volume.size)}},
            "storageClassName": ctx.storage_class,
        }
    }))
}

pub fn build_pod_volume(volume: &Volume) -> Value {
    let name = pod_volume_name(volume);
    match volume.kind {
        VolumeType::Fs | VolumeType::Block => json!({"name": name, "persistentVolumeClaim": {"claimName": name}}),
        VolumeType::Secret => json!({"name": name, "secret": {"secretName": name}}),
        VolumeType::Temp => json!({"name": name, "emptyDir": {"medium": "Memory", "sizeLimit": TEMP_VOLUME_LIMIT}}),
    }
}

/// `kubernetes.io/dockerconfigjson` secret; `config` is the raw JSON document.
pub fn build_pull_secret_spec(name: &str, app: &Application, config: &str) -> Value {
    use base64::Engine;
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": metadata(name, &app.namespace, &app.appid),
        "type": "kubernetes.io/dockerconfigjson",
        "data": {".dockerconfigjson": base64::engine::general_purpose::STANDARD.encode(config)},
    })
}

pub fn build_opaque_secret_spec(app: &Application, secret: &SecretRecord) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": metadata(&names::secret(&secret.secretid), &app.namespace, &app.appid),
        "type": "Opaque",
        "stringData": secret.data,
    })
}

fn strategy(s: UpdateStrategy) -> Value {
    match s {
        UpdateStrategy::Recreate => json!({"type": "Recreate"}),
        UpdateStrategy::Rolling => json!({"type": "RollingUpdate", "rollingUpdate": {"maxSurge": "25%", "maxUnavailable": "50%"}}),
    }
}

/// Deployment with init containers first, then main and sidecars.
/// `pull_secrets` are secret names; they are sorted and de-duplicated here.
pub fn build_workload_spec(ctx: &BuildContext, app: &Application, pull_secrets: &[String]) -> Value {
    let mut pulls: Vec<&String> = pull_secrets.iter().collect();
    pulls.sort();
    pulls.dedup();
    let mut seen = std::collections::BTreeSet::new();
    let volumes: Vec<Value> = app.volumes.iter().filter(|v| seen.insert(pod_volume_name(v))).map(build_pod_volume).collect();

    let mut pod = Map::new();
    if let Some(rc) = &ctx.runtime_class { pod.insert("runtimeClassName".into(), json!(rc)); }
    pod.insert("initContainers".into(), app.init_containers().map(|c| build_container_spec(c, &app.volumes)).collect());
    pod.insert("containers".into(), app.serving_containers().map(|c| build_container_spec(c, &app.volumes)).collect());
    pod.insert("volumes".into(), Value::Array(volumes));
    pod.insert("imagePullSecrets".into(), pulls.iter().map(|n| json!({"name": n})).collect());
    pod.insert("terminationGracePeriodSeconds".into(), json!(TERMINATION_GRACE_SECS));

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(&names::workload(&app.appid), &app.namespace, &app.appid),
        "spec": {
            "replicas": app.scaler.min_replicas,
            "selector": {"matchLabels": {APP_LABEL: app.appid}},
            "strategy": strategy(app.update_strategy),
            "template": {
                "metadata": {"labels": {APP_LABEL: app.appid}},
                "spec": Value::Object(pod),
            }
        }
    })
}

/// http: cluster-internal service on 443 forwarding to the main container port.
/// tcp/udp: node port service on the allocated connection port.
pub fn build_service_spec(app: &Application) -> Value {
    let main = app.main_container();
    let target = main.and_then(|c| c.port).unwrap_or_default();
    let proto = main.and_then(|c| c.port_protocol).unwrap_or(PortProtocol::Tcp).as_k8s();
    let (kind, port) = match app.connection.protocol {
        ConnectionProtocol::Http => ("ClusterIP", json!({"name": "http", "port": HTTP_PORT, "targetPort": target, "protocol": proto})),
        ConnectionProtocol::Tcp | ConnectionProtocol::Udp => {
            let mut p = json!({"port": target, "targetPort": target, "protocol": proto});
            if let Some(node_port) = app.connection.port { p["nodePort"] = json!(node_port); }
            ("NodePort", p)
        }
    };
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(&names::service(&app.appid), &app.namespace, &app.appid),
        "spec": {
            "type": kind,
            "selector": {APP_LABEL: app.appid},
            "ports": [port],
            "sessionAffinity": "ClientIP",
        }
    })
}

/// Traefik middlewares for http apps: the ip rules plugin, plus an allow list
/// when the extra-allow flag is set. Empty for other protocols.
pub fn build_firewall_spec(ctx: &BuildContext, app: &Application) -> Vec<Value> {
    if !app.is_http() { return Vec::new(); }
    let fw = &app.firewall;
    let precedence = match fw.precedence { crate::models::Precedence::Allow => "allow", crate::models::Precedence::Deny => "deny" };
    let mut out = vec![json!({
        "apiVersion": "traefik.io/v1alpha1",
        "kind": "Middleware",
        "metadata": metadata(&names::ip_rules(&app.appid), &app.namespace, &app.appid),
        "spec": {"plugin": {"iprules": {"allow": fw.allow, "deny": fw.deny, "precedence": precedence}}},
    })];
    if fw.extra_allow_list {
        out.push(json!({
            "apiVersion": "traefik.io/v1alpha1",
            "kind": "Middleware",
            "metadata": metadata(&names::allow_list(&app.appid), &app.namespace, &app.appid),
            "spec": {"ipAllowList": {"sourceRange": ctx.extra_allow_cidrs}},
        }));
    }
    out
}

pub fn primary_host(ctx: &BuildContext, app: &Application) -> String { format!("{}.{}", app.slug, ctx.apps_domain) }

/// IngressRoute with one rule per host; `None` unless the app speaks http.
pub fn build_ingress_spec(ctx: &BuildContext, app: &Application) -> Option<Value> {
    if !app.is_http() { return None; }
    let primary = primary_host(ctx, app);
    let hosts = std::iter::once(primary.clone()).chain(app.custom_domains.iter().map(|d| d.name.clone()));
    let mut middlewares = vec![json!({"name": names::ip_rules(&app.appid)})];
    if app.firewall.extra_allow_list { middlewares.push(json!({"name": names::allow_list(&app.appid)})); }
    let routes: Vec<Value> = hosts.map(|host| json!({
        "match": format!("Host(`{host}`)"),
        "kind": "Rule",
        "services": [{"name": names::service(&app.appid), "port": HTTP_PORT}],
        "middlewares": middlewares,
    })).collect();
    let tls = if app.pass_tls {
        json!({"passthrough": true})
    } else {
        let domains: Vec<Value> = std::iter::once(primary)
            .chain(app.custom_domains.iter().filter(|d| d.gen_tls_cert).map(|d| d.name.clone()))
            .map(|main| json!({"main": main}))
            .collect();
        json!({"certResolver": "letsencrypt", "domains": domains})
    };
    Some(json!({
        "apiVersion": "traefik.io/v1alpha1",
        "kind": "IngressRoute",
        "metadata": metadata(&names::ingress(&app.appid), &app.namespace, &app.appid),
        "spec": {"entryPoints": ["websecure", "web"], "routes": routes, "tls": tls},
    }))
}

/// KEDA ScaledObject; `None` when the scaler has no triggers.
pub fn build_autoscaler_spec(app: &Application) -> Option<Value> {
    let s = &app.scaler;
    if s.triggers.is_empty() { return None; }
    let triggers: Vec<Value> = s.triggers.iter().map(|t| json!({"type": t.kind, "metadata": {"type": "Utilization", "value": t.target.to_string()}})).collect();
    let policy = json!([{"type": "Percent", "value": 100, "periodSeconds": 10}]);
    Some(json!({
        "apiVersion": "keda.sh/v1alpha1",
        "kind": "ScaledObject",
        "metadata": metadata(&names::autoscaler(&app.appid), &app.namespace, &app.appid),
        "spec": {
            "scaleTargetRef": {"name": names::workload(&app.appid), "kind": "Deployment"},
            "minReplicaCount": s.min_replicas,
            "maxReplicaCount": s.max_replicas,
            "pollingInterval": 15,
            "cooldownPeriod": 60,
            "triggers": triggers,
            "advanced": {
                "restoreToOriginalReplicaCount": true,
                "horizontalPodAutoscalerConfig": {"behavior": {
                    "scaleDown": {"stabilizationWindowSeconds": s.scaledown_stb_window, "policies": policy},
                    "scaleUp": {"stabilizationWindowSeconds": s.scaleup_stb_window, "policies": policy},
                }}
            }
        }
    }))
}

pub fn build_restart_patch(timestamp: &str) -> Value {
    json!({"spec": {"template": {"metadata": {"annotations": {RESTARTED_AT_ANNOTATION: timestamp}}}}})
}

pub fn build_scale_patch(replicas: u32) -> Value { json!({"spec": {"replicas": replicas}}) }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerType, CustomDomain, MountModes, Trigger};
    use crate::test_support::{fixture_app, fixture_ctx};

    #[test]
    fn container_spec_is_byte_stable() {
        let app = fixture_app("d1");
        let a = serde_json::to_vec(&build_container_spec(&app.containers[0], &app.volumes)).unwrap();
        let b = serde_json::to_vec(&build_container_spec(&app.containers[0], &app.volumes)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resources_render_fixed_units() {
        let mut app = fixture_app("r1");
        app.containers[0].cpu = 1.0;
        app.containers[0].memory = 0.5;
        let c = build_container_spec(&app.containers[0], &[]);
        assert_eq!(c["name"], "main-c1");
        assert_eq!(c["resources"]["limits"]["cpu"], "1.00");
        assert_eq!(c["resources"]["requests"]["cpu"], "0.50");
        assert_eq!(c["resources"]["limits"]["memory"], "512M");
        assert_eq!(c["resources"]["requests"]["memory"], "256M");
        assert_eq!(render_cpu(0.125), "0.12");
    }

    #[test]
    fn mounts_follow_per_type_modes() {
        let mut app = fixture_app("m1");
        app.volumes.push(Volume { volid: "v1".into(), kind: VolumeType::Fs, size: 2, mount_path: "/data".into(), modes: MountModes { main: MountMode::Ro, ..Default::default() }, secretid: None });
        app.volumes.push(Volume { volid: "v2".into(), kind: VolumeType::Temp, size: 0, mount_path: "/tmp/x".into(), modes: MountModes { sidecar: MountMode::Rw, ..Default::default() }, secretid: None });
        let c = build_container_spec(&app.containers[0], &app.volumes);
        assert_eq!(c["volumeMounts"], json!([{"name": "vol-v1", "mountPath": "/data", "readOnly": true}]));
        let w = build_workload_spec(&fixture_ctx(), &app, &[]);
        assert_eq!(w["spec"]["template"]["spec"]["volumes"][1]["emptyDir"]["sizeLimit"], "100Mi");
    }

    #[test]
    fn workload_orders_init_then_serving() {
        let mut app = fixture_app("w1");
        let mut init = app.containers[0].clone();
        init.kind = ContainerType::Init;
        init.containerid = "i1".into();
        init.port = None;
        init.port_protocol = None;
        let mut side = init.clone();
        side.kind = ContainerType::Sidecar;
        side.containerid = "s1".into();
        app.containers.insert(0, side);
        app.containers.push(init);
        let w = build_workload_spec(&fixture_ctx(), &app, &["pull-secret-b".into(), "pull-secret-a".into(), "pull-secret-b".into()]);
        let pod = &w["spec"]["template"]["spec"];
        assert_eq!(pod["initContainers"][0]["name"], "init-i1");
        assert_eq!(pod["containers"][0]["name"], "main-c1");
        assert_eq!(pod["containers"][1]["name"], "sidecar-s1");
        assert_eq!(pod["imagePullSecrets"], json!([{"name": "pull-secret-a"}, {"name": "pull-secret-b"}]));
        assert_eq!(w["metadata"]["name"], "app-w1");
        assert_eq!(w["spec"]["strategy"]["rollingUpdate"]["maxUnavailable"], "50%");
    }

    #[test]
    fn http_service_maps_443_to_container_port() {
        let app = fixture_app("s1");
        let s = build_service_spec(&app);
        assert_eq!(s["spec"]["type"], "ClusterIP");
        assert_eq!(s["spec"]["ports"][0]["port"], 443);
        assert_eq!(s["spec"]["ports"][0]["targetPort"], 8080);
    }

    #[test]
    fn tcp_service_uses_node_port() {
        let mut app = fixture_app("s2");
        app.connection = crate::models::Connection { protocol: ConnectionProtocol::Tcp, port: Some(31555) };
        let s = build_service_spec(&app);
        assert_eq!(s["spec"]["type"], "NodePort");
        assert_eq!(s["spec"]["ports"][0]["nodePort"], 31555);
        assert!(build_ingress_spec(&fixture_ctx(), &app).is_none());
        assert!(build_firewall_spec(&fixture_ctx(), &app).is_empty());
    }

    #[test]
    fn ingress_has_route_per_host() {
        let mut app = fixture_app("i1");
        app.custom_domains.push(CustomDomain { name: "shop.example.com".into(), gen_tls_cert: true });
        app.firewall.extra_allow_list = true;
        let ing = build_ingress_spec(&fixture_ctx(), &app).unwrap();
        let routes = ing["spec"]["routes"].as_array().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0]["match"], "Host(`demo.apps.test`)");
        assert_eq!(routes[1]["middlewares"][1]["name"], "allowlist-i1");
        assert_eq!(ing["spec"]["tls"]["certResolver"], "letsencrypt");
        assert_eq!(build_firewall_spec(&fixture_ctx(), &app).len(), 2);
        app.pass_tls = true;
        assert_eq!(build_ingress_spec(&fixture_ctx(), &app).unwrap()["spec"]["tls"], json!({"passthrough": true}));
    }

    #[test]
    fn autoscaler_only_with_triggers() {
        let mut app = fixture_app("a1");
        assert!(build_autoscaler_spec(&app).is_none());
        app.scaler.max_replicas = 4;
        app.scaler.triggers.push(Trigger { kind: "cpu".into(), target: 70 });
        let so = build_autoscaler_spec(&app).unwrap();
        assert_eq!(so["spec"]["maxReplicaCount"], 4);
        assert_eq!(so["spec"]["triggers"][0]["metadata"]["value"], "70");
        assert_eq!(so["spec"]["scaleTargetRef"]["name"], "app-a1");
    }

    #[test]
    fn pull_secret_is_base64_dockerconfig() {
        let app = fixture_app("p1");
        let s = build_pull_secret_spec("pull-secret-x", &app, "{}");
        assert_eq!(s["type"], "kubernetes.io/dockerconfigjson");
        assert_eq!(s["data"][".dockerconfigjson"], "e30=");
    }
}
