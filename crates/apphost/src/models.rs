//! Desired-state records for hosted applications.
//!
//! An [`Application`] owns its containers, volumes, scaler, firewall rule and
//! custom domains by value. Secrets live outside the application and are only
//! referenced by id.
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;

/// Externally exposed port for http applications.
pub const HTTP_PORT: u16 = 443;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType { Init, Main, Sidecar }

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Init => "init", Self::Main => "main", Self::Sidecar => "sidecar" }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol { Tcp, Udp }

impl PortProtocol {
    pub fn as_k8s(&self) -> &'static str { match self { Self::Tcp => "TCP", Self::Udp => "UDP" } }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Container {
    pub containerid: String,
    #[serde(rename = "type")]
    pub kind: ContainerType,
    pub image: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub port_protocol: Option<PortProtocol>,
    /// Declared CPU in cores. Rendered as the limit; the request is half of it.
    pub cpu: f64,
    /// Declared memory in GiB. Rendered as the limit; the request is half of it.
    pub memory: f64,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub pull_secret: Option<String>,
    #[serde(default)]
    pub env_secret: Option<String>,
    /// Platform registry id when the image is hosted on the platform registry.
    #[serde(default)]
    pub registry: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType { Temp, Fs, Block, Secret }

impl VolumeType {
    /// Backed by a persistent volume claim.
    pub fn is_claim(&self) -> bool { matches!(self, Self::Fs | Self::Block) }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MountMode { #[default] None, Ro, Rw }

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountModes {
    #[serde(default)]
    pub init: MountMode,
    #[serde(default)]
    pub main: MountMode,
    #[serde(default)]
    pub sidecar: MountMode,
}

impl MountModes {
    pub fn for_type(&self, kind: ContainerType) -> MountMode {
        match kind { ContainerType::Init => self.init, ContainerType::Main => self.main, ContainerType::Sidecar => self.sidecar }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Volume {
    pub volid: String,
    #[serde(rename = "type")]
    pub kind: VolumeType,
    /// Size in GiB.
    pub size: u32,
    pub mount_path: String,
    #[serde(default)]
    pub modes: MountModes,
    /// Referenced secret for `secret` volumes.
    #[serde(default)]
    pub secretid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: String,
    /// Target utilization percentage.
    pub target: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Scaler {
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default = "default_window")]
    pub scaleup_stb_window: u32,
    #[serde(default = "default_window")]
    pub scaledown_stb_window: u32,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

fn default_window() -> u32 { 300 }

impl Default for Scaler {
    fn default() -> Self {
        Self { min_replicas: 1, max_replicas: 1, scaleup_stb_window: 300, scaledown_stb_window: 300, triggers: Vec::new() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precedence { #[default] Allow, Deny }

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FirewallRule {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub precedence: Precedence,
    #[serde(default)]
    pub extra_allow_list: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CustomDomain {
    pub name: String,
    #[serde(default)]
    pub gen_tls_cert: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionProtocol { Http, Tcp, Udp }

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub protocol: ConnectionProtocol,
    /// Allocated cluster-unique port for tcp/udp; unused for http.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppState { Creating, Updating, Deleting, Active, Stopped, Error, Zombie, Orphan }

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Zombie => "zombie",
            Self::Orphan => "orphan",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy { Recreate, #[default] Rolling }

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Application {
    pub appid: String,
    pub name: String,
    pub slug: String,
    pub namespace: String,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub scaler: Scaler,
    #[serde(default)]
    pub firewall: FirewallRule,
    #[serde(default)]
    pub custom_domains: Vec<CustomDomain>,
    pub connection: Connection,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub pass_tls: bool,
    pub state: AppState,
    /// Volume ids whose claims must be removed on the next apply.
    #[serde(default)]
    pub volumes_to_delete: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Application {
    pub fn main_container(&self) -> Option<&Container> {
        self.containers.iter().find(|c| c.kind == ContainerType::Main)
    }

    pub fn init_containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.iter().filter(|c| c.kind == ContainerType::Init)
    }

    /// Main container first, then sidecars in declaration order.
    pub fn serving_containers(&self) -> impl Iterator<Item = &Container> {
        self.main_container().into_iter().chain(self.containers.iter().filter(|c| c.kind == ContainerType::Sidecar))
    }

    pub fn is_http(&self) -> bool { self.connection.protocol == ConnectionProtocol::Http }

    /// Port clients connect to from outside the cluster.
    pub fn external_port(&self) -> Option<u16> {
        if self.is_http() { Some(HTTP_PORT) } else { self.connection.port }
    }

    /// Init containers run one after another while main and sidecars run side by
    /// side, so the budget is the larger of the two sums times the replica ceiling.
    pub fn cpu_limit(&self) -> f64 {
        self.aggregate(|c| c.cpu)
    }

    pub fn memory_limit(&self) -> f64 {
        self.aggregate(|c| c.memory)
    }

    pub fn disk_limit(&self) -> u64 {
        self.volumes.iter().map(|v| v.size as u64).sum()
    }

    fn aggregate(&self, f: impl Fn(&Container) -> f64) -> f64 {
        let serving: f64 = self.containers.iter().filter(|c| c.kind != ContainerType::Init).map(&f).sum();
        let init: f64 = self.init_containers().map(&f).sum();
        serving.max(init) * self.scaler.max_replicas as f64
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecretType { Opaque, Dockerconfig }

/// Stored user secret. Values are plain strings; rendering encodes them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub secretid: String,
    #[serde(rename = "type")]
    pub kind: SecretType,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}
