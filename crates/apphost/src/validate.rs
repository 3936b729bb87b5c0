//! Structural checks run before any cluster side effect.
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use crate::models::{Application, ConnectionProtocol, ContainerType, VolumeType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError { pub field: String, pub reason: String }

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

type Check = Result<(), ValidationError>;

static SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap());
/// At least two labels of up to 63 chars, no edge dashes, alphabetic TLD.
static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{1,63}$").unwrap()
});

pub fn validate_application(app: &Application) -> Check {
    let mains = app.containers.iter().filter(|c| c.kind == ContainerType::Main).count();
    if mains != 1 { return Err(ValidationError::new("containers", format!("exactly one main container required, found {mains}"))); }
    for c in &app.containers {
        let field = c.kind.as_str();
        if c.image.trim().is_empty() { return Err(ValidationError::new(format!("{field}[image]"), "is required")); }
        if !(c.cpu > 0.0) { return Err(ValidationError::new(format!("{field}[cpu]"), "must be greater than 0")); }
        if !(c.memory > 0.0) { return Err(ValidationError::new(format!("{field}[memory]"), "must be greater than 0")); }
        if c.port.is_some() != c.port_protocol.is_some() {
            return Err(ValidationError::new(format!("{field}[port]"), "port and port_protocol must be set together"));
        }
    }
    if let Some(main) = app.main_container() {
        if main.port.is_none() { return Err(ValidationError::new("main[port]", "is required")); }
    }
    if !is_slug(&app.slug) { return Err(ValidationError::new("slug", "must be lowercase alphanumerics separated by single dashes")); }
    match app.connection.protocol {
        ConnectionProtocol::Http => {}
        _ => if app.connection.port == Some(0) { return Err(ValidationError::new("connection[port]", "must be non-zero")); }
    }
    validate_scaler(app)?;
    validate_volumes(app)?;
    validate_firewall(app)?;
    for d in &app.custom_domains {
        if !is_hostname(&d.name) { return Err(ValidationError::new("custom_domains", format!("host \"{}\" is invalid", d.name))); }
    }
    Ok(())
}

fn validate_scaler(app: &Application) -> Check {
    let s = &app.scaler;
    if s.min_replicas < 1 { return Err(ValidationError::new("scaling[min_replicas]", "must be at least 1")); }
    if s.max_replicas < s.min_replicas { return Err(ValidationError::new("scaling[max_replicas]", "must be >= min_replicas")); }
    for t in &s.triggers {
        if t.kind != "cpu" && t.kind != "memory" { return Err(ValidationError::new("scaling[triggers][type]", format!("unsupported trigger {}", t.kind))); }
        if !(1..=100).contains(&t.target) { return Err(ValidationError::new("scaling[triggers][target]", "must be within 1% and 100%")); }
    }
    Ok(())
}

fn validate_volumes(app: &Application) -> Check {
    for v in &app.volumes {
        if !v.mount_path.starts_with('/') { return Err(ValidationError::new("volumes[mount_path]", format!("{} must be absolute", v.mount_path))); }
        if v.kind.is_claim() && v.size == 0 { return Err(ValidationError::new("volumes[size]", "must be greater than 0")); }
        if v.kind == VolumeType::Secret && v.secretid.is_none() { return Err(ValidationError::new("volumes[secretid]", "is required for secret volumes")); }
    }
    Ok(())
}

fn validate_firewall(app: &Application) -> Check {
    for (field, rules) in [("firewall[allow]", &app.firewall.allow), ("firewall[deny]", &app.firewall.deny)] {
        for rule in rules {
            if !is_ip_rule(rule) { return Err(ValidationError::new(field, format!("invalid rule {rule}"))); }
        }
    }
    Ok(())
}

/// Accepts a single address, a CIDR subnet, or a `start-end` range.
pub fn is_ip_rule(rule: &str) -> bool {
    let rule = rule.trim();
    if let Some((start, end)) = rule.split_once('-') {
        return match (start.trim().parse::<IpAddr>(), end.trim().parse::<IpAddr>()) {
            (Ok(a), Ok(b)) => a <= b,
            _ => false,
        };
    }
    if let Some((addr, bits)) = rule.split_once('/') {
        let Ok(addr) = addr.parse::<IpAddr>() else { return false };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        return bits.parse::<u8>().map(|b| b <= max).unwrap_or(false);
    }
    rule.parse::<IpAddr>().is_ok()
}

fn is_slug(s: &str) -> bool { SLUG.is_match(s) }

fn is_hostname(s: &str) -> bool { HOSTNAME.is_match(s) }
