//! Authorization of realtime connections.
//!
//! Identity is resolved upstream and arrives in request headers; this module
//! only checks it against namespace membership and the target application.
use axum::http::HeaderMap;
use crate::{error::{Error, Result}, models::Application, store::{AppStore, Role}};

pub const WS_SCOPE: &str = "container-apps:ws";
pub const SUBJECT_HEADER: &str = "x-auth-subject";
pub const SCOPES_HEADER: &str = "x-auth-scopes";

/// Container name prefixes a client may address.
const CONTAINER_PREFIXES: [&str; 3] = ["main", "sidecar", "init"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub subject: Option<String>,
    /// `None` for session credentials, which carry no scope restriction.
    pub scopes: Option<Vec<String>>,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty());
        Self {
            subject: get(SUBJECT_HEADER).map(String::from),
            scopes: get(SCOPES_HEADER).map(|s| s.split([' ', ',']).filter(|p| !p.is_empty()).map(String::from).collect()),
        }
    }
}

pub async fn authorize_app(store: &dyn AppStore, identity: &Identity, nsid: &str, appid: &str) -> Result<(Application, Role)> {
    let subject = identity.subject.as_deref().ok_or_else(|| Error::permission("Unauthenticated"))?;
    if let Some(scopes) = &identity.scopes {
        if !scopes.iter().any(|s| s == WS_SCOPE) {
            return Err(Error::permission("Token does not have permission to access this resource"));
        }
    }
    if nsid.is_empty() || appid.is_empty() { return Err(Error::permission("nsid and appid are required")); }
    let role = store.namespace_role(nsid, subject).await?
        .ok_or_else(|| Error::not_found("Namespace not found or no permission to access"))?;
    let app = store.find(nsid, appid).await?
        .ok_or_else(|| Error::not_found("App not found or no permission to access"))?;
    Ok((app, role))
}

/// Instance names are derived from the workload name; containers from their type.
pub fn authorize_instance(appid: &str, iref: &str, cref: &str) -> Result<()> {
    if !iref.starts_with(&format!("{}-", crate::builder::names::workload(appid))) {
        return Err(Error::permission("Permission denied: Cannot access this instance"));
    }
    if !CONTAINER_PREFIXES.iter().any(|p| cref.starts_with(p)) {
        return Err(Error::permission("Permission denied: Cannot access this container"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::fixture_app;
    use axum::http::HeaderValue;

    fn store() -> MemoryStore {
        let s = MemoryStore::new();
        s.insert_app(fixture_app("a1"));
        s.grant("ns-test", "alice", Role::Admin);
        s
    }

    fn who(subject: &str, scopes: Option<&[&str]>) -> Identity {
        Identity { subject: Some(subject.into()), scopes: scopes.map(|s| s.iter().map(|x| x.to_string()).collect()) }
    }

    #[test]
    fn headers_parse() {
        let mut h = HeaderMap::new();
        h.insert(SUBJECT_HEADER, HeaderValue::from_static("alice"));
        h.insert(SCOPES_HEADER, HeaderValue::from_static("apps:read container-apps:ws"));
        let id = Identity::from_headers(&h);
        assert_eq!(id.subject.as_deref(), Some("alice"));
        assert_eq!(id.scopes.unwrap().len(), 2);
        assert_eq!(Identity::from_headers(&HeaderMap::new()), Identity::default());
    }

    #[tokio::test]
    async fn app_checks_in_order() {
        let s = store();
        let msg = |r: Result<(Application, Role)>| r.err().map(|e| e.client_message());
        assert_eq!(msg(authorize_app(&s, &Identity::default(), "ns-test", "a1").await).as_deref(), Some("Unauthenticated"));
        assert_eq!(msg(authorize_app(&s, &who("alice", Some(&["apps:read"])), "ns-test", "a1").await).as_deref(), Some("Token does not have permission to access this resource"));
        assert_eq!(msg(authorize_app(&s, &who("bob", None), "ns-test", "a1").await).as_deref(), Some("Namespace not found or no permission to access"));
        assert_eq!(msg(authorize_app(&s, &who("alice", None), "ns-test", "zz").await).as_deref(), Some("App not found or no permission to access"));
        let (app, role) = authorize_app(&s, &who("alice", Some(&[WS_SCOPE])), "ns-test", "a1").await.unwrap();
        assert_eq!((app.appid.as_str(), role), ("a1", Role::Admin));
    }

    #[test]
    fn instance_and_container_prefixes() {
        assert!(authorize_instance("a1", "app-a1-7d9f-x2", "main-c1").is_ok());
        assert!(authorize_instance("a1", "app-b2-7d9f-x2", "main-c1").is_err());
        assert!(authorize_instance("a1", "app-a10-7d9f-x2", "main-c1").is_err());
        assert!(authorize_instance("a1", "app-a1-7d9f-x2", "istio-proxy").is_err());
    }
}
