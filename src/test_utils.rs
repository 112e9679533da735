// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! In-memory Kubernetes API server for tests.
//!
//! Namespaced objects are kept as JSON and served for get, list (label selectors),
//! create (including generateName), replace (resourceVersion checked), merge patch
//! and delete. Every request is recorded so tests can assert which calls happened.

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::ByteString;
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    requests: Vec<(String, String)>,
    injected: HashMap<(String, String), (u16, usize)>,
    next_version: u64,
    next_suffix: u64,
    /// Seconds until minted tokens expire, 600 when unset
    token_lifetime: Option<i64>,
}

/// A fake API server usable as the transport of a kube Client.
#[derive(Clone, Default)]
pub struct FakeApiServer {
    state: Arc<Mutex<State>>,
}

impl FakeApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a kube Client backed by this server
    pub fn client(&self) -> Client {
        Client::new(self.clone(), "default")
    }

    pub fn insert(&self, namespace: &str, resource: &str, mut object: Value) {
        let mut state = self.state.lock().unwrap();
        state.next_version += 1;
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        object["metadata"]["namespace"] = json!(namespace);
        object["metadata"]["resourceVersion"] = json!(state.next_version.to_string());
        state
            .objects
            .insert((namespace.to_string(), resource.to_string(), name), object);
    }

    pub fn insert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &[(&str, &str)],
        labels: Option<BTreeMap<String, String>>,
        annotations: Option<BTreeMap<String, String>>,
    ) {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                labels,
                annotations,
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        self.insert(namespace, "secrets", serde_json::to_value(secret).unwrap());
    }

    pub fn insert_service_account(
        &self,
        namespace: &str,
        name: &str,
        labels: Option<BTreeMap<String, String>>,
        annotations: Option<BTreeMap<String, String>>,
    ) {
        let sa = ServiceAccount {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                labels,
                annotations,
                ..Default::default()
            },
            ..Default::default()
        };
        self.insert(namespace, "serviceaccounts", serde_json::to_value(sa).unwrap());
    }

    pub fn get_object(&self, namespace: &str, resource: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(namespace.to_string(), resource.to_string(), name.to_string()))
            .cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.get_object(namespace, "secrets", name)
            .map(|v| serde_json::from_value(v).unwrap())
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.get_object(namespace, "serviceaccounts", name)
            .map(|v| serde_json::from_value(v).unwrap())
    }

    /// Names of the stored objects of one resource in a namespace
    pub fn names(&self, namespace: &str, resource: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(ns, res, _)| ns == namespace && res == resource)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Make the next `times` requests with this method and path fail with `code`
    pub fn inject_error(&self, method: &str, path: &str, code: u16, times: usize) {
        self.state
            .lock()
            .unwrap()
            .injected
            .insert((method.to_string(), path.to_string()), (code, times));
    }

    /// Make the next `times` replaces of an object report a conflict
    pub fn fail_next_writes(&self, namespace: &str, resource: &str, name: &str, times: usize) {
        let path = format!("/api/v1/namespaces/{}/{}/{}", namespace, resource, name);
        self.inject_error("PUT", &path, 409, times);
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count_requests(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|(m, p)| m == method && p == path)
            .count()
    }

    /// Number of requests that could have changed state
    pub fn mutation_count(&self) -> usize {
        self.requests().iter().filter(|(m, _)| m != "GET").count()
    }

    /// Tokens minted from now on expire `seconds` after issue; negative means already expired.
    pub fn set_token_lifetime(&self, seconds: i64) {
        self.state.lock().unwrap().token_lifetime = Some(seconds);
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    fn handle(&self, method: &str, path: &str, query: Option<&str>, body: &[u8]) -> (u16, Value) {
        let mut state = self.state.lock().unwrap();
        state.requests.push((method.to_string(), path.to_string()));

        let injected_key = (method.to_string(), path.to_string());
        if let Some((code, remaining)) = state.injected.get_mut(&injected_key) {
            if *remaining > 0 {
                *remaining -= 1;
                let code = *code;
                return (code, status_json(code, "injected failure"));
            }
        }

        let Some(route) = Route::parse(path) else {
            return (404, status_json(404, "unknown path"));
        };
        let key = (route.namespace.clone(), route.resource.clone(), route.name.clone().unwrap_or_default());

        match (method, route.name.as_deref(), route.subresource.as_deref()) {
            ("GET", None, None) => {
                let selector = query.and_then(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .find(|(k, _)| k == "labelSelector")
                        .map(|(_, v)| v.into_owned())
                });
                let items: Vec<Value> = state
                    .objects
                    .iter()
                    .filter(|((ns, res, _), _)| *ns == route.namespace && *res == route.resource)
                    .map(|(_, v)| v.clone())
                    .filter(|v| selector.as_deref().map_or(true, |s| matches_selector(v, s)))
                    .collect();
                let (api_version, kind) = type_of(&route.resource);
                (
                    200,
                    json!({
                        "apiVersion": api_version,
                        "kind": format!("{}List", kind),
                        "metadata": {"resourceVersion": state.next_version.to_string()},
                        "items": items,
                    }),
                )
            }
            ("GET", Some(name), None) => match state.objects.get(&key) {
                Some(obj) => (200, obj.clone()),
                None => (404, not_found(&route.resource, name)),
            },
            ("POST", None, None) => {
                let mut obj: Value = match serde_json::from_slice(body) {
                    Ok(v) => v,
                    Err(e) => return (400, status_json(400, &e.to_string())),
                };
                let name = match obj["metadata"]["name"].as_str() {
                    Some(n) if !n.is_empty() => n.to_string(),
                    _ => {
                        let prefix = obj["metadata"]["generateName"].as_str().unwrap_or_default().to_string();
                        state.next_suffix += 1;
                        format!("{}{:05x}", prefix, state.next_suffix)
                    }
                };
                let key = (route.namespace.clone(), route.resource.clone(), name.clone());
                if state.objects.contains_key(&key) {
                    return (409, status_json(409, "AlreadyExists"));
                }
                state.next_version += 1;
                obj["metadata"]["name"] = json!(name);
                obj["metadata"]["namespace"] = json!(route.namespace);
                obj["metadata"]["resourceVersion"] = json!(state.next_version.to_string());
                obj["metadata"]["uid"] = json!(format!("uid-{}", state.next_version));
                state.objects.insert(key, obj.clone());
                (201, obj)
            }
            ("POST", Some(name), Some("token")) => {
                if !state.objects.contains_key(&key) {
                    return (404, not_found(&route.resource, name));
                }
                state.next_version += 1;
                let lifetime = state.token_lifetime.unwrap_or(600);
                let expiry = chrono::Utc::now() + chrono::Duration::seconds(lifetime);
                (
                    201,
                    json!({
                        "apiVersion": "authentication.k8s.io/v1",
                        "kind": "TokenRequest",
                        "spec": {"audiences": []},
                        "status": {
                            "token": format!("token-{}-{}", name, state.next_version),
                            "expirationTimestamp": expiry.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        }
                    }),
                )
            }
            ("PUT", Some(name), _) => {
                let Some(existing) = state.objects.get(&key) else {
                    return (404, not_found(&route.resource, name));
                };
                let mut obj: Value = match serde_json::from_slice(body) {
                    Ok(v) => v,
                    Err(e) => return (400, status_json(400, &e.to_string())),
                };
                let sent = obj["metadata"]["resourceVersion"].as_str().map(str::to_string);
                if let Some(sent) = sent {
                    if Some(sent.as_str()) != existing["metadata"]["resourceVersion"].as_str() {
                        return (409, status_json(409, "Conflict"));
                    }
                }
                state.next_version += 1;
                obj["metadata"]["resourceVersion"] = json!(state.next_version.to_string());
                state.objects.insert(key, obj.clone());
                (200, obj)
            }
            ("PATCH", Some(name), _) => {
                let Some(mut obj) = state.objects.get(&key).cloned() else {
                    return (404, not_found(&route.resource, name));
                };
                let patch: Value = match serde_json::from_slice(body) {
                    Ok(v) => v,
                    Err(e) => return (400, status_json(400, &e.to_string())),
                };
                merge_patch(&mut obj, &patch);
                state.next_version += 1;
                obj["metadata"]["resourceVersion"] = json!(state.next_version.to_string());
                state.objects.insert(key, obj.clone());
                (200, obj)
            }
            ("DELETE", Some(name), None) => match state.objects.remove(&key) {
                Some(_) => (
                    200,
                    json!({"kind": "Status", "apiVersion": "v1", "metadata": {}, "status": "Success"}),
                ),
                None => (404, not_found(&route.resource, name)),
            },
            _ => (405, status_json(405, "MethodNotAllowed")),
        }
    }
}

struct Route {
    namespace: String,
    resource: String,
    name: Option<String>,
    subresource: Option<String>,
}

impl Route {
    /// `/api/v1/namespaces/{ns}/{resource}[/{name}[/{sub}]]` or the `/apis/{group}/{version}` form
    fn parse(path: &str) -> Option<Route> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let ns_at = segments.iter().position(|s| *s == "namespaces")?;
        let rest = &segments[ns_at + 1..];
        Some(Route {
            namespace: rest.first()?.to_string(),
            resource: rest.get(1)?.to_string(),
            name: rest.get(2).map(|s| s.to_string()),
            subresource: rest.get(3).map(|s| s.to_string()),
        })
    }
}

fn type_of(resource: &str) -> (&'static str, &'static str) {
    match resource {
        "secrets" => ("v1", "Secret"),
        "serviceaccounts" => ("v1", "ServiceAccount"),
        "distributedsecrets" => ("courier.geeko.me/v1alpha1", "DistributedSecret"),
        _ => ("v1", "Unknown"),
    }
}

/// Supports `key=value`, `key!=value` and bare `key` terms
fn matches_selector(obj: &Value, selector: &str) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector.split(',').filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            labels[k.trim()].as_str() != Some(v.trim())
        } else if let Some((k, v)) = term.split_once('=') {
            labels[k.trim()].as_str() == Some(v.trim().trim_start_matches('='))
        } else {
            !labels[term.trim()].is_null()
        }
    })
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = json!({});
            }
            for (k, v) in fields {
                if v.is_null() {
                    if let Some(map) = target.as_object_mut() {
                        map.remove(k);
                    }
                } else {
                    merge_patch(&mut target[k], v);
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn status_json(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code
    })
}

fn not_found(resource: &str, name: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
}

impl Service<Request<Body>> for FakeApiServer {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let server = self.clone();
        Box::pin(async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let query = req.uri().query().map(str::to_string);
            let body: Bytes = req
                .into_body()
                .collect()
                .await
                .map_err(|e| format!("failed to read request body: {}", e))?
                .to_bytes();

            let (status, value) = server.handle(&method, &path, query.as_deref(), &body);

            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(value.to_string().into_bytes()))
                .unwrap())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse_core_and_group_paths() {
        let core = Route::parse("/api/v1/namespaces/a/serviceaccounts/builder/token").unwrap();
        assert_eq!(core.namespace, "a");
        assert_eq!(core.resource, "serviceaccounts");
        assert_eq!(core.name.as_deref(), Some("builder"));
        assert_eq!(core.subresource.as_deref(), Some("token"));

        let group = Route::parse("/apis/courier.geeko.me/v1alpha1/namespaces/apps/distributedsecrets").unwrap();
        assert_eq!(group.namespace, "apps");
        assert_eq!(group.resource, "distributedsecrets");
        assert!(group.name.is_none());
    }

    #[test]
    fn test_matches_selector() {
        let obj = json!({"metadata": {"labels": {"a": "true", "b": "x"}}});
        assert!(matches_selector(&obj, "a=true"));
        assert!(matches_selector(&obj, "a=true,b"));
        assert!(matches_selector(&obj, "b!=y"));
        assert!(!matches_selector(&obj, "c"));
        assert!(!matches_selector(&obj, "a=false"));
    }

    #[test]
    fn test_merge_patch_removes_nulls() {
        let mut obj = json!({"status": {"phase": "Ready", "message": "ok"}});
        merge_patch(&mut obj, &json!({"status": {"message": null, "targets": []}}));
        assert_eq!(obj, json!({"status": {"phase": "Ready", "targets": []}}));
    }
}
