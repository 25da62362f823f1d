//! Request bodies and response reduction per [`TargetKind`].

use std::collections::BTreeSet;

use obo_models::{AuthStrategy, DownstreamTarget, RelayRequest, SearchSettings, TargetKind};
use serde_json::{Map, Value, json};

/// `@odata.type` of group entries in a `memberOf` listing.
const GROUP_ODATA_TYPE: &str = "#microsoft.graph.group";

/// What the dispatcher should send to a target.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPlan {
    /// `GET` with no body.
    Get,
    /// `POST` with this JSON body.
    Post(Value),
    /// Do not call the target; answer with this payload instead.
    Skip(Value),
}

/// Plan the call for `target`.
///
/// Search targets with a `group_filter_field` get a filter built from
/// `groups`. An empty group set never widens the search: the call is
/// skipped and an empty result set is returned.
pub fn plan_request(target: &DownstreamTarget, groups: &BTreeSet<String>, request: &RelayRequest) -> RequestPlan {
    match &target.kind {
        TargetKind::Profile | TargetKind::Groups => RequestPlan::Get,
        TargetKind::Search(settings) => {
            let mut body = search_body(settings, request);
            if let Some(field) = &settings.group_filter_field {
                match group_filter(field, groups) {
                    Some(filter) => {
                        body.insert("filter".into(), Value::String(filter));
                    }
                    None => return RequestPlan::Skip(empty_access_context(target, request)),
                }
            }
            RequestPlan::Post(Value::Object(body))
        }
    }
}

/// How a search target restricts results to what the caller may see.
///
/// `filter` is the filter sent with the query, if any. `None` for targets
/// that are not searches.
pub fn security_filtering(target: &DownstreamTarget, filter: Option<&str>) -> Option<Value> {
    let TargetKind::Search(settings) = &target.kind else {
        return None;
    };
    let (method, description) = match (target.auth_strategy, &settings.group_filter_field) {
        (AuthStrategy::SharedSecret, Some(_)) => (
            "group_filter",
            "Shared key; results limited by a filter built from the caller's groups.",
        ),
        (AuthStrategy::Delegated, _) if target.propagate_identity => (
            "query_source_identity",
            "Delegated token; the search service trims results to the caller's identity.",
        ),
        _ => (
            "credential_scope",
            "No per-user trimming; everything the credential can read is returned.",
        ),
    };
    Some(json!({
        "method": method,
        "filter_applied": filter,
        "description": description,
    }))
}

/// Attach the query and [`security_filtering`] to a search payload.
pub fn annotate_search(target: &DownstreamTarget, request: &RelayRequest, filter: Option<&str>, payload: &mut Value) {
    let (Some(security), Value::Object(map)) = (security_filtering(target, filter), payload) else {
        return;
    };
    map.insert("search_query".into(), json!(request.query_or_default()));
    map.insert("security_filtering".into(), security);
}

fn search_body(settings: &SearchSettings, request: &RelayRequest) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("search".into(), json!(request.query_or_default()));
    body.insert("select".into(), json!(settings.select));
    body.insert("top".into(), json!(settings.top));
    body.insert("queryType".into(), json!(settings.query_type));
    if let Some(order_by) = &settings.order_by {
        body.insert("orderby".into(), json!(order_by));
    }
    body
}

/// OData filter matching documents whose `field` collection contains one of
/// `groups`, or `None` when there are no groups.
pub fn group_filter(field: &str, groups: &BTreeSet<String>) -> Option<String> {
    if groups.is_empty() {
        return None;
    }
    let clauses: Vec<String> = groups
        .iter()
        .map(|g| format!("g eq '{}'", g.replace('\'', "''")))
        .collect();
    Some(format!("{field}/any(g: {})", clauses.join(" or ")))
}

fn empty_access_context(target: &DownstreamTarget, request: &RelayRequest) -> Value {
    let mut payload = json!({
        "result_count": 0,
        "results": [],
        "access_context": "empty",
    });
    annotate_search(target, request, None, &mut payload);
    payload
}

/// Reduce a successful response body to the fields callers consume.
pub fn shape_payload(kind: &TargetKind, body: &Value) -> Value {
    let field = |key: &str| body.get(key).cloned().unwrap_or(Value::Null);

    match kind {
        TargetKind::Profile => json!({
            "displayName": field("displayName"),
            "userPrincipalName": field("userPrincipalName"),
            "jobTitle": field("jobTitle"),
            "id": field("id"),
        }),
        TargetKind::Groups => {
            let group_ids: Vec<Value> = entries(body)
                .iter()
                .filter(|entry| entry.get("@odata.type").and_then(Value::as_str) == Some(GROUP_ODATA_TYPE))
                .filter_map(|entry| entry.get("id").cloned())
                .collect();
            json!({ "group_count": group_ids.len(), "group_ids": group_ids })
        }
        TargetKind::Search(_) => {
            let results = entries(body);
            let count = body
                .get("@odata.count")
                .and_then(Value::as_u64)
                .unwrap_or(results.len() as u64);
            json!({ "result_count": count, "results": results })
        }
    }
}

fn entries(body: &Value) -> Vec<Value> {
    body.get("value").and_then(Value::as_array).cloned().unwrap_or_default()
}
