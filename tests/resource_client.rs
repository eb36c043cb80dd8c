mod fixture;

use fixture::cm;
use futures::StreamExt;
use hyper::http::{Method, Request, Response, StatusCode};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::serde_json::{self, Value, json};
use kube::api::{DeleteParams, Patch, PatchParams, WatchEvent};
use kube::client::Body;
use kube::{Client, ResourceExt};
use kubemirror::ErrorKind;
use kubemirror::k8s::cache::{ListWatch, ListerWatcher};
use kubemirror::k8s::resource_client::{ListOptions, ResourceClient};
use tower_test::mock::{self, Handle};

type MockHandle = Handle<Request<Body>, Response<Body>>;

fn content_type(request: &Request<Body>) -> Option<String> {
    request
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Answer one request with `reply` after checking its method, path and,
/// when given, its content type
async fn expect_request(
    handle: &mut MockHandle,
    method: Method,
    path: &str,
    mime: Option<&str>,
    reply: Response<Body>,
) {
    let (request, send) = handle.next_request().await.expect("service not called");
    assert_eq!(request.method(), method);
    assert_eq!(request.uri().path(), path);
    if let Some(mime) = mime {
        assert_eq!(content_type(&request).as_deref(), Some(mime));
    }
    send.send_response(reply);
}

fn mock_client() -> (ResourceClient<ConfigMap>, MockHandle) {
    let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(service, "default");
    (ResourceClient::namespaced(client, "default"), handle)
}

fn respond(status: StatusCode, body: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn status_body(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("request failed: {reason}"),
        "reason": reason,
        "code": code
    })
}

fn config_map_list(items: &[ConfigMap], rv: &str, continue_token: Option<&str>) -> Value {
    let mut metadata = json!({ "resourceVersion": rv });
    if let Some(token) = continue_token {
        metadata["continue"] = json!(token);
    }
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMapList",
        "metadata": metadata,
        "items": items
    })
}

#[tokio::test]
async fn test_get_returns_object() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/default/configmaps/settings"
        );
        send.send_response(respond(StatusCode::OK, &serde_json::to_value(cm("settings", "7")).unwrap()));
    });

    let obj = client.get("settings").await.unwrap();
    assert_eq!(obj.name_any(), "settings");
    assert_eq!(obj.resource_version().as_deref(), Some("7"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_not_found_passes_through() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        for _ in 0..2 {
            let (_, send) = handle.next_request().await.expect("service not called");
            send.send_response(respond(StatusCode::NOT_FOUND, &status_body(404, "NotFound")));
        }
    });

    let err = client.get("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(client.get_opt("ghost").await.unwrap().is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn test_create_conflict_is_classified() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/default/configmaps");
        send.send_response(respond(StatusCode::CONFLICT, &status_body(409, "AlreadyExists")));
    });

    let err = client.create(&cm("settings", "1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    server.await.unwrap();
}

#[tokio::test]
async fn test_snapshot_follows_continue_tokens() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("first page not requested");
        let query = request.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("limit=1"), "{query}");
        assert!(query.contains("labelSelector=app%3Dweb"), "{query}");
        assert!(!query.contains("continue="), "{query}");
        send.send_response(respond(
            StatusCode::OK,
            &config_map_list(&[cm("a", "90")], "100", Some("page-2")),
        ));

        let (request, send) = handle.next_request().await.expect("second page not requested");
        let query = request.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("continue=page-2"), "{query}");
        send.send_response(respond(
            StatusCode::OK,
            &config_map_list(&[cm("b", "95")], "101", None),
        ));
    });

    let source = ListWatch::new(client, ListOptions::default().labels("app=web").page_size(1));
    let snapshot = source.snapshot().await.unwrap();
    let names: Vec<String> = snapshot.items.iter().map(ResourceExt::name_any).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(snapshot.resource_version, "100");
    server.await.unwrap();
}

#[tokio::test]
async fn test_expired_continue_token_is_stale() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let (_, send) = handle.next_request().await.expect("first page not requested");
        send.send_response(respond(
            StatusCode::OK,
            &config_map_list(&[cm("a", "90")], "100", Some("page-2")),
        ));
        let (_, send) = handle.next_request().await.expect("second page not requested");
        send.send_response(respond(StatusCode::GONE, &status_body(410, "Expired")));
    });

    let source = ListWatch::new(client, ListOptions::default().page_size(1));
    let err = source.snapshot().await.unwrap_err();
    assert!(err.is_stale());
    server.await.unwrap();
}

#[tokio::test]
async fn test_watch_streams_events_from_resource_version() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("watch not requested");
        let query = request.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("watch=true"), "{query}");
        assert!(query.contains("resourceVersion=100"), "{query}");

        let mut body = Vec::new();
        for event in [
            json!({ "type": "ADDED", "object": cm("a", "101") }),
            json!({ "type": "DELETED", "object": cm("a", "102") }),
        ] {
            body.extend(serde_json::to_vec(&event).unwrap());
            body.push(b'\n');
        }
        send.send_response(Response::builder().body(Body::from(body)).unwrap());
    });

    let source = ListWatch::new(client, ListOptions::default());
    let events: Vec<_> = source.stream("100").await.unwrap().collect().await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Ok(WatchEvent::Added(obj)) if obj.name_any() == "a"));
    assert!(matches!(&events[1], Ok(WatchEvent::Deleted(obj))
        if obj.resource_version().as_deref() == Some("102")));
    server.await.unwrap();
}

#[tokio::test]
async fn test_update_replaces_whole_object() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        expect_request(
            &mut handle,
            Method::PUT,
            "/api/v1/namespaces/default/configmaps/settings",
            Some("application/json"),
            respond(StatusCode::OK, &serde_json::to_value(cm("settings", "8")).unwrap()),
        )
        .await;
    });

    let updated = client.update(&cm("settings", "7")).await.unwrap();
    assert_eq!(updated.resource_version().as_deref(), Some("8"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_update_status_puts_status_subresource() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        expect_request(
            &mut handle,
            Method::PUT,
            "/api/v1/namespaces/default/configmaps/settings/status",
            Some("application/json"),
            respond(StatusCode::OK, &serde_json::to_value(cm("settings", "9")).unwrap()),
        )
        .await;
    });

    let updated = client.update_status(&cm("settings", "8")).await.unwrap();
    assert_eq!(updated.resource_version().as_deref(), Some("9"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_update_requires_a_name() {
    let (client, _handle) = mock_client();
    let err = client.update(&ConfigMap::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn test_delete_reports_pending_and_finished_deletions() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let mut finalizing = serde_json::to_value(cm("slow", "4")).unwrap();
        finalizing["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
        expect_request(
            &mut handle,
            Method::DELETE,
            "/api/v1/namespaces/default/configmaps/slow",
            None,
            respond(StatusCode::OK, &finalizing),
        )
        .await;

        let done = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success",
            "details": { "name": "quick", "kind": "configmaps" },
            "code": 200
        });
        expect_request(
            &mut handle,
            Method::DELETE,
            "/api/v1/namespaces/default/configmaps/quick",
            None,
            respond(StatusCode::OK, &done),
        )
        .await;
    });

    let pending = client.delete("slow", &DeleteParams::default()).await.unwrap();
    assert_eq!(pending.map(|obj| obj.name_any()).as_deref(), Some("slow"));

    let gone = client.delete("quick", &DeleteParams::default()).await.unwrap();
    assert!(gone.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn test_delete_collection_passes_selector() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::DELETE);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/default/configmaps");
        let query = request.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("labelSelector=app%3Dweb"), "{query}");
        send.send_response(respond(
            StatusCode::OK,
            &config_map_list(&[cm("a", "3")], "12", None),
        ));
    });

    client
        .delete_collection(&DeleteParams::default(), &ListOptions::default().labels("app=web"))
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_patch_sends_merge_patch() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        let mut patched = serde_json::to_value(cm("settings", "10")).unwrap();
        patched["data"] = json!({ "mode": "fast" });
        expect_request(
            &mut handle,
            Method::PATCH,
            "/api/v1/namespaces/default/configmaps/settings",
            Some("application/merge-patch+json"),
            respond(StatusCode::OK, &patched),
        )
        .await;
    });

    let patch = json!({ "data": { "mode": "fast" } });
    let obj = client
        .patch("settings", &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .unwrap();
    assert_eq!(
        obj.data.unwrap_or_default().get("mode").map(String::as_str),
        Some("fast")
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_patch_subresource_targets_subresource_path() {
    let (client, mut handle) = mock_client();
    let server = tokio::spawn(async move {
        expect_request(
            &mut handle,
            Method::PATCH,
            "/api/v1/namespaces/default/configmaps/settings/status",
            Some("application/merge-patch+json"),
            respond(StatusCode::OK, &serde_json::to_value(cm("settings", "11")).unwrap()),
        )
        .await;
    });

    let patch = json!({ "metadata": { "labels": { "checked": "true" } } });
    let obj = client
        .patch_subresource("status", "settings", &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .unwrap();
    assert_eq!(obj.resource_version().as_deref(), Some("11"));
    server.await.unwrap();
}
