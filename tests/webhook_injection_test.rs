// Admission webhook tests through the HTTP router

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use gcsfuse_csi::options::SIDECAR_CONTAINER_NAME;
use gcsfuse_csi::webhook::{InjectorConfig, WebhookState, inject, webhook_router};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn router() -> Router {
    webhook_router(Arc::new(WebhookState::new(InjectorConfig::default())))
}

fn deployment_pod(annotations: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "generateName": "trainer-5d8f7b-",
            "namespace": "ml",
            "labels": {"app": "trainer"},
            "annotations": annotations
        },
        "spec": {
            "serviceAccountName": "trainer",
            "containers": [{
                "name": "trainer",
                "image": "us-docker.pkg.dev/ml/trainer:1.4",
                "volumeMounts": [{"name": "datasets", "mountPath": "/data", "readOnly": true}]
            }],
            "volumes": [{
                "name": "datasets",
                "csi": {
                    "driver": "gcsfuse.csi.storage.gke.io",
                    "readOnly": true,
                    "volumeAttributes": {"bucketName": "ml-datasets", "implicitDirs": "true"}
                }
            }]
        }
    })
}

async fn admit(object: Value, operation: &str) -> Value {
    let review = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "e911857d-c318-11e8-bbad-025000000001",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "",
            "namespace": "ml",
            "operation": operation,
            "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
            "object": object
        }
    });

    let response = router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mutate-pod")
                .header("content-type", "application/json")
                .body(Body::from(review.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    body["response"].clone()
}

fn is_patched(response: &Value) -> bool {
    response.get("patchType").is_some_and(|t| t == "JSONPatch")
}

#[tokio::test]
async fn test_deployment_pod_gets_sidecar() {
    let response = admit(deployment_pod(json!({"gke-gcsfuse/memory-limit": "2Gi"})), "CREATE").await;
    assert_eq!(response["allowed"], json!(true));
    assert!(is_patched(&response));
    assert!(response.get("warnings").is_none_or(Value::is_null));
}

#[tokio::test]
async fn test_readmitting_injected_pod_is_a_no_op() {
    let pod: Pod = serde_json::from_value(deployment_pod(json!({}))).unwrap();
    let injected = inject(&pod, &InjectorConfig::default()).patched.unwrap();

    let spec = injected.spec.as_ref().unwrap();
    assert_eq!(spec.containers[0].name, SIDECAR_CONTAINER_NAME);
    assert_eq!(spec.containers[1].name, "trainer");

    let response = admit(serde_json::to_value(&injected).unwrap(), "CREATE").await;
    assert_eq!(response["allowed"], json!(true));
    assert!(!is_patched(&response));
}

#[tokio::test]
async fn test_unrelated_pod_is_untouched() {
    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "nginx", "namespace": "ml"},
        "spec": {"containers": [{"name": "nginx", "image": "nginx:1.27"}]}
    });
    let response = admit(pod, "CREATE").await;
    assert_eq!(response["allowed"], json!(true));
    assert!(!is_patched(&response));
}

#[tokio::test]
async fn test_unknown_cache_volume_is_admitted_with_warning() {
    let response =
        admit(deployment_pod(json!({"gke-gcsfuse/custom-cache-volume": "scratch"})), "CREATE").await;
    assert_eq!(response["allowed"], json!(true));
    assert!(!is_patched(&response));
    let warning = response["warnings"][0].as_str().unwrap();
    assert!(warning.contains("scratch"), "{warning}");
}

#[tokio::test]
async fn test_delete_is_allowed_unchanged() {
    let response = admit(deployment_pod(json!({})), "DELETE").await;
    assert_eq!(response["allowed"], json!(true));
    assert!(!is_patched(&response));
}
