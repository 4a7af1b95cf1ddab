use std::sync::Arc;

use axum::{Json, extract::State};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info, warn};

use super::WebhookState;
use super::injector::inject;
use crate::error::FailureKind;

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(review(&state, &req).into_review())
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Decide one admission request. Pods are always allowed.
pub fn review(state: &WebhookState, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let uid = req.uid.clone();

    if req.dry_run || !matches!(req.operation, Operation::Create) || req.kind.kind != "Pod" {
        debug!(uid = %uid, kind = %req.kind.kind, dry_run = req.dry_run, "Allowing unchanged");
        return AdmissionResponse::from(req);
    }
    let Some(pod) = &req.object else {
        debug!(uid = %uid, "No pod object in request, allowing unchanged");
        return AdmissionResponse::from(req);
    };

    let outcome = inject(pod, &state.injector);
    let pod_name = pod.metadata.name.as_deref().or(pod.metadata.generate_name.as_deref()).unwrap_or("");
    let namespace = req.namespace.as_deref().unwrap_or("");

    let mut response = AdmissionResponse::from(req);
    if let Some(e) = &outcome.error {
        warn!(
            uid = %uid,
            pod = %format!("{namespace}/{pod_name}"),
            failure = %FailureKind::AdmissionError,
            error = %e,
            "Admitting pod without the gcsfuse sidecar"
        );
    }
    if !outcome.warnings.is_empty() {
        response.warnings = Some(outcome.warnings.clone());
    }

    let Some(patched) = outcome.patched else {
        return response;
    };

    let patch = match (serde_json::to_value(pod), serde_json::to_value(&patched)) {
        (Ok(before), Ok(after)) => json_patch::diff(&before, &after),
        (Err(e), _) | (_, Err(e)) => {
            error!(uid = %uid, error = %e, "Failed to serialize pod");
            return response;
        }
    };

    info!(
        uid = %uid,
        pod = %format!("{namespace}/{pod_name}"),
        patch_ops = patch.0.len(),
        "Injecting gcsfuse sidecar"
    );

    let warnings = response.warnings.clone();
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch");
            let mut response = AdmissionResponse::from(req);
            response.warnings = warnings;
            response
        }
    }
}
