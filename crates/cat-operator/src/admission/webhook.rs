//! Admission webhook HTTP server
//!
//! Serves the mutating (defaulting) and validating endpoints the API server
//! calls before persisting a Cat. Both accept `admission.k8s.io/v1` and
//! `admission.k8s.io/v1beta1` reviews and answer with the request's version.

use std::net::SocketAddr;

use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, Operation, SerializePatchError,
};
use kube::core::DynamicObject;
use kube::ResourceExt;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, warn};

use super::{Defaulter, Validator};
use crate::cat::Cat;
use crate::config::TlsPaths;

/// Path of the mutating (defaulting) hook
pub const MUTATE_PATH: &str = "/mutate-example-cats-io-v1alpha1-cat";
/// Path of the validating hook
pub const VALIDATE_PATH: &str = "/validate-example-cats-io-v1alpha1-cat";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to serialize Cat: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to attach patch: {0}")]
    Patch(#[from] SerializePatchError),
    #[error("failed to load TLS certificate: {0}")]
    Tls(#[source] std::io::Error),
    #[error("webhook server error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON patch that turns `cat` into its defaulted form
fn default_patch(cat: &Cat) -> Result<json_patch::Patch, WebhookError> {
    let original = serde_json::to_value(cat)?;
    let mut defaulted = cat.clone();
    defaulted.apply_defaults();
    let updated = serde_json::to_value(&defaulted)?;
    Ok(json_patch::diff(&original, &updated))
}

/// Run the defaulting hook against one admission request.
///
/// Always allows the request. Requests without an object (deletes) pass
/// through unchanged.
pub fn mutate(req: &AdmissionRequest<Cat>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let Some(cat) = req.object.as_ref() else {
        debug!(operation = ?req.operation, "No object in request, nothing to default");
        return response;
    };

    match default_patch(cat).and_then(|patch| Ok(response.with_patch(patch)?)) {
        Ok(patched) => patched,
        Err(e) => {
            error!(name = %cat.name_any(), error = %e, "Failed to compute defaulting patch");
            AdmissionResponse::from(req)
        }
    }
}

/// Run the validating hook against one admission request.
pub fn validate(req: &AdmissionRequest<Cat>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let result = match (&req.operation, req.object.as_ref(), req.old_object.as_ref()) {
        (Operation::Create, Some(cat), _) => cat.validate_create(),
        (Operation::Update, Some(cat), Some(old)) => cat.validate_update(old),
        (Operation::Update, Some(cat), None) => cat.validate_update(cat),
        (Operation::Delete, _, Some(old)) => old.validate_delete(),
        _ => Ok(()),
    };

    match result {
        Ok(()) => response,
        Err(e) => {
            info!(name = %req.name, error = %e, "Rejected Cat");
            response.deny(e.to_string())
        }
    }
}

#[instrument(skip_all)]
async fn mutate_handler(
    Json(review): Json<AdmissionReview<Cat>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Cat> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Invalid admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(mutate(&req).into_review())
}

#[instrument(skip_all)]
async fn validate_handler(
    Json(review): Json<AdmissionReview<Cat>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Cat> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Invalid admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(validate(&req).into_review())
}

/// Router with both admission endpoints
pub fn router() -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate_handler))
        .route(VALIDATE_PATH, post(validate_handler))
}

/// Run the webhook server until it fails.
///
/// Serves HTTPS when `tls` is given, plain HTTP otherwise.
pub async fn run_webhook_server(port: u16, tls: Option<TlsPaths>) -> Result<(), WebhookError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router();

    match tls {
        Some(paths) => {
            let config = RustlsConfig::from_pem_file(&paths.cert_path, &paths.key_path)
                .await
                .map_err(WebhookError::Tls)?;
            info!(port = port, cert = %paths.cert_path.display(), "Admission webhook listening (TLS)");
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = TcpListener::bind(addr).await?;
            warn!(port = port, "Admission webhook listening without TLS");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
