use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
};
use std::sync::Arc;

use crate::billing::gateway::GatewayRegistry;
use crate::billing::reconciler::ReconcilerHandle;
use crate::error::{AppError, AppResult};

/// key: webhooks-ingress -> verify, enqueue, ack
///
/// Signature verification happens inline (it is the security boundary); the
/// actual reconciliation is queued so the provider gets its 200 immediately
/// and redeliveries stay cheap.
pub async fn provider_webhook(
    Extension(registry): Extension<Arc<GatewayRegistry>>,
    Extension(reconciler): Extension<ReconcilerHandle>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let adapter = registry.get(&provider).ok_or(AppError::NotFound)?;

    let signature = headers
        .get(adapter.signature_header())
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    let event = adapter.verify_and_parse_webhook(&body, signature)?;

    reconciler
        .dispatch(event)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    Ok(StatusCode::OK)
}
