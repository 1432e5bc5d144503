//! Practitioner billing endpoints: settings, invoices, consolidation, refunds

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use bookwell_billing::{
    BillingSettings, ConsolidationPreview, ConsolidationRunReport, Invoice, InvoiceWithBills,
    IssuedInvoice, RefundRecord, SettingsInput,
};
use bookwell_shared::InvoiceStatus;
use serde::Deserialize;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn list_settings(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<BillingSettings>>> {
    Ok(Json(state.billing()?.settings.list(auth_user.user_id).await?))
}

/// Create or replace the settings row for the scope named in the body
pub async fn upsert_settings(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(input): Json<SettingsInput>,
) -> ApiResult<Json<BillingSettings>> {
    let settings = state
        .billing()?
        .settings
        .upsert(auth_user.user_id, &input)
        .await?;
    Ok(Json(settings))
}

pub async fn delete_settings(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .billing()?
        .settings
        .delete(auth_user.user_id, id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct InvoiceListQuery {
    pub status: Option<InvoiceStatus>,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<InvoiceListQuery>,
) -> ApiResult<Json<Vec<Invoice>>> {
    let invoices = state
        .billing()?
        .invoices
        .list_for_user(auth_user.user_id, query.status)
        .await?;
    Ok(Json(invoices))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InvoiceWithBills>> {
    let invoice = state
        .billing()?
        .invoices
        .get_with_bills(auth_user.user_id, id)
        .await?;
    Ok(Json(invoice))
}

pub async fn issue_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<IssuedInvoice>> {
    let issued = state
        .billing()?
        .issue_invoice(auth_user.user_id, id)
        .await?;
    Ok(Json(issued))
}

pub async fn cancel_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    let invoice = state
        .billing()?
        .cancel_invoice(auth_user.user_id, id)
        .await?;
    Ok(Json(invoice))
}

#[derive(Debug, Deserialize)]
pub struct PdfReferenceRequest {
    pub pdf_path: String,
}

/// Record where the rendered PDF for an invoice is stored
pub async fn set_invoice_pdf(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<PdfReferenceRequest>,
) -> ApiResult<StatusCode> {
    let path = req.pdf_path.trim();
    if path.is_empty() {
        return Err(ApiError::BadRequest("pdf_path is required".to_string()));
    }
    state
        .billing()?
        .invoices
        .set_pdf_reference(auth_user.user_id, id, path)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ConsolidationQuery {
    /// Any day in the month to preview; defaults to the current month
    pub period: Option<Date>,
}

pub async fn preview_consolidation(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ConsolidationQuery>,
) -> ApiResult<Json<Vec<ConsolidationPreview>>> {
    let period = query
        .period
        .unwrap_or_else(|| OffsetDateTime::now_utc().date());
    let preview = state
        .billing()?
        .consolidation
        .preview(auth_user.user_id, period)
        .await?;
    Ok(Json(preview))
}

/// Run consolidation now for the signed-in practitioner's due groups
pub async fn run_consolidation(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ConsolidationRunReport>> {
    let today = OffsetDateTime::now_utc().date();
    let report = state
        .billing()?
        .consolidation
        .run_for_user(auth_user.user_id, today)
        .await?;
    Ok(Json(report))
}

pub async fn refund_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<RefundRecord>>> {
    Ok(Json(
        state
            .billing()?
            .refund
            .refund_history(auth_user.user_id)
            .await?,
    ))
}
