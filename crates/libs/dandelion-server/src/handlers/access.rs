//! Access check endpoint: answers whether an IP is inside the CIDR allow
//! list kept in `dandelion_accesscheck`.

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::error::{Result, ServerError, succeed};

#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    #[serde(default)]
    ip: String,
}

/// `GET /api/v1/access/check?ip=<addr>`
pub async fn access_check_handler(
    State(state): State<AppState>,
    Query(query): Query<AccessQuery>,
) -> Result<Json<serde_json::Value>> {
    let ip = query.ip.trim();
    if ip.is_empty() {
        return Err(ServerError::Params);
    }
    let ip: std::net::IpAddr = ip.parse().map_err(|_| ServerError::Params)?;

    let allow = state
        .mm
        .access_checker()
        .allow_ip(&state.mm, ip)
        .await?;
    Ok(succeed(json!({ "ip": allow })))
}
