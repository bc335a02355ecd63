//! Per-vehicle breadcrumb download.
//!
//! Each vehicle gets exactly one GET. A failure is captured in the returned
//! [`VehicleFetch`] and the loop moves on to the next vehicle.

mod client;

pub use client::{BasicClient, HttpClient};

use crate::record::VehicleBatch;
use reqwest::{Method, Request, StatusCode, Url};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://busdata.cs.pdx.edu/api/getBreadCrumbs";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_ERROR_BODY: usize = 512;

/// Why a single vehicle produced no records.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid breadcrumb url: {0}")]
    InvalidUrl(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed breadcrumb payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    /// Short label used in logs and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::Status { .. } => "http_status",
            FetchError::Transport(e) if e.is_timeout() => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::Decode(_) => "decode",
        }
    }
}

/// Outcome of fetching one vehicle.
#[derive(Debug)]
pub struct VehicleFetch {
    pub vehicle_id: String,
    pub result: Result<VehicleBatch, FetchError>,
}

/// Builds `<endpoint>?vehicle_id=<id>`, keeping any query the endpoint already has.
pub fn breadcrumb_url(endpoint: &str, vehicle_id: &str) -> Result<Url, FetchError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| FetchError::InvalidUrl(format!("{endpoint}: {e}")))?;
    url.query_pairs_mut().append_pair("vehicle_id", vehicle_id);
    Ok(url)
}

/// Downloads the breadcrumbs for one vehicle.
///
/// Anything other than `200 OK` with a JSON array of objects is an error.
pub async fn fetch_vehicle<C: HttpClient + ?Sized>(
    client: &C,
    endpoint: &str,
    vehicle_id: &str,
) -> Result<VehicleBatch, FetchError> {
    let url = breadcrumb_url(endpoint, vehicle_id)?;
    let resp = client.execute(Request::new(Method::GET, url)).await?;

    let status = resp.status();
    let body = resp.bytes().await?;
    debug!(vehicle_id, status = status.as_u16(), bytes = body.len(), "Breadcrumb response");

    if status != StatusCode::OK {
        return Err(FetchError::Status {
            status: status.as_u16(),
            body: error_body(&body),
        });
    }

    Ok(serde_json::from_slice(&body)?)
}

/// Fetches every vehicle in order, one request at a time.
///
/// Stops early, returning what it has, once `cancel` fires. A request still in
/// flight at that point is abandoned and its vehicle left out.
#[tracing::instrument(skip_all, fields(vehicles = vehicle_ids.len(), endpoint = %endpoint))]
pub async fn fetch_all<C: HttpClient + ?Sized>(
    client: &C,
    endpoint: &str,
    vehicle_ids: &[String],
    cancel: &CancellationToken,
) -> Vec<VehicleFetch> {
    let mut fetches = Vec::with_capacity(vehicle_ids.len());

    for vehicle_id in vehicle_ids {
        if cancel.is_cancelled() {
            warn!(
                fetched = fetches.len(),
                remaining = vehicle_ids.len() - fetches.len(),
                "Fetch interrupted"
            );
            break;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(
                    vehicle_id = %vehicle_id,
                    fetched = fetches.len(),
                    "Fetch interrupted mid-request"
                );
                break;
            }
            result = fetch_vehicle(client, endpoint, vehicle_id) => result,
        };
        match &result {
            Ok(records) if records.is_empty() => {
                warn!(vehicle_id = %vehicle_id, "No breadcrumbs returned");
            }
            Ok(records) => {
                info!(vehicle_id = %vehicle_id, records = records.len(), "Breadcrumbs fetched");
            }
            Err(e) => {
                error!(vehicle_id = %vehicle_id, kind = e.kind(), error = %e, "Breadcrumb fetch failed");
            }
        }

        fetches.push(VehicleFetch {
            vehicle_id: vehicle_id.clone(),
            result,
        });
    }

    fetches
}

/// Keeps error bodies readable in logs: JSON is compacted, anything else is
/// shown as text, and both are capped.
fn error_body(body: &[u8]) -> String {
    let text = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => json.to_string(),
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    };

    if text.chars().count() > MAX_ERROR_BODY {
        let mut truncated: String = text.chars().take(MAX_ERROR_BODY).collect();
        truncated.push_str("...");
        truncated
    } else {
        text
    }
}
