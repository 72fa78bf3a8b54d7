//! Client for the Nominatim `reverse` API.
//!
//! We ask for `format=jsonv2` and only keep `display_name`, `category` and `addresstype`.
//! Nominatim answers 200 with an `error` field when there is nothing at the spot.
//!
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};

use super::ReverseGeocoder;
use crate::{GeocoderConfig, LookupError, Place};

/// What we care about in a `jsonv2` answer.
///
#[derive(Debug, Deserialize)]
struct Reply {
    display_name: Option<String>,
    category: Option<String>,
    #[serde(alias = "addressType")]
    addresstype: Option<String>,
    error: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct NominatimGeocoder {
    base_url: String,
    user_agent: String,
    client: Client,
}

impl NominatimGeocoder {
    #[tracing::instrument]
    pub fn new(cfg: &GeocoderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .gzip(true)
            .build()?;
        Ok(NominatimGeocoder {
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            user_agent: cfg.user_agent.clone(),
            client,
        })
    }
}

fn from_reqwest(e: reqwest::Error) -> LookupError {
    if e.is_timeout() {
        LookupError::Timeout
    } else {
        LookupError::Network(e.to_string())
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    #[tracing::instrument(skip(self))]
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Place, LookupError> {
        let url = format!("{}/reverse", self.base_url);
        trace!("GET {url}");

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
            ])
            .header("user-agent", &self.user_agent)
            .send()
            .await
            .map_err(from_reqwest)?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(LookupError::NotFound),
            s if !s.is_success() => {
                debug!("geocoder answered {s}");
                return Err(LookupError::Network(format!("HTTP {s}")));
            }
            _ => (),
        }

        let body = resp.text().await.map_err(from_reqwest)?;
        let reply: Reply = serde_json::from_str(&body)
            .map_err(|e| LookupError::MalformedResponse(e.to_string()))?;

        if let Some(err) = reply.error {
            debug!("geocoder error: {err}");
            return Err(LookupError::NotFound);
        }
        match reply.display_name {
            Some(display_name) => Ok(Place {
                display_name,
                category: reply.category,
                address_type: reply.addresstype,
            }),
            None => Err(LookupError::NotFound),
        }
    }
}
