//! OpenF1 HTTP upstream.
//!
//! Two endpoints are used:
//! - `GET {base}/sessions?circuit_key=..&session_name=..&year=..`
//! - `GET {base}/location?session_key=..&driver_number=..&date>=..&date<..`
//!
//! The location window is half-open. Bounds go out as naive UTC with
//! millisecond precision (`2023-09-17T12:03:00.000`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use trackviz_env::{EntityId, EnvError, Sample, SessionFilter, SessionInfo, UpstreamSource};

pub const DEFAULT_BASE_URL: &str = "https://api.openf1.org/v1";

/// Formats a window bound the way the location endpoint expects it.
pub fn format_api_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Percent-encodes a query value.
fn escape_query_value(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

pub struct OpenF1Source {
    client: reqwest::Client,
    base_url: String,
}

impl OpenF1Source {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn sessions_url(&self) -> String {
        format!("{}/sessions", self.base_url)
    }

    /// Location URL; built by hand because `date>=` and `date<` are part of
    /// the parameter names.
    pub fn location_url(
        &self,
        session_key: u32,
        entity: EntityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        format!(
            "{}/location?session_key={}&driver_number={}&date>={}&date<{}",
            self.base_url,
            session_key,
            entity.get(),
            escape_query_value(&format_api_time(start)),
            escape_query_value(&format_api_time(end)),
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, EnvError> {
        let response = request
            .send()
            .await
            .map_err(|e| EnvError::upstream(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(EnvError::upstream(format!("HTTP {}: {}", status, body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| EnvError::decode(e.to_string()))
    }
}

#[async_trait]
impl UpstreamSource for OpenF1Source {
    async fn fetch_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>, EnvError> {
        let request = self.client.get(self.sessions_url()).query(&[
            ("circuit_key", filter.circuit_key.to_string()),
            ("session_name", filter.session_name.clone()),
            ("year", filter.year.to_string()),
        ]);
        let sessions: Vec<SessionInfo> = self.get_json(request).await?;
        debug!("{} sessions match {:?}", sessions.len(), filter);
        Ok(sessions)
    }

    async fn fetch_window(
        &self,
        session_key: u32,
        entity: EntityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, EnvError> {
        let url = self.location_url(session_key, entity, start, end);
        debug!("GET {}", url);
        self.get_json(self.client.get(url)).await
    }
}
