//! Upstream position source abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EnvError;
use crate::types::{EntityId, Sample, SessionFilter, SessionInfo};

/// Abstraction for the service that serves recorded position samples.
///
/// # Implementations
///
/// - **Production**: OpenF1 HTTP client (`trackviz_agent`)
/// - **Simulation**: synthetic laps around a closed course (`trackviz_sim`)
///
/// # Window Flow
///
/// ```text
/// Fetcher                           Source
///   |                                 |
///   |-- fetch_window(t, t+30s) ------>|
///   |<------------- [s0, s1, .., sn] -|
///   |-- fetch_window(sn+1ms, ..) ---->|
///   |<------------------------- [] ---|   stream exhausted
/// ```
#[async_trait]
pub trait UpstreamSource: Send + Sync + 'static {
    /// Lists sessions matching the filter, in upstream order.
    ///
    /// An empty list is not an error here; the caller decides what
    /// "no session" means.
    async fn fetch_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>, EnvError>;

    /// Fetches samples for one entity with `start <= date < end`.
    ///
    /// # Returns
    /// * `Ok(samples)` - Ordered by timestamp; empty means no more data
    /// * `Err(_)` - Transient failure, the window may be retried
    async fn fetch_window(
        &self,
        session_key: u32,
        entity: EntityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, EnvError>;
}
