//! Privacy-budget consumption.
//!
//! The ledger is an external distributed service; this module pins down the
//! bridge contract the worker relies on and ships an HTTP client for it plus
//! an in-memory ledger for tests and local runs. Consumption is atomic
//! all-or-nothing across a batch and idempotent per `(job_id, unit)` within
//! the ledger's retention window, so retrying a crashed job cannot
//! double-debit.

use crate::aggregate::PrivacyBudgetUnit;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("budget service did not accept our credentials")]
    Unauthenticated,
    #[error("budget service denied consumption for this identity")]
    Unauthorized,
    #[error("budget service transport failure: {0}")]
    Transport(String),
}

/// Bridge to the distributed privacy-budget ledger.
#[async_trait]
pub trait PrivacyBudgetBridge: Send + Sync {
    /// Consume one unit of budget for each element of `units` on behalf of
    /// `claimed_identity`. Returns the subset for which no budget was left;
    /// empty means the whole batch was debited. Nothing is debited when the
    /// result is non-empty.
    async fn consume(
        &self,
        job_id: &str,
        units: &[PrivacyBudgetUnit],
        claimed_identity: &str,
    ) -> Result<Vec<PrivacyBudgetUnit>, Error>;
}

static BUDGET_USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "/",
    "budget-bridge"
);

#[derive(Serialize)]
struct ConsumeRequest<'a> {
    job_id: &'a str,
    claimed_identity: &'a str,
    units: &'a [PrivacyBudgetUnit],
}

#[derive(Deserialize)]
struct ConsumeResponse {
    exhausted: Vec<PrivacyBudgetUnit>,
}

/// HTTP client for a ledger exposing `POST {endpoint}/v1/consume`.
pub struct HttpBudgetBridge {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBudgetBridge {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(BUDGET_USER_AGENT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PrivacyBudgetBridge for HttpBudgetBridge {
    async fn consume(
        &self,
        job_id: &str,
        units: &[PrivacyBudgetUnit],
        claimed_identity: &str,
    ) -> Result<Vec<PrivacyBudgetUnit>, Error> {
        use http::StatusCode;

        let response = self
            .client
            .post(format!("{}/v1/consume", self.endpoint))
            .json(&ConsumeRequest {
                job_id,
                claimed_identity,
                units,
            })
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => return Err(Error::Unauthenticated),
            StatusCode::FORBIDDEN => return Err(Error::Unauthorized),
            _ if !status.is_success() => {
                return Err(Error::Transport(format!(
                    "budget service answered {status}"
                )))
            }
            _ => {}
        }

        let body: ConsumeResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(
            requested = units.len(),
            exhausted = body.exhausted.len(),
            "budget consumption answered"
        );
        Ok(body.exhausted)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    spent: HashMap<PrivacyBudgetUnit, u32>,
    charged: HashMap<String, HashSet<PrivacyBudgetUnit>>,
}

/// In-memory ledger with a fixed per-unit capacity.
#[derive(Debug)]
pub struct MemoryLedger {
    capacity: u32,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Units a given job has successfully debited so far.
    pub fn charged_units(&self, job_id: &str) -> BTreeSet<PrivacyBudgetUnit> {
        self.lock()
            .charged
            .get(job_id)
            .map(|units| units.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PrivacyBudgetBridge for MemoryLedger {
    async fn consume(
        &self,
        job_id: &str,
        units: &[PrivacyBudgetUnit],
        _claimed_identity: &str,
    ) -> Result<Vec<PrivacyBudgetUnit>, Error> {
        let mut state = self.lock();

        // Units this job already paid for are not charged again on replay.
        let already: HashSet<PrivacyBudgetUnit> = state
            .charged
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        let fresh: Vec<PrivacyBudgetUnit> = units
            .iter()
            .filter(|unit| !already.contains(unit))
            .cloned()
            .collect();

        let exhausted: Vec<PrivacyBudgetUnit> = fresh
            .iter()
            .filter(|unit| state.spent.get(unit).copied().unwrap_or(0) >= self.capacity)
            .cloned()
            .collect();
        if !exhausted.is_empty() {
            return Ok(exhausted);
        }

        for unit in &fresh {
            *state.spent.entry(unit.clone()).or_insert(0) += 1;
        }
        state
            .charged
            .entry(job_id.to_string())
            .or_default()
            .extend(units.iter().cloned());
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SharedInfo;
    use crate::testutil::shared_info_json;
    use assert_matches::assert_matches;

    fn unit(origin: &str) -> PrivacyBudgetUnit {
        let info = SharedInfo::from_json(&shared_info_json(origin, "1.0", 0)).unwrap();
        PrivacyBudgetUnit::for_report(&info)
    }

    #[tokio::test]
    async fn memory_ledger_debits_and_exhausts() {
        let ledger = MemoryLedger::new(1);
        let units = vec![unit("https://a.example"), unit("https://b.example")];

        let exhausted = ledger.consume("job-1", &units, "https://a.example").await.unwrap();
        assert!(exhausted.is_empty());
        assert_eq!(ledger.charged_units("job-1").len(), 2);

        // A different job over the same units finds them spent.
        let exhausted = ledger.consume("job-2", &units, "https://a.example").await.unwrap();
        assert_eq!(exhausted.len(), 2);
        assert!(ledger.charged_units("job-2").is_empty());
    }

    #[tokio::test]
    async fn memory_ledger_replay_is_idempotent() {
        let ledger = MemoryLedger::new(1);
        let units = vec![unit("https://a.example")];

        assert!(ledger
            .consume("job-1", &units, "https://a.example")
            .await
            .unwrap()
            .is_empty());
        // Retrying the identical call succeeds again without double-spending.
        assert!(ledger
            .consume("job-1", &units, "https://a.example")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(ledger.lock().spent.values().sum::<u32>(), 1);
    }

    #[tokio::test]
    async fn memory_ledger_is_all_or_nothing() {
        let ledger = MemoryLedger::new(1);
        let first = vec![unit("https://a.example")];
        let both = vec![unit("https://a.example"), unit("https://b.example")];

        assert!(ledger
            .consume("job-1", &first, "https://a.example")
            .await
            .unwrap()
            .is_empty());

        // The second batch contains one spent unit, so nothing is debited.
        let exhausted = ledger.consume("job-2", &both, "https://a.example").await.unwrap();
        assert_eq!(exhausted, vec![unit("https://a.example")]);
        assert_eq!(
            ledger.lock().spent.get(&unit("https://b.example")),
            None
        );
    }

    #[tokio::test]
    async fn http_bridge_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let bridge = HttpBudgetBridge::new(server.url()).unwrap();
        let units = vec![unit("https://a.example")];

        let ok = server
            .mock("POST", "/v1/consume")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"exhausted":[]}"#)
            .create_async()
            .await;
        assert!(bridge
            .consume("job-1", &units, "https://a.example")
            .await
            .unwrap()
            .is_empty());
        ok.assert_async().await;

        let unauthenticated = server
            .mock("POST", "/v1/consume")
            .with_status(401)
            .create_async()
            .await;
        assert_matches!(
            bridge.consume("job-1", &units, "https://a.example").await,
            Err(Error::Unauthenticated)
        );
        unauthenticated.assert_async().await;

        let unauthorized = server
            .mock("POST", "/v1/consume")
            .with_status(403)
            .create_async()
            .await;
        assert_matches!(
            bridge.consume("job-1", &units, "https://a.example").await,
            Err(Error::Unauthorized)
        );
        unauthorized.assert_async().await;

        let broken = server
            .mock("POST", "/v1/consume")
            .with_status(500)
            .create_async()
            .await;
        assert_matches!(
            bridge.consume("job-1", &units, "https://a.example").await,
            Err(Error::Transport(_))
        );
        broken.assert_async().await;
    }

    #[tokio::test]
    async fn http_bridge_surfaces_exhausted_units() {
        let mut server = mockito::Server::new_async().await;
        let bridge = HttpBudgetBridge::new(server.url()).unwrap();
        let units = vec![unit("https://a.example")];
        let body = format!(
            r#"{{"exhausted":{}}}"#,
            serde_json::to_string(&units).unwrap()
        );

        let mock = server
            .mock("POST", "/v1/consume")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;
        let exhausted = bridge
            .consume("job-1", &units, "https://a.example")
            .await
            .unwrap();
        assert_eq!(exhausted, units);
        mock.assert_async().await;
    }
}
