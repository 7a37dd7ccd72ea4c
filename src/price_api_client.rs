use crate::data_context::PriceSeriesProvider;
use crate::models::PriceBar;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 2048;

pub fn build_blocking_client(timeout: Option<Duration>) -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("failed to build HTTP client")
}

/// Remote price service speaking JSON over HTTP.
///
/// Every `fetch` builds its own client, so a worker's session lives exactly as
/// long as the call that needed it.
#[derive(Debug, Clone)]
pub struct PriceApiClient {
    base_url: String,
    timeout: Duration,
}

impl PriceApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("price API URL must not be empty"));
        }
        Ok(Self { base_url, timeout })
    }

    fn prices_url(&self) -> String {
        format!("{}/prices", self.base_url)
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        retry_with_backoff(|| {
            let client = build_blocking_client(Some(self.timeout))?;
            let response = client.get(url).query(query).send()?;
            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .with_context(|| format!("invalid response body from {}", url));
            }
            let body = response.text().unwrap_or_default();
            Err(anyhow!(
                "price API request failed: status={} url={} body={}",
                status,
                url,
                truncate_for_log(&body, MAX_ERROR_BODY_CHARS)
            ))
        })
    }
}

impl PriceSeriesProvider for PriceApiClient {
    fn fetch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        lookback: usize,
    ) -> Result<HashMap<String, Vec<PriceBar>>> {
        let query = [
            ("symbols", symbols.join(",")),
            ("start", start.format("%Y-%m-%d").to_string()),
            ("end", end.format("%Y-%m-%d").to_string()),
            ("lookback", lookback.to_string()),
        ];
        let mut fetched: HashMap<String, Vec<PriceBar>> =
            self.get_json(&self.prices_url(), &query)?;

        for series in fetched.values_mut() {
            series.sort_by_key(|bar| bar.date);
        }
        for symbol in symbols {
            fetched.entry(symbol.clone()).or_default();
        }
        Ok(fetched)
    }

    fn first_dates(&self, symbols: &[String]) -> Result<HashMap<String, NaiveDate>> {
        let url = format!("{}/first-dates", self.prices_url());
        self.get_json(&url, &[("symbols", symbols.join(","))])
    }
}

pub(crate) fn retry_with_backoff<F, T>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    const MAX_RETRIES: usize = 3;
    const BASE_DELAY_MS: u64 = 1000;
    const MAX_DELAY_MS: u64 = 10000;

    let mut last_error = None;

    for attempt in 0..=MAX_RETRIES {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = Some(e);
                if attempt < MAX_RETRIES {
                    let delay_ms = (BASE_DELAY_MS * 2_u64.pow(attempt as u32)).min(MAX_DELAY_MS);
                    let jitter_range = (delay_ms as f64 * 0.25) as u64;
                    let jitter = fastrand::u64(0..=jitter_range * 2);
                    let final_delay = delay_ms.saturating_sub(jitter_range).saturating_add(jitter);
                    log::debug!(
                        "Attempt {} failed, retrying in {}ms",
                        attempt + 1,
                        final_delay
                    );
                    thread::sleep(Duration::from_millis(final_delay));
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("retry_with_backoff exhausted attempts")))
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
