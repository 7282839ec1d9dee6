use super::types::{FilingRef, RecentFilings, SubmissionsIndex, TickerIndex};
use super::{FilingDocument, FilingFetcher};
use crate::config::EdgarConfig;
use crate::utils::error::ApiError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// EDGAR archive client. Every outbound request goes through a single
/// permit that enforces the archive's fair-access floor between requests,
/// and carries the contact-bearing user agent from configuration.
pub struct EdgarClient {
    client: Client,
    config: EdgarConfig,
    last_request_at: Mutex<Option<Instant>>,
}

impl EdgarClient {
    pub fn new(config: EdgarConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build EDGAR HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: Mutex::new(None),
        })
    }

    /// Serialize outbound requests and sleep out the remainder of the
    /// minimum inter-request interval before letting one through.
    async fn throttled_get(&self, url: &str) -> Result<reqwest::Response> {
        let min_interval = Duration::from_millis(self.config.min_request_interval_ms);

        {
            let mut last = self.last_request_at.lock().await;
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < min_interval {
                    tokio::time::sleep(min_interval - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("EDGAR request failed: {}", url))?;

        Ok(response)
    }

    /// Resolve a company identifier to a 10-digit CIK. Numeric input is
    /// taken verbatim and zero-padded; anything else is matched
    /// case-insensitively against the ticker index. None when unresolved.
    pub async fn resolve_cik(&self, company_identifier: &str) -> Result<Option<String>> {
        let trimmed = company_identifier.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Some(format!("{:0>10}", trimmed)));
        }

        let url = format!("{}/files/company_tickers.json", self.config.base_url);
        let response = self.throttled_get(&url).await?;
        if !response.status().is_success() {
            anyhow::bail!("Ticker index request failed with {}", response.status());
        }

        let index: TickerIndex = response
            .json()
            .await
            .context("Failed to parse ticker index")?;

        let wanted = trimmed.to_uppercase();
        let cik = index
            .values()
            .find(|entry| entry.ticker.to_uppercase() == wanted)
            .map(|entry| format!("{:010}", entry.cik_str));

        if cik.is_none() {
            warn!("Ticker {} not found in EDGAR index", trimmed);
        }

        Ok(cik)
    }

    /// List recent filings of the requested form types for a CIK.
    pub async fn list_filings(
        &self,
        cik10: &str,
        filing_types: &[String],
    ) -> Result<Vec<FilingRef>> {
        let url = format!("{}/submissions/CIK{}.json", self.config.data_base_url, cik10);
        let response = self.throttled_get(&url).await?;
        if !response.status().is_success() {
            anyhow::bail!("Submissions request failed with {}", response.status());
        }

        let index: SubmissionsIndex = response
            .json()
            .await
            .context("Failed to parse submissions index")?;

        let selected = select_filings(
            &index.filings.recent,
            filing_types,
            self.config.max_filings_to_download,
        );

        debug!("Selected {} filings for CIK {}", selected.len(), cik10);

        Ok(selected)
    }

    fn archive_url(&self, cik10: &str, filing: &FilingRef) -> String {
        let cik_no_zeros = cik10.trim_start_matches('0');
        let accession_no_dashes = filing.accession_number.replace('-', "");
        format!(
            "{}/Archives/edgar/data/{}/{}/{}",
            self.config.base_url, cik_no_zeros, accession_no_dashes, filing.primary_document
        )
    }

    /// Download one filing's primary document. Non-success status is a
    /// skip, not a failure.
    async fn download_one(
        &self,
        cik10: &str,
        company_identifier: &str,
        filing: &FilingRef,
    ) -> Result<Option<FilingDocument>> {
        let url = self.archive_url(cik10, filing);
        let response = self.throttled_get(&url).await?;

        if !response.status().is_success() {
            warn!(
                "Skipping filing {} ({}): HTTP {}",
                filing.accession_number,
                filing.form,
                response.status()
            );
            return Ok(None);
        }

        let content = response.bytes().await?.to_vec();
        let accession_no_dashes = filing.accession_number.replace('-', "");

        Ok(Some(FilingDocument {
            content,
            file_name: format!("{}_{}", accession_no_dashes, filing.primary_document),
            filing_type: filing.form.clone(),
            accession_number: filing.accession_number.clone(),
            filing_date: filing.filing_date,
            company_identifier: company_identifier.to_string(),
        }))
    }
}

#[async_trait]
impl FilingFetcher for EdgarClient {
    async fn download_filings(
        &self,
        company_identifier: &str,
        filing_types: &[String],
        ct: CancellationToken,
    ) -> Result<Vec<FilingDocument>> {
        ensure_not_cancelled(&ct)?;

        let Some(cik10) = self.resolve_cik(company_identifier).await? else {
            return Ok(Vec::new());
        };

        ensure_not_cancelled(&ct)?;
        let filings = self.list_filings(&cik10, filing_types).await?;

        let mut documents = Vec::with_capacity(filings.len());
        for filing in &filings {
            ensure_not_cancelled(&ct)?;

            match self.download_one(&cik10, company_identifier, filing).await {
                Ok(Some(doc)) => documents.push(doc),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Download failed for filing {} ({}): {}",
                        filing.accession_number, filing.form, e
                    );
                }
            }
        }

        info!(
            "Downloaded {}/{} filings for {}",
            documents.len(),
            filings.len(),
            company_identifier
        );

        Ok(documents)
    }
}

fn ensure_not_cancelled(ct: &CancellationToken) -> Result<()> {
    if ct.is_cancelled() {
        return Err(ApiError::Cancelled.into());
    }
    Ok(())
}

/// Walk the parallel arrays in positional lockstep, keep entries whose form
/// matches case-insensitively, drop unparseable dates, honor the cap
/// (<= 0 means no cap).
pub fn select_filings(
    recent: &RecentFilings,
    filing_types: &[String],
    max_filings: i64,
) -> Vec<FilingRef> {
    let wanted: Vec<String> = filing_types.iter().map(|t| t.to_uppercase()).collect();
    let count = recent
        .form
        .len()
        .min(recent.accession_number.len())
        .min(recent.filing_date.len())
        .min(recent.primary_document.len());

    let mut selected = Vec::new();
    for i in 0..count {
        if max_filings > 0 && selected.len() as i64 >= max_filings {
            break;
        }

        if !wanted.contains(&recent.form[i].to_uppercase()) {
            continue;
        }

        let Ok(filing_date) = NaiveDate::parse_from_str(&recent.filing_date[i], "%Y-%m-%d") else {
            warn!(
                "Dropping filing {} with unparseable date {:?}",
                recent.accession_number[i], recent.filing_date[i]
            );
            continue;
        };

        selected.push(FilingRef {
            form: recent.form[i].clone(),
            accession_number: recent.accession_number[i].clone(),
            filing_date,
            primary_document: recent.primary_document[i].clone(),
        });
    }

    selected
}
