use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;

/// One downloaded filing, ready for the blob store.
#[derive(Debug, Clone)]
pub struct FilingDocument {
    pub content: Vec<u8>,
    pub file_name: String,
    pub filing_type: String,
    pub accession_number: String,
    pub filing_date: NaiveDate,
    pub company_identifier: String,
}

impl FilingDocument {
    /// Opaque document identifier used everywhere downstream:
    /// `{filingType}_{accessionNumber}`.
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.filing_type, self.accession_number)
    }
}

/// `company_tickers.json` is a map of arbitrary numeric keys to entries.
pub type TickerIndex = HashMap<String, TickerEntry>;

#[derive(Debug, Clone, Deserialize)]
pub struct TickerEntry {
    pub cik_str: u64,
    pub ticker: String,
    #[allow(dead_code)]
    pub title: Option<String>,
}

/// `submissions/CIK{key}.json`, reduced to the part we read.
#[derive(Debug, Deserialize)]
pub struct SubmissionsIndex {
    pub filings: SubmissionFilings,
}

#[derive(Debug, Deserialize)]
pub struct SubmissionFilings {
    pub recent: RecentFilings,
}

/// Parallel arrays; entry i of each column describes the same filing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentFilings {
    pub form: Vec<String>,
    pub accession_number: Vec<String>,
    pub filing_date: Vec<String>,
    pub primary_document: Vec<String>,
}

/// A filing selected from the submissions index, not yet downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct FilingRef {
    pub form: String,
    pub accession_number: String,
    pub filing_date: NaiveDate,
    pub primary_document: String,
}
