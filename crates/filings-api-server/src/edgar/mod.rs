pub mod client;
pub mod types;

pub use client::EdgarClient;
pub use types::FilingDocument;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Download contract the pipeline drives. The production implementation is
/// [`EdgarClient`]; tests substitute their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FilingFetcher: Send + Sync {
    /// Resolve a company identifier (CIK or ticker), list its filings of
    /// the requested form types and download each primary document. An
    /// unresolvable identifier yields an empty list, as does a company
    /// with no matching filings.
    async fn download_filings(
        &self,
        company_identifier: &str,
        filing_types: &[String],
        ct: CancellationToken,
    ) -> Result<Vec<FilingDocument>>;
}
