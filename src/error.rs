use thiserror::Error;

/// Pipeline failures callers branch on. Infra errors travel as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("there is no scraper for retailer {0}")]
    UnknownRetailer(i64),

    #[error("scrape of '{artist}' at {retailer} timed out after {secs}s")]
    ScrapeTimeout {
        retailer: String,
        artist: String,
        secs: u64,
    },

    #[error("no reports for artist {artist_id} in batch {batch_id}")]
    NoReportsForArtist { batch_id: i64, artist_id: i64 },

    #[error("batch {0} was not incremented. does it exist?")]
    BatchNotFound(i64),

    #[error("batch {0} already has all required searches completed")]
    BatchAlreadyComplete(i64),

    #[error("report {0} does not exist")]
    ReportNotFound(i64),

    #[error("notification to {recipient} failed: {reason}")]
    Notify { recipient: String, reason: String },
}
