//! Fetches the plain-text body of the most recent message from a given
//! sender over IMAP.

pub mod config;
pub mod decoder;
pub mod fetcher;
pub mod imap_transport;
pub mod traits;

pub use config::{ImapConfig, RecencyStrategy};
pub use fetcher::{EmailFetcher, NO_EMAILS_FOUND, fetch_most_recent_email};
