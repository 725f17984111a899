use crate::config::ImapConfig;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::stream::BoxStream;

/// A stream of raw message chunks. An `Err` item is a stream failure, the end
/// of the stream means the message has been fully delivered.
pub type ChunkStream<'a> = BoxStream<'a, anyhow::Result<Vec<u8>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMessage {
    pub text: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
}

// Abstract the connection setup so we can mock it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Connects and authenticates; an error here is a connection-level error
    async fn connect(&self, config: &ImapConfig) -> anyhow::Result<Box<dyn MailSession>>;
}

#[async_trait]
pub trait MailSession: Send {
    async fn open_mailbox(&mut self, name: &str, read_only: bool) -> anyhow::Result<()>;

    /// Identifiers of messages whose From field matches `sender`
    async fn search_from(&mut self, sender: &str) -> anyhow::Result<Vec<u32>>;

    async fn internal_dates(
        &mut self,
        ids: &[u32],
    ) -> anyhow::Result<Vec<(u32, Option<DateTime<FixedOffset>>)>>;

    async fn fetch_body<'a>(&'a mut self, id: u32) -> anyhow::Result<ChunkStream<'a>>;

    async fn logout(&mut self) -> anyhow::Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageDecoder: Send + Sync {
    async fn decode(&self, raw: &str) -> anyhow::Result<DecodedMessage>;
}
