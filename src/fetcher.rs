use crate::config::{ImapConfig, RecencyStrategy};
use crate::decoder::MailParserDecoder;
use crate::imap_transport::ImapConnector;
use crate::traits::{MailConnector, MailSession, MessageDecoder};
use chrono::{DateTime, FixedOffset};
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

#[cfg(test)]
#[path = "./fetcher_tests.rs"]
mod fetcher_tests;

/// Returned instead of a body when the search matches nothing.
pub const NO_EMAILS_FOUND: &str = "No emails found from the specified sender.";

/// Fetches the plain-text body of the most recent message from `sender`,
/// using async-imap for the transport and mail-parser for decoding.
pub async fn fetch_most_recent_email(config: &ImapConfig, sender: &str) -> anyhow::Result<String> {
    EmailFetcher::new().fetch_most_recent(config, sender).await
}

/// One-shot completion cell. The first outcome wins, later ones are dropped.
#[derive(Debug)]
pub struct Settlement<T> {
    outcome: Option<anyhow::Result<T>>,
}

impl<T> Default for Settlement<T> {
    fn default() -> Self {
        Self { outcome: None }
    }
}

impl<T> Settlement<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if an outcome was already recorded.
    pub fn settle(&mut self, outcome: anyhow::Result<T>) -> bool {
        if self.outcome.is_some() {
            if let Err(e) = &outcome {
                debug!("Ignoring error after settlement: {}", e);
            } else {
                debug!("Ignoring result after settlement");
            }
            return false;
        }

        self.outcome = Some(outcome);
        true
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn into_outcome(self) -> Option<anyhow::Result<T>> {
        self.outcome
    }
}

/// What a message body stream can report.
#[derive(Debug)]
pub enum FetchEvent {
    Data(Vec<u8>),
    Error(anyhow::Error),
    End,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FetchStep {
    Continue,
    /// The stream ended cleanly; the accumulated message is ready for decoding
    Decode(String),
    Done,
}

/// Accumulates body chunks in arrival order until the stream finishes.
#[derive(Debug, Default)]
pub struct FetchCollector {
    raw: Vec<u8>,
    finished: bool,
}

impl FetchCollector {
    pub fn handle(&mut self, event: FetchEvent, outcome: &mut Settlement<String>) -> FetchStep {
        if self.finished {
            return FetchStep::Done;
        }

        match event {
            FetchEvent::Data(chunk) => {
                self.raw.extend_from_slice(&chunk);
                FetchStep::Continue
            }
            FetchEvent::Error(e) => {
                self.finished = true;
                outcome.settle(Err(e));
                FetchStep::Done
            }
            FetchEvent::End => {
                self.finished = true;
                if outcome.is_settled() {
                    return FetchStep::Done;
                }
                // Converted once so multi-byte sequences split across chunks survive
                let raw = std::mem::take(&mut self.raw);
                FetchStep::Decode(String::from_utf8_lossy(&raw).into_owned())
            }
        }
    }
}

pub struct EmailFetcher {
    connector: Arc<dyn MailConnector>,
    decoder: Arc<dyn MessageDecoder>,
}

impl Default for EmailFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailFetcher {
    pub fn new() -> Self {
        Self {
            connector: Arc::new(ImapConnector),
            decoder: Arc::new(MailParserDecoder),
        }
    }

    pub fn new_with(connector: Arc<dyn MailConnector>, decoder: Arc<dyn MessageDecoder>) -> Self {
        Self { connector, decoder }
    }

    pub async fn fetch_most_recent(
        &self,
        config: &ImapConfig,
        sender: &str,
    ) -> anyhow::Result<String> {
        info!(
            "Connecting to {}:{} ({})",
            config.host, config.port, config.username
        );

        let mut session = self.connector.connect(config).await.inspect_err(|e| {
            error!("Connection to {} failed: {}", config.host, e);
        })?;

        let mut outcome = Settlement::new();
        self.run(session.as_mut(), config, sender, &mut outcome).await;

        // Every path that got a session closes it here, once
        if let Err(e) = session.logout().await {
            warn!("[{}] {}", config.username, e);
        }
        info!("Connection ended.");

        outcome
            .into_outcome()
            .unwrap_or_else(|| Err(anyhow::anyhow!("Fetch finished without an outcome")))
    }

    async fn run(
        &self,
        session: &mut dyn MailSession,
        config: &ImapConfig,
        sender: &str,
        outcome: &mut Settlement<String>,
    ) {
        if let Err(e) = session.open_mailbox(&config.mailbox, config.read_only).await {
            error!("[{}] {}", config.username, e);
            outcome.settle(Err(e));
            return;
        }

        let ids = match session.search_from(sender).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("[{}] {}", config.username, e);
                outcome.settle(Err(e));
                return;
            }
        };

        debug!("[{}] {} messages from {}", config.username, ids.len(), sender);

        let target = match pick_most_recent(session, &ids, config.recency).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                info!("[{}] No messages from {}", config.username, sender);
                outcome.settle(Ok(NO_EMAILS_FOUND.to_string()));
                return;
            }
            Err(e) => {
                error!("[{}] {}", config.username, e);
                outcome.settle(Err(e));
                return;
            }
        };

        info!("[{}] Fetching message {}", config.username, target);
        self.fetch_and_decode(session, target, outcome).await;
    }

    async fn fetch_and_decode(
        &self,
        session: &mut dyn MailSession,
        id: u32,
        outcome: &mut Settlement<String>,
    ) {
        let mut chunks = match session.fetch_body(id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                error!("{}", e);
                outcome.settle(Err(e));
                return;
            }
        };

        let mut collector = FetchCollector::default();
        loop {
            let event = match chunks.next().await {
                Some(Ok(chunk)) => FetchEvent::Data(chunk),
                Some(Err(e)) => {
                    error!("{}", e);
                    FetchEvent::Error(e)
                }
                None => FetchEvent::End,
            };

            match collector.handle(event, outcome) {
                FetchStep::Continue => continue,
                FetchStep::Done => break,
                FetchStep::Decode(raw) => {
                    debug!("Decoding message {} ({} bytes)", id, raw.len());
                    let decoded = self
                        .decoder
                        .decode(&raw)
                        .await
                        .inspect_err(|e| error!("Failed to decode message {}: {}", id, e))
                        .map(|message| message.text.unwrap_or_default());
                    outcome.settle(decoded);
                    break;
                }
            }
        }
    }
}

async fn pick_most_recent(
    session: &mut dyn MailSession,
    ids: &[u32],
    recency: RecencyStrategy,
) -> anyhow::Result<Option<u32>> {
    let Some(&last) = ids.last() else {
        return Ok(None);
    };

    match recency {
        RecencyStrategy::LastSearchResult => Ok(Some(last)),
        RecencyStrategy::InternalDate => {
            let dates = session.internal_dates(ids).await?;
            Ok(Some(latest_by_date(ids, &dates).unwrap_or(last)))
        }
    }
}

/// Latest dated message among `ids`, ties going to the higher identifier.
/// Undated messages only win when nothing is dated.
fn latest_by_date(ids: &[u32], dates: &[(u32, Option<DateTime<FixedOffset>>)]) -> Option<u32> {
    let wanted: HashSet<u32> = ids.iter().copied().collect();
    dates
        .iter()
        .filter(|(id, _)| wanted.contains(id))
        .max_by_key(|(id, date)| (*date, *id))
        .map(|(id, _)| *id)
}
