use crate::config::ImapConfig;
use crate::traits::{ChunkStream, MailConnector, MailSession};
use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::io::{AsyncRead, AsyncWrite};
use futures::{StreamExt, TryStreamExt};
use log::debug;
use std::fmt::Debug;
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;

/// Opens IMAP sessions with async-imap, over TLS unless `use_tls` is off.
pub struct ImapConnector;

impl ImapConnector {
    async fn login<T>(config: &ImapConfig, stream: T) -> anyhow::Result<Box<dyn MailSession>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
    {
        let client = async_imap::Client::new(stream);

        let session = client
            .login(&config.username, &config.password)
            .await
            .map_err(|e| anyhow::anyhow!("Login failed: {:?}", e.0))?;

        debug!("Logged in to {} as {}", config.host, config.username);
        Ok(Box::new(ImapMailSession { session }))
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, config: &ImapConfig) -> anyhow::Result<Box<dyn MailSession>> {
        let addr = format!("{}:{}", config.host, config.port);
        let tcp_stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", addr, e))?;

        if !config.use_tls {
            return Self::login(config, tcp_stream.compat()).await;
        }

        let tls = TlsConnector::new().danger_accept_invalid_certs(config.accept_invalid_certs);
        let tls_stream = tls
            .connect(&config.host, tcp_stream.compat())
            .await
            .map_err(|e| anyhow::anyhow!("TLS connection failed: {}", e))?;

        Self::login(config, tls_stream).await
    }
}

pub struct ImapMailSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    session: Session<T>,
}

#[async_trait]
impl<T> MailSession for ImapMailSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    async fn open_mailbox(&mut self, name: &str, read_only: bool) -> anyhow::Result<()> {
        let opened = if read_only {
            self.session.examine(name).await
        } else {
            self.session.select(name).await
        };

        let mailbox =
            opened.map_err(|e| anyhow::anyhow!("Failed to open mailbox {}: {}", name, e))?;
        debug!("Opened {} ({} messages)", name, mailbox.exists);
        Ok(())
    }

    async fn search_from(&mut self, sender: &str) -> anyhow::Result<Vec<u32>> {
        // Only ask for capabilities when the sender can't be sent quoted
        let non_sync_literals = if sender.is_ascii() || sender.contains(['\r', '\n', '\0']) {
            false
        } else {
            let capabilities = self
                .session
                .capabilities()
                .await
                .map_err(|e| anyhow::anyhow!("Search failed: {}", e))?;
            capabilities.has_str("LITERAL+") || capabilities.has_str("LITERAL-")
        };

        let query = from_query(sender, non_sync_literals)?;
        let uids = self
            .session
            .uid_search(&query)
            .await
            .map_err(|e| anyhow::anyhow!("Search failed: {}", e))?;

        // The server answers with an unordered set
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn internal_dates(
        &mut self,
        ids: &[u32],
    ) -> anyhow::Result<Vec<(u32, Option<DateTime<FixedOffset>>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_set = uid_set(ids);
        let fetches: Vec<_> = self
            .session
            .uid_fetch(&uid_set, "(UID INTERNALDATE)")
            .await
            .map_err(|e| anyhow::anyhow!("Fetch failed for messages {}: {}", uid_set, e))?
            .try_collect()
            .await
            .map_err(|e| anyhow::anyhow!("Error reading fetch result: {}", e))?;

        Ok(fetches
            .iter()
            .filter_map(|fetch| fetch.uid.map(|uid| (uid, fetch.internal_date())))
            .collect())
    }

    async fn fetch_body<'a>(&'a mut self, id: u32) -> anyhow::Result<ChunkStream<'a>> {
        // PEEK keeps the \Seen flag untouched
        let fetch_stream = self
            .session
            .uid_fetch(id.to_string(), "BODY.PEEK[]")
            .await
            .map_err(|e| anyhow::anyhow!("Fetch failed for message {}: {}", id, e))?;

        let chunks = fetch_stream.filter_map(|item| async move {
            match item {
                Ok(fetch) => fetch.body().map(|body| Ok(body.to_vec())),
                Err(e) => Some(Err(anyhow::anyhow!("Error reading fetch result: {}", e))),
            }
        });

        Ok(chunks.boxed())
    }

    async fn logout(&mut self) -> anyhow::Result<()> {
        self.session
            .logout()
            .await
            .map_err(|e| anyhow::anyhow!("Logout failed: {}", e))
    }
}

/// Builds the search criteria for `sender`. ASCII senders go out as a quoted
/// string; anything else needs `CHARSET UTF-8` and a non-synchronizing
/// literal, which only works when the server allows it.
fn from_query(sender: &str, non_sync_literals: bool) -> anyhow::Result<String> {
    if sender.contains(['\r', '\n', '\0']) {
        return Err(anyhow::anyhow!(
            "Search failed: sender must not contain CR, LF or NUL"
        ));
    }

    if !sender.is_ascii() {
        if !non_sync_literals {
            return Err(anyhow::anyhow!(
                "Search failed: non-ASCII sender {} needs LITERAL+ support on the server",
                sender
            ));
        }
        return Ok(format!(
            "CHARSET UTF-8 FROM {{{}+}}\r\n{}",
            sender.len(),
            sender
        ));
    }

    let mut quoted = String::with_capacity(sender.len() + 2);
    quoted.push('"');
    for c in sender.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');

    Ok(format!("FROM {}", quoted))
}

/// Collapses sorted UIDs into a sequence set like `1:3,7,9:10`.
fn uid_set(ids: &[u32]) -> String {
    let mut ranges: Vec<String> = Vec::new();
    let mut iter = ids.iter().copied();
    let Some(first) = iter.next() else {
        return String::new();
    };

    let (mut start, mut end) = (first, first);
    for id in iter {
        if end.checked_add(1) == Some(id) {
            end = id;
            continue;
        }
        ranges.push(range(start, end));
        (start, end) = (id, id);
    }
    ranges.push(range(start, end));

    ranges.join(",")
}

fn range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}
