use crate::traits::{DecodedMessage, MessageDecoder};
use async_trait::async_trait;
use mail_parser::MessageParser;

/// Decodes raw RFC 5322 messages with mail-parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct MailParserDecoder;

#[async_trait]
impl MessageDecoder for MailParserDecoder {
    async fn decode(&self, raw: &str) -> anyhow::Result<DecodedMessage> {
        let message = MessageParser::default()
            .parse(raw.as_bytes())
            .ok_or_else(|| anyhow::anyhow!("Failed to parse message ({} bytes)", raw.len()))?;

        // HTML-only messages are converted to text by mail-parser
        let text = message.body_text(0).map(|text| text.into_owned());
        let subject = message.subject().map(str::to_string);
        let from = message
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(str::to_string);

        Ok(DecodedMessage {
            text,
            subject,
            from,
        })
    }
}
