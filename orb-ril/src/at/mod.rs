//! AT command channel: command/response types, the [`Channel`] seam and the
//! [`At`] handle the engines talk to.

use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

pub mod channel;
pub mod codec;
pub mod tokenizer;

pub use tokenizer::{ParseError, Tokenizer};

const HANDSHAKE_ATTEMPTS: usize = 8;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(250);

/// How the channel decides which lines belong to the pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Only a final response is expected.
    NoResult,
    /// One intermediate line starting with a digit.
    Numeric,
    /// One intermediate line starting with the prefix.
    SingleLine(String),
    /// Any number of intermediate lines starting with the prefix.
    MultiLine(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtCommand {
    pub text: String,
    pub kind: ResponseKind,
    /// Sent after the `> ` prompt, terminated with ctrl-Z.
    pub pdu: Option<String>,
    /// Overrides the channel timeout. Expiry does not close the channel.
    pub timeout: Option<Duration>,
}

impl AtCommand {
    pub fn new(text: impl Into<String>, kind: ResponseKind) -> Self {
        Self {
            text: text.into(),
            kind,
            pdu: None,
            timeout: None,
        }
    }

    pub fn with_pdu(self, pdu: impl Into<String>) -> Self {
        Self {
            pdu: Some(pdu.into()),
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AtResponse {
    pub success: bool,
    pub final_response: String,
    pub intermediates: Vec<String>,
}

/// Error code carried by a final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cme {
    Success,
    /// Failed without a `+CME ERROR:` code, e.g. plain `ERROR`.
    NonCme,
    Code(i32),
}

impl AtResponse {
    pub fn ok<S: AsRef<str>>(intermediates: &[S]) -> Self {
        Self {
            success: true,
            final_response: "OK".to_owned(),
            intermediates: intermediates
                .iter()
                .map(|s| s.as_ref().to_owned())
                .collect(),
        }
    }

    pub fn error(final_response: impl Into<String>) -> Self {
        Self {
            success: false,
            final_response: final_response.into(),
            intermediates: Vec::new(),
        }
    }

    pub fn cme(&self) -> Cme {
        if self.success {
            return Cme::Success;
        }
        if !self.final_response.starts_with("+CME ERROR:") {
            return Cme::NonCme;
        }

        Tokenizer::start(&self.final_response)
            .and_then(|mut tok| tok.next_int())
            .map_or(Cme::NonCme, Cme::Code)
    }

    /// First intermediate line, which single-line and numeric commands always have.
    pub fn line(&self) -> Result<&str, ParseError> {
        self.intermediates
            .first()
            .map(String::as_str)
            .ok_or_else(|| ParseError::Unexpected("missing intermediate line".into()))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("at channel is closed")]
    Closed,
    #[error("timed out waiting for response to {0:?}")]
    Timeout(String),
    #[error("successful command returned no intermediate response")]
    InvalidResponse,
    #[error("at channel io: {0}")]
    Io(#[from] std::io::Error),
}

/// One command in flight at a time. Implementations never retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, command: AtCommand) -> Result<AtResponse, ChannelError>;
}

/// Stand-in until the first connection is attached.
pub struct Disconnected;

#[async_trait]
impl Channel for Disconnected {
    async fn send(&self, _command: AtCommand) -> Result<AtResponse, ChannelError> {
        Err(ChannelError::Closed)
    }
}

/// Cheap to clone handle with one helper per response kind.
#[derive(Clone)]
pub struct At {
    channel: Arc<dyn Channel>,
}

impl fmt::Debug for At {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("At").finish_non_exhaustive()
    }
}

impl At {
    pub fn new(channel: impl Channel + 'static) -> Self {
        Self {
            channel: Arc::new(channel),
        }
    }

    pub fn disconnected() -> Self {
        Self::new(Disconnected)
    }

    pub async fn send(&self, command: AtCommand) -> Result<AtResponse, ChannelError> {
        debug!(command = %command.text, "AT>");
        let response = self.channel.send(command).await?;
        debug!(
            success = response.success,
            final_response = %response.final_response,
            lines = response.intermediates.len(),
            "AT<"
        );

        Ok(response)
    }

    pub async fn command(&self, text: impl Into<String>) -> Result<AtResponse, ChannelError> {
        self.send(AtCommand::new(text, ResponseKind::NoResult)).await
    }

    pub async fn numeric(&self, text: impl Into<String>) -> Result<AtResponse, ChannelError> {
        self.send(AtCommand::new(text, ResponseKind::Numeric)).await
    }

    pub async fn singleline(
        &self,
        text: impl Into<String>,
        prefix: &str,
    ) -> Result<AtResponse, ChannelError> {
        self.send(AtCommand::new(
            text,
            ResponseKind::SingleLine(prefix.to_owned()),
        ))
        .await
    }

    pub async fn multiline(
        &self,
        text: impl Into<String>,
        prefix: &str,
    ) -> Result<AtResponse, ChannelError> {
        self.send(AtCommand::new(
            text,
            ResponseKind::MultiLine(prefix.to_owned()),
        ))
        .await
    }

    pub async fn sms(
        &self,
        text: impl Into<String>,
        pdu: impl Into<String>,
        prefix: &str,
    ) -> Result<AtResponse, ChannelError> {
        self.send(
            AtCommand::new(text, ResponseKind::SingleLine(prefix.to_owned())).with_pdu(pdu),
        )
        .await
    }

    /// Wakes the modem up and turns echo off. Some modems drop the first commands
    /// after the port opens.
    pub async fn handshake(&self) -> Result<(), ChannelError> {
        let mut last = ChannelError::Timeout("ATE0Q0V1".to_owned());
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            let command = AtCommand::new("ATE0Q0V1", ResponseKind::NoResult)
                .with_timeout(HANDSHAKE_TIMEOUT);
            match self.send(command).await {
                Ok(response) if response.success => return Ok(()),
                Ok(response) => {
                    debug!(attempt, "handshake rejected: {}", response.final_response)
                }
                Err(ChannelError::Closed) => return Err(ChannelError::Closed),
                Err(e) => {
                    debug!(attempt, "handshake failed: {e}");
                    last = e;
                }
            }
        }
        warn!("modem did not answer handshake after {HANDSHAKE_ATTEMPTS} attempts");

        Err(last)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use mockall::Sequence;

    pub(crate) enum Reply {
        Response(AtResponse),
        Closed,
    }

    pub(crate) fn ok(lines: &[&str]) -> Reply {
        Reply::Response(AtResponse::ok(lines))
    }

    pub(crate) fn error(final_response: &str) -> Reply {
        Reply::Response(AtResponse::error(final_response))
    }

    pub(crate) fn closed() -> Reply {
        Reply::Closed
    }

    /// A channel that expects exactly these commands, in this order.
    pub(crate) fn scripted(steps: Vec<(&str, Reply)>) -> At {
        let mut mock = MockChannel::new();
        let mut seq = Sequence::new();
        for (text, reply) in steps {
            let text = text.to_owned();
            mock.expect_send()
                .times(1)
                .in_sequence(&mut seq)
                .withf(move |command| command.text == text)
                .return_once(move |_| match reply {
                    Reply::Response(response) => Ok(response),
                    Reply::Closed => Err(ChannelError::Closed),
                });
        }

        At::new(mock)
    }

    /// A channel that must not be used.
    pub(crate) fn silent() -> At {
        let mut mock = MockChannel::new();
        mock.expect_send().never();

        At::new(mock)
    }
}
