use super::{
    AtCommand, AtResponse, Channel, ChannelError, ResponseKind, codec::AtLineCodec,
};
use async_trait::async_trait;
use futures::StreamExt as _;
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _},
    sync::{self, oneshot},
    task::JoinHandle,
    time,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, info, warn};

const FINAL_SUCCESS: [&str; 2] = ["OK", "CONNECT"];
const FINAL_ERROR: [&str; 6] = [
    "ERROR",
    "+CMS ERROR:",
    "+CME ERROR:",
    "NO CARRIER",
    "NO ANSWER",
    "NO DIALTONE",
];
/// Unsolicited lines whose PDU arrives on the following line.
const SMS_UNSOLICITED: [&str; 3] = ["+CMT:", "+CDS:", "+CBM:"];
const SMS_PROMPT: &str = "> ";
const CTRL_Z: char = '\u{1a}';

/// What the reader hands to the unsolicited handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Unsolicited { line: String, pdu: Option<String> },
    /// The stream ended, failed, or a command timed out.
    Closed,
}

struct Pending {
    kind: ResponseKind,
    intermediates: Vec<String>,
    reply: oneshot::Sender<AtResponse>,
    prompt: Option<oneshot::Sender<()>>,
}

impl Pending {
    fn accepts(&self, line: &str) -> bool {
        match &self.kind {
            ResponseKind::NoResult => false,
            ResponseKind::Numeric => {
                self.intermediates.is_empty()
                    && line.starts_with(|c: char| c.is_ascii_digit())
            }
            ResponseKind::SingleLine(prefix) => {
                self.intermediates.is_empty() && line.starts_with(prefix.as_str())
            }
            ResponseKind::MultiLine(prefix) => line.starts_with(prefix.as_str()),
        }
    }

    fn complete(self, success: bool, final_response: String) {
        let _ = self.reply.send(AtResponse {
            success,
            final_response,
            intermediates: self.intermediates,
        });
    }
}

struct Shared {
    pending: Mutex<Option<Pending>>,
    closed: AtomicBool,
    events: flume::Sender<ReaderEvent>,
    cancel: CancellationToken,
}

impl Shared {
    fn set_pending(&self, pending: Option<Pending>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = pending;
    }

    /// Hands `line` to the pending command, or back to the caller when it is
    /// unsolicited.
    fn offer(&self, line: String) -> Option<String> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(command) = pending.as_mut() else {
            return Some(line);
        };

        if let Some(success) = final_result(&line) {
            if let Some(command) = pending.take() {
                command.complete(success, line);
            }
            return None;
        }

        if line == SMS_PROMPT
            && let Some(prompt) = command.prompt.take()
        {
            let _ = prompt.send(());
            return None;
        }

        if command.accepts(&line) {
            command.intermediates.push(line);
            return None;
        }

        Some(line)
    }

    fn unsolicited(&self, line: String, pdu: Option<String>) {
        let _ = self.events.send(ReaderEvent::Unsolicited { line, pdu });
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        // Dropping the reply sender fails the waiting command.
        self.set_pending(None);
        let _ = self.events.send(ReaderEvent::Closed);
    }
}

fn final_result(line: &str) -> Option<bool> {
    if FINAL_SUCCESS.iter().any(|p| line.starts_with(p)) {
        Some(true)
    } else if FINAL_ERROR.iter().any(|p| line.starts_with(p)) {
        Some(false)
    } else {
        None
    }
}

struct Reader {
    shared: Arc<Shared>,
    sms_header: Option<String>,
}

impl Reader {
    async fn run<R>(mut self, mut lines: FramedRead<R, AtLineCodec>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => self.process(line),
                Some(Err(e)) => {
                    warn!("at channel read failed: {e}");
                    break;
                }
                None => {
                    info!("at channel reached end of stream");
                    break;
                }
            }
        }

        self.shared.close();
    }

    fn process(&mut self, line: String) {
        debug!(%line, "AT<<");

        if let Some(header) = self.sms_header.take() {
            self.shared.unsolicited(header, Some(line));
            return;
        }
        if SMS_UNSOLICITED.iter().any(|p| line.starts_with(p)) {
            self.sms_header = Some(line);
            return;
        }

        if let Some(line) = self.shared.offer(line) {
            self.shared.unsolicited(line, None);
        }
    }
}

/// [`Channel`] over any byte stream: a serial port, a TCP socket or a unix socket.
pub struct AtChannel {
    writer: sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl AtChannel {
    /// Spawns the reader task. Unsolicited lines and the close event are sent to
    /// `events`. A command that exceeds `timeout` closes the channel.
    pub fn open<T>(
        io: T,
        events: flume::Sender<ReaderEvent>,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
        });

        let reader = Reader {
            shared: Arc::clone(&shared),
            sms_header: None,
        };
        let handle = tokio::spawn(reader.run(FramedRead::new(read, AtLineCodec)));

        let channel = Self {
            writer: sync::Mutex::new(Box::new(write)),
            shared,
            timeout,
        };

        (channel, handle)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for AtChannel {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[async_trait]
impl Channel for AtChannel {
    async fn send(&self, command: AtCommand) -> Result<AtResponse, ChannelError> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let (reply, response) = oneshot::channel();
        let (prompt, prompted) = match command.pdu {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        self.shared.set_pending(Some(Pending {
            kind: command.kind.clone(),
            intermediates: Vec::new(),
            reply,
            prompt,
        }));

        let exchange = async {
            writer.write_all(format!("{}\r", command.text).as_bytes()).await?;
            writer.flush().await?;
            if let (Some(pdu), Some(prompted)) = (&command.pdu, prompted) {
                prompted.await.map_err(|_| ChannelError::Closed)?;
                writer.write_all(format!("{pdu}{CTRL_Z}").as_bytes()).await?;
                writer.flush().await?;
            }

            response.await.map_err(|_| ChannelError::Closed)
        };

        let deadline = command.timeout.unwrap_or(self.timeout);
        let result = time::timeout(deadline, exchange)
            .await
            .unwrap_or_else(|_| Err(ChannelError::Timeout(command.text.clone())));
        self.shared.set_pending(None);

        if matches!(result, Err(ChannelError::Timeout(_))) && command.timeout.is_none() {
            warn!(command = %command.text, "at command timed out, closing channel");
            self.shared.close();
        }

        let response = result?;
        let needs_line = matches!(
            command.kind,
            ResponseKind::Numeric | ResponseKind::SingleLine(_)
        );
        if needs_line && response.success && response.intermediates.is_empty() {
            return Err(ChannelError::InvalidResponse);
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, DuplexStream, ReadHalf, WriteHalf};

    struct Modem {
        rd: ReadHalf<DuplexStream>,
        wr: WriteHalf<DuplexStream>,
    }

    impl Modem {
        async fn expect(&mut self, command: &str) {
            let mut buf = vec![0; command.len()];
            self.rd.read_exact(&mut buf).await.unwrap();
            assert_eq!(String::from_utf8_lossy(&buf), command);
        }

        async fn reply(&mut self, output: &str) {
            self.wr.write_all(output.as_bytes()).await.unwrap();
        }
    }

    fn setup(timeout: Duration) -> (AtChannel, Modem, flume::Receiver<ReaderEvent>) {
        let (modem, host) = tokio::io::duplex(4096);
        let (events_tx, events_rx) = flume::unbounded();
        let (channel, _reader) = AtChannel::open(host, events_tx, timeout);
        let (rd, wr) = tokio::io::split(modem);

        (channel, Modem { rd, wr }, events_rx)
    }

    #[tokio::test]
    async fn it_collects_singleline_response_and_forwards_unsolicited() {
        // Arrange
        let (channel, mut modem, events) = setup(Duration::from_secs(5));
        let modem_task = tokio::spawn(async move {
            modem.expect("AT+CSQ\r").await;
            modem.reply("\r\n+CREG: 1\r\n+CSQ: 20,99\r\nOK\r\n").await;
            modem
        });

        // Act
        let response = channel
            .send(AtCommand::new(
                "AT+CSQ",
                ResponseKind::SingleLine("+CSQ:".into()),
            ))
            .await
            .unwrap();

        // Assert
        assert_eq!(response, AtResponse::ok(&["+CSQ: 20,99"]));
        assert_eq!(
            events.recv_async().await.unwrap(),
            ReaderEvent::Unsolicited {
                line: "+CREG: 1".into(),
                pdu: None
            }
        );
        let _modem = modem_task.await.unwrap();
    }

    #[tokio::test]
    async fn it_reports_cme_errors_as_unsuccessful_responses() {
        let (channel, mut modem, _events) = setup(Duration::from_secs(5));
        let modem_task = tokio::spawn(async move {
            modem.expect("AT+CPIN?\r").await;
            modem.reply("+CME ERROR: 10\r\n").await;
            modem
        });

        let response = channel
            .send(AtCommand::new(
                "AT+CPIN?",
                ResponseKind::SingleLine("+CPIN:".into()),
            ))
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.final_response, "+CME ERROR: 10");
        let _modem = modem_task.await.unwrap();
    }

    #[tokio::test]
    async fn it_rejects_singleline_success_without_intermediate() {
        let (channel, mut modem, _events) = setup(Duration::from_secs(5));
        let modem_task = tokio::spawn(async move {
            modem.expect("AT+CGSN\r").await;
            modem.reply("OK\r\n").await;
            modem
        });

        let result = channel
            .send(AtCommand::new("AT+CGSN", ResponseKind::Numeric))
            .await;

        assert!(matches!(result, Err(ChannelError::InvalidResponse)));
        let _modem = modem_task.await.unwrap();
    }

    #[tokio::test]
    async fn it_sends_pdu_after_prompt() {
        let (channel, mut modem, _events) = setup(Duration::from_secs(5));
        let modem_task = tokio::spawn(async move {
            modem.expect("AT+CMGS=2\r").await;
            modem.reply("\r\n> ").await;
            modem.expect("000102\u{1a}").await;
            modem.reply("\r\n+CMGS: 7\r\nOK\r\n").await;
            modem
        });

        let response = channel
            .send(
                AtCommand::new("AT+CMGS=2", ResponseKind::SingleLine("+CMGS:".into()))
                    .with_pdu("000102"),
            )
            .await
            .unwrap();

        assert_eq!(response, AtResponse::ok(&["+CMGS: 7"]));
        let _modem = modem_task.await.unwrap();
    }

    #[tokio::test]
    async fn it_pairs_sms_unsolicited_with_pdu_line() {
        let (_channel, mut modem, events) = setup(Duration::from_secs(5));

        modem.reply("+CMT: ,23\r\n0791\r\n").await;

        assert_eq!(
            events.recv_async().await.unwrap(),
            ReaderEvent::Unsolicited {
                line: "+CMT: ,23".into(),
                pdu: Some("0791".into())
            }
        );
    }

    #[tokio::test]
    async fn it_closes_on_end_of_stream() {
        let (channel, modem, events) = setup(Duration::from_secs(5));

        drop(modem);

        assert_eq!(events.recv_async().await.unwrap(), ReaderEvent::Closed);
        assert!(channel.is_closed());
        let result = channel
            .send(AtCommand::new("AT", ResponseKind::NoResult))
            .await;
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn it_closes_when_command_times_out() {
        let (channel, _modem, events) = setup(Duration::from_secs(3));

        let result = channel
            .send(AtCommand::new("AT+CFUN=1", ResponseKind::NoResult))
            .await;

        assert!(matches!(result, Err(ChannelError::Timeout(_))));
        assert_eq!(events.recv_async().await.unwrap(), ReaderEvent::Closed);
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn it_keeps_channel_open_after_soft_timeout() {
        let (channel, _modem, events) = setup(Duration::from_secs(3));

        let result = channel
            .send(
                AtCommand::new("ATE0Q0V1", ResponseKind::NoResult)
                    .with_timeout(Duration::from_millis(250)),
            )
            .await;

        assert!(matches!(result, Err(ChannelError::Timeout(_))));
        assert!(!channel.is_closed());
        assert!(events.is_empty());
    }
}
