use clap::{ArgGroup, Parser};
use color_eyre::eyre::{Result, WrapErr as _, bail};
use orb_ril::{
    Program, netif::IpCommand, notification::Notification, request::Request,
    ril::{RilConfig, RilHandle}, transport::Transport,
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, Stdout},
    signal::unix::{self, SignalKind},
    sync::Mutex,
};
use tracing::{debug, info, warn};

const SYSLOG_IDENTIFIER: &str = "worldcoin-ril";

/// Radio interface layer for AT command modems.
///
/// Reads one JSON request per line on stdin and writes completions and
/// notifications as JSON lines to stdout.
#[derive(Debug, Parser)]
#[command(version, about)]
#[command(group(
    ArgGroup::new("transport")
        .required(true)
        .args(["device", "port", "socket"]),
))]
struct Cli {
    /// Serial device of the modem's AT port.
    #[arg(long, env = "ORB_RIL_DEVICE")]
    device: Option<PathBuf>,

    #[arg(long, env = "ORB_RIL_BAUD_RATE", default_value_t = 115_200)]
    baud_rate: u32,

    /// Loopback TCP port of the AT channel.
    #[arg(long, env = "ORB_RIL_PORT")]
    port: Option<u16>,

    /// Unix socket of the AT channel.
    #[arg(long, env = "ORB_RIL_SOCKET")]
    socket: Option<PathBuf>,

    /// Seconds before an unanswered command closes the channel.
    #[arg(
        long = "command-timeout",
        env = "ORB_RIL_COMMAND_TIMEOUT",
        default_value_t = 180
    )]
    command_timeout_secs: u64,

    #[arg(long, env = "ORB_RIL_INTERFACE_PREFIX", default_value = "rmnet")]
    interface_prefix: String,
}

impl Cli {
    fn transport(&self) -> Result<Transport> {
        let transport = match (&self.device, self.port, &self.socket) {
            (Some(path), _, _) => Transport::Serial {
                path: path.clone(),
                baud_rate: self.baud_rate,
            },
            (None, Some(port), _) => Transport::Tcp { port },
            (None, None, Some(path)) => Transport::Unix { path: path.clone() },
            (None, None, None) => bail!("one of --device, --port or --socket is required"),
        };

        Ok(transport)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Output<'a> {
    Completion {
        id: u64,
        #[serde(flatten)]
        completion: &'a orb_ril::request::Completion,
    },
    Error {
        id: u64,
        message: String,
    },
    Notification(&'a Notification),
}

async fn write_line(stdout: &Mutex<Stdout>, output: &Output<'_>) -> Result<()> {
    let mut line = serde_json::to_vec(output)?;
    line.push(b'\n');
    let mut stdout = stdout.lock().await;
    stdout.write_all(&line).await?;
    stdout.flush().await?;

    Ok(())
}

/// Each request gets its own task so that the completion is written as soon as
/// it is available. Ids are the input line numbers.
async fn serve_stdin(handle: RilHandle, stdout: Arc<Mutex<Stdout>>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut id = 0;
    while let Some(line) = lines.next_line().await? {
        id += 1;
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(id, "invalid request: {e}");
                let output = Output::Error {
                    id,
                    message: e.to_string(),
                };
                write_line(&stdout, &output).await?;
                continue;
            }
        };

        let handle = handle.clone();
        let stdout = Arc::clone(&stdout);
        tokio::spawn(async move {
            let output = match handle.request(request).await {
                Ok(completion) => {
                    let output = Output::Completion {
                        id,
                        completion: &completion,
                    };
                    write_line(&stdout, &output).await
                }
                Err(e) => {
                    let output = Output::Error {
                        id,
                        message: format!("{e:#}"),
                    };
                    write_line(&stdout, &output).await
                }
            };
            if let Err(e) = output {
                warn!(id, "failed to write completion: {e:#}");
            }
        });
    }
    info!("stdin closed, no more requests");

    Ok(())
}

async fn forward_notifications(
    notifications: flume::Receiver<Notification>,
    stdout: Arc<Mutex<Stdout>>,
) -> Result<()> {
    while let Ok(notification) = notifications.recv_async().await {
        write_line(&stdout, &Output::Notification(&notification)).await?;
    }
    debug!("notification stream ended");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    orb_ril::telemetry::init(SYSLOG_IDENTIFIER).wrap_err("failed to set up logging")?;

    let cli = Cli::parse();
    let config = RilConfig::builder()
        .interface_prefix(cli.interface_prefix.clone())
        .build();

    let Program {
        handle,
        notifications,
        mut tasks,
    } = orb_ril::program()
        .transport(cli.transport()?)
        .netif(IpCommand)
        .config(config)
        .command_timeout(Duration::from_secs(cli.command_timeout_secs))
        .run()
        .await?;

    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    tasks.push(tokio::spawn(forward_notifications(
        notifications,
        Arc::clone(&stdout),
    )));
    tasks.push(tokio::spawn(serve_stdin(handle, stdout)));

    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sigint = unix::signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => warn!("received SIGTERM"),
        _ = sigint.recv()  => warn!("received SIGINT"),
    }

    info!("aborting tasks and exiting gracefully");

    for handle in tasks {
        handle.abort();
    }

    Ok(())
}
