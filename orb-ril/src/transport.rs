use color_eyre::{Result, eyre::WrapErr as _};
use std::{net::Ipv4Addr, path::PathBuf};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, UnixStream},
};
use tokio_serial::{SerialPort as _, SerialPortBuilderExt as _};
use tracing::info;

pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Where the modem's AT port lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Serial { path: PathBuf, baud_rate: u32 },
    /// Loopback TCP, as exposed by emulators.
    Tcp { port: u16 },
    Unix { path: PathBuf },
}

impl Transport {
    pub async fn open(&self) -> Result<Box<dyn Stream>> {
        let stream: Box<dyn Stream> = match self {
            Transport::Serial { path, baud_rate } => {
                let mut port = tokio_serial::new(path.to_string_lossy(), *baud_rate)
                    .open_native_async()
                    .wrap_err_with(|| format!("failed to open {}", path.display()))?;
                port.set_data_bits(tokio_serial::DataBits::Eight)?;
                port.set_stop_bits(tokio_serial::StopBits::One)?;
                port.set_parity(tokio_serial::Parity::None)?;
                port.set_flow_control(tokio_serial::FlowControl::None)?;

                Box::new(port)
            }
            Transport::Tcp { port } => Box::new(
                TcpStream::connect((Ipv4Addr::LOCALHOST, *port))
                    .await
                    .wrap_err_with(|| format!("failed to connect to port {port}"))?,
            ),
            Transport::Unix { path } => Box::new(
                UnixStream::connect(path)
                    .await
                    .wrap_err_with(|| format!("failed to connect to {}", path.display()))?,
            ),
        };
        info!(transport = ?self, "opened modem transport");

        Ok(stream)
    }
}
