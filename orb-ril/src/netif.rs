//! Kernel side of a data call: bringing the modem's network interface up with
//! the address the network assigned.

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{WrapErr, bail, eyre},
};
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetIface: Send + Sync {
    /// Brings `ifname` up with `cidr` (`a.b.c.d/len`).
    async fn configure(&self, ifname: &str, cidr: &str) -> Result<()>;

    async fn deconfigure(&self, ifname: &str) -> Result<()>;
}

/// Only IPv4 addresses are configured for now.
pub fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| eyre!("{cidr} has no prefix length"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .wrap_err_with(|| format!("invalid address in {cidr}"))?;
    let prefix: u8 = prefix
        .parse()
        .wrap_err_with(|| format!("invalid prefix length in {cidr}"))?;
    if prefix > 32 {
        bail!("prefix length {prefix} out of range");
    }

    Ok((addr, prefix))
}

/// Configures interfaces with iproute2.
pub struct IpCommand;

#[async_trait]
impl NetIface for IpCommand {
    async fn configure(&self, ifname: &str, cidr: &str) -> Result<()> {
        let (addr, prefix) = parse_ipv4_cidr(cidr)?;
        let cidr = format!("{addr}/{prefix}");

        run_cmd("ip", &["link", "set", ifname, "up"]).await?;
        if let Err(e) = run_cmd("ip", &["addr", "replace", &cidr, "dev", ifname]).await {
            let _ = run_cmd("ip", &["link", "set", ifname, "down"]).await;
            return Err(e);
        }
        info!(ifname, %cidr, "interface configured");

        Ok(())
    }

    async fn deconfigure(&self, ifname: &str) -> Result<()> {
        run_cmd("ip", &["addr", "flush", "dev", ifname]).await?;
        run_cmd("ip", &["link", "set", ifname, "down"]).await?;
        info!(ifname, "interface deconfigured");

        Ok(())
    }
}

async fn run_cmd(cmd: &str, args: &[&str]) -> Result<String> {
    debug!("{cmd} {}", args.join(" "));
    let output = Command::new(cmd).args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let err = String::from_utf8_lossy(&output.stderr);
        let args = args.join(" ");
        Err(eyre!("Failed to run {cmd} {args}. Error {err}"))
    }
}
