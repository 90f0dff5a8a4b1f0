//! Radio interface layer for AT command modems.
//!
//! Translates [`request::Request`]s from a telephony stack into AT command
//! exchanges with the modem and turns unsolicited modem output into
//! [`notification::Notification`]s.

use at::{At, channel::AtChannel};
use color_eyre::eyre::{Result, eyre};
use netif::NetIface;
use notification::{Notification, Notifier};
use radio::RadioStateCell;
use ril::{Ril, RilConfig, RilHandle, Scheduler, Work, spawn_timers};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time};
use tracing::{info, warn};
use transport::Transport;
use unsolicited::UnsolicitedHandler;

pub mod at;
pub mod calls;
pub mod cdma;
pub mod data;
pub mod error;
pub mod messaging;
pub mod netif;
pub mod network;
pub mod notification;
pub mod radio;
pub mod request;
pub mod ril;
pub mod sim;
pub mod supplementary;
pub mod telemetry;
pub mod transport;
pub mod unsolicited;

const REOPEN_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) type Tasks = Vec<JoinHandle<Result<()>>>;

pub struct Program {
    pub handle: RilHandle,
    pub notifications: flume::Receiver<Notification>,
    pub tasks: Tasks,
}

#[bon::builder(finish_fn = run)]
pub async fn program(
    transport: Transport,
    netif: impl NetIface + 'static,
    #[builder(default)] config: RilConfig,
    #[builder(default = Duration::from_secs(180))] command_timeout: Duration,
) -> Result<Program> {
    let (work_tx, work_rx) = flume::unbounded();
    let (notify_tx, notifications) = flume::unbounded();
    let (schedule_tx, schedule_rx) = flume::unbounded();
    let (events_tx, events_rx) = flume::unbounded();

    let radio = RadioStateCell::new();
    let notifier = Notifier::new(notify_tx);
    let scheduler = Scheduler::new(schedule_tx);

    let ril = Ril::builder()
        .radio(radio.clone())
        .notifier(notifier.clone())
        .scheduler(scheduler.clone())
        .netif(Arc::new(netif))
        .config(config)
        .build();
    let unsolicited = UnsolicitedHandler::new(radio.clone(), notifier, scheduler);

    let mut tasks: Tasks = vec![
        tokio::spawn(ril.run(work_rx)),
        spawn_timers(schedule_rx, work_tx.clone()),
        tokio::spawn(unsolicited.run(events_rx)),
    ];

    let handle = RilHandle::new(work_tx.clone(), radio.clone());
    info!(version = handle.version(), ?transport, "starting");

    tasks.push(tokio::spawn(supervise(
        transport,
        radio,
        events_tx,
        work_tx,
        command_timeout,
    )));

    Ok(Program {
        handle,
        notifications,
        tasks,
    })
}

/// Keeps a channel attached: opens the transport, hands the channel to the
/// command loop and waits for it to close again.
async fn supervise(
    transport: Transport,
    radio: RadioStateCell,
    events: flume::Sender<at::channel::ReaderEvent>,
    work: flume::Sender<Work>,
    command_timeout: Duration,
) -> Result<()> {
    loop {
        let stream = match transport.open().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to open modem transport, retrying in {REOPEN_INTERVAL:?}: {e:#}");
                time::sleep(REOPEN_INTERVAL).await;
                continue;
            }
        };

        radio.reopen();
        let (channel, _reader) = AtChannel::open(stream, events.clone(), command_timeout);
        work.send_async(Work::Connected(At::new(channel)))
            .await
            .map_err(|_| eyre!("command loop stopped"))?;

        radio.wait_closed().await;
        warn!("modem channel closed, reconnecting");
    }
}
