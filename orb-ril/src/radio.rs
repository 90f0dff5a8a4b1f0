//! Radio power state and the connection lifecycle around it.

use crate::{
    error::{Accepted as _, RilError},
    notification::Notification,
    request::Response,
    ril::Ril,
};
use derive_more::Display;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioState {
    Unavailable,
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: RadioState,
    closed: bool,
}

/// The only state shared between the reader and the command context.
///
/// Once the channel is closed every transition lands on
/// [`RadioState::Unavailable`] until [`RadioStateCell::reopen`] is called for a
/// fresh connection.
#[derive(Debug, Clone)]
pub struct RadioStateCell {
    tx: Arc<watch::Sender<Status>>,
}

impl Default for RadioStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioStateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Status {
            state: RadioState::Unavailable,
            closed: false,
        });

        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> RadioState {
        self.tx.borrow().state
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    /// Returns whether the state actually changed.
    pub fn transition(&self, target: RadioState) -> bool {
        self.tx.send_if_modified(|status| {
            let target = if status.closed {
                RadioState::Unavailable
            } else {
                target
            };
            if status.state == target {
                return false;
            }
            status.state = target;
            true
        })
    }

    /// Marks the channel closed and forces `Unavailable`. Returns whether the
    /// radio state changed.
    pub fn close(&self) -> bool {
        let mut changed = false;
        self.tx.send_modify(|status| {
            status.closed = true;
            changed = status.state != RadioState::Unavailable;
            status.state = RadioState::Unavailable;
        });

        changed
    }

    pub fn reopen(&self) {
        self.tx.send_modify(|status| status.closed = false);
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|status| status.closed).await;
    }

    pub async fn wait_for(&self, state: RadioState) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|status| status.state == state).await;
    }
}

/// Sent at every connect, after the handshake and the modem probe.
const INIT_SEQUENCE: [&str; 13] = [
    // no echo, result codes, verbose results
    "ATE0Q0V1",
    // no auto-answer
    "ATS0=0",
    // numeric +CME errors
    "AT+CMEE=1",
    "AT+CGREG=1",
    // call waiting notifications
    "AT+CCWA=1",
    // single mode calls
    "AT+CMOD=0",
    "AT+CMUT=0",
    // supplementary service notifications
    "AT+CSSN=0,1",
    // no connected line identification
    "AT+COLP=0",
    "AT+CSCS=\"HEX\"",
    // USSD unsolicited
    "AT+CUSD=1",
    // +CGEV unsolicited
    "AT+CGEREP=1,0",
    // SMS PDU mode
    "AT+CMGF=0",
];

impl Ril {
    pub(crate) async fn set_radio_state(&mut self, target: RadioState) {
        if !self.radio.transition(target) {
            return;
        }

        let state = self.radio.current();
        info!(%state, "radio state changed");
        self.notifier.notify(Notification::RadioStateChanged(state));
        if state == RadioState::On {
            self.on_radio_power_on().await;
        }
    }

    pub(crate) async fn on_radio_power_on(&mut self) {
        self.poll_sim_state().await;
    }

    pub(crate) async fn is_radio_on(&self) -> Result<bool, RilError> {
        let response = self.at.singleline("AT+CFUN?", "+CFUN:").await?.accepted()?;
        let mut tok = crate::at::Tokenizer::start(response.line()?)?;

        Ok(tok.next_bool()?)
    }

    pub(crate) async fn request_radio_power(&mut self, on: bool) -> Result<Response, RilError> {
        let state = self.radio.current();
        if !on && state != RadioState::Off {
            self.at.command("AT+CFUN=0").await?.accepted()?;
            self.set_radio_state(RadioState::Off).await;
        } else if on && state == RadioState::Off {
            let powered = self.at.command("AT+CFUN=1").await?;
            if !powered.success {
                // Some modems report an error even though the radio came up.
                if !matches!(self.is_radio_on().await, Ok(true)) {
                    return Err(RilError::Rejected(powered.cme()));
                }
                warn!("AT+CFUN=1 failed but the radio is on");
            }
            self.set_radio_state(RadioState::On).await;
        }

        Ok(Response::Empty)
    }

    /// Runs once per connection, on the command context.
    pub(crate) async fn initialize(&mut self) {
        self.set_radio_state(RadioState::Off).await;

        if let Err(e) = self.at.handshake().await {
            warn!("handshake failed: {e}");
        }

        self.modem = crate::network::probe_modem(&self.at).await;
        info!(modem = ?self.modem, "probed modem");
        self.max_data_contexts =
            crate::data::query_max_contexts(&self.at, self.config.default_data_contexts)
                .await;

        for command in INIT_SEQUENCE.iter().take(3) {
            self.send_init(command).await;
        }
        // network registration events, falling back when cell ids are unsupported
        match self.at.command("AT+CREG=2").await {
            Ok(response) if response.success => {}
            _ => self.send_init("AT+CREG=1").await,
        }
        for command in INIT_SEQUENCE.iter().skip(3) {
            self.send_init(command).await;
        }

        if matches!(self.is_radio_on().await, Ok(true)) {
            self.set_radio_state(RadioState::On).await;
        }
    }

    async fn send_init(&self, command: &str) {
        match self.at.command(command).await {
            Ok(response) if !response.success => {
                warn!(command, "init command rejected: {}", response.final_response)
            }
            Ok(_) => {}
            Err(e) => warn!(command, "init command failed: {e}"),
        }
    }
}
