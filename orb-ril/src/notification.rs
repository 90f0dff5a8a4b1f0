use crate::{
    data::DataContext,
    network::{RadioTech, SignalStrength},
    radio::RadioState,
};
use serde::Serialize;
use tracing::debug;

/// Spontaneous events for the telephony stack, not tied to any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    RadioStateChanged(RadioState),
    CallStateChanged,
    CallRing,
    VoiceNetworkStateChanged,
    SimStatusChanged,
    /// `None` when the refresh could not be completed.
    DataCallListChanged(Option<Vec<DataContext>>),
    NitzTimeReceived(String),
    StkProactiveCommand(String),
    NewSms(String),
    NewSmsStatusReport(String),
    NewBroadcastSms(Vec<u8>),
    VoiceRadioTechChanged(RadioTech),
    CdmaSubscriptionSourceChanged(i32),
    EnterEmergencyCallbackMode,
    ExitEmergencyCallbackMode,
    CdmaPrlChanged(i32),
    SignalStrength(SignalStrength),
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: flume::Sender<Notification>,
}

impl Notifier {
    pub fn new(tx: flume::Sender<Notification>) -> Self {
        Self { tx }
    }

    pub fn notify(&self, notification: Notification) {
        debug!(?notification, "notify");
        if self.tx.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }
}
