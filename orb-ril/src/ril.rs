//! The command context: one task owns [`Ril`] and works through requests,
//! deferred tasks and connection events strictly one at a time.

use crate::{
    at::At,
    calls::{CallTracker, CallerName},
    error::{Accepted as _, RilError},
    netif::NetIface,
    network::{Domain, ModemInfo, Tech},
    notification::{Notification, Notifier},
    radio::{RadioState, RadioStateCell},
    request::{Completion, Request, Response},
};
use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

pub const VERSION: &str = concat!("orb-ril ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, bon::Builder)]
pub struct RilConfig {
    /// Network interfaces are named `{prefix}{n}`.
    #[builder(into, default = "rmnet".to_owned())]
    pub interface_prefix: String,
    #[builder(default = Duration::from_secs(1))]
    pub sim_poll_interval: Duration,
    #[builder(default = Duration::from_millis(500))]
    pub call_poll_interval: Duration,
    /// Used until the modem reports its supported range.
    #[builder(default = 1)]
    pub default_data_contexts: u32,
}

impl Default for RilConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Work that needs the modem or command-context state but was triggered
/// somewhere else: by a timer or by an unsolicited line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    PollSimState,
    CallStateChanged,
    RefreshDataCalls,
    /// Modem-reported power state, applied in arrival order.
    RadioPower(RadioState),
    TechnologyChanged(Tech),
    SubscriptionSourceChanged(i32),
    CallerName(CallerName),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled {
    pub task: Deferred,
    pub after: Duration,
}

/// One-shot timers onto the command queue.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tx: flume::Sender<Scheduled>,
}

impl Scheduler {
    pub fn new(tx: flume::Sender<Scheduled>) -> Self {
        Self { tx }
    }

    pub fn schedule(&self, task: Deferred, after: Duration) {
        if self.tx.send(Scheduled { task, after }).is_err() {
            debug!("timer task is gone, dropping deferred work");
        }
    }
}

/// Turns scheduled tasks into queued work once their delay expires.
pub fn spawn_timers(
    scheduled: flume::Receiver<Scheduled>,
    work: flume::Sender<Work>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        while let Ok(Scheduled { task, after }) = scheduled.recv_async().await {
            if after.is_zero() {
                work.send(Work::Deferred(task))
                    .map_err(|_| eyre!("command loop stopped"))?;
                continue;
            }

            let work = work.clone();
            tokio::spawn(async move {
                time::sleep(after).await;
                let _ = work.send(Work::Deferred(task));
            });
        }

        Ok(())
    })
}

#[derive(Debug)]
pub enum Work {
    Request {
        request: Request,
        reply: oneshot::Sender<Completion>,
    },
    /// A fresh channel. Replaces the previous one and runs the connect sequence.
    Connected(At),
    Deferred(Deferred),
}

enum Routed {
    Handled(Result<Response, RilError>),
    Unhandled(Request),
}

pub struct Ril {
    pub(crate) at: At,
    pub(crate) radio: RadioStateCell,
    pub(crate) notifier: Notifier,
    pub(crate) scheduler: Scheduler,
    pub(crate) netif: Arc<dyn NetIface>,
    pub(crate) config: RilConfig,
    pub(crate) modem: ModemInfo,
    pub(crate) calls: CallTracker,
    pub(crate) max_data_contexts: u32,
}

#[bon::bon]
impl Ril {
    #[builder]
    pub fn new(
        #[builder(default = At::disconnected())] at: At,
        radio: RadioStateCell,
        notifier: Notifier,
        scheduler: Scheduler,
        netif: Arc<dyn NetIface>,
        #[builder(default)] config: RilConfig,
    ) -> Self {
        Self {
            at,
            radio,
            notifier,
            scheduler,
            netif,
            max_data_contexts: config.default_data_contexts,
            config,
            modem: ModemInfo::default(),
            calls: CallTracker::default(),
        }
    }
}

impl Ril {
    pub async fn run(mut self, work: flume::Receiver<Work>) -> Result<()> {
        while let Ok(item) = work.recv_async().await {
            match item {
                Work::Request { request, reply } => {
                    let completion = self.dispatch(request).await;
                    if reply.send(completion).is_err() {
                        debug!("requester went away before completion");
                    }
                }
                Work::Connected(at) => self.attach(at).await,
                Work::Deferred(task) => self.run_deferred(task).await,
            }
        }
        info!("command loop stopped");

        Ok(())
    }

    async fn attach(&mut self, at: At) {
        info!("modem connected");
        self.at = at;
        self.calls = CallTracker::default();
        self.initialize().await;
    }

    pub(crate) async fn run_deferred(&mut self, task: Deferred) {
        debug!(?task, "running deferred task");
        match task {
            Deferred::PollSimState => self.poll_sim_state().await,
            Deferred::CallStateChanged => {
                self.notifier.notify(Notification::CallStateChanged)
            }
            Deferred::RefreshDataCalls => {
                if self.radio.current() != RadioState::Unavailable {
                    self.refresh_data_calls().await;
                }
            }
            Deferred::RadioPower(state) => self.set_radio_state(state).await,
            Deferred::TechnologyChanged(tech) => self.set_radio_technology(tech),
            Deferred::SubscriptionSourceChanged(source) => {
                self.modem.subscription_source = source;
                self.notifier
                    .notify(Notification::CdmaSubscriptionSourceChanged(source));
            }
            Deferred::CallerName(name) => self.calls.cache_caller_name(name),
        }
    }

    pub(crate) async fn dispatch(&mut self, request: Request) -> Completion {
        debug!(?request, "request");
        let result = if self.radio.current() == RadioState::Unavailable
            && !matches!(request, Request::GetSimStatus)
        {
            Err(RilError::RadioNotAvailable)
        } else {
            match self.route_common(request).await {
                Routed::Handled(result) => result,
                Routed::Unhandled(request) if self.modem.is_3gpp2() => {
                    self.route_cdma(request).await
                }
                Routed::Unhandled(request) => self.route_gsm(request).await,
            }
        };

        match &result {
            Err(e @ RilError::Parse(_)) => error!("request failed: {e}"),
            Err(RilError::RepollRequested(_)) => {}
            Err(e) => debug!("request failed: {e}"),
            Ok(_) => {}
        }

        Completion::from(result)
    }

    async fn route_common(&mut self, request: Request) -> Routed {
        let result = match request {
            Request::GetSimStatus => self.card_status().await,
            Request::GetCurrentCalls => self.current_calls().await,
            Request::Dial { address, clir } => self.dial(&address, clir).await,
            Request::Hangup { index } => self.hangup(index).await,
            Request::HangupWaitingOrBackground => self.hangup_waiting_or_background().await,
            Request::HangupForegroundResumeBackground => {
                self.hangup_foreground_resume_background().await
            }
            Request::SwitchWaitingOrHoldingAndActive => {
                self.switch_waiting_or_holding_and_active().await
            }
            Request::Answer => self.answer().await,
            Request::Conference => self.conference().await,
            Request::Udub => self.udub().await,
            Request::SeparateConnection { party } => self.separate_connection(party).await,
            Request::LastCallFailCause => self.last_call_fail_cause().await,
            Request::SignalStrength => self.signal_strength().await,
            Request::VoiceRegistrationState => self.registration_state(Domain::Voice).await,
            Request::DataRegistrationState => self.registration_state(Domain::Data).await,
            Request::Operator => self.operator().await,
            Request::RadioPower { on } => self.request_radio_power(on).await,
            Request::Dtmf { tone } => self.dtmf(tone).await,
            Request::SetupDataCall(setup) => self.setup_data_call(&setup).await,
            Request::DeactivateDataCall { cid } => self.deactivate_data_call(cid).await,
            Request::DataCallList => self.data_call_list().await,
            Request::SmsAcknowledge { success } => self.sms_acknowledge(success).await,
            Request::GetImsi => self.imsi().await,
            Request::GetImei => self.imei().await,
            Request::SimIo(io) => self.sim_io(&io).await,
            Request::SendUssd { .. } => Err(RilError::NotSupported),
            Request::CancelUssd => self.cancel_ussd().await,
            Request::OemHookRaw(data) => Ok(Response::Raw(data)),
            Request::OemHookStrings(strings) => {
                for s in &strings {
                    debug!("> '{s}'");
                }
                Ok(Response::Strings(strings.into_iter().map(Some).collect()))
            }
            Request::WriteSmsToSim { status, pdu } => self.write_sms_to_sim(status, &pdu).await,
            Request::DeleteSmsOnSim { index } => self.delete_sms_on_sim(index).await,
            Request::EnterSimPin { pin } => self.enter_sim_pin(&pin).await,
            Request::EnterSimPuk { puk, new_pin } => self.enter_sim_puk(&puk, &new_pin).await,
            Request::ChangeSimPin { old_pin, new_pin } => {
                self.change_sim_pin(&old_pin, &new_pin).await
            }
            Request::EnterSimPin2 { .. }
            | Request::EnterSimPuk2 { .. }
            | Request::ChangeSimPin2 { .. } => Err(RilError::NotSupported),
            Request::GetUnlockRetryCount { lock } => self.unlock_retry_count(&lock).await,
            Request::ScreenState { on } => self.screen_state(on).await,
            Request::VoiceRadioTech => self.voice_radio_tech(),
            Request::SetPreferredNetworkType { mode } => {
                self.set_preferred_network_type(mode).await
            }
            Request::GetPreferredNetworkType => self.get_preferred_network_type().await,
            Request::GetSmscAddress => self.smsc_address().await,
            Request::SetSmscAddress { address } => self.set_smsc_address(&address).await,
            Request::QueryCallForwardStatus {
                reason,
                service_class,
            } => self.query_call_forward_status(reason, service_class).await,
            Request::SetCallForward(info) => self.set_call_forward(&info).await,
            Request::QueryFacilityLock {
                facility,
                password,
                service_class,
            } => {
                self.query_facility_lock(&facility, &password, service_class)
                    .await
            }
            Request::SetFacilityLock {
                facility,
                lock,
                password,
                service_class,
            } => {
                self.set_facility_lock(&facility, lock, &password, service_class)
                    .await
            }
            Request::ChangeBarringPassword {
                facility,
                old_password,
                new_password,
            } => {
                self.change_barring_password(&facility, &old_password, &new_password)
                    .await
            }
            Request::StkSendTerminalResponse { contents } => {
                self.stk_terminal_response(&contents).await
            }
            Request::StkSendEnvelopeCommand { contents } => {
                self.stk_envelope(&contents).await
            }
            request => return Routed::Unhandled(request),
        };

        Routed::Handled(result)
    }

    async fn route_gsm(&mut self, request: Request) -> Result<Response, RilError> {
        match request {
            Request::SendSms { smsc, pdu } => self.send_sms(smsc.as_deref(), &pdu).await,
            Request::SetNetworkSelectionAutomatic => {
                self.set_network_selection_automatic().await
            }
            Request::SetNetworkSelectionManual { operator } => {
                self.set_network_selection_manual(&operator).await
            }
            Request::QueryNetworkSelectionMode => self.query_network_selection_mode().await,
            Request::QueryAvailableNetworks => self.query_available_networks().await,
            _ => Err(RilError::NotSupported),
        }
    }

    async fn route_cdma(&mut self, request: Request) -> Result<Response, RilError> {
        match request {
            Request::CdmaSendSms => {
                warn!("cdma sms is not implemented, asking the stack to retry");
                Err(RilError::SmsSendFailRetry)
            }
            Request::BasebandVersion => self.baseband_version(),
            Request::DeviceIdentity => self.device_identity().await,
            Request::CdmaSubscription => self.cdma_subscription(),
            Request::CdmaGetSubscriptionSource => self.subscription_source().await,
            Request::CdmaSetSubscriptionSource { source } => {
                self.set_subscription_source(source).await
            }
            Request::CdmaQueryRoamingPreference => self.roaming_preference().await,
            Request::CdmaSetRoamingPreference { preference } => {
                self.set_roaming_preference(preference).await
            }
            Request::CdmaPrlVersion => self.prl_version().await,
            Request::ExitEmergencyCallbackMode => self.exit_emergency_callback_mode().await,
            _ => Err(RilError::NotSupported),
        }
    }

    async fn imei(&self) -> Result<Response, RilError> {
        let response = self.at.numeric("AT+CGSN").await?.accepted()?;

        Ok(Response::Text(response.line()?.to_owned()))
    }

    /// Cell id reporting is only needed while someone looks at the screen.
    async fn screen_state(&self, on: bool) -> Result<Response, RilError> {
        let mode = if on { 2 } else { 1 };
        self.at.command(format!("AT+CREG={mode}")).await?.accepted()?;

        Ok(Response::Empty)
    }
}

/// What the telephony stack holds on to.
#[derive(Debug, Clone)]
pub struct RilHandle {
    work: flume::Sender<Work>,
    radio: RadioStateCell,
}

impl RilHandle {
    pub fn new(work: flume::Sender<Work>, radio: RadioStateCell) -> Self {
        Self { work, radio }
    }

    /// Completes exactly once, in submission order with other requests.
    pub async fn request(&self, request: Request) -> Result<Completion> {
        let (reply, completion) = oneshot::channel();
        self.work
            .send_async(Work::Request { request, reply })
            .await
            .map_err(|_| eyre!("command loop stopped"))?;

        completion.await.wrap_err("command loop dropped the request")
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio.current()
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }
}
