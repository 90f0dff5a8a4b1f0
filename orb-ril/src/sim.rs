//! SIM readiness, card status, PIN handling and SIM file access.

use crate::{
    at::{Cme, Tokenizer},
    error::{Accepted as _, CmeCode, RilError},
    notification::Notification,
    radio::RadioState,
    request::Response,
    ril::{Deferred, Ril},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Derived from `AT+CPIN?` every time, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimStatus {
    Absent,
    NotReady,
    Ready,
    Pin,
    Puk,
    NetworkPersonalization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CardState {
    Absent = 0,
    Present = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppType {
    Unknown = 0,
    Sim = 1,
    Ruim = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppState {
    Unknown = 0,
    Detected = 1,
    Pin = 2,
    Puk = 3,
    SubscriptionPerso = 4,
    Ready = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PersoSubstate {
    Unknown = 0,
    Ready = 2,
    SimNetwork = 3,
    RuimNetwork1 = 13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PinState {
    Unknown = 0,
    EnabledNotVerified = 1,
    EnabledBlocked = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatus {
    pub app_type: AppType,
    pub app_state: AppState,
    pub perso_substate: PersoSubstate,
    pub pin1: PinState,
    pub pin2: PinState,
}

impl AppStatus {
    const UNKNOWN: AppStatus = AppStatus {
        app_type: AppType::Unknown,
        app_state: AppState::Unknown,
        perso_substate: PersoSubstate::Unknown,
        pin1: PinState::Unknown,
        pin2: PinState::Unknown,
    };

    fn new(app_type: AppType, status: SimStatus) -> Self {
        let (app_state, perso_substate, pin1) = match status {
            SimStatus::Absent => return Self::UNKNOWN,
            SimStatus::NotReady => {
                (AppState::Detected, PersoSubstate::Unknown, PinState::Unknown)
            }
            SimStatus::Ready => (AppState::Ready, PersoSubstate::Ready, PinState::Unknown),
            SimStatus::Pin => (
                AppState::Pin,
                PersoSubstate::Unknown,
                PinState::EnabledNotVerified,
            ),
            SimStatus::Puk => {
                (AppState::Puk, PersoSubstate::Unknown, PinState::EnabledBlocked)
            }
            SimStatus::NetworkPersonalization => {
                let substate = match app_type {
                    AppType::Ruim => PersoSubstate::RuimNetwork1,
                    _ => PersoSubstate::SimNetwork,
                };
                (
                    AppState::SubscriptionPerso,
                    substate,
                    PinState::EnabledNotVerified,
                )
            }
        };

        Self {
            app_type,
            app_state,
            perso_substate,
            pin1,
            pin2: PinState::Unknown,
        }
    }
}

/// Index used when an application slot is not populated.
pub const NO_APP: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardStatus {
    pub card_state: CardState,
    pub universal_pin_state: PinState,
    pub gsm_umts_subscription_app_index: usize,
    pub cdma_subscription_app_index: usize,
    pub ims_subscription_app_index: usize,
    pub applications: Vec<AppStatus>,
}

impl CardStatus {
    /// A present card exposes a SIM application at 0 and a RUIM application at 1.
    pub fn from_status(status: SimStatus) -> Self {
        if status == SimStatus::Absent {
            return Self {
                card_state: CardState::Absent,
                universal_pin_state: PinState::Unknown,
                gsm_umts_subscription_app_index: NO_APP,
                cdma_subscription_app_index: NO_APP,
                ims_subscription_app_index: NO_APP,
                applications: Vec::new(),
            };
        }

        Self {
            card_state: CardState::Present,
            universal_pin_state: PinState::Unknown,
            gsm_umts_subscription_app_index: 0,
            cdma_subscription_app_index: 1,
            ims_subscription_app_index: NO_APP,
            applications: vec![
                AppStatus::new(AppType::Sim, status),
                AppStatus::new(AppType::Ruim, status),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimIo {
    pub command: i32,
    pub fileid: i32,
    pub path: Option<String>,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub data: Option<String>,
    pub pin2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimIoResponse {
    pub sw1: i32,
    pub sw2: i32,
    pub response: Option<String>,
}

pub fn parse_cpin(line: &str) -> Result<SimStatus, crate::at::ParseError> {
    let mut tok = Tokenizer::start(line)?;
    let status = match tok.next_str()? {
        "SIM PIN" => SimStatus::Pin,
        "SIM PUK" => SimStatus::Puk,
        "PH-NET PIN" => SimStatus::NetworkPersonalization,
        "READY" => SimStatus::Ready,
        // PIN2 and the other lock states are treated as no usable SIM
        _ => SimStatus::Absent,
    };

    Ok(status)
}

fn parse_crsm(line: &str) -> Result<SimIoResponse, crate::at::ParseError> {
    let mut tok = Tokenizer::start(line)?;
    let sw1 = tok.next_int()?;
    let sw2 = tok.next_int()?;
    let response = if tok.has_more() {
        Some(tok.next_str()?.to_owned())
    } else {
        None
    };

    Ok(SimIoResponse { sw1, sw2, response })
}

impl Ril {
    pub(crate) async fn sim_status(&self) -> SimStatus {
        match self.radio.current() {
            RadioState::Off => return SimStatus::Absent,
            RadioState::Unavailable => return SimStatus::NotReady,
            RadioState::On => {}
        }

        let response = match self.at.singleline("AT+CPIN?", "+CPIN:").await {
            Ok(response) => response,
            Err(e) => {
                debug!("AT+CPIN? failed: {e}");
                return SimStatus::NotReady;
            }
        };

        match response.cme() {
            Cme::Success => {}
            cme if CmeCode::SimNotInserted.matches(cme) => return SimStatus::Absent,
            _ => return SimStatus::NotReady,
        }

        response
            .line()
            .and_then(parse_cpin)
            .unwrap_or(SimStatus::NotReady)
    }

    /// Polls until the SIM leaves `NotReady`, re-arming a timer on the command
    /// context each time.
    pub(crate) async fn poll_sim_state(&mut self) {
        if self.radio.current() != RadioState::On {
            return;
        }

        match self.sim_status().await {
            SimStatus::NotReady => {
                debug!("sim not ready, polling again");
                self.scheduler
                    .schedule(Deferred::PollSimState, self.config.sim_poll_interval);
            }
            SimStatus::Ready => {
                info!("sim ready");
                self.on_sim_ready().await;
                self.notifier.notify(Notification::SimStatusChanged);
            }
            status => {
                info!(?status, "sim status");
                self.notifier.notify(Notification::SimStatusChanged);
            }
        }
    }

    async fn on_sim_ready(&self) {
        if let Err(e) = self.at.singleline("AT+CSMS=1", "+CSMS:").await {
            debug!("AT+CSMS=1 failed: {e}");
        }
        // deliver SMS, status reports and broadcasts as unsolicited
        if let Err(e) = self.at.command("AT+CNMI=1,2,2,1,1").await {
            debug!("AT+CNMI failed: {e}");
        }
    }

    pub(crate) async fn card_status(&self) -> Result<Response, RilError> {
        let status = self.sim_status().await;

        Ok(Response::CardStatus(CardStatus::from_status(status)))
    }

    pub(crate) async fn lock_retry_count(&self, lock: &str) -> Result<(i32, i32), RilError> {
        let response = self
            .at
            .singleline(format!("AT+CPINR={lock}"), "+CPINR:")
            .await?
            .accepted()?;

        let mut tok = Tokenizer::start(response.line()?)?;
        let _lock = tok.next_str()?;
        let retries = tok.next_int()?;
        let default = if tok.has_more() { tok.next_int()? } else { -1 };

        Ok((retries, default))
    }

    async fn pin_retries(&self, lock: &str) -> i32 {
        self.lock_retry_count(lock)
            .await
            .map_or(-1, |(retries, _)| retries)
    }

    /// Shared body of the PIN/PUK requests: the SIM must be in `required`.
    async fn unlock(
        &mut self,
        required: SimStatus,
        command: String,
        retry_lock: &str,
    ) -> Result<Response, RilError> {
        if self.sim_status().await != required {
            return Err(RilError::SimState);
        }

        let result = match self.at.command(command).await {
            Ok(response) if response.success => Ok(Response::Int(0)),
            _ => Err(RilError::PasswordIncorrect {
                retries: self.pin_retries(retry_lock).await,
            }),
        };

        self.poll_sim_state().await;

        result
    }

    pub(crate) async fn enter_sim_pin(&mut self, pin: &str) -> Result<Response, RilError> {
        self.unlock(SimStatus::Pin, format!("AT+CPIN={pin}"), "SIM PIN")
            .await
    }

    pub(crate) async fn enter_sim_puk(
        &mut self,
        puk: &str,
        new_pin: &str,
    ) -> Result<Response, RilError> {
        self.unlock(SimStatus::Puk, format!("AT+CPIN={puk},{new_pin}"), "SIM PUK")
            .await
    }

    pub(crate) async fn change_sim_pin(
        &mut self,
        old_pin: &str,
        new_pin: &str,
    ) -> Result<Response, RilError> {
        self.unlock(
            SimStatus::Ready,
            format!("AT+CPIN={old_pin},{new_pin}"),
            "SIM PIN",
        )
        .await
    }

    pub(crate) async fn unlock_retry_count(&self, lock: &str) -> Result<Response, RilError> {
        let (retries, default) = self.lock_retry_count(lock).await?;

        Ok(Response::Ints(vec![retries, default]))
    }

    pub(crate) async fn sim_io(&self, io: &SimIo) -> Result<Response, RilError> {
        let mut command = format!(
            "AT+CRSM={},{},{},{},{}",
            io.command, io.fileid, io.p1, io.p2, io.p3
        );
        if let Some(data) = &io.data {
            command.push(',');
            command.push_str(data);
        }

        let response = self.at.singleline(command, "+CRSM:").await?.accepted()?;

        Ok(Response::SimIo(parse_crsm(response.line()?)?))
    }

    pub(crate) async fn imsi(&self) -> Result<Response, RilError> {
        let response = self.at.numeric("AT+CIMI").await?.accepted()?;

        Ok(Response::Text(response.line()?.to_owned()))
    }

    pub(crate) async fn query_facility_lock(
        &self,
        facility: &str,
        password: &str,
        service_class: i32,
    ) -> Result<Response, RilError> {
        let response = self
            .at
            .multiline(
                format!("AT+CLCK=\"{facility}\",2,\"{password}\",{service_class}"),
                "+CLCK:",
            )
            .await?
            .accepted()?;

        let mut enabled = 0;
        for line in &response.intermediates {
            let mut tok = Tokenizer::start(line)?;
            let status = tok.next_int()?;
            if !tok.has_more() {
                continue;
            }
            let class = tok.next_int()?;
            if status == 1 {
                enabled |= class;
            }
        }

        Ok(Response::Int(enabled))
    }

    pub(crate) async fn set_facility_lock(
        &self,
        facility: &str,
        lock: bool,
        password: &str,
        service_class: i32,
    ) -> Result<Response, RilError> {
        let response = self
            .at
            .command(format!(
                "AT+CLCK=\"{facility}\",{},\"{password}\",{service_class}",
                u8::from(lock)
            ))
            .await?;

        if response.success {
            return Ok(Response::Int(0));
        }

        Err(RilError::FacilityLock {
            cme: response.cme(),
            retries: self.pin_retries("SIM PIN").await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        at::testing::{closed, error, ok, scripted, silent},
        error::Outcome,
        request::Completion,
        ril::testing::Harness,
    };
    use std::time::Duration;

    #[test]
    fn it_parses_cpin_states() {
        assert_eq!(parse_cpin("+CPIN: READY"), Ok(SimStatus::Ready));
        assert_eq!(parse_cpin("+CPIN: SIM PIN"), Ok(SimStatus::Pin));
        assert_eq!(parse_cpin("+CPIN: SIM PUK"), Ok(SimStatus::Puk));
        assert_eq!(
            parse_cpin("+CPIN: PH-NET PIN"),
            Ok(SimStatus::NetworkPersonalization)
        );
        assert_eq!(parse_cpin("+CPIN: SIM PIN2"), Ok(SimStatus::Absent));
    }

    #[test]
    fn it_builds_card_status_for_both_app_families() {
        let card = CardStatus::from_status(SimStatus::NetworkPersonalization);

        assert_eq!(card.card_state, CardState::Present);
        assert_eq!(card.applications.len(), 2);
        assert_eq!(card.applications[0].app_type, AppType::Sim);
        assert_eq!(
            card.applications[0].perso_substate,
            PersoSubstate::SimNetwork
        );
        assert_eq!(card.applications[1].app_type, AppType::Ruim);
        assert_eq!(
            card.applications[1].perso_substate,
            PersoSubstate::RuimNetwork1
        );
    }

    #[test]
    fn it_reports_absent_card_without_applications() {
        let card = CardStatus::from_status(SimStatus::Absent);

        assert_eq!(card.card_state, CardState::Absent);
        assert!(card.applications.is_empty());
        assert_eq!(card.gsm_umts_subscription_app_index, NO_APP);
    }

    #[tokio::test]
    async fn it_derives_sim_status_from_radio_state_without_querying() {
        let h = Harness::new(silent());

        assert_eq!(h.ril.sim_status().await, SimStatus::NotReady);
        h.ril.radio.transition(RadioState::Off);
        assert_eq!(h.ril.sim_status().await, SimStatus::Absent);
    }

    #[tokio::test]
    async fn it_maps_sim_not_inserted_to_absent() {
        let h = Harness::new(scripted(vec![
            ("AT+CPIN?", error("+CME ERROR: 10")),
            ("AT+CPIN?", error("+CME ERROR: 13")),
            ("AT+CPIN?", closed()),
        ]));
        h.ril.radio.transition(RadioState::On);

        assert_eq!(h.ril.sim_status().await, SimStatus::Absent);
        assert_eq!(h.ril.sim_status().await, SimStatus::NotReady);
        assert_eq!(h.ril.sim_status().await, SimStatus::NotReady);
    }

    #[tokio::test]
    async fn it_reschedules_poll_while_sim_not_ready() {
        // Arrange
        let mut h = Harness::new(scripted(vec![("AT+CPIN?", error("+CME ERROR: 14"))]));
        h.ril.radio.transition(RadioState::On);

        // Act
        h.ril.poll_sim_state().await;

        // Assert
        assert!(h.notifications().is_empty());
        assert_eq!(
            h.scheduled(),
            vec![(Deferred::PollSimState, Duration::from_secs(1))]
        );
    }

    #[tokio::test]
    async fn it_configures_sms_before_reporting_sim_ready() {
        let mut h = Harness::new(scripted(vec![
            ("AT+CPIN?", ok(&["+CPIN: READY"])),
            ("AT+CSMS=1", ok(&["+CSMS: 1,1,1"])),
            ("AT+CNMI=1,2,2,1,1", ok(&[])),
        ]));
        h.ril.radio.transition(RadioState::On);

        h.ril.poll_sim_state().await;

        assert_eq!(h.notifications(), vec![Notification::SimStatusChanged]);
        assert!(h.scheduled().is_empty());
    }

    #[tokio::test]
    async fn it_skips_poll_when_radio_is_not_on() {
        let mut h = Harness::new(silent());
        h.ril.radio.transition(RadioState::Off);

        h.ril.poll_sim_state().await;

        assert!(h.notifications().is_empty());
    }

    #[tokio::test]
    async fn it_returns_remaining_retries_on_wrong_pin() {
        // Arrange
        let mut h = Harness::new(scripted(vec![
            ("AT+CPIN?", ok(&["+CPIN: SIM PIN"])),
            ("AT+CPIN=0000", error("+CME ERROR: 16")),
            ("AT+CPINR=SIM PIN", ok(&["+CPINR: SIM PIN,2,3"])),
            ("AT+CPIN?", ok(&["+CPIN: SIM PIN"])),
        ]));
        h.ril.radio.transition(RadioState::On);

        // Act
        let completion = h.dispatch(crate::request::Request::EnterSimPin {
            pin: "0000".into(),
        })
        .await;

        // Assert
        assert_eq!(
            completion,
            Completion {
                outcome: Outcome::PasswordIncorrect,
                response: Some(Response::Int(2)),
            }
        );
    }

    #[tokio::test]
    async fn it_refuses_pin_when_sim_is_not_locked() {
        let mut h = Harness::new(scripted(vec![("AT+CPIN?", ok(&["+CPIN: READY"]))]));
        h.ril.radio.transition(RadioState::On);

        let result = h.ril.enter_sim_pin("1234").await;

        assert!(matches!(result, Err(RilError::SimState)));
    }

    #[tokio::test]
    async fn it_reads_sim_file() {
        let h = Harness::new(scripted(vec![(
            "AT+CRSM=176,28589,0,0,4",
            ok(&["+CRSM: 144,0,\"00000003\""]),
        )]));

        let result = h
            .ril
            .sim_io(&SimIo {
                command: 176,
                fileid: 28589,
                path: Some("3F00".into()),
                p1: 0,
                p2: 0,
                p3: 4,
                data: None,
                pin2: None,
            })
            .await
            .unwrap();

        assert_eq!(
            result,
            Response::SimIo(SimIoResponse {
                sw1: 144,
                sw2: 0,
                response: Some("00000003".into())
            })
        );
    }

    #[tokio::test]
    async fn it_merges_enabled_facility_lock_classes() {
        let h = Harness::new(scripted(vec![(
            "AT+CLCK=\"AO\",2,\"1234\",7",
            ok(&["+CLCK: 1,1", "+CLCK: 0,2", "+CLCK: 1,4"]),
        )]));

        let result = h.ril.query_facility_lock("AO", "1234", 7).await.unwrap();

        assert_eq!(result, Response::Int(5));
    }

    #[tokio::test]
    async fn it_classifies_facility_lock_rejection() {
        let h = Harness::new(scripted(vec![
            ("AT+CLCK=\"SC\",1,\"0000\",7", error("+CME ERROR: 16")),
            ("AT+CPINR=SIM PIN", ok(&["+CPINR: SIM PIN,1"])),
        ]));

        let err = h
            .ril
            .set_facility_lock("SC", true, "0000", 7)
            .await
            .unwrap_err();

        assert_eq!(err.outcome(), Outcome::PasswordIncorrect);
        assert_eq!(err.payload(), Some(Response::Int(1)));
    }
}
