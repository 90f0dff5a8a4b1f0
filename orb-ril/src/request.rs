//! Operations accepted from the telephony stack and the payloads they complete with.

use crate::{
    calls::CallRecord,
    data::{DataContext, SetupDataCall},
    error::{Outcome, RilError},
    messaging::SmsResponse,
    network::{OperatorInfo, SignalStrength},
    sim::{CardStatus, SimIo, SimIoResponse},
    supplementary::CallForwardInfo,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    GetSimStatus,
    GetCurrentCalls,
    Dial {
        address: String,
        #[serde(default)]
        clir: i32,
    },
    Hangup {
        index: u8,
    },
    HangupWaitingOrBackground,
    HangupForegroundResumeBackground,
    SwitchWaitingOrHoldingAndActive,
    Answer,
    Conference,
    Udub,
    SeparateConnection {
        party: u8,
    },
    LastCallFailCause,
    SignalStrength,
    VoiceRegistrationState,
    DataRegistrationState,
    Operator,
    RadioPower {
        on: bool,
    },
    Dtmf {
        tone: char,
    },
    SetupDataCall(SetupDataCall),
    DeactivateDataCall {
        cid: u32,
    },
    DataCallList,
    SmsAcknowledge {
        success: bool,
    },
    GetImsi,
    GetImei,
    SimIo(SimIo),
    SendUssd {
        ussd: String,
    },
    CancelUssd,
    OemHookRaw(Vec<u8>),
    OemHookStrings(Vec<String>),
    WriteSmsToSim {
        status: i32,
        pdu: String,
    },
    DeleteSmsOnSim {
        index: i32,
    },
    EnterSimPin {
        pin: String,
    },
    EnterSimPuk {
        puk: String,
        new_pin: String,
    },
    ChangeSimPin {
        old_pin: String,
        new_pin: String,
    },
    EnterSimPin2 {
        pin2: String,
    },
    EnterSimPuk2 {
        puk2: String,
        new_pin2: String,
    },
    ChangeSimPin2 {
        old_pin2: String,
        new_pin2: String,
    },
    GetUnlockRetryCount {
        lock: String,
    },
    ScreenState {
        on: bool,
    },
    VoiceRadioTech,
    SetPreferredNetworkType {
        mode: i32,
    },
    GetPreferredNetworkType,
    GetSmscAddress,
    SetSmscAddress {
        address: String,
    },
    QueryCallForwardStatus {
        reason: i32,
        service_class: i32,
    },
    SetCallForward(CallForwardInfo),
    QueryFacilityLock {
        facility: String,
        password: String,
        service_class: i32,
    },
    SetFacilityLock {
        facility: String,
        lock: bool,
        password: String,
        service_class: i32,
    },
    ChangeBarringPassword {
        facility: String,
        old_password: String,
        new_password: String,
    },
    StkSendTerminalResponse {
        contents: String,
    },
    StkSendEnvelopeCommand {
        contents: String,
    },

    // GSM family
    SendSms {
        smsc: Option<String>,
        pdu: String,
    },
    SetNetworkSelectionAutomatic,
    SetNetworkSelectionManual {
        operator: String,
    },
    QueryNetworkSelectionMode,
    QueryAvailableNetworks,

    // CDMA family
    CdmaSendSms,
    BasebandVersion,
    DeviceIdentity,
    CdmaSubscription,
    CdmaGetSubscriptionSource,
    CdmaSetSubscriptionSource {
        source: i32,
    },
    CdmaQueryRoamingPreference,
    CdmaSetRoamingPreference {
        preference: i32,
    },
    CdmaPrlVersion,
    ExitEmergencyCallbackMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Empty,
    Int(i32),
    Ints(Vec<i32>),
    Text(String),
    Strings(Vec<Option<String>>),
    Raw(Vec<u8>),
    CardStatus(CardStatus),
    Calls(Vec<CallRecord>),
    SignalStrength(SignalStrength),
    DataCall(DataContext),
    DataCalls(Vec<DataContext>),
    SimIo(SimIoResponse),
    Sms(SmsResponse),
    CallForwards(Vec<CallForwardInfo>),
    Operators(Vec<OperatorInfo>),
}

/// Delivered exactly once per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub outcome: Outcome,
    pub response: Option<Response>,
}

impl From<Result<Response, RilError>> for Completion {
    fn from(result: Result<Response, RilError>) -> Self {
        match result {
            Ok(response) => Self {
                outcome: Outcome::Success,
                response: Some(response),
            },
            Err(e) => Self {
                outcome: e.outcome(),
                response: e.payload(),
            },
        }
    }
}
