//! Registration, operator and signal queries, plus radio technology negotiation
//! over `AT+CTEC`.

use crate::{
    at::{At, Cme, ParseError, Tokenizer},
    error::{Accepted as _, CmeCode, RilError},
    notification::Notification,
    request::Response,
    ril::Ril,
};
use derive_more::Display;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;
use regex::Regex;
use serde::Serialize;
use std::{ops::BitOr, sync::LazyLock};
use tracing::{debug, error, info, warn};

/// Technology index as reported by `+CTEC`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Tech {
    Gsm = 0,
    Wcdma = 1,
    Cdma = 2,
    Evdo = 3,
    Lte = 4,
}

impl Tech {
    pub fn mask(self) -> TechMask {
        TechMask(1 << self as u32)
    }

    /// Only single-bit masks name a technology.
    pub fn from_mask(mask: TechMask) -> Option<Self> {
        [Tech::Gsm, Tech::Wcdma, Tech::Cdma, Tech::Evdo, Tech::Lte]
            .into_iter()
            .find(|tech| tech.mask() == mask)
    }

    pub fn radio_tech(self) -> RadioTech {
        match self {
            Tech::Gsm => RadioTech::Gprs,
            Tech::Wcdma => RadioTech::Hspa,
            Tech::Cdma => RadioTech::OneXRtt,
            Tech::Evdo => RadioTech::EvdoA,
            Tech::Lte => RadioTech::Lte,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TechMask(pub u32);

impl TechMask {
    pub const GSM: Self = Self(0x01);
    pub const WCDMA: Self = Self(0x02);
    pub const CDMA: Self = Self(0x04);
    pub const EVDO: Self = Self(0x08);
    pub const LTE: Self = Self(0x10);

    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TechMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.or(rhs)
    }
}

/// Technologies each network mode needs from the modem, indexed by mode.
const MODE_TECHS: [TechMask; 12] = [
    TechMask::GSM.or(TechMask::WCDMA),
    TechMask::GSM,
    TechMask::WCDMA,
    TechMask::GSM.or(TechMask::WCDMA),
    TechMask::CDMA.or(TechMask::EVDO),
    TechMask::CDMA,
    TechMask::EVDO,
    TechMask::GSM
        .or(TechMask::WCDMA)
        .or(TechMask::CDMA)
        .or(TechMask::EVDO),
    TechMask::LTE.or(TechMask::CDMA).or(TechMask::EVDO),
    TechMask::LTE.or(TechMask::GSM).or(TechMask::WCDMA),
    TechMask::LTE
        .or(TechMask::CDMA)
        .or(TechMask::EVDO)
        .or(TechMask::GSM)
        .or(TechMask::WCDMA),
    TechMask::LTE,
];

/// Preference mask written with `AT+CTEC` for each network mode. Mode 0 puts
/// WCDMA in the second byte to mark it as the fallback.
const MODE_PREFERENCE: [TechMask; 12] = [
    TechMask(TechMask::GSM.0 | (TechMask::WCDMA.0 << 8)),
    MODE_TECHS[1],
    MODE_TECHS[2],
    MODE_TECHS[3],
    MODE_TECHS[4],
    MODE_TECHS[5],
    MODE_TECHS[6],
    MODE_TECHS[7],
    MODE_TECHS[8],
    MODE_TECHS[9],
    MODE_TECHS[10],
    MODE_TECHS[11],
];

pub fn network_mode_possible(supported: TechMask, mode: i32) -> bool {
    usize::try_from(mode)
        .ok()
        .and_then(|mode| MODE_TECHS.get(mode))
        .is_some_and(|needed| supported.contains(*needed))
}

/// Radio access technology reported to the telephony stack.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, FromPrimitive, ToPrimitive,
)]
#[repr(i32)]
pub enum RadioTech {
    Unknown = 0,
    Gprs = 1,
    Edge = 2,
    Umts = 3,
    Is95A = 4,
    Is95B = 5,
    OneXRtt = 6,
    Evdo0 = 7,
    EvdoA = 8,
    Hsdpa = 9,
    Hsupa = 10,
    Hspa = 11,
    EvdoB = 12,
    Ehrpd = 13,
    Lte = 14,
}

impl RadioTech {
    pub fn is_3gpp2(self) -> bool {
        matches!(
            self,
            RadioTech::Is95A
                | RadioTech::Is95B
                | RadioTech::OneXRtt
                | RadioTech::Evdo0
                | RadioTech::EvdoA
                | RadioTech::EvdoB
                | RadioTech::Ehrpd
        )
    }
}

/// Probed at every connect, owned by the command context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemInfo {
    pub supported: TechMask,
    pub current: Tech,
    pub multimode: bool,
    /// Last preference mask written to or read from the modem.
    pub preferred: Option<TechMask>,
    pub subscription_source: i32,
}

impl Default for ModemInfo {
    fn default() -> Self {
        Self {
            supported: TechMask::GSM | TechMask::WCDMA | TechMask::LTE,
            current: Tech::Gsm,
            multimode: false,
            preferred: None,
            subscription_source: 0,
        }
    }
}

impl ModemInfo {
    /// Selects the CDMA request table.
    pub fn is_3gpp2(&self) -> bool {
        self.current.radio_tech().is_3gpp2()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TechResponse {
    Full { current: i32, preferred: TechMask },
    /// The modem only reported the current technology.
    Partial { current: i32 },
}

impl TechResponse {
    pub fn current(&self) -> i32 {
        match self {
            TechResponse::Full { current, .. } | TechResponse::Partial { current } => {
                *current
            }
        }
    }
}

pub fn parse_technology(line: &str) -> Result<TechResponse, ParseError> {
    let mut tok = Tokenizer::start(line)?;
    if !tok.has_more() {
        return Err(ParseError::Exhausted);
    }
    let current = tok.next_int()?;

    match tok.next_hex() {
        Ok(preferred) => Ok(TechResponse::Full {
            current,
            preferred: TechMask(preferred as u32),
        }),
        Err(_) => Ok(TechResponse::Partial { current }),
    }
}

pub async fn query_technology(at: &At) -> Result<TechResponse, RilError> {
    let response = at.singleline("AT+CTEC?", "+CTEC:").await?.accepted()?;

    Ok(parse_technology(response.line()?)?)
}

async fn query_supported_techs(at: &At) -> Result<TechMask, RilError> {
    let response = at.singleline("AT+CTEC=?", "+CTEC:").await?.accepted()?;
    let mut tok = Tokenizer::start(response.line()?)?;
    if !tok.has_more() {
        return Err(ParseError::Exhausted.into());
    }

    let mut supported = TechMask::default();
    while let Ok(tech) = tok.next_int() {
        match u32::try_from(tech).ok().and_then(|t| 1u32.checked_shl(t)) {
            Some(bit) => supported = supported | TechMask(bit),
            None => warn!(tech, "ignoring unknown technology in AT+CTEC=?"),
        }
    }

    Ok(supported)
}

/// Figures out whether the modem is multimode, CDMA-only or GSM-only.
pub async fn probe_modem(at: &At) -> ModemInfo {
    if let Ok(TechResponse::Full { current, preferred }) = query_technology(at).await
        && let Ok(supported) = query_supported_techs(at).await
    {
        let current = Tech::from_i32(current).unwrap_or_else(|| {
            warn!(current, "unknown current technology, assuming GSM");
            Tech::Gsm
        });
        info!(supported = supported.0, %current, "found multimode modem");

        return ModemInfo {
            supported,
            current,
            multimode: true,
            preferred: Some(preferred),
            ..ModemInfo::default()
        };
    }

    match at.singleline("AT+WNAM", "+WNAM:").await {
        Ok(response) if response.success => {
            info!("found CDMA modem");
            ModemInfo {
                supported: TechMask::CDMA | TechMask::EVDO,
                current: Tech::Cdma,
                ..ModemInfo::default()
            }
        }
        _ => {
            info!("found GSM modem");
            ModemInfo::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegField {
    Mode,
    Stat,
    Lac,
    Cid,
    NetworkType,
}

/// Field layout of `+CREG`/`+CGREG`, indexed by the number of commas.
const REGISTRATION_LAYOUTS: [&[RegField]; 5] = {
    use RegField::*;
    [
        &[Stat],
        &[Mode, Stat],
        &[Stat, Lac, Cid],
        &[Mode, Stat, Lac, Cid],
        &[Mode, Stat, Lac, Cid, NetworkType],
    ]
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub stat: i32,
    /// -1 when not reported.
    pub lac: i32,
    /// -1 when not reported.
    pub cid: i32,
    pub network_type: Option<i32>,
}

/// Decodes both the solicited (`n,stat,...`) and the unsolicited (`stat,...`)
/// forms, which can only be told apart by their arity.
pub fn parse_registration(line: &str) -> Result<Registration, ParseError> {
    let mut tok = Tokenizer::start(line)?;
    let commas = line
        .split_once(':')
        .map_or(0, |(_, rest)| rest.matches(',').count());
    let layout = REGISTRATION_LAYOUTS.get(commas).ok_or_else(|| {
        ParseError::Unexpected(format!("registration with {} fields", commas + 1))
    })?;

    let mut registration = Registration {
        stat: 0,
        lac: -1,
        cid: -1,
        network_type: None,
    };
    for field in *layout {
        match field {
            RegField::Mode => {
                tok.next_int()?;
            }
            RegField::Stat => registration.stat = tok.next_int()?,
            RegField::Lac => registration.lac = tok.next_hex()?,
            RegField::Cid => registration.cid = tok.next_hex()?,
            RegField::NetworkType => registration.network_type = Some(tok.next_hex()?),
        }
    }

    Ok(registration)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Voice,
    Data,
}

impl Domain {
    fn reply_len(self) -> usize {
        match self {
            Domain::Voice => 15,
            Domain::Data => 6,
        }
    }
}

/// Voice registration fields from index 3 onwards for 3GPP2 networks.
const CDMA_VOICE_REGISTRATION: [&str; 12] = [
    "8", "1", "123", "222", "0", "4", "65535", "0", "1", "0", "0", "0",
];

pub fn registration_reply(
    registration: &Registration,
    tech: RadioTech,
    domain: Domain,
) -> Vec<Option<String>> {
    let mut reply = vec![None; domain.reply_len()];
    reply[0] = Some(registration.stat.to_string());

    if tech.is_3gpp2() {
        match domain {
            Domain::Voice => {
                for (slot, value) in reply[3..].iter_mut().zip(CDMA_VOICE_REGISTRATION) {
                    *slot = Some(value.to_owned());
                }
            }
            Domain::Data => reply[3] = Some("8".to_owned()),
        }
        return reply;
    }

    if registration.lac >= 0 {
        reply[1] = Some(format!("{:x}", registration.lac));
    }
    if registration.cid >= 0 {
        reply[2] = Some(format!("{:x}", registration.cid));
    }
    reply[3] = registration.network_type.map(|t| t.to_string());

    reply
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalStrength {
    pub gw_signal_strength: i32,
    pub gw_bit_error_rate: i32,
    pub cdma_dbm: i32,
    pub cdma_ecio: i32,
    pub evdo_dbm: i32,
    pub evdo_ecio: i32,
    pub evdo_snr: i32,
    pub lte_signal_strength: i32,
    pub lte_rsrp: i32,
    pub lte_rsrq: i32,
    pub lte_rssnr: i32,
    pub lte_cqi: i32,
}

/// Only the GSM pair is required, the other fields default to -1.
pub fn parse_signal_strength(line: &str) -> Result<SignalStrength, ParseError> {
    let mut tok = Tokenizer::start(line)?;
    let mut values = [-1; 12];
    values[0] = tok.next_int()?;
    values[1] = tok.next_int()?;
    for slot in &mut values[2..] {
        if !tok.has_more() {
            break;
        }
        match tok.next_int() {
            Ok(value) => *slot = value,
            Err(_) => break,
        }
    }

    let [
        gw_signal_strength,
        gw_bit_error_rate,
        cdma_dbm,
        cdma_ecio,
        evdo_dbm,
        evdo_ecio,
        evdo_snr,
        lte_signal_strength,
        lte_rsrp,
        lte_rsrq,
        lte_rssnr,
        lte_cqi,
    ] = values;

    Ok(SignalStrength {
        gw_signal_strength,
        gw_bit_error_rate,
        cdma_dbm,
        cdma_ecio,
        evdo_dbm,
        evdo_ecio,
        evdo_snr,
        lte_signal_strength,
        lte_rsrp,
        lte_rsrq,
        lte_rssnr,
        lte_cqi,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStatus {
    Unknown,
    Available,
    Current,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorInfo {
    pub long_name: String,
    pub short_name: String,
    pub numeric: String,
    pub status: OperatorStatus,
}

static OPERATOR_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^\)]+)\)").expect("valid regex"));

/// Parses `+COPS: (2,"Long","Short","00101",7),(1,...),,(0-4),(0-2)`. Groups
/// without a quoted name are the trailing mode and format ranges.
pub fn parse_available_networks(line: &str) -> Result<Vec<OperatorInfo>, ParseError> {
    let mut operators = Vec::new();
    for group in OPERATOR_GROUP.captures_iter(line) {
        let group = &group[1];
        if !group.contains('"') {
            continue;
        }

        let mut tok = Tokenizer::bare(group);
        let status = match tok.next_int()? {
            1 => OperatorStatus::Available,
            2 => OperatorStatus::Current,
            3 => OperatorStatus::Forbidden,
            _ => OperatorStatus::Unknown,
        };
        operators.push(OperatorInfo {
            long_name: tok.next_str()?.to_owned(),
            short_name: tok.next_str()?.to_owned(),
            numeric: tok.next_str()?.to_owned(),
            status,
        });
    }

    Ok(operators)
}

impl Ril {
    pub(crate) async fn registration_state(
        &self,
        domain: Domain,
    ) -> Result<Response, RilError> {
        let (command, prefix) = match domain {
            Domain::Voice => ("AT+CREG?", "+CREG:"),
            Domain::Data => ("AT+CGREG?", "+CGREG:"),
        };
        let response = self.at.singleline(command, prefix).await?.accepted()?;
        let registration = parse_registration(response.line()?)?;

        Ok(Response::Strings(registration_reply(
            &registration,
            self.modem.current.radio_tech(),
            domain,
        )))
    }

    pub(crate) async fn operator(&self) -> Result<Response, RilError> {
        let response = self
            .at
            .multiline(
                "AT+COPS=3,0;+COPS?;+COPS=3,1;+COPS?;+COPS=3,2;+COPS?",
                "+COPS:",
            )
            .await?;

        // not registered yet
        if CmeCode::NoNetworkService.matches(response.cme()) {
            return Ok(Response::Strings(vec![None; 3]));
        }
        let response = response.accepted()?;
        if response.intermediates.len() != 3 {
            return Err(ParseError::Unexpected(format!(
                "expected 3 operator lines, got {}",
                response.intermediates.len()
            ))
            .into());
        }

        let mut names = Vec::with_capacity(3);
        for line in &response.intermediates {
            let mut tok = Tokenizer::start(line)?;
            let _mode = tok.next_int()?;
            if !tok.has_more() {
                names.push(None);
                continue;
            }
            let _format = tok.next_int()?;
            if !tok.has_more() {
                names.push(None);
                continue;
            }
            names.push(Some(tok.next_str()?.to_owned()));
        }

        Ok(Response::Strings(names))
    }

    pub(crate) async fn signal_strength(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+CSQ", "+CSQ:").await?.accepted()?;

        Ok(Response::SignalStrength(parse_signal_strength(
            response.line()?,
        )?))
    }

    pub(crate) fn voice_radio_tech(&self) -> Result<Response, RilError> {
        Ok(Response::Int(self.modem.current.radio_tech() as i32))
    }

    /// Records a technology change and tells the stack when the radio family
    /// changed with it.
    pub(crate) fn set_radio_technology(&mut self, tech: Tech) {
        let old = self.modem.current;
        if old == tech {
            return;
        }

        info!(%old, new = %tech, "radio technology changed");
        self.modem.current = tech;
        if old.radio_tech() != tech.radio_tech() {
            self.notifier
                .notify(Notification::VoiceRadioTechChanged(tech.radio_tech()));
        }
    }

    pub(crate) async fn set_preferred_network_type(
        &mut self,
        mode: i32,
    ) -> Result<Response, RilError> {
        if !network_mode_possible(self.modem.supported, mode) {
            return Err(RilError::ModeNotSupported(mode));
        }
        let preferred = MODE_PREFERENCE[mode as usize];
        if self.modem.preferred == Some(preferred) {
            debug!(mode, "preferred network type unchanged");
            return Ok(Response::Empty);
        }

        let current = query_technology(&self.at).await?.current();
        let response = self
            .at
            .singleline(
                format!("AT+CTEC={current},\"{:x}\"", preferred.0),
                "+CTEC:",
            )
            .await?
            .accepted()?;
        self.modem.preferred = Some(preferred);

        let line = response.line()?;
        if !line.contains("DONE") {
            match parse_technology(line).map(|reply| Tech::from_i32(reply.current())) {
                Ok(Some(tech)) => self.set_radio_technology(tech),
                Ok(None) => warn!(line, "unknown technology in +CTEC reply"),
                Err(e) => debug!(line, "unparsable +CTEC reply: {e}"),
            }
        }

        Ok(Response::Empty)
    }

    pub(crate) async fn get_preferred_network_type(&self) -> Result<Response, RilError> {
        let preferred = match query_technology(&self.at).await? {
            TechResponse::Full { preferred, .. } => preferred,
            TechResponse::Partial { .. } => {
                self.modem.preferred.ok_or(ParseError::Exhausted)?
            }
        };

        let mode = MODE_PREFERENCE
            .iter()
            .position(|mask| *mask == preferred)
            .ok_or_else(|| {
                error!(preferred = preferred.0, "unknown preferred mask from modem");
                RilError::Failed(format!("unknown preferred mask {:x}", preferred.0))
            })?;

        Ok(Response::Int(mode as i32))
    }

    pub(crate) async fn set_network_selection_automatic(
        &self,
    ) -> Result<Response, RilError> {
        self.at.command("AT+COPS=0").await?.accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn set_network_selection_manual(
        &self,
        operator: &str,
    ) -> Result<Response, RilError> {
        let response = self.at.command(format!("AT+COPS=1,2,{operator}")).await?;
        if response.cme() != Cme::Success {
            return Err(RilError::Rejected(response.cme()));
        }

        Ok(Response::Empty)
    }

    pub(crate) async fn query_network_selection_mode(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+COPS?", "+COPS:").await?.accepted()?;
        let mut tok = Tokenizer::start(response.line()?)?;

        Ok(Response::Int(tok.next_int()?))
    }

    pub(crate) async fn query_available_networks(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+COPS=?", "+COPS:").await?.accepted()?;

        Ok(Response::Operators(parse_available_networks(
            response.line()?,
        )?))
    }
}
