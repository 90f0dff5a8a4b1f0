//! Call list polling, caller name bookkeeping and call control.

use crate::{
    at::{ParseError, Tokenizer},
    error::{Accepted as _, RilError},
    request::Response,
    ril::{Deferred, Ril},
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Consecutive polls that may be failed while a call looks answered without
/// anyone answering it.
const MAX_REPOLLS: u8 = 4;
const MAX_NAME_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromPrimitive)]
pub enum CallState {
    Active = 0,
    Holding = 1,
    Dialing = 2,
    Alerting = 3,
    Incoming = 4,
    Waiting = 5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub index: u8,
    pub mobile_terminated: bool,
    pub state: CallState,
    pub voice: bool,
    pub multiparty: bool,
    pub number: Option<String>,
    pub number_type: i32,
    pub number_presentation: i32,
    pub name: Option<String>,
    pub name_presentation: i32,
}

/// Maps the `+CLCC` CLI validity onto a number presentation.
pub fn cli_validity_to_presentation(validity: i32) -> i32 {
    match validity {
        2 | 4 => 2,
        1 | 3 => validity,
        _ => 0,
    }
}

/// Some modems put text like `NOT AVAILABLE` where the number goes.
fn is_dialable(number: &str) -> bool {
    !number.is_empty() && number.chars().all(|c| c == '+' || c.is_ascii_digit())
}

/// `+CLCC: index,isMT,state,mode,isMpty[,number,type[,alpha[,priority[,CLI validity]]]]`
pub fn parse_clcc_line(line: &str) -> Result<CallRecord, ParseError> {
    let mut tok = Tokenizer::start(line)?;

    let index = tok.next_int()?;
    let index = u8::try_from(index).map_err(|_| ParseError::OutOfRange(index.into()))?;
    let mobile_terminated = tok.next_bool()?;
    let state = tok.next_int()?;
    let state = CallState::from_i32(state)
        .ok_or_else(|| ParseError::Unexpected(format!("call state {state}")))?;
    let voice = tok.next_int()? == 0;
    let multiparty = tok.next_bool()?;

    let mut call = CallRecord {
        index,
        mobile_terminated,
        state,
        voice,
        multiparty,
        number: None,
        number_type: 0,
        number_presentation: 0,
        name: None,
        name_presentation: 0,
    };

    if !tok.has_more() {
        return Ok(call);
    }
    let Ok(number) = tok.next_str() else {
        return Ok(call);
    };
    call.number = Some(number)
        .filter(|number| is_dialable(number))
        .map(str::to_owned);
    call.number_type = tok.next_int()?;

    if !tok.has_more() {
        return Ok(call);
    }
    // a malformed alpha ends the line but keeps the call
    let Ok(_alpha) = tok.next_str() else {
        return Ok(call);
    };
    if !tok.has_more() {
        return Ok(call);
    }
    let _priority = tok.next_int()?;
    if !tok.has_more() {
        return Ok(call);
    }
    call.number_presentation = cli_validity_to_presentation(tok.next_int()?);

    Ok(call)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerName {
    pub name: String,
    pub validity: i32,
}

impl CallerName {
    fn is_meaningful(&self) -> bool {
        !self.name.is_empty() || matches!(self.validity, 1 | 2)
    }
}

/// `+CNAP: "name",validity`
pub fn parse_cnap(line: &str) -> Result<CallerName, ParseError> {
    let mut tok = Tokenizer::start(line)?;
    let name = tok.next_str()?.chars().take(MAX_NAME_LEN).collect();
    let validity = tok.next_int()?;

    Ok(CallerName { name, validity })
}

/// Caller names and the erroneous-answer workaround, carried between polls.
#[derive(Debug, Default)]
pub struct CallTracker {
    /// Last `+CNAP`, not yet tied to a call.
    pending_name: Option<CallerName>,
    names: BTreeMap<u8, CallerName>,
    incoming_or_waiting: Option<u8>,
    repoll_count: u8,
    expect_answer: bool,
}

impl CallTracker {
    pub fn cache_caller_name(&mut self, name: CallerName) {
        self.pending_name = Some(name);
    }

    pub fn expect_answer(&mut self) {
        self.expect_answer = true;
    }

    /// Returns the incoming or waiting slot seen by the previous poll.
    fn begin_poll(&mut self) -> Option<u8> {
        self.incoming_or_waiting.take()
    }

    fn reconcile(
        &mut self,
        previous: Option<u8>,
        calls: &mut [CallRecord],
    ) -> Result<(), RilError> {
        for call in calls.iter() {
            if !matches!(call.state, CallState::Incoming | CallState::Waiting) {
                continue;
            }
            self.incoming_or_waiting = Some(call.index);
            if let Some(name) = self.pending_name.take_if(|name| name.is_meaningful()) {
                self.names.insert(call.index, name);
            }
        }

        self.names.retain(|slot, name| {
            let Some(call) = calls.iter_mut().find(|call| call.index == *slot) else {
                return false;
            };
            call.name = Some(name.name.clone());
            call.name_presentation = name.validity;
            true
        });

        // A call that was ringing now shows up active although nobody answered
        // it. The modem usually drops it on the next poll.
        if let Some(previous) = previous
            && self.incoming_or_waiting.is_none()
            && !self.expect_answer
            && self.repoll_count < MAX_REPOLLS
            && calls
                .iter()
                .any(|call| call.index == previous && call.state == CallState::Active)
        {
            self.repoll_count += 1;
            info!(repoll = self.repoll_count, "call became active without answer");
            return Err(RilError::RepollRequested(self.repoll_count));
        }

        self.expect_answer = false;
        self.repoll_count = 0;

        Ok(())
    }
}

impl Ril {
    pub(crate) async fn current_calls(&mut self) -> Result<Response, RilError> {
        let previous = self.calls.begin_poll();
        let response = self.at.multiline("AT+CLCC", "+CLCC:").await?.accepted()?;

        let mut calls: Vec<CallRecord> = response
            .intermediates
            .iter()
            .filter_map(|line| match parse_clcc_line(line) {
                Ok(call) => Some(call),
                Err(e) => {
                    error!(%line, "skipping call entry: {e}");
                    None
                }
            })
            .collect();

        self.calls.reconcile(previous, &mut calls)?;

        if calls
            .iter()
            .any(|call| !matches!(call.state, CallState::Active | CallState::Holding))
        {
            self.scheduler
                .schedule(Deferred::CallStateChanged, self.config.call_poll_interval);
        }

        Ok(Response::Calls(calls))
    }

    /// For commands whose outcome the stack learns from the next call poll.
    async fn send_unchecked(&self, command: String) -> Result<Response, RilError> {
        match self.at.command(command).await {
            Ok(response) if !response.success => {
                debug!("call control rejected: {}", response.final_response)
            }
            Ok(_) => {}
            Err(e) => debug!("call control failed: {e}"),
        }

        Ok(Response::Empty)
    }

    pub(crate) async fn dial(&self, address: &str, clir: i32) -> Result<Response, RilError> {
        let clir = match clir {
            1 => "I",
            2 => "i",
            _ => "",
        };

        self.send_unchecked(format!("ATD{address}{clir};")).await
    }

    pub(crate) async fn hangup(&self, index: u8) -> Result<Response, RilError> {
        self.send_unchecked(format!("AT+CHLD=1{index}")).await
    }

    pub(crate) async fn hangup_waiting_or_background(&self) -> Result<Response, RilError> {
        self.send_unchecked("AT+CHLD=0".to_owned()).await
    }

    pub(crate) async fn hangup_foreground_resume_background(
        &self,
    ) -> Result<Response, RilError> {
        self.send_unchecked("AT+CHLD=1".to_owned()).await
    }

    pub(crate) async fn switch_waiting_or_holding_and_active(
        &mut self,
    ) -> Result<Response, RilError> {
        let response = self.at.command("AT+CHLD=2").await;
        self.calls.expect_answer();
        response?.accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn answer(&mut self) -> Result<Response, RilError> {
        let result = self.send_unchecked("ATA".to_owned()).await;
        self.calls.expect_answer();

        result
    }

    pub(crate) async fn conference(&self) -> Result<Response, RilError> {
        self.at.command("AT+CHLD=3").await?.accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn udub(&self) -> Result<Response, RilError> {
        self.send_unchecked("ATH".to_owned()).await
    }

    pub(crate) async fn separate_connection(&self, party: u8) -> Result<Response, RilError> {
        if !(1..=9).contains(&party) {
            return Err(RilError::Failed(format!("invalid party {party}")));
        }
        self.at.command(format!("AT+CHLD=2{party}")).await?.accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn last_call_fail_cause(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+CEER", "+CEER:").await?.accepted()?;
        let mut tok = Tokenizer::start(response.line()?)?;

        Ok(Response::Int(tok.next_int()?))
    }

    pub(crate) async fn dtmf(&self, tone: char) -> Result<Response, RilError> {
        self.send_unchecked(format!("AT+VTS={tone}")).await
    }
}
