//! Call forwarding, barring passwords, USSD and SIM toolkit.

use crate::{
    at::{ParseError, Tokenizer},
    error::{Accepted as _, RilError},
    request::Response,
    ril::Ril,
};
use serde::{Deserialize, Serialize};

/// Service class used when the stack passes 0: voice, data and fax.
const DEFAULT_SERVICE_CLASS: i32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallForwardInfo {
    pub status: i32,
    pub reason: i32,
    pub service_class: i32,
    #[serde(default)]
    pub toa: i32,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub time_seconds: i32,
}

/// `+CCFC: status,class[,number,type[,subaddr,satype[,time]]]`
fn parse_ccfc(line: &str, reason: i32) -> Result<CallForwardInfo, ParseError> {
    let mut tok = Tokenizer::start(line)?;
    let mut info = CallForwardInfo {
        status: tok.next_int()?,
        reason,
        service_class: tok.next_int()?,
        toa: 0,
        number: None,
        time_seconds: 0,
    };

    if !tok.has_more() {
        return Ok(info);
    }
    info.number = Some(tok.next_str()?.to_owned());
    info.toa = tok.next_int()?;

    if !tok.has_more() {
        return Ok(info);
    }
    let _subaddr = tok.next_str()?;
    let _satype = tok.next_str()?;

    if !tok.has_more() {
        return Ok(info);
    }
    info.time_seconds = tok.next_int()?;

    Ok(info)
}

impl Ril {
    pub(crate) async fn query_call_forward_status(
        &self,
        reason: i32,
        service_class: i32,
    ) -> Result<Response, RilError> {
        let service_class = match service_class {
            0 => DEFAULT_SERVICE_CLASS,
            class => class,
        };
        let response = self
            .at
            .multiline(format!("AT+CCFC={reason},2,,,{service_class}"), "+CCFC:")
            .await?
            .accepted()?;

        let forwards = response
            .intermediates
            .iter()
            .map(|line| parse_ccfc(line, reason))
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(Response::CallForwards(forwards))
    }

    pub(crate) async fn set_call_forward(
        &self,
        info: &CallForwardInfo,
    ) -> Result<Response, RilError> {
        // disable, enable, registration and erasure
        if !matches!(info.status, 0 | 1 | 3 | 4) {
            return Err(RilError::Failed(format!(
                "invalid call forward status {}",
                info.status
            )));
        }

        self.at
            .command(format!(
                "AT+CCFC={},{},\"{}\",{},{},,,{}",
                info.reason,
                info.status,
                info.number.as_deref().unwrap_or_default(),
                info.toa,
                info.service_class,
                info.time_seconds
            ))
            .await?
            .accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn change_barring_password(
        &self,
        facility: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<Response, RilError> {
        self.at
            .command(format!(
                "AT+CPWD=\"{facility}\",\"{old_password}\",\"{new_password}\""
            ))
            .await?
            .accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn cancel_ussd(&self) -> Result<Response, RilError> {
        self.at.command("AT+CUSD=2").await?.accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn stk_terminal_response(
        &self,
        contents: &str,
    ) -> Result<Response, RilError> {
        self.at
            .singleline(format!("AT+CUSATT={contents}"), "+CUSATT:")
            .await?
            .accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn stk_envelope(&self, contents: &str) -> Result<Response, RilError> {
        self.at
            .singleline(format!("AT+CUSATE={contents}"), "+CUSATE:")
            .await?
            .accepted()?;

        Ok(Response::Empty)
    }
}
