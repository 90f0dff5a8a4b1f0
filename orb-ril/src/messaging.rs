//! SMS in PDU mode and service centre configuration.

use crate::{
    at::{ParseError, Tokenizer},
    error::{Accepted as _, RilError},
    request::Response,
    ril::Ril,
};
use serde::Serialize;
use tracing::{debug, warn};

/// Used when the stack does not name a service centre.
const DEFAULT_SMSC: &str = "00";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmsResponse {
    pub message_ref: i32,
    pub ack_pdu: Option<String>,
    /// -1 when unknown.
    pub error_code: i32,
}

fn parse_message_ref(line: &str) -> Result<i32, ParseError> {
    Tokenizer::start(line)?.next_int()
}

/// Length in octets of a hex encoded PDU, as `AT+CMGS`/`AT+CMGW` expect it.
fn pdu_len(pdu: &str) -> usize {
    pdu.len() / 2
}

impl Ril {
    pub(crate) async fn send_sms(
        &self,
        smsc: Option<&str>,
        pdu: &str,
    ) -> Result<Response, RilError> {
        let smsc = smsc.unwrap_or(DEFAULT_SMSC);
        let response = self
            .at
            .sms(
                format!("AT+CMGS={}", pdu_len(pdu)),
                format!("{smsc}{pdu}"),
                "+CMGS:",
            )
            .await?
            .accepted()?;

        let message_ref = response
            .line()
            .and_then(parse_message_ref)
            .unwrap_or_else(|e| {
                warn!("sms sent without a usable message reference: {e}");
                0
            });

        Ok(Response::Sms(SmsResponse {
            message_ref,
            ack_pdu: None,
            error_code: -1,
        }))
    }

    pub(crate) async fn write_sms_to_sim(
        &self,
        status: i32,
        pdu: &str,
    ) -> Result<Response, RilError> {
        self.at
            .sms(
                format!("AT+CMGW={},{status}", pdu_len(pdu)),
                pdu,
                "+CMGW:",
            )
            .await?
            .accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn delete_sms_on_sim(&self, index: i32) -> Result<Response, RilError> {
        self.at.command(format!("AT+CMGD={index}")).await?.accepted()?;

        Ok(Response::Empty)
    }

    /// The stack does not retry acknowledgements, so a rejected one is only
    /// logged.
    pub(crate) async fn sms_acknowledge(&self, success: bool) -> Result<Response, RilError> {
        let command = if success { "AT+CNMA=1" } else { "AT+CNMA=2" };
        match self.at.command(command).await {
            Ok(response) if !response.success => {
                debug!(command, "ack rejected: {}", response.final_response)
            }
            Ok(_) => {}
            Err(e) => debug!(command, "ack failed: {e}"),
        }

        Ok(Response::Empty)
    }

    pub(crate) async fn smsc_address(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+CSCA?", "+CSCA:").await?.accepted()?;
        let (_, rest) = response.line()?.split_once(':').ok_or(ParseError::NoPrefix)?;

        Ok(Response::Text(
            rest.strip_prefix(' ').unwrap_or(rest).to_owned(),
        ))
    }

    pub(crate) async fn set_smsc_address(&self, address: &str) -> Result<Response, RilError> {
        self.at.command(format!("AT+CSCA={address}")).await?.accepted()?;

        Ok(Response::Empty)
    }
}
