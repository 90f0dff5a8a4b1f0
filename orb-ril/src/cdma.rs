//! Requests only served while the modem is on a 3GPP2 technology.

use crate::{
    at::Tokenizer,
    error::{Accepted as _, RilError},
    notification::Notification,
    request::Response,
    ril::Ril,
};

const BASEBAND_VERSION: &str = "1.0.0.0";

/// MDN, SID, NID, MIN and PRL version of the emulated subscription.
const SUBSCRIPTION: [&str; 5] = ["8587777777", "1", "1", "8587777777", "1"];

fn strings<const N: usize>(values: [&str; N]) -> Response {
    Response::Strings(values.into_iter().map(|v| Some(v.to_owned())).collect())
}

impl Ril {
    pub(crate) fn baseband_version(&self) -> Result<Response, RilError> {
        Ok(Response::Text(BASEBAND_VERSION.to_owned()))
    }

    /// IMEI, IMEISV, ESN and MEID. Only the MEID comes from the modem.
    pub(crate) async fn device_identity(&self) -> Result<Response, RilError> {
        let response = self.at.numeric("AT+CGSN").await?.accepted()?;

        Ok(strings(["----", "----", "77777777", response.line()?]))
    }

    pub(crate) fn cdma_subscription(&self) -> Result<Response, RilError> {
        Ok(strings(SUBSCRIPTION))
    }

    pub(crate) async fn subscription_source(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+CCSS?", "+CCSS:").await?.accepted()?;
        let mut tok = Tokenizer::start(response.line()?)?;

        Ok(Response::Int(tok.next_int()?))
    }

    pub(crate) async fn set_subscription_source(
        &mut self,
        source: i32,
    ) -> Result<Response, RilError> {
        self.at.command(format!("AT+CCSS={source}")).await?.accepted()?;
        self.modem.subscription_source = source;
        self.notifier
            .notify(Notification::CdmaSubscriptionSourceChanged(source));

        Ok(Response::Empty)
    }

    pub(crate) async fn roaming_preference(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+WRMP?", "+WRMP:").await?.accepted()?;
        let mut tok = Tokenizer::start(response.line()?)?;

        Ok(Response::Int(tok.next_int()?))
    }

    pub(crate) async fn set_roaming_preference(
        &self,
        preference: i32,
    ) -> Result<Response, RilError> {
        self.at
            .command(format!("AT+WRMP={preference}"))
            .await?
            .accepted()?;

        Ok(Response::Empty)
    }

    pub(crate) async fn prl_version(&self) -> Result<Response, RilError> {
        let response = self.at.singleline("AT+WPRL?", "+WPRL:").await?.accepted()?;
        let mut tok = Tokenizer::start(response.line()?)?;

        Ok(Response::Text(tok.next_str()?.to_owned()))
    }

    pub(crate) async fn exit_emergency_callback_mode(&self) -> Result<Response, RilError> {
        self.at.command("AT+WSOS=0").await?.accepted()?;

        Ok(Response::Empty)
    }
}
