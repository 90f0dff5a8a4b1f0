//! Packet data contexts: allocation, activation, teardown and the merged
//! context list reported to the telephony stack.

use crate::{
    at::{At, ParseError, Tokenizer},
    error::{Accepted as _, RilError},
    notification::Notification,
    request::Response,
    ril::Ril,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::LazyLock};
use tracing::{debug, error, info, warn};

const PROTOCOLS: [&str; 3] = ["IP", "IPV6", "IPV4V6"];
const DEFAULT_PROTOCOL: &str = "IP";

/// Activation state reported for contexts brought up by a setup request.
const ACTIVE_UP: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupDataCall {
    #[serde(default)]
    pub radio_technology: i32,
    #[serde(default)]
    pub profile: i32,
    pub apn: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth_type: i32,
    /// `IP`, `IPV6` or `IPV4V6`. Defaults to `IP`.
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataContext {
    pub cid: i32,
    /// 0 inactive, 1 active, 2 active and link up.
    pub active: i32,
    pub ifname: String,
    pub address: Option<String>,
    pub gateway: Option<String>,
    /// Space separated.
    pub dns: Option<String>,
    pub protocol: String,
    pub status: i32,
    pub suggested_retry_time: i32,
}

impl DataContext {
    /// Entry for a context only known from `AT+CGACT?`.
    fn from_activation(cid: i32, active: i32) -> Self {
        Self {
            cid,
            active,
            ifname: String::new(),
            address: None,
            gateway: None,
            dns: None,
            protocol: String::new(),
            status: -1,
            suggested_retry_time: -1,
        }
    }

    /// Takes over the dynamic parameters, keeping the activation state.
    fn merge(&mut self, params: DataContext) {
        self.status = params.status;
        self.protocol = params.protocol;
        self.ifname = params.ifname;
        self.address = params.address;
        self.gateway = params.gateway;
        self.dns = params.dns;
    }
}

/// `+CGACT: cid,state`
fn parse_cgact(line: &str) -> Result<(i32, i32), ParseError> {
    let mut tok = Tokenizer::start(line)?;

    Ok((tok.next_int()?, tok.next_int()?))
}

/// `+CGCONTRDP: cid,bearer,apn[,addr/mask[,gw[,dns1[,dns2]]]]`
pub fn parse_cgcontrdp(line: &str, ifname_prefix: &str) -> Result<DataContext, ParseError> {
    let mut tok = Tokenizer::start(line)?;
    let cid = tok.next_int()?;
    let bearer = tok.next_int()?;
    let _apn = tok.next_str()?;

    let mut context = DataContext {
        cid,
        active: ACTIVE_UP,
        ifname: format!("{ifname_prefix}{bearer}"),
        address: None,
        gateway: None,
        dns: None,
        protocol: DEFAULT_PROTOCOL.to_owned(),
        status: 0,
        suggested_retry_time: -1,
    };

    if !tok.has_more() {
        return Ok(context);
    }
    context.address = Some(tok.next_str()?.to_owned());

    if !tok.has_more() {
        return Ok(context);
    }
    context.gateway = Some(tok.next_str()?.to_owned());

    if !tok.has_more() {
        return Ok(context);
    }
    let dns1 = tok.next_str()?;
    context.dns = Some(if tok.has_more() {
        format!("{dns1} {}", tok.next_str()?)
    } else {
        dns1.to_owned()
    });

    Ok(context)
}

static CONTEXT_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\((\d+)-(\d+)\)").expect("valid regex"));

/// Highest context id of the `(start-end)` ranges leading each `+CGDCONT: ` line.
fn parse_context_ranges<S: AsRef<str>>(lines: &[S]) -> Option<u32> {
    lines
        .iter()
        .filter_map(|line| {
            let (_, rest) = line.as_ref().split_once(':')?;
            CONTEXT_RANGE.captures(rest)?[2].parse::<u32>().ok()
        })
        .max()
}

/// Number of contexts the modem supports, never less than `default`.
pub async fn query_max_contexts(at: &At, default: u32) -> u32 {
    let response = match at.multiline("AT+CGDCONT=?", "+CGDCONT:").await {
        Ok(response) if response.success => response,
        Ok(response) => {
            warn!("AT+CGDCONT=? rejected: {}", response.final_response);
            return default;
        }
        Err(e) => {
            warn!("AT+CGDCONT=? failed: {e}");
            return default;
        }
    };

    let max = parse_context_ranges(&response.intermediates)
        .map_or(default, |end| end.max(default));
    info!(max, "data contexts");

    max
}

impl Ril {
    /// Reuses the first inactive context, else the lowest id the modem did not
    /// report.
    pub(crate) async fn find_free_context(&self) -> Result<u32, RilError> {
        let response = self.at.multiline("AT+CGACT?", "+CGACT:").await?.accepted()?;

        let mut used = BTreeSet::new();
        for line in &response.intermediates {
            let (cid, state) = parse_cgact(line)?;
            let Ok(cid) = u32::try_from(cid) else {
                continue;
            };
            if state == 0 {
                return Ok(cid);
            }
            if cid <= self.max_data_contexts {
                used.insert(cid);
            }
        }

        (1..=self.max_data_contexts)
            .find(|cid| !used.contains(cid))
            .ok_or_else(|| RilError::Failed("no free data context".to_owned()))
    }

    pub(crate) async fn setup_data_call(
        &self,
        setup: &SetupDataCall,
    ) -> Result<Response, RilError> {
        let protocol = setup.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL);
        if !PROTOCOLS.contains(&protocol) {
            return Err(RilError::Failed(format!("unsupported protocol {protocol}")));
        }

        let cid = self.find_free_context().await?;
        info!(cid, apn = %setup.apn, protocol, "setting up data call");

        self.at
            .command(format!(
                "AT+CGDCONT={cid},\"{protocol}\",\"{}\",,0,0",
                setup.apn
            ))
            .await?
            .accepted()?;

        // default QoS, packet domain events, then restart the context
        self.send_best_effort(format!("AT+CGQREQ={cid}")).await;
        self.send_best_effort(format!("AT+CGQMIN={cid}")).await;
        self.send_best_effort("AT+CGEREP=1,0".to_owned()).await;
        self.send_best_effort(format!("AT+CGACT=0,{cid}")).await;
        self.send_best_effort(format!("ATD*99***{cid}#")).await;

        let response = self
            .at
            .singleline(format!("AT+CGCONTRDP={cid}"), "+CGCONTRDP:")
            .await?
            .accepted()?;
        let context = parse_cgcontrdp(response.line()?, &self.config.interface_prefix)?;

        let configured = match &context.address {
            Some(address) => self.netif.configure(&context.ifname, address).await,
            None => Err(color_eyre::eyre::eyre!("no address assigned to context {cid}")),
        };
        if let Err(e) = configured {
            if let Err(e) = self.netif.deconfigure(&context.ifname).await {
                debug!(ifname = %context.ifname, "deconfigure after failed setup: {e}");
            }
            return Err(RilError::Interface(e));
        }

        Ok(Response::DataCall(context))
    }

    pub(crate) async fn deactivate_data_call(&self, cid: u32) -> Result<Response, RilError> {
        if cid == 0 {
            return Err(RilError::Failed("invalid context id 0".to_owned()));
        }

        self.at.command(format!("AT+CGACT=0,{cid}")).await?.accepted()?;
        // leaves the context undefined
        self.at.command(format!("AT+CGDCONT={cid}")).await?.accepted()?;

        let ifname = format!("{}{}", self.config.interface_prefix, cid - 1);
        self.netif
            .deconfigure(&ifname)
            .await
            .map_err(RilError::Interface)?;
        info!(cid, "data call deactivated");

        Ok(Response::Empty)
    }

    pub(crate) async fn data_contexts(&self) -> Result<Vec<DataContext>, RilError> {
        let response = self.at.multiline("AT+CGACT?", "+CGACT:").await?.accepted()?;
        let mut contexts = response
            .intermediates
            .iter()
            .map(|line| {
                parse_cgact(line).map(|(cid, state)| DataContext::from_activation(cid, state))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        let response = self
            .at
            .multiline("AT+CGCONTRDP", "+CGCONTRDP:")
            .await?
            .accepted()?;
        for line in &response.intermediates {
            let params = parse_cgcontrdp(line, &self.config.interface_prefix)?;
            match contexts.iter_mut().find(|c| c.cid == params.cid) {
                Some(context) => context.merge(params),
                None => debug!(cid = params.cid, "dropping parameters of unknown context"),
            }
        }

        Ok(contexts)
    }

    pub(crate) async fn data_call_list(&self) -> Result<Response, RilError> {
        Ok(Response::DataCalls(self.data_contexts().await?))
    }

    /// Unsolicited variant of [`Ril::data_call_list`].
    pub(crate) async fn refresh_data_calls(&self) {
        let contexts = match self.data_contexts().await {
            Ok(contexts) => Some(contexts),
            Err(e) => {
                error!("data call list refresh failed: {e}");
                None
            }
        };

        self.notifier
            .notify(Notification::DataCallListChanged(contexts));
    }

    async fn send_best_effort(&self, command: String) {
        match self.at.command(command.as_str()).await {
            Ok(response) if !response.success => {
                warn!(%command, "rejected: {}", response.final_response)
            }
            Ok(_) => {}
            Err(e) => warn!(%command, "failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        at::testing::{error, ok, scripted, silent},
        error::Outcome,
        netif::MockNetIface,
        ril::testing::Harness,
    };
    use mockall::predicate::eq;

    const PARAMS_1: &str =
        r#"+CGCONTRDP: 1,5,"internet","10.0.0.2/24","10.0.0.1","8.8.8.8","8.8.4.4""#;

    fn setup_request() -> SetupDataCall {
        SetupDataCall {
            radio_technology: 0,
            profile: 0,
            apn: "internet".to_owned(),
            user: None,
            password: None,
            auth_type: 0,
            protocol: None,
        }
    }

    #[test]
    fn it_parses_context_parameters_of_varying_length() {
        let full = parse_cgcontrdp(PARAMS_1, "rmnet").unwrap();
        assert_eq!(
            full,
            DataContext {
                cid: 1,
                active: 2,
                ifname: "rmnet5".into(),
                address: Some("10.0.0.2/24".into()),
                gateway: Some("10.0.0.1".into()),
                dns: Some("8.8.8.8 8.8.4.4".into()),
                protocol: "IP".into(),
                status: 0,
                suggested_retry_time: -1,
            }
        );

        let bare = parse_cgcontrdp(r#"+CGCONTRDP: 3,6,"ims""#, "wwan").unwrap();
        assert_eq!(bare.ifname, "wwan6");
        assert_eq!(bare.address, None);
        assert_eq!(bare.dns, None);

        assert!(parse_cgcontrdp("+CGCONTRDP: 3", "rmnet").is_err());
    }

    #[test]
    fn it_finds_highest_context_range() {
        let lines = [
            r#"+CGDCONT: (1-11),"IP",,,(0-2),(0-4)"#,
            r#"+CGDCONT: (1-16),"IPV6",,,(0-2),(0-4)"#,
        ];

        assert_eq!(parse_context_ranges(&lines), Some(16));
        assert_eq!(parse_context_ranges(&["+CGDCONT: \"IP\""]), None);
    }

    #[tokio::test]
    async fn it_keeps_default_context_count_when_probe_fails() {
        let at = scripted(vec![("AT+CGDCONT=?", error("ERROR"))]);

        assert_eq!(query_max_contexts(&at, 1).await, 1);
    }

    #[tokio::test]
    async fn it_merges_parameters_into_activation_state() {
        // Arrange
        let h = Harness::new(scripted(vec![
            ("AT+CGACT?", ok(&["+CGACT: 1,1", "+CGACT: 3,0"])),
            (
                "AT+CGCONTRDP",
                ok(&[
                    PARAMS_1,
                    r#"+CGCONTRDP: 3,6,"ims""#,
                    r#"+CGCONTRDP: 5,7,"mms","10.0.1.2/24""#,
                ]),
            ),
        ]));

        // Act
        let contexts = h.ril.data_contexts().await.unwrap();

        // Assert
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].cid, 1);
        assert_eq!(contexts[0].active, 1);
        assert_eq!(contexts[0].ifname, "rmnet5");
        assert_eq!(contexts[0].address.as_deref(), Some("10.0.0.2/24"));
        assert_eq!(contexts[0].status, 0);
        assert_eq!(contexts[1].cid, 3);
        assert_eq!(contexts[1].active, 0);
        assert_eq!(contexts[1].ifname, "rmnet6");
        assert_eq!(contexts[1].address, None);
        assert_eq!(contexts[1].suggested_retry_time, -1);
    }

    #[tokio::test]
    async fn it_reuses_inactive_context() {
        let mut h = Harness::new(scripted(vec![(
            "AT+CGACT?",
            ok(&["+CGACT: 1,1", "+CGACT: 2,0", "+CGACT: 3,0"]),
        )]));
        h.ril.max_data_contexts = 4;

        assert_eq!(h.ril.find_free_context().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn it_allocates_lowest_unreported_context() {
        let mut h = Harness::new(scripted(vec![(
            "AT+CGACT?",
            ok(&["+CGACT: 1,1", "+CGACT: 3,1", "+CGACT: 9,1"]),
        )]));
        h.ril.max_data_contexts = 4;

        assert_eq!(h.ril.find_free_context().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn it_fails_when_every_context_is_active() {
        let mut h = Harness::new(scripted(vec![(
            "AT+CGACT?",
            ok(&["+CGACT: 1,1", "+CGACT: 2,1"]),
        )]));
        h.ril.max_data_contexts = 2;

        assert!(h.ril.find_free_context().await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn it_sets_up_data_call_and_configures_interface() {
        // Arrange
        let mut netif = MockNetIface::new();
        netif
            .expect_configure()
            .with(eq("rmnet5"), eq("10.0.0.2/24"))
            .times(1)
            .returning(|_, _| Ok(()));
        netif.expect_deconfigure().never();
        let mut h = Harness::with_netif(
            scripted(vec![
                ("AT+CGACT?", ok(&[])),
                ("AT+CGDCONT=1,\"IP\",\"internet\",,0,0", ok(&[])),
                ("AT+CGQREQ=1", ok(&[])),
                ("AT+CGQMIN=1", error("ERROR")),
                ("AT+CGEREP=1,0", ok(&[])),
                ("AT+CGACT=0,1", ok(&[])),
                ("ATD*99***1#", ok(&[])),
                ("AT+CGCONTRDP=1", ok(&[PARAMS_1])),
            ]),
            netif,
        );
        h.ril.max_data_contexts = 1;

        // Act
        let result = h.ril.setup_data_call(&setup_request()).await;

        // Assert
        let Ok(Response::DataCall(context)) = result else {
            panic!("expected a data call");
        };
        assert_eq!(context.ifname, "rmnet5");
        assert_eq!(context.active, 2);
        assert_eq!(context.gateway.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn it_deconfigures_when_interface_setup_fails() {
        // Arrange
        let mut netif = MockNetIface::new();
        netif
            .expect_configure()
            .times(1)
            .returning(|_, _| Err(color_eyre::eyre::eyre!("ip failed")));
        netif
            .expect_deconfigure()
            .with(eq("rmnet5"))
            .times(1)
            .returning(|_| Ok(()));
        let mut h = Harness::with_netif(
            scripted(vec![
                ("AT+CGACT?", ok(&["+CGACT: 1,0"])),
                ("AT+CGDCONT=1,\"IPV4V6\",\"internet\",,0,0", ok(&[])),
                ("AT+CGQREQ=1", ok(&[])),
                ("AT+CGQMIN=1", ok(&[])),
                ("AT+CGEREP=1,0", ok(&[])),
                ("AT+CGACT=0,1", ok(&[])),
                ("ATD*99***1#", ok(&[])),
                ("AT+CGCONTRDP=1", ok(&[PARAMS_1])),
            ]),
            netif,
        );
        h.ril.radio.transition(crate::radio::RadioState::On);
        let request = SetupDataCall {
            protocol: Some("IPV4V6".to_owned()),
            ..setup_request()
        };

        // Act
        let completion = h.dispatch(crate::request::Request::SetupDataCall(request)).await;

        // Assert
        assert_eq!(completion.outcome, Outcome::GenericFailure);
        assert_eq!(completion.response, None);
    }

    #[tokio::test]
    async fn it_fails_setup_when_context_definition_is_rejected() {
        let mut netif = MockNetIface::new();
        netif.expect_configure().never();
        netif.expect_deconfigure().never();
        let h = Harness::with_netif(
            scripted(vec![
                ("AT+CGACT?", ok(&[])),
                ("AT+CGDCONT=1,\"IP\",\"internet\",,0,0", error("+CME ERROR: 4")),
            ]),
            netif,
        );

        let err = h.ril.setup_data_call(&setup_request()).await.unwrap_err();

        assert_eq!(err.outcome(), Outcome::RequestNotSupported);
    }

    #[tokio::test]
    async fn it_rejects_unknown_protocol_without_touching_modem() {
        let h = Harness::new(silent());
        let request = SetupDataCall {
            protocol: Some("PPP".to_owned()),
            ..setup_request()
        };

        assert!(h.ril.setup_data_call(&request).await.is_err());
    }

    #[tokio::test]
    async fn it_tears_down_context_and_interface() {
        // Arrange
        let mut netif = MockNetIface::new();
        netif
            .expect_deconfigure()
            .with(eq("rmnet1"))
            .times(1)
            .returning(|_| Ok(()));
        let h = Harness::with_netif(
            scripted(vec![("AT+CGACT=0,2", ok(&[])), ("AT+CGDCONT=2", ok(&[]))]),
            netif,
        );

        // Act
        let result = h.ril.deactivate_data_call(2).await;

        // Assert
        assert_eq!(result.unwrap(), Response::Empty);
    }

    #[tokio::test]
    async fn it_keeps_interface_when_deactivation_is_rejected() {
        let mut netif = MockNetIface::new();
        netif.expect_deconfigure().never();
        let h = Harness::with_netif(
            scripted(vec![("AT+CGACT=0,2", error("ERROR"))]),
            netif,
        );

        assert!(h.ril.deactivate_data_call(2).await.is_err());
    }

    #[tokio::test]
    async fn it_notifies_failed_refresh_without_list() {
        let h = Harness::new(scripted(vec![("AT+CGACT?", error("ERROR"))]));

        h.ril.refresh_data_calls().await;

        assert_eq!(
            h.notifications(),
            vec![Notification::DataCallListChanged(None)]
        );
    }
}
