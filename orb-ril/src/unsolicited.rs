//! Classifies lines the modem sends on its own. Runs on the reader side and
//! never issues commands: anything that needs the modem or command-context
//! state is handed to the command loop as a [`Deferred`] task.

use crate::{
    at::{ParseError, Tokenizer, channel::ReaderEvent},
    calls::parse_cnap,
    network::{Tech, parse_signal_strength, parse_technology},
    notification::{Notification, Notifier},
    radio::{RadioState, RadioStateCell},
    ril::{Deferred, Scheduler},
};
use color_eyre::Result;
use num_traits::FromPrimitive as _;
use std::time::Duration;
use tracing::{debug, error, info};

/// What a line means, before any side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Nitz(String),
    Ring,
    CallStateChanged,
    StkProactiveCommand(String),
    NetworkStateChanged,
    NewSms(String),
    SmsStatusReport(String),
    BroadcastSms(Vec<u8>),
    DataCallsChanged,
    TechnologyChanged(Tech),
    SubscriptionSource(i32),
    EmergencyCallbackMode(bool),
    PrlChanged(i32),
    RadioPower(RadioState),
    SignalStrength(crate::network::SignalStrength),
    CallerName(crate::calls::CallerName),
}

fn first_int(line: &str) -> Result<i32, ParseError> {
    Tokenizer::start(line)?.next_int()
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// First matching prefix wins. `Ok(None)` for lines nobody cares about.
fn classify(line: &str, pdu: Option<&str>) -> Result<Option<Event>, ParseError> {
    let pdu = || {
        pdu.map(str::to_owned)
            .ok_or_else(|| ParseError::Unexpected(format!("{line} without pdu")))
    };

    let event = if line.starts_with("%CTZV:") {
        Event::Nitz(unquote(Tokenizer::start(line)?.remainder().trim()).to_owned())
    } else if line.starts_with("+CRING:") || line.starts_with("RING") {
        Event::Ring
    } else if line.starts_with("NO CARRIER")
        || line.starts_with("+CCWA")
        || line.starts_with("CALL STATE CHANGED")
    {
        Event::CallStateChanged
    } else if line.starts_with("+CUSATP:") {
        Event::StkProactiveCommand(Tokenizer::start(line)?.next_str()?.to_owned())
    } else if line.starts_with("+CREG:") || line.starts_with("+CGREG:") {
        Event::NetworkStateChanged
    } else if line.starts_with("+CMT:") {
        Event::NewSms(pdu()?)
    } else if line.starts_with("+CDS:") {
        Event::SmsStatusReport(pdu()?)
    } else if line.starts_with("+CBM:") {
        let pdu = pdu()?;
        Event::BroadcastSms(
            hex::decode(&pdu).map_err(|e| ParseError::Unexpected(format!("{pdu}: {e}")))?,
        )
    } else if line.starts_with("+CGEV:") || line.starts_with("+CME ERROR: 150") {
        Event::DataCallsChanged
    } else if line.starts_with("+CTEC: ") {
        let current = parse_technology(line)?.current();
        let tech = Tech::from_i32(current)
            .ok_or_else(|| ParseError::Unexpected(format!("unknown technology {current}")))?;
        Event::TechnologyChanged(tech)
    } else if line.starts_with("+CCSS: ") {
        Event::SubscriptionSource(first_int(line)?)
    } else if line.starts_with("+WSOS: ") {
        Event::EmergencyCallbackMode(Tokenizer::start(line)?.next_bool()?)
    } else if line.starts_with("+WPRL: ") {
        Event::PrlChanged(first_int(line)?)
    } else if line.starts_with("+CFUN:") {
        match first_int(line)? {
            0 => Event::RadioPower(RadioState::Off),
            1 => Event::RadioPower(RadioState::On),
            other => return Err(ParseError::OutOfRange(other.into())),
        }
    } else if line.starts_with("+CSQ:") {
        Event::SignalStrength(parse_signal_strength(line)?)
    } else if line.starts_with("+CNAP:") {
        Event::CallerName(parse_cnap(line)?)
    } else {
        return Ok(None);
    };

    Ok(Some(event))
}

/// Reader-side half of the adapter.
#[derive(Debug, Clone)]
pub struct UnsolicitedHandler {
    radio: RadioStateCell,
    notifier: Notifier,
    scheduler: Scheduler,
}

impl UnsolicitedHandler {
    pub fn new(radio: RadioStateCell, notifier: Notifier, scheduler: Scheduler) -> Self {
        Self {
            radio,
            notifier,
            scheduler,
        }
    }

    /// Drains reader events until every reader is gone.
    pub async fn run(self, events: flume::Receiver<ReaderEvent>) -> Result<()> {
        while let Ok(event) = events.recv_async().await {
            self.handle(event);
        }
        debug!("unsolicited handler stopped");

        Ok(())
    }

    pub fn handle(&self, event: ReaderEvent) {
        match event {
            ReaderEvent::Unsolicited { line, pdu } => self.on_line(&line, pdu.as_deref()),
            ReaderEvent::Closed => {
                info!("at channel closed");
                if self.radio.close() {
                    self.notifier
                        .notify(Notification::RadioStateChanged(RadioState::Unavailable));
                }
            }
        }
    }

    fn on_line(&self, line: &str, pdu: Option<&str>) {
        // the stack polls for the initial state once the radio is up
        if self.radio.current() == RadioState::Unavailable {
            debug!(line, "ignoring unsolicited while unavailable");
            return;
        }

        match classify(line, pdu) {
            Ok(Some(event)) => self.apply(event),
            Ok(None) => debug!(line, "unhandled unsolicited"),
            Err(e) => error!(line, "malformed unsolicited: {e}"),
        }
    }

    fn defer(&self, task: Deferred) {
        self.scheduler.schedule(task, Duration::ZERO);
    }

    fn apply(&self, event: Event) {
        let notify = |notification| self.notifier.notify(notification);
        match event {
            Event::Nitz(time) => notify(Notification::NitzTimeReceived(time)),
            Event::Ring => {
                notify(Notification::CallRing);
                notify(Notification::CallStateChanged);
            }
            Event::CallStateChanged => {
                notify(Notification::CallStateChanged);
                self.defer(Deferred::RefreshDataCalls);
            }
            Event::StkProactiveCommand(pdu) => {
                info!(%pdu, "stk proactive command");
                notify(Notification::StkProactiveCommand(pdu));
            }
            Event::NetworkStateChanged => {
                notify(Notification::VoiceNetworkStateChanged);
                self.defer(Deferred::RefreshDataCalls);
            }
            Event::NewSms(pdu) => notify(Notification::NewSms(pdu)),
            Event::SmsStatusReport(pdu) => notify(Notification::NewSmsStatusReport(pdu)),
            Event::BroadcastSms(pdu) => notify(Notification::NewBroadcastSms(pdu)),
            Event::DataCallsChanged => self.defer(Deferred::RefreshDataCalls),
            Event::TechnologyChanged(tech) => self.defer(Deferred::TechnologyChanged(tech)),
            Event::SubscriptionSource(source) => {
                self.defer(Deferred::SubscriptionSourceChanged(source))
            }
            Event::EmergencyCallbackMode(true) => {
                notify(Notification::EnterEmergencyCallbackMode)
            }
            Event::EmergencyCallbackMode(false) => {
                notify(Notification::ExitEmergencyCallbackMode)
            }
            Event::PrlChanged(version) => notify(Notification::CdmaPrlChanged(version)),
            Event::RadioPower(state) => self.defer(Deferred::RadioPower(state)),
            Event::SignalStrength(strength) => notify(Notification::SignalStrength(strength)),
            Event::CallerName(name) => self.defer(Deferred::CallerName(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        at::testing::{ok, scripted},
        calls::CallerName,
        ril::{Scheduled, testing::Harness},
    };

    struct Setup {
        handler: UnsolicitedHandler,
        notifications: flume::Receiver<Notification>,
        scheduled: flume::Receiver<Scheduled>,
    }

    impl Setup {
        fn new(state: RadioState) -> Self {
            let (notify_tx, notifications) = flume::unbounded();
            let (schedule_tx, scheduled) = flume::unbounded();
            let radio = RadioStateCell::new();
            radio.transition(state);
            let handler = UnsolicitedHandler::new(
                radio,
                Notifier::new(notify_tx),
                Scheduler::new(schedule_tx),
            );

            Self {
                handler,
                notifications,
                scheduled,
            }
        }

        fn line(&self, line: &str) {
            self.handler.handle(ReaderEvent::Unsolicited {
                line: line.to_owned(),
                pdu: None,
            });
        }

        fn notifications(&self) -> Vec<Notification> {
            self.notifications.drain().collect()
        }

        fn deferred(&self) -> Vec<Deferred> {
            self.scheduled.drain().map(|s| s.task).collect()
        }
    }

    #[test]
    fn it_reports_ring_and_call_state() {
        let s = Setup::new(RadioState::On);

        s.line("RING");

        assert_eq!(
            s.notifications(),
            vec![Notification::CallRing, Notification::CallStateChanged]
        );
        assert!(s.deferred().is_empty());
    }

    #[test]
    fn it_refreshes_data_calls_on_network_changes() {
        // Arrange
        let s = Setup::new(RadioState::On);

        // Act
        s.line("+CREG: 1");
        s.line("+CGEV: NW DETACH");
        s.line("+CME ERROR: 150");
        s.line("NO CARRIER");

        // Assert
        assert_eq!(
            s.notifications(),
            vec![
                Notification::VoiceNetworkStateChanged,
                Notification::CallStateChanged
            ]
        );
        assert_eq!(s.deferred(), vec![Deferred::RefreshDataCalls; 4]);
    }

    #[test]
    fn it_ignores_lines_while_unavailable() {
        let s = Setup::new(RadioState::Unavailable);

        s.line("RING");
        s.line("+CFUN: 1");

        assert!(s.notifications().is_empty());
        assert!(s.deferred().is_empty());
    }

    #[test]
    fn it_decodes_broadcast_pdu() {
        let s = Setup::new(RadioState::Off);

        s.handler.handle(ReaderEvent::Unsolicited {
            line: "+CBM: 88".to_owned(),
            pdu: Some("00ff1a".to_owned()),
        });

        assert_eq!(
            s.notifications(),
            vec![Notification::NewBroadcastSms(vec![0x00, 0xff, 0x1a])]
        );
    }

    #[test]
    fn it_forwards_sms_pdu() {
        let s = Setup::new(RadioState::On);

        s.handler.handle(ReaderEvent::Unsolicited {
            line: "+CMT: ,23".to_owned(),
            pdu: Some("0791".to_owned()),
        });

        assert_eq!(s.notifications(), vec![Notification::NewSms("0791".into())]);
    }

    #[test]
    fn it_defers_known_technology_changes_only() {
        let s = Setup::new(RadioState::On);

        s.line("+CTEC: 3");
        s.line("+CTEC: 7");

        assert_eq!(s.deferred(), vec![Deferred::TechnologyChanged(Tech::Evdo)]);
        assert!(s.notifications().is_empty());
    }

    #[test]
    fn it_handles_cdma_events() {
        let s = Setup::new(RadioState::On);

        s.line("+CCSS: 1");
        s.line("+WSOS: 1");
        s.line("+WSOS: 0");
        s.line("+WPRL: 7");

        assert_eq!(s.deferred(), vec![Deferred::SubscriptionSourceChanged(1)]);
        assert_eq!(
            s.notifications(),
            vec![
                Notification::EnterEmergencyCallbackMode,
                Notification::ExitEmergencyCallbackMode,
                Notification::CdmaPrlChanged(7),
            ]
        );
    }

    #[test]
    fn it_follows_modem_radio_power() {
        // Arrange
        let s = Setup::new(RadioState::On);

        // Act
        s.line("+CFUN: 0");
        s.line("+CFUN: 0");
        s.line("+CFUN: 1");
        s.line("+CFUN: 4");

        // Assert
        assert!(s.notifications().is_empty());
        assert_eq!(
            s.deferred(),
            vec![
                Deferred::RadioPower(RadioState::Off),
                Deferred::RadioPower(RadioState::Off),
                Deferred::RadioPower(RadioState::On),
            ]
        );
    }

    #[tokio::test]
    async fn it_applies_modem_power_reports_in_arrival_order() {
        // Arrange
        let mut h = Harness::new(scripted(vec![("AT+CPIN?", ok(&["+CPIN: SIM PIN"]))]));
        h.ril.radio.transition(RadioState::Off);
        let handler = UnsolicitedHandler::new(
            h.ril.radio.clone(),
            h.ril.notifier.clone(),
            h.ril.scheduler.clone(),
        );

        // Act
        for line in ["+CFUN: 1", "+CFUN: 0"] {
            handler.handle(ReaderEvent::Unsolicited {
                line: line.to_owned(),
                pdu: None,
            });
        }
        for (task, _) in h.scheduled() {
            h.ril.run_deferred(task).await;
        }

        // Assert
        assert_eq!(h.ril.radio.current(), RadioState::Off);
        assert_eq!(
            h.notifications(),
            vec![
                Notification::RadioStateChanged(RadioState::On),
                Notification::SimStatusChanged,
                Notification::RadioStateChanged(RadioState::Off),
            ]
        );
    }

    #[test]
    fn it_passes_nitz_and_signal_strength() {
        let s = Setup::new(RadioState::On);

        s.line("%CTZV: 24/05/01,12:00:00+08");
        s.line("+CSQ: 20,99");

        let notifications = s.notifications();
        assert_eq!(
            notifications[0],
            Notification::NitzTimeReceived("24/05/01,12:00:00+08".into())
        );
        let Notification::SignalStrength(strength) = notifications[1] else {
            panic!("expected signal strength");
        };
        assert_eq!(strength.gw_signal_strength, 20);
        assert_eq!(strength.lte_rsrp, -1);
    }

    #[test]
    fn it_strips_quotes_from_nitz() {
        let s = Setup::new(RadioState::On);

        s.line("%CTZV: \"24/05/01,12:00:00+08,0\"");

        assert_eq!(
            s.notifications(),
            vec![Notification::NitzTimeReceived("24/05/01,12:00:00+08,0".into())]
        );
    }

    #[test]
    fn it_defers_caller_name() {
        let s = Setup::new(RadioState::On);

        s.line("+CNAP: \"Alice\",0");

        assert_eq!(
            s.deferred(),
            vec![Deferred::CallerName(CallerName {
                name: "Alice".into(),
                validity: 0,
            })]
        );
    }

    #[test]
    fn it_reports_unavailable_once_on_close() {
        let s = Setup::new(RadioState::On);

        s.handler.handle(ReaderEvent::Closed);
        s.handler.handle(ReaderEvent::Closed);

        assert_eq!(
            s.notifications(),
            vec![Notification::RadioStateChanged(RadioState::Unavailable)]
        );
    }
}
