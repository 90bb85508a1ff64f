//! Message routing
//!
//! `dispatch` is total over message tags: every known inbound type has a
//! handler, everything else is logged at trace level and dropped.

use crate::codec::Message;
use crate::error::{ProtocolError, SessionError};
use crate::records;
use crate::scheduler::TimerKind;
use crate::tunnels::{Forwarder, Peer, STATUS_OK, TUNNEL_REQUEST, TUNNEL_RESPONSE, TUNNEL_UPDATE};

use super::{transmit, Action, Session, SessionHandler, SessionState, StopReason, Transport};

/// Login accepted
pub const LOGIN_OK: &str = "ok";

/// Login accepted and the account was created on the fly
pub const LOGIN_OK_REGISTERED: &str = "ok_registered";

/// Separator inside a MESSAGE_FROM routing token
const TOKEN_DELIMITER: char = '/';

/// Split a routing token into command name and arguments
pub fn parse_token(tp: &str) -> Result<(&str, Vec<&str>), ProtocolError> {
    let mut parts = tp.split(TOKEN_DELIMITER);
    let command = parts
        .next()
        .filter(|c| !c.is_empty())
        .ok_or(ProtocolError::EmptyToken)?;
    Ok((command, parts.collect()))
}

impl<T: Transport, F: Forwarder, H: SessionHandler> Session<T, F, H> {
    pub(super) fn dispatch(&mut self, msg: Message<'_>) -> Result<(), SessionError> {
        match msg {
            Message::AccountLoginReply { error } => {
                self.on_login_reply(error);
                Ok(())
            }
            Message::DevicePairReply {
                error,
                cloud,
                pair_kind,
                list,
            } => {
                if error != STATUS_OK {
                    log::warn!("Pairing request rejected by relay: {}", error);
                    return Ok(());
                }
                for record in records::pairing_records(cloud, pair_kind, list)? {
                    let outcome = self.tunnels.on_pairing_record(&record, &mut self.forwarder);
                    self.handler.on_pairing(&record, outcome);
                }
                if !self.tunnels.has_unpaired() {
                    self.scheduler.stop(TimerKind::PairingPoll);
                }
                Ok(())
            }
            Message::MessageFrom {
                from_cloud,
                from_device,
                from_address,
                tp,
                ..
            } => {
                let peer = Peer {
                    cloud: from_cloud,
                    device: from_device,
                    address: from_address,
                };
                self.on_message_from(&peer, tp)
            }
            Message::OfflineSet {
                cloud,
                device,
                address,
            } => {
                log::info!(
                    "Relay reports {}/{} offline (address {:?})",
                    cloud,
                    device,
                    address
                );
                self.tunnels.on_offline(address, &mut self.forwarder);
                self.ensure_pairing_poll();
                Ok(())
            }
            Message::MessageToSetReply { error } => {
                if error == STATUS_OK {
                    log::debug!("Routed message delivered");
                } else {
                    log::warn!("Routed message not delivered: {}", error);
                }
                Ok(())
            }
            Message::TrafficGetReply { error, list } => {
                if !self.expecting_reply("traffic") {
                    return Ok(());
                }
                let traffic = if error == STATUS_OK {
                    records::traffic_records(list)?
                } else {
                    Vec::new()
                };
                self.handler.on_traffic(error, &traffic);
                self.finish(StopReason::ActionComplete(error.to_string()));
                Ok(())
            }
            Message::AccountSetReply { error } => {
                if self.expecting_reply("account set") {
                    self.handler.on_account_set(error);
                    self.finish(StopReason::ActionComplete(error.to_string()));
                }
                Ok(())
            }
            Message::AccountExistsReply { error } => {
                if self.expecting_reply("account exists") {
                    self.handler.on_account_exists(error);
                    self.finish(StopReason::ActionComplete(error.to_string()));
                }
                Ok(())
            }
            other => {
                log::trace!("Not handling packet type: {}", other.tag());
                Ok(())
            }
        }
    }

    /// Administrative replies only count while such an action is pending
    fn expecting_reply(&self, what: &str) -> bool {
        if self.settings.action.is_single_shot() && self.state == SessionState::Ready {
            return true;
        }
        log::warn!("Unexpected {} reply while {:?}, ignoring", what, self.state);
        false
    }

    fn on_login_reply(&mut self, error: &str) {
        if self.state != SessionState::Authenticating {
            log::warn!("Login reply while {:?}, ignoring", self.state);
            return;
        }

        self.handler.on_login(error);
        if error != LOGIN_OK && error != LOGIN_OK_REGISTERED {
            log::error!("Login rejected by relay: {}", error);
            self.finish(StopReason::LoginRejected(error.to_string()));
            return;
        }

        log::info!("Logged in as {}", self.settings.credentials.username);
        self.set_state(SessionState::Ready);
        match self.settings.action {
            Action::Tunnels => self.ensure_pairing_poll(),
            _ => self.send_action(),
        }
    }

    /// Send the single administrative request once logged in
    fn send_action(&mut self) {
        let msg = match &self.settings.action {
            Action::Tunnels => return,
            Action::TrafficGet => Message::TrafficGet {
                cloud: &self.settings.credentials.username,
            },
            Action::AccountSet { email, password } => Message::AccountSet { email, password },
            Action::AccountExists { email } => Message::AccountExists { email },
        };

        let result = transmit(&mut self.transport, &msg);
        if let Err(e) = result {
            if e.is_connection_fatal() {
                self.handle_error(e);
            } else {
                log::error!("Cannot send request: {}", e);
                self.finish(StopReason::ActionFailed(e.to_string()));
            }
        }
    }

    fn on_message_from(&mut self, peer: &Peer<'_>, tp: &str) -> Result<(), SessionError> {
        let (command, args) = parse_token(tp)?;
        match command {
            TUNNEL_REQUEST => {
                let reply = self
                    .tunnels
                    .on_tunnel_request(peer, &args, &mut self.forwarder)?;
                transmit(&mut self.transport, &reply.as_message())
            }
            TUNNEL_RESPONSE => {
                self.tunnels.on_tunnel_response(&args, &mut self.forwarder)?;
                Ok(())
            }
            TUNNEL_UPDATE => {
                self.tunnels.on_tunnel_update(&args, &mut self.forwarder)?;
                Ok(())
            }
            unknown => Err(ProtocolError::UnknownCommand(unknown.to_string()).into()),
        }
    }
}
