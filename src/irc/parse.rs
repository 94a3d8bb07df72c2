//! Line parsing and dispatch.
//!
//! Clients and unregistered connections speak long command names and their
//! `:prefix`, if any, is ignored: the sender is always the connection. Server
//! links prefix every line with a numeric (or, from older peers, `:name`)
//! naming the originating node, and the command may be a token.

use std::sync::Arc;

use tracing::{debug, warn};

use super::ircd::{ConnState, Ircd};
use super::message::Message;
use super::msgtab::{CommandSpec, Disposition, Gate, Request, Sender, Status, MAXPARA, TOK_KILL};
use super::numeric;
use super::topology::{ConnId, NodeId};

/// Why a line was not handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no such connection {0}")]
    UnknownConnection(ConnId),
    #[error("connection is closing")]
    Closing,
    #[error("empty message")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("unknown prefix {0:?}")]
    UnknownPrefix(String),
    #[error("fake direction for {0:?}")]
    FakeDirection(String),
    #[error("{0}: not enough parameters")]
    NeedMoreParams(String),
    #[error("{0}: refused by registration state")]
    Refused(String),
    #[error("numeric reply for unknown target {0:?}")]
    UnknownTarget(String),
}

/// Flood penalty, in seconds, for a slow command whose parameters span
/// `bytes` bytes.
pub fn penalty(bytes: usize) -> i64 {
    2 + (bytes / 120) as i64
}

/// Split the text after the command word into parameters.
///
/// Runs of spaces separate parameters. A parameter starting with `:` takes
/// the rest of the line; so does the `max`-th parameter.
pub fn split_params(rest: Option<&str>, max: usize) -> Vec<String> {
    let mut params = Vec::new();
    let Some(mut s) = rest else {
        return params;
    };
    loop {
        s = s.trim_start_matches(' ');
        if s.is_empty() {
            break;
        }
        if let Some(trailing) = s.strip_prefix(':') {
            params.push(trailing.to_owned());
            break;
        }
        if params.len() + 1 >= max {
            params.push(s.to_owned());
            break;
        }
        match s.split_once(' ') {
            Some((word, tail)) => {
                params.push(word.to_owned());
                s = tail;
            }
            None => {
                params.push(s.to_owned());
                break;
            }
        }
    }
    params
}

fn split_command(line: &str) -> (&str, Option<&str>) {
    match line.split_once(' ') {
        Some((command, rest)) => (command, Some(rest)),
        None => (line, None),
    }
}

fn is_numeric_reply(command: &str) -> bool {
    command.len() == 3 && command.bytes().all(|b| b.is_ascii_digit())
}

impl Ircd {
    /// Parse one line from `conn` and run its handler.
    pub fn dispatch(&mut self, conn: ConnId, line: &str) -> Result<Disposition, DispatchError> {
        let state = self
            .connection(conn)
            .map(|c| c.state)
            .ok_or(DispatchError::UnknownConnection(conn))?;
        if state != ConnState::Closing {
            self.touch(conn);
        }
        match state {
            ConnState::Closing => Err(DispatchError::Closing),
            ConnState::Server => self.dispatch_server(conn, line),
            _ => self.dispatch_client(conn, line),
        }
    }

    fn dispatch_client(&mut self, conn: ConnId, line: &str) -> Result<Disposition, DispatchError> {
        let mut line = line.trim_start_matches(' ');
        if let Some(prefixed) = line.strip_prefix(':') {
            line = prefixed
                .split_once(' ')
                .map_or("", |(_, rest)| rest.trim_start_matches(' '));
        }
        if line.is_empty() {
            return Err(DispatchError::Empty);
        }

        let (command, rest) = split_command(line);
        let status = self.status_of(conn);
        let table = Arc::clone(&self.table);
        let Some(spec) = table.find_client(command) else {
            if matches!(status, Status::Client | Status::Oper) {
                self.reply(conn, "421", [command, "Unknown command"]);
            }
            return Err(DispatchError::UnknownCommand(command.to_owned()));
        };

        if spec.slow {
            self.charge_penalty(conn, penalty(rest.unwrap_or(command).len()));
        }

        let params = split_params(rest, spec.max_params);
        let sender = self
            .connection(conn)
            .and_then(|c| c.node)
            .map_or(Sender::Link, Sender::Node);
        self.invoke(spec, conn, sender, status, command, &params)
    }

    fn dispatch_server(&mut self, conn: ConnId, line: &str) -> Result<Disposition, DispatchError> {
        let link = self.connection(conn).and_then(|c| c.node);
        let link_sender = link.map_or(Sender::Link, Sender::Node);

        let (sender, rest) = if let Some(prefixed) = line.strip_prefix(':') {
            let (name, rest) = prefixed
                .split_once(' ')
                .ok_or(DispatchError::Empty)?;
            let rest = rest.trim_start_matches(' ');
            match self.topology.find_by_name(name) {
                Some(id) => (self.check_direction(conn, id, name)?, rest),
                // Only an SQUIT may travel upstream past a removed prefix.
                None if rest.as_bytes().get(1) == Some(&b'Q') => (link_sender, rest),
                None => {
                    debug!(%conn, prefix = name, "unknown prefix");
                    return Err(DispatchError::UnknownPrefix(name.to_owned()));
                }
            }
        } else {
            let bytes = line.as_bytes();
            let width = bytes.iter().take(5).take_while(|&&b| b != b' ').count();
            let Some(prefix) = line.get(..width) else {
                return Err(DispatchError::UnknownPrefix(line.to_owned()));
            };
            let rest = line[width..]
                .split_once(' ')
                .map_or("", |(_, rest)| rest)
                .trim_start_matches(' ');

            if width == 0 {
                warn!(%conn, "protocol violation: missing prefix");
                (link_sender, line.trim_start_matches(' '))
            } else {
                let is_server = bytes.get(1) == Some(&b' ') || bytes.get(2) == Some(&b' ');
                let found = if is_server {
                    numeric::canonical_server(prefix).and_then(|n| self.topology.find_by_numeric(&n))
                } else {
                    numeric::canonical_user(prefix).and_then(|n| self.topology.find_by_numeric(&n))
                };
                match found {
                    Some(id) => (self.check_direction(conn, id, prefix)?, rest),
                    None => (self.unknown_numeric_prefix(conn, prefix, rest, link_sender)?, rest),
                }
            }
        };

        if rest.is_empty() {
            return Err(DispatchError::Empty);
        }
        let (command, params_text) = split_command(rest);

        if is_numeric_reply(command) && params_text.is_some() {
            let params = split_params(params_text, MAXPARA);
            self.relay_numeric(sender, command, params)?;
            return Ok(Disposition::Continue);
        }

        let table = Arc::clone(&self.table);
        let Some(spec) = table.find_server(command) else {
            debug!(%conn, command, "unknown command from server");
            return Err(DispatchError::UnknownCommand(command.to_owned()));
        };
        let params = split_params(params_text, spec.max_params);
        self.invoke(spec, conn, sender, Status::Server, command, &params)
    }

    fn check_direction(&self, conn: ConnId, id: NodeId, prefix: &str) -> Result<Sender, DispatchError> {
        let from = self.topology.get(id).and_then(|n| n.from);
        if from == Some(conn) {
            Ok(Sender::Node(id))
        } else {
            debug!(%conn, prefix, "fake direction");
            Err(DispatchError::FakeDirection(prefix.to_owned()))
        }
    }

    /// Handle a numeric prefix that names nothing we know. Lagged SQUITs and
    /// KILLs are let through as coming from the link itself.
    fn unknown_numeric_prefix(
        &mut self,
        conn: ConnId,
        prefix: &str,
        rest: &str,
        link_sender: Sender,
    ) -> Result<Sender, DispatchError> {
        let b = rest.as_bytes();
        let at = |i: usize| b.get(i).copied().unwrap_or(0);

        // A nick change from a user we never saw: kill it upstream.
        if at(0) == b'N' && (at(1) == b' ' || at(1) == b'I') {
            let server = prefix
                .get(..(prefix.len() / 2).max(1))
                .and_then(numeric::canonical_server)
                .and_then(|n| self.topology.find_by_numeric(&n));
            if server.and_then(|s| self.topology.get(s)).and_then(|s| s.from) == Some(conn) {
                let me = self.topology.me();
                let kill = Message::new(TOK_KILL, [prefix.to_owned(), format!("{} (Unknown numeric nick)", me.name)])
                    .from_numeric(&me.numeric);
                self.send(conn, kill);
            }
        }

        if at(1) == b'Q' || (at(0) == b'D' && at(1) == b' ') || (at(0) == b'K' && at(2) == b'L') {
            Ok(link_sender)
        } else {
            debug!(%conn, prefix, "unknown numeric prefix");
            Err(DispatchError::UnknownPrefix(prefix.to_owned()))
        }
    }

    /// Apply the registration gate and parameter minimum, then run the handler.
    fn invoke(
        &mut self,
        spec: &CommandSpec,
        conn: ConnId,
        sender: Sender,
        status: Status,
        command: &str,
        params: &[String],
    ) -> Result<Disposition, DispatchError> {
        match spec.registration.gate(status) {
            Gate::Allow => {}
            Gate::Ignore => return Ok(Disposition::Continue),
            Gate::NotRegistered => {
                self.reply(conn, "451", [command, "Register first."]);
                return Err(DispatchError::Refused(spec.name.to_owned()));
            }
            Gate::AlreadyRegistered => {
                self.reply(conn, "462", ["You may not reregister"]);
                return Err(DispatchError::Refused(spec.name.to_owned()));
            }
            Gate::NoPrivileges => {
                self.reply(conn, "481", ["Permission Denied: Insufficient privileges"]);
                return Err(DispatchError::Refused(spec.name.to_owned()));
            }
        }

        if params.len() < spec.min_params {
            if status == Status::Server {
                warn!(%conn, command = spec.name, "protocol violation: not enough parameters");
            } else {
                self.reply(conn, "461", [spec.name, "Not enough parameters"]);
            }
            return Err(DispatchError::NeedMoreParams(spec.name.to_owned()));
        }

        let req = Request {
            conn,
            sender,
            status,
            command,
            params,
        };
        Ok(spec.handler.handle(self, &req))
    }

    /// Pass a numeric reply from a server on toward its target.
    fn relay_numeric(&mut self, sender: Sender, command: &str, mut params: Vec<String>) -> Result<(), DispatchError> {
        let Some(target) = params.first().cloned() else {
            return Err(DispatchError::Empty);
        };
        let id = numeric::canonical_user(&target)
            .and_then(|n| self.topology.find_by_numeric(&n))
            .or_else(|| self.topology.find_by_name(&target))
            .ok_or_else(|| DispatchError::UnknownTarget(target.clone()))?;
        let (Some(origin), Some(node)) = (
            sender_node(sender).and_then(|s| self.topology.get(s)),
            self.topology.get(id),
        ) else {
            return Err(DispatchError::UnknownTarget(target));
        };
        let Some(via) = node.from else {
            return Ok(());
        };

        let msg = if self.connection(via).is_some_and(|c| c.state == ConnState::Server) {
            params[0] = node.numeric.clone();
            Message::new(command, params).from_numeric(&origin.numeric)
        } else {
            params[0] = node.name.clone();
            Message::new(command, params).from_name(&origin.name)
        };
        self.send(via, msg);
        Ok(())
    }
}

fn sender_node(sender: Sender) -> Option<NodeId> {
    match sender {
        Sender::Node(id) => Some(id),
        Sender::Link => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn colon_takes_rest_of_line() {
        let params = split_params(Some("#lagoon :hello there  world"), 15);
        assert_eq!(params, vec!["#lagoon", "hello there  world"]);
    }

    #[test]
    fn runs_of_spaces_separate() {
        let params = split_params(Some("  a   b c  "), 15);
        assert_eq!(params, vec!["a", "b", "c"]);
    }

    #[test]
    fn last_allowed_parameter_swallows_the_rest() {
        let params = split_params(Some("wings hello there world"), 2);
        assert_eq!(params, vec!["wings", "hello there world"]);
    }

    #[test]
    fn numeric_reply_parameters() {
        let params = split_params(Some("ABAAB wings :No such nick"), MAXPARA);
        assert_eq!(params, vec!["ABAAB", "wings", "No such nick"]);
    }

    #[test]
    fn no_parameters() {
        assert!(split_params(None, 15).is_empty());
        assert!(split_params(Some("   "), 15).is_empty());
    }

    #[test]
    fn penalty_grows_every_120_bytes() {
        assert_eq!(penalty(0), 2);
        assert_eq!(penalty(119), 2);
        assert_eq!(penalty(120), 3);
        assert_eq!(penalty(510), 6);
    }

    #[test]
    fn numeric_reply_detection() {
        assert!(is_numeric_reply("401"));
        assert!(!is_numeric_reply("40"));
        assert!(!is_numeric_reply("EB"));
    }
}
