//! The command table.
//!
//! Every command the server understands is described by a [`CommandSpec`]:
//! its long name, its short server-to-server token, how many parameters it
//! takes, whether it counts against the flood budget, and who may use it.
//! The table indexes the specs with two [`Trie`]s, one per spelling.

use std::fmt;
use std::sync::Arc;

use super::ircd::Ircd;
use super::topology::{ConnId, NodeId};
use super::trie::{Trie, TrieError};

/// Upper bound on parameters after the command word.
pub const MAXPARA: usize = 15;

pub const TOK_PRIVMSG: &str = "P";
pub const TOK_NOTICE: &str = "O";
pub const TOK_NICK: &str = "N";
pub const TOK_SERVER: &str = "S";
pub const TOK_QUIT: &str = "Q";
pub const TOK_SQUIT: &str = "SQ";
pub const TOK_KILL: &str = "D";
pub const TOK_ERROR: &str = "Y";
pub const TOK_PING: &str = "G";
pub const TOK_PONG: &str = "Z";
pub const TOK_PASS: &str = "PA";
pub const TOK_USER: &str = "USER";
pub const TOK_OPER: &str = "OPER";
pub const TOK_WALLOPS: &str = "WA";
pub const TOK_CONNECT: &str = "CO";
pub const TOK_TOPIC: &str = "T";
pub const TOK_JOIN: &str = "J";
pub const TOK_BURST: &str = "B";
pub const TOK_CREATE: &str = "C";
pub const TOK_END_OF_BURST: &str = "EB";
pub const TOK_EOB_ACK: &str = "EA";

/// Registration state of the connection a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unregistered,
    Client,
    Server,
    Oper,
}

/// Who may use a command, and what everyone else gets instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Anyone, registered or not.
    Open,
    /// Before registration or from a server link; clients get 462.
    Handshake,
    /// Only before registration; clients get 462, servers are ignored.
    Unregistered,
    /// After registration; unregistered connections get 451.
    Required,
    /// After registration; unregistered connections are ignored.
    RequiredQuiet,
    /// Server links only; unregistered connections get 451, clients are
    /// ignored.
    Links,
    /// Operators and server links; unregistered connections get 451 and
    /// plain clients 481.
    Operator,
}

/// What the gate decided for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allow,
    Ignore,
    NotRegistered,
    AlreadyRegistered,
    NoPrivileges,
}

impl Registration {
    pub fn gate(self, status: Status) -> Gate {
        use Registration as R;
        use Status as S;
        match (self, status) {
            (R::Open, _) => Gate::Allow,
            (R::Handshake, S::Client | S::Oper) => Gate::AlreadyRegistered,
            (R::Handshake, _) => Gate::Allow,
            (R::Unregistered, S::Unregistered) => Gate::Allow,
            (R::Unregistered, S::Server) => Gate::Ignore,
            (R::Unregistered, _) => Gate::AlreadyRegistered,
            (R::Required | R::Links | R::Operator, S::Unregistered) => Gate::NotRegistered,
            (R::RequiredQuiet, S::Unregistered) => Gate::Ignore,
            (R::Required | R::RequiredQuiet, _) => Gate::Allow,
            (R::Links, S::Server) => Gate::Allow,
            (R::Links, _) => Gate::Ignore,
            (R::Operator, S::Client) => Gate::NoPrivileges,
            (R::Operator, _) => Gate::Allow,
        }
    }
}

/// Who a line is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    /// The connection itself, before it has a node in the tree.
    Link,
    Node(NodeId),
}

/// A parsed line, ready for its handler.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    /// The connection the line arrived on.
    pub conn: ConnId,
    pub sender: Sender,
    pub status: Status,
    /// The command word as received.
    pub command: &'a str,
    pub params: &'a [String],
}

impl Request<'_> {
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// The sending node, if the sender has one.
    pub fn node(&self) -> Option<NodeId> {
        match self.sender {
            Sender::Node(id) => Some(id),
            Sender::Link => None,
        }
    }
}

/// What became of the arrival connection after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    ConnectionClosed,
}

/// A command implementation.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &mut Ircd, req: &Request<'_>) -> Disposition;
}

impl<F> Handler for F
where
    F: Fn(&mut Ircd, &Request<'_>) -> Disposition + Send + Sync,
{
    fn handle(&self, ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
        self(ctx, req)
    }
}

/// One row of the command table.
#[derive(Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub token: &'static str,
    pub min_params: usize,
    pub max_params: usize,
    /// Charged against the client's flood budget.
    pub slow: bool,
    pub registration: Registration,
    pub handler: Arc<dyn Handler>,
}

impl CommandSpec {
    pub fn new<H>(name: &'static str, token: &'static str, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        Self {
            name,
            token,
            min_params: 0,
            max_params: MAXPARA,
            slow: false,
            registration: Registration::Required,
            handler: Arc::new(handler),
        }
    }

    pub fn params(mut self, min: usize, max: usize) -> Self {
        self.min_params = min;
        self.max_params = max.min(MAXPARA);
        self
    }

    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }

    pub fn registration(mut self, registration: Registration) -> Self {
        self.registration = registration;
        self
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("min_params", &self.min_params)
            .field("max_params", &self.max_params)
            .field("slow", &self.slow)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

/// The immutable command table with its two lookup tries.
#[derive(Debug)]
pub struct CommandTable {
    specs: Vec<CommandSpec>,
    by_name: Trie,
    by_token: Trie,
}

impl CommandTable {
    pub fn build(mut specs: Vec<CommandSpec>) -> Result<Self, TrieError> {
        for spec in &mut specs {
            spec.max_params = spec.max_params.min(MAXPARA);
        }
        let by_name = Trie::build(specs.iter().enumerate().map(|(i, s)| (s.name, i)))?;
        let by_token = Trie::build(specs.iter().enumerate().map(|(i, s)| (s.token, i)))?;
        Ok(Self {
            specs,
            by_name,
            by_token,
        })
    }

    pub fn specs(&self) -> &[CommandSpec] {
        &self.specs
    }

    /// Lookup for lines from clients and unregistered connections: long
    /// names only, whole word.
    pub fn find_client(&self, command: &str) -> Option<&CommandSpec> {
        self.by_name.find_exact(command).map(|i| &self.specs[i])
    }

    /// Lookup for lines from server links: token first, then long name.
    pub fn find_server(&self, command: &str) -> Option<&CommandSpec> {
        self.by_token
            .find_prefix(command)
            .or_else(|| self.by_name.find_exact(command))
            .map(|i| &self.specs[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Ircd, _: &Request<'_>) -> Disposition {
        Disposition::Continue
    }

    fn table(rows: &[(&'static str, &'static str)]) -> Result<CommandTable, TrieError> {
        CommandTable::build(
            rows.iter()
                .map(|&(name, token)| CommandSpec::new(name, token, noop))
                .collect(),
        )
    }

    // ── Lookup ───────────────────────────────────────────────────

    #[test]
    fn server_lookup_prefers_tokens_then_long_names() {
        let t = table(&[
            ("PRIVMSG", "P"),
            ("PASS", "PA"),
            ("SERVER", "S"),
            ("SQUIT", "SQ"),
            ("NOTICE", "O"),
            ("OPER", "OPER"),
        ])
        .unwrap();
        assert_eq!(t.find_server("P").map(|s| s.name), Some("PRIVMSG"));
        assert_eq!(t.find_server("PA").map(|s| s.name), Some("PASS"));
        assert_eq!(t.find_server("SQ").map(|s| s.name), Some("SQUIT"));
        assert_eq!(t.find_server("SQUIT").map(|s| s.name), Some("SQUIT"));
        assert_eq!(t.find_server("OPER").map(|s| s.name), Some("OPER"));
        assert_eq!(t.find_server("NOTICE").map(|s| s.name), Some("NOTICE"));
        assert!(t.find_server("001").is_none());
    }

    #[test]
    fn client_lookup_ignores_tokens() {
        let t = table(&[("PRIVMSG", "P"), ("NICK", "N"), ("NOTICE", "O")]).unwrap();
        assert!(t.find_client("P").is_none());
        assert_eq!(t.find_client("notice").map(|s| s.name), Some("NOTICE"));
        assert_eq!(t.find_client("NICK").map(|s| s.name), Some("NICK"));
    }

    #[test]
    fn max_params_is_capped() {
        let spec = CommandSpec::new("X", "X", noop).params(1, 40);
        assert_eq!(spec.max_params, MAXPARA);
    }

    #[test]
    fn duplicate_token_fails_build() {
        let err = table(&[("SERVLIST", "SERVSET"), ("SERVSET", "SERVSET")]).unwrap_err();
        assert_eq!(err, TrieError::Duplicate("SERVSET".into()));
    }

    // ── Registration gate ────────────────────────────────────────

    #[test]
    fn gate_matrix() {
        use Registration as R;
        assert_eq!(R::Required.gate(Status::Unregistered), Gate::NotRegistered);
        assert_eq!(R::RequiredQuiet.gate(Status::Unregistered), Gate::Ignore);
        assert_eq!(R::Unregistered.gate(Status::Client), Gate::AlreadyRegistered);
        assert_eq!(R::Unregistered.gate(Status::Server), Gate::Ignore);
        assert_eq!(R::Handshake.gate(Status::Server), Gate::Allow);
        assert_eq!(R::Handshake.gate(Status::Oper), Gate::AlreadyRegistered);
        assert_eq!(R::Operator.gate(Status::Client), Gate::NoPrivileges);
        assert_eq!(R::Operator.gate(Status::Oper), Gate::Allow);
        assert_eq!(R::Links.gate(Status::Client), Gate::Ignore);
        assert_eq!(R::Links.gate(Status::Server), Gate::Allow);
        assert_eq!(R::Open.gate(Status::Unregistered), Gate::Allow);
    }
}
