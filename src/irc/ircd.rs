//! The runtime context: everything the server knows, owned in one place.
//!
//! [`Ircd`] holds the tree, the channels, the local connections and the
//! command table. Handlers get `&mut Ircd` for the duration of one line, so
//! every dispatch runs to completion before the next one starts.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channel::Channels;
use super::conf::{Config, RuleKind};
use super::handlers;
use super::message::Message;
use super::msgtab::{CommandSpec, CommandTable, Disposition, Status, TOK_QUIT, TOK_SQUIT};
use super::numeric;
use super::topology::{ConnId, Node, NodeId, ServerFlags, Topology};
use super::trie::TrieError;

/// Flood budget: reading stops while a client is this many seconds ahead.
pub const FLOOD_LIMIT: i64 = 10;

/// Lifecycle of a local connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, nothing said yet.
    Unknown,
    /// Outbound connect in progress.
    Connecting,
    /// We sent our SERVER line and are waiting for theirs.
    Handshake,
    Server,
    User,
    Closing,
}

/// USER parameters held until NICK completes registration.
#[derive(Debug, Clone)]
pub struct PendingUser {
    pub username: String,
    pub realname: String,
}

/// A local connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub addr: Option<SocketAddr>,
    pub state: ConnState,
    /// Declared server name, or the nick chosen before registration.
    pub name: String,
    pub password: Option<String>,
    pub node: Option<NodeId>,
    pub user: Option<PendingUser>,
    /// Flood clock; see [`Ircd::read_delay`].
    pub since: i64,
    pub firsttime: i64,
    pub last_active: i64,
    pub pinged: bool,
    tx: Option<mpsc::UnboundedSender<Message>>,
}

impl Connection {
    /// Server links are never throttled.
    pub fn trusted(&self) -> bool {
        self.state == ConnState::Server
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }
}

/// Something [`Ircd::exit_client`] can remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Conn(ConnId),
    Node(NodeId),
}

/// An outbound link the runtime should open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub conn: ConnId,
    pub name: String,
    pub addr: String,
}

/// What a name resolves to across the tree and the local connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Found {
    Me,
    Node(NodeId),
    /// A local connection still connecting or in handshake.
    Link(ConnId),
}

/// The server's entire state.
pub struct Ircd {
    pub config: Config,
    pub topology: Topology,
    pub channels: Channels,
    pub(crate) table: Arc<CommandTable>,
    connections: HashMap<ConnId, Connection>,
    next_conn: u64,
    next_user: u32,
    /// Current time, in seconds. Set by the runtime before each dispatch.
    pub now: i64,
    /// Users removed by KILL; their exit does not send QUIT.
    killed: HashSet<NodeId>,
    connect_requests: Vec<ConnectRequest>,
    next_autoconnect: HashMap<String, i64>,
}

impl Ircd {
    /// Build the context with the standard command table.
    pub fn new(config: Config, now: i64) -> Result<Self, TrieError> {
        Self::with_commands(config, now, handlers::commands())
    }

    pub fn with_commands(config: Config, now: i64, commands: Vec<CommandSpec>) -> Result<Self, TrieError> {
        let table = CommandTable::build(commands)?;
        let flags = ServerFlags {
            hub: config.hub,
            ..ServerFlags::default()
        };
        let topology = Topology::new(&config.name, &config.numeric, &config.description, now, flags);
        info!(name = %config.name, numeric = %config.numeric, "server identity");
        Ok(Self {
            config,
            topology,
            channels: Channels::default(),
            table: Arc::new(table),
            connections: HashMap::new(),
            next_conn: 1,
            next_user: 0,
            now,
            killed: HashSet::new(),
            connect_requests: Vec::new(),
            next_autoconnect: HashMap::new(),
        })
    }

    /// Add a command to the table. Only meant for startup; the table is
    /// rebuilt and validated.
    pub fn register_command(&mut self, spec: CommandSpec) -> Result<(), TrieError> {
        let mut specs = self.table.specs().to_vec();
        specs.push(spec);
        self.table = Arc::new(CommandTable::build(specs)?);
        Ok(())
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    // ── Connections ──────────────────────────────────────────────

    /// Register an accepted connection.
    pub fn accept(&mut self, addr: Option<SocketAddr>, tx: mpsc::UnboundedSender<Message>) -> ConnId {
        let id = self.alloc_conn();
        self.connections.insert(id, self.new_connection(id, addr, ConnState::Unknown, String::new(), Some(tx)));
        id
    }

    fn alloc_conn(&mut self) -> ConnId {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        id
    }

    fn new_connection(
        &self,
        id: ConnId,
        addr: Option<SocketAddr>,
        state: ConnState,
        name: String,
        tx: Option<mpsc::UnboundedSender<Message>>,
    ) -> Connection {
        Connection {
            id,
            addr,
            state,
            name,
            password: None,
            node: None,
            user: None,
            since: self.now,
            firsttime: self.now,
            last_active: self.now,
            pinged: false,
            tx,
        }
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Forget a connection whose socket is gone. Runs exit processing first
    /// if nothing has yet.
    pub fn remove_connection(&mut self, id: ConnId, reason: &str) {
        if self.connection(id).is_some_and(|c| c.state != ConnState::Closing) {
            let me = self.topology.root();
            self.exit_client(id, Target::Conn(id), me, reason);
        }
        self.connections.remove(&id);
    }

    /// Registration state used by the command gate.
    pub fn status_of(&self, conn: ConnId) -> Status {
        let Some(c) = self.connection(conn) else {
            return Status::Unregistered;
        };
        match c.state {
            ConnState::Server => Status::Server,
            ConnState::User => {
                let oper = c
                    .node
                    .and_then(|n| self.topology.get(n))
                    .and_then(Node::user)
                    .is_some_and(|u| u.modes.oper);
                if oper {
                    Status::Oper
                } else {
                    Status::Client
                }
            }
            _ => Status::Unregistered,
        }
    }

    /// Local connections linked to servers.
    pub fn server_links(&self) -> Vec<ConnId> {
        let mut links: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| c.state == ConnState::Server && c.is_open())
            .map(|c| c.id)
            .collect();
        links.sort();
        links
    }

    /// The local connection still connecting or handshaking as `name`.
    pub fn find_pending_link(&self, name: &str) -> Option<ConnId> {
        self.connections
            .values()
            .find(|c| {
                matches!(c.state, ConnState::Connecting | ConnState::Handshake)
                    && super::matching::eq_ignore_case(&c.name, name)
            })
            .map(|c| c.id)
    }

    /// Look `name` up among nodes and pending links.
    pub fn find_any(&self, name: &str) -> Option<Found> {
        match self.topology.find_by_name(name) {
            Some(id) if id == self.topology.root() => Some(Found::Me),
            Some(id) => Some(Found::Node(id)),
            None => self.find_pending_link(name).map(Found::Link),
        }
    }

    /// The link's own server node, if it has one.
    pub fn link_node(&self, conn: ConnId) -> Option<&Node> {
        self.connection(conn)
            .and_then(|c| c.node)
            .and_then(|n| self.topology.get(n))
    }

    /// Whether `id` is directly connected to us.
    pub fn is_local(&self, id: NodeId) -> bool {
        self.topology
            .get(id)
            .and_then(|n| n.from)
            .and_then(|c| self.connection(c))
            .is_some_and(|c| c.node == Some(id))
    }

    /// Next free numeric for a local user, or `None` once every index up
    /// to our advertised capacity is taken.
    pub fn alloc_user_numeric(&mut self) -> Option<String> {
        let me = self.topology.me();
        let prefix = me.numeric.clone();
        let slots = me
            .server()
            .map_or(numeric::MAX_CAPACITY, |s| s.capacity.min(numeric::MAX_CAPACITY))
            + 1;
        for _ in 0..slots {
            let index = self.next_user % slots;
            self.next_user = (index + 1) % slots;
            let candidate = format!("{prefix}{}", numeric::encode(index, 3));
            if self.topology.find_by_numeric(&candidate).is_none() {
                return Some(candidate);
            }
        }
        None
    }

    // ── Sending ──────────────────────────────────────────────────

    pub fn send(&self, conn: ConnId, msg: Message) {
        if let Some(tx) = self.connection(conn).and_then(|c| c.tx.as_ref()) {
            debug!(%conn, line = %msg, "send");
            // A closed receiver means the task is already gone.
            let _ = tx.send(msg);
        }
    }

    /// Send to every server link except `except`.
    pub fn send_to_servers(&self, except: Option<ConnId>, msg: &Message) {
        for link in self.server_links() {
            if Some(link) != except {
                self.send(link, msg.clone());
            }
        }
    }

    /// A message prefixed with our own numeric.
    pub fn from_me<I, S>(&self, command: &str, params: I) -> Message
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Message::new(command, params).from_numeric(&self.topology.me().numeric)
    }

    /// Numeric reply to a local client, addressed by nick (or `*`).
    pub fn reply<I, S>(&self, conn: ConnId, code: &str, params: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target = self
            .link_node(conn)
            .map(|n| n.name.clone())
            .or_else(|| self.connection(conn).map(|c| c.name.clone()).filter(|n| !n.is_empty()))
            .unwrap_or_else(|| "*".into());
        let mut all = vec![target];
        all.extend(params.into_iter().map(Into::into));
        let msg = Message::new(code, all).from_name(&self.topology.me().name);
        self.send(conn, msg);
    }

    /// Server notice to local operators; also logged.
    pub fn notice_opers(&self, text: &str) {
        info!(target: "lagoon_ircd::notice", "{text}");
        let me = &self.topology.me().name;
        for id in self.topology.users_of(self.topology.root()) {
            let Some(node) = self.topology.get(*id) else {
                continue;
            };
            if !node.user().is_some_and(|u| u.modes.oper) {
                continue;
            }
            if let Some(conn) = node.from {
                let msg = Message::new("NOTICE", [node.name.clone(), format!("*** Notice -- {text}")]).from_name(me);
                self.send(conn, msg);
            }
        }
    }

    /// `nick!user@host` of a user node.
    pub fn user_mask(&self, id: NodeId) -> Option<String> {
        let node = self.topology.get(id)?;
        let user = node.user()?;
        Some(format!("{}!{}@{}", node.name, user.username, user.host))
    }

    // ── Flood control ────────────────────────────────────────────

    /// Add `seconds` to the connection's flood clock.
    pub fn charge_penalty(&mut self, conn: ConnId, seconds: i64) {
        if let Some(c) = self.connection_mut(conn) {
            c.since += seconds;
        }
    }

    /// Seconds to wait before reading from `conn` again. Lifts a lagging
    /// flood clock up to now first.
    pub fn read_delay(&mut self, conn: ConnId) -> i64 {
        let now = self.now;
        let Some(c) = self.connection_mut(conn) else {
            return 0;
        };
        if c.since < now {
            c.since = now;
        }
        if c.trusted() {
            0
        } else {
            (c.since - now - (FLOOD_LIMIT - 1)).max(0)
        }
    }

    /// Note activity on a connection.
    pub fn touch(&mut self, conn: ConnId) {
        let now = self.now;
        if let Some(c) = self.connection_mut(conn) {
            c.last_active = now;
            c.pinged = false;
        }
    }

    // ── Disconnect ───────────────────────────────────────────────

    pub fn mark_killed(&mut self, id: NodeId) {
        self.killed.insert(id);
    }

    /// Close a connection, or remove a node with everything behind it, and
    /// tell the rest of the network.
    ///
    /// `cptr` is the connection whose line is being handled; the result says
    /// whether it was the one destroyed. `killer` decides which link already
    /// knows and is not told.
    pub fn exit_client(&mut self, cptr: ConnId, victim: Target, killer: NodeId, reason: &str) -> Disposition {
        let (local, node) = match victim {
            Target::Conn(c) => (Some(c), self.connection(c).and_then(|c| c.node)),
            Target::Node(n) => {
                let local = self
                    .topology
                    .get(n)
                    .and_then(|node| node.from)
                    .filter(|c| self.connection(*c).is_some_and(|conn| conn.node == Some(n)));
                (local, Some(n))
            }
        };
        let me = self.topology.root();
        let killer_from = self.topology.get(killer).and_then(|k| k.from);

        if let Some(conn) = local {
            self.close_local(conn, killer, killer_from, reason);
        }

        if let Some(id) = node.filter(|id| *id != me) {
            self.exit_node(id, killer, killer_from, local, reason);
        }

        if local == Some(cptr) {
            Disposition::ConnectionClosed
        } else {
            Disposition::Continue
        }
    }

    fn close_local(&mut self, conn: ConnId, killer: NodeId, killer_from: Option<ConnId>, reason: &str) {
        let Some(c) = self.connection(conn) else {
            return;
        };
        if c.state == ConnState::Closing {
            return;
        }
        let state = c.state;
        let victim_name = self
            .link_node(conn)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| c.name.clone());
        let me = self.topology.me();

        if killer_from != Some(conn) {
            match state {
                ConnState::Server => {
                    let killer_numeric = self.topology.get(killer).map_or(me.numeric.clone(), |k| k.numeric.clone());
                    let msg = Message::new(TOK_SQUIT, [me.name.clone(), "0".into(), reason.to_owned()])
                        .from_numeric(&killer_numeric);
                    self.send(conn, msg);
                }
                ConnState::Handshake => {
                    self.send(conn, Message::new("SQUIT", [me.name.as_str(), "0", reason]));
                }
                ConnState::Connecting => {}
                _ => {
                    let by = self
                        .topology
                        .get(killer)
                        .filter(|k| !k.is_server())
                        .map_or(me.name.as_str(), |k| k.name.as_str());
                    let shown = if victim_name.is_empty() { "*" } else { victim_name.as_str() };
                    let text = format!("Closing Link: {shown} by {by} ({reason})");
                    self.send(conn, Message::new("ERROR", [text]));
                }
            }
            if matches!(state, ConnState::Server | ConnState::Handshake | ConnState::Connecting)
                && killer == self.topology.root()
            {
                self.notice_opers(&format!("Link with {victim_name} cancelled: {reason}"));
            }
        }

        info!(%conn, name = %victim_name, reason, "closing connection");
        if let Some(c) = self.connection_mut(conn) {
            c.state = ConnState::Closing;
            c.tx = None;
        }
    }

    fn exit_node(
        &mut self,
        id: NodeId,
        killer: NodeId,
        killer_from: Option<ConnId>,
        local: Option<ConnId>,
        reason: &str,
    ) {
        let Some(node) = self.topology.get(id) else {
            return;
        };
        let is_server = node.is_server();
        let killed = self.killed.remove(&id);

        let propagate = if is_server {
            let up = node
                .up
                .and_then(|u| self.topology.get(u))
                .map_or_else(String::new, |u| u.name.clone());
            self.notice_opers(&format!("Net break: {up} {} ({reason})", node.name));
            let killer_numeric = self
                .topology
                .get(killer)
                .map_or_else(|| self.topology.me().numeric.clone(), |k| k.numeric.clone());
            Some(
                Message::new(TOK_SQUIT, [node.name.clone(), node.timestamp().to_string(), reason.to_owned()])
                    .from_numeric(&killer_numeric),
            )
        } else if !killed {
            Some(Message::new(TOK_QUIT, [reason]).from_numeric(&node.numeric))
        } else {
            None
        };

        if let Some(msg) = propagate {
            for link in self.server_links() {
                if Some(link) != killer_from && Some(link) != local {
                    self.send(link, msg.clone());
                }
            }
        }

        // Local channel peers see every removed user quit; a split shows
        // the two servers that parted.
        let (quitters, text) = if is_server {
            let up = node.up.and_then(|u| self.topology.get(u)).map_or("", |u| u.name.as_str());
            (self.topology.users_from(id), format!("{up} {}", node.name))
        } else {
            (vec![id], reason.to_owned())
        };
        for user in quitters {
            if let Some(mask) = self.user_mask(user) {
                let quit = Message::new("QUIT", [text.as_str()]).from_name(&mask);
                self.notify_peers(user, &quit, false);
            }
        }

        for gone in self.topology.remove(id) {
            self.channels.remove_member(gone.id);
            self.killed.remove(&gone.id);
            // A local user behind a removed node cannot exist, but a local
            // client being removed still needs its socket closed.
            if let Some(conn) = gone.from {
                if Some(conn) != local && self.connection(conn).is_some_and(|c| c.node == Some(gone.id)) {
                    if let Some(c) = self.connection_mut(conn) {
                        c.state = ConnState::Closing;
                        c.tx = None;
                    }
                }
            }
        }
    }

    // ── Outbound links ───────────────────────────────────────────

    /// Queue an outbound connect to the configured peer `name`.
    pub fn request_connect(&mut self, name: &str) -> Option<ConnId> {
        let policy = self.config.policy_for(name)?;
        let addr = policy.endpoint()?;
        let name = policy.name.clone();
        let id = self.alloc_conn();
        self.connections
            .insert(id, self.new_connection(id, None, ConnState::Connecting, name.clone(), None));
        info!(%id, %name, %addr, "connecting");
        self.connect_requests.push(ConnectRequest { conn: id, name, addr });
        Some(id)
    }

    /// Connect requests not yet picked up by the runtime.
    pub fn take_connect_requests(&mut self) -> Vec<ConnectRequest> {
        std::mem::take(&mut self.connect_requests)
    }

    /// The socket for an outbound link is up: introduce ourselves. Returns
    /// false, forgetting the attempt, if it was cancelled meanwhile.
    pub fn connect_established(
        &mut self,
        conn: ConnId,
        addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<Message>,
    ) -> bool {
        let now = self.now;
        if self.connection(conn).is_some_and(|c| c.state != ConnState::Connecting) {
            debug!(%conn, "connect cancelled");
            self.connections.remove(&conn);
            return false;
        }
        let Some(c) = self.connection_mut(conn) else {
            return false;
        };
        c.addr = addr;
        c.tx = Some(tx);
        c.state = ConnState::Handshake;
        c.firsttime = now;
        c.since = now;
        let name = c.name.clone();

        let password = self
            .config
            .policy_for(&name)
            .map(|p| p.password.clone())
            .unwrap_or_default();
        if !password.is_empty() {
            self.send(conn, Message::new("PASS", [password]));
        }
        let me = self.topology.me();
        let flags = ServerFlags {
            hub: self.config.hub,
            ..ServerFlags::default()
        };
        let hello = Message::new(
            "SERVER",
            [
                me.name.clone(),
                "1".into(),
                me.timestamp().to_string(),
                now.to_string(),
                format!("J{}", super::MAJOR_PROTOCOL),
                numeric::server_field(&me.numeric, numeric::MAX_CAPACITY),
                flags.to_field(),
                me.info.clone(),
            ],
        );
        self.send(conn, hello);
        true
    }

    /// An outbound connect failed before the socket came up.
    pub fn connect_failed(&mut self, conn: ConnId, error: &str) {
        let name = self.connection(conn).map(|c| c.name.clone()).unwrap_or_default();
        if self.connection(conn).is_some_and(|c| c.state == ConnState::Connecting) {
            self.notice_opers(&format!("Connection to {name} failed: {error}"));
        }
        self.connections.remove(&conn);
    }

    /// Start at most one automatic connect, honouring connect rules, the
    /// per-link hold and leaf status.
    pub fn try_connections(&mut self) -> Option<ConnId> {
        let now = self.now;
        let has_link = !self.server_links().is_empty();
        let mut chosen = None;
        for policy in &self.config.links {
            if !policy.autoconnect || policy.endpoint().is_none() {
                continue;
            }
            let hold = self.next_autoconnect.get(&policy.name).copied().unwrap_or(0);
            if hold > now {
                continue;
            }
            if self.find_any(&policy.name).is_some() {
                continue;
            }
            if !self.config.hub && has_link {
                continue;
            }
            if policy.rule.as_ref().is_some_and(|(rule, _)| rule.evaluate(&self.topology)) {
                debug!(link = %policy.name, "autoconnect refused by rule");
                continue;
            }
            chosen = Some((policy.name.clone(), policy.connect_freq));
            break;
        }
        let (name, freq) = chosen?;
        self.next_autoconnect.insert(name.clone(), now + freq as i64);
        self.request_connect(&name)
    }

    /// Whether an `all` rule on `name` refuses the link.
    pub fn refused_by_rule(&self, name: &str, kind: RuleKind) -> bool {
        self.config
            .policy_for(name)
            .and_then(|p| p.rule.as_ref())
            .is_some_and(|(rule, k)| *k == kind && rule.evaluate(&self.topology))
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Ping idle connections and drop dead or never-registered ones.
    pub fn check_pings(&mut self) {
        let now = self.now;
        let freq = self.config.ping_freq as i64;
        let me = self.topology.root();
        let mut ping = Vec::new();
        let mut drop = Vec::new();
        for c in self.connections.values() {
            match c.state {
                ConnState::Unknown | ConnState::Handshake => {
                    if now - c.firsttime > freq {
                        drop.push((c.id, "Registration Timeout"));
                    }
                }
                ConnState::Server | ConnState::User => {
                    let idle = now - c.last_active;
                    if c.pinged && idle >= 2 * freq {
                        drop.push((c.id, "Ping timeout"));
                    } else if !c.pinged && idle >= freq {
                        ping.push(c.id);
                    }
                }
                ConnState::Connecting | ConnState::Closing => {}
            }
        }
        for (conn, reason) in drop {
            self.exit_client(conn, Target::Conn(conn), me, reason);
        }
        let me_name = self.topology.me().name.clone();
        for conn in ping {
            let msg = if self.connection(conn).is_some_and(|c| c.state == ConnState::Server) {
                self.from_me(super::msgtab::TOK_PING, [me_name.clone()])
            } else {
                Message::new("PING", [me_name.clone()])
            };
            self.send(conn, msg);
            if let Some(c) = self.connection_mut(conn) {
                c.pinged = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::topology::{NewUser, User, UserModes};

    fn ircd() -> Ircd {
        let config = Config::from_json(r#"{"name": "hub.lagun.co", "numeric": "A"}"#).unwrap();
        Ircd::new(config, 1_000_000_000).unwrap()
    }

    fn user(numeric: &str) -> NewUser {
        NewUser {
            nick: format!("u{numeric}"),
            numeric: numeric.into(),
            info: "real".into(),
            hop: 0,
            from: ConnId(0),
            user: User {
                username: "u".into(),
                host: "h".into(),
                ip: "AAAAAA".into(),
                modes: UserModes::default(),
                lastnick: 1,
            },
        }
    }

    #[test]
    fn flood_clock_throttles_untrusted_reads() {
        let mut ircd = ircd();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = ircd.accept(None, tx);
        assert_eq!(ircd.read_delay(conn), 0);
        ircd.charge_penalty(conn, 9);
        assert_eq!(ircd.read_delay(conn), 0);
        ircd.charge_penalty(conn, 3);
        assert_eq!(ircd.read_delay(conn), 3);
        ircd.now += 3;
        assert_eq!(ircd.read_delay(conn), 0);
    }

    #[test]
    fn flood_clock_is_lifted_to_now() {
        let mut ircd = ircd();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = ircd.accept(None, tx);
        ircd.now += 100;
        ircd.read_delay(conn);
        assert_eq!(ircd.connection(conn).map(|c| c.since), Some(ircd.now));
    }

    #[test]
    fn unregistered_exit_sends_error() {
        let mut ircd = ircd();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ircd.accept(None, tx);
        let me = ircd.topology.root();
        assert_eq!(
            ircd.exit_client(conn, Target::Conn(conn), me, "Bogus protocol (X10)"),
            Disposition::ConnectionClosed
        );
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.to_wire(), "ERROR :Closing Link: * by hub.lagun.co (Bogus protocol (X10))");
        assert!(rx.try_recv().is_err());
        assert_eq!(ircd.connection(conn).map(|c| c.state), Some(ConnState::Closing));
    }

    #[test]
    fn user_numerics_skip_used_ones() {
        let mut ircd = ircd();
        assert_eq!(ircd.alloc_user_numeric().as_deref(), Some("AAAAA"));
        assert_eq!(ircd.alloc_user_numeric().as_deref(), Some("AAAAB"));
    }

    #[test]
    fn user_numerics_run_out_at_capacity() {
        let mut ircd = ircd();
        let root = ircd.topology.root();
        if let Some(me) = ircd.topology.server_mut(root) {
            me.capacity = 1;
        }
        let first = ircd.alloc_user_numeric().unwrap();
        ircd.topology.add_user(root, user(&first)).unwrap();
        let second = ircd.alloc_user_numeric().unwrap();
        ircd.topology.add_user(root, user(&second)).unwrap();
        assert_eq!(ircd.alloc_user_numeric(), None);
    }

    #[test]
    fn register_command_rejects_duplicates() {
        let mut ircd = ircd();
        fn noop(_: &mut Ircd, _: &super::super::msgtab::Request<'_>) -> Disposition {
            Disposition::Continue
        }
        assert!(ircd.register_command(CommandSpec::new("SERVSET", "SERVSET", noop)).is_ok());
        assert!(ircd.register_command(CommandSpec::new("SERVSET", "SVS", noop)).is_err());
        assert!(ircd.table().find_client("SERVSET").is_some());
    }
}
