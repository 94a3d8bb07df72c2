//! SERVER, SQUIT and CONNECT: bringing links up, resolving collisions and
//! taking servers down.

use tracing::{debug, info, warn};

use crate::irc::burst;
use crate::irc::conf::{LinkPolicy, LinkRole, RuleKind};
use crate::irc::ircd::{ConnState, Found, Ircd, Target};
use crate::irc::matching::{eq_ignore_case, matches};
use crate::irc::message::Message;
use crate::irc::msgtab::{Disposition, Request, Status, TOK_SERVER, TOK_SQUIT, TOK_WALLOPS};
use crate::irc::numeric;
use crate::irc::topology::{ConnId, NewServer, NodeId, ServerFlags};
use crate::irc::{atoi, truncate, HOSTLEN, MAJOR_PROTOCOL, MAXHOPS, MINOR_PROTOCOL, OLDEST_TS, REALLEN};

/// Seconds after a ghost during which a repeat collision is taken as a
/// ghost loop.
const GHOST_WINDOW: i64 = 20;

/// A validated SERVER line.
#[derive(Debug, Clone)]
pub struct PendingHandshake {
    pub name: String,
    pub hop: u32,
    pub start: i64,
    pub timestamp: i64,
    pub protocol: u16,
    /// The protocol field as it will be propagated (`J10`, `P10`).
    pub proto_field: String,
    /// `J` marker: the server is still bursting.
    pub junction: bool,
    pub numeric: String,
    pub capacity: u32,
    pub flags: ServerFlags,
    pub info: String,
    pub policy: Option<LinkPolicy>,
}

impl PendingHandshake {
    /// `YYXXX` field as carried on the wire.
    pub fn numeric_field(&self) -> String {
        numeric::server_field(&self.numeric, self.capacity)
    }
}

/// Which leaf/hub restriction a new server is running into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkLine {
    /// The arrival link may only be a leaf.
    Leaf,
    /// The arrival link is not a hub, or the new server is too far away.
    Hub,
    /// We are not a hub and already have an uplink.
    LocalLeaf,
}

impl LinkLine {
    fn describe(self, link: &str, host: &str, mask: &str) -> String {
        match self {
            LinkLine::Hub => format!("Non-Hub link {link} <- {host}({mask})"),
            LinkLine::Leaf | LinkLine::LocalLeaf => format!("Leaf-only link {link} <- {host}({mask})"),
        }
    }
}

/// Outcome of the collision search.
enum Collision {
    /// Nothing else stands in the way.
    Clear,
    /// The line was fully handled (someone was removed or the link refused).
    Done(Disposition),
}

/// Refuse a new server. A fresh link is closed; a server behind an
/// established link is squit back up that link.
pub fn exit_new_server(
    ctx: &mut Ircd,
    cptr: ConnId,
    sptr: Option<NodeId>,
    host: &str,
    timestamp: i64,
    reason: &str,
) -> Disposition {
    match sptr {
        None => {
            let me = ctx.topology.root();
            ctx.exit_client(cptr, Target::Conn(cptr), me, reason)
        }
        Some(_) => {
            let squit = ctx.from_me(TOK_SQUIT, [host.to_owned(), timestamp.to_string(), reason.to_owned()]);
            ctx.send(cptr, squit);
            Disposition::Continue
        }
    }
}

/// Whether removing `a` also removes `b`.
pub fn a_kills_b_too(ctx: &Ircd, a: NodeId, b: NodeId) -> bool {
    a != ctx.topology.root() && ctx.topology.is_ancestor(a, b)
}

/// SERVER from a fresh connection, a handshake, or an established link
/// introducing a server behind it.
pub fn m_server(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let cptr = req.conn;
    let me = ctx.topology.root();
    let on_link = req.status == Status::Server;
    let sptr = if on_link {
        match req.node().filter(|id| ctx.topology.get(*id).is_some_and(|n| n.is_server())) {
            Some(id) => Some(id),
            None => {
                debug!(conn = %cptr, "SERVER from a non-server prefix");
                return Disposition::Continue;
            }
        }
    } else {
        None
    };
    let sender_target = sptr.map_or(Target::Conn(cptr), Target::Node);

    // ── Validation ──────────────────────────────────────────────
    if req.params.len() < 7 {
        return ctx.exit_client(cptr, Target::Conn(cptr), me, "Need more parameters");
    }
    let p = req.params;
    let declared = p[0].as_str();

    if !on_link {
        if let Some(jupe) = ctx.config.jupe_for(declared) {
            let reason = format!("Juped: {}", jupe.reason);
            ctx.notice_opers(&format!("Refused juped server {declared}"));
            return ctx.exit_client(cptr, Target::Conn(cptr), me, &reason);
        }
    }

    let proto = p[4].as_str();
    if proto.len() != 3 || !(proto.starts_with('P') || proto.starts_with('J')) {
        return ctx.exit_client(cptr, sender_target, me, &format!("Bogus protocol ({proto})"));
    }
    let proto_field = if on_link {
        proto.to_owned()
    } else {
        format!("J{}", &proto[1..])
    };
    let mut protocol = atoi(&proto[1..]).clamp(0, i64::from(MAJOR_PROTOCOL)) as u16;
    if let Some(link) = ctx.link_node(cptr).and_then(|n| n.server()) {
        protocol = protocol.min(link.protocol);
    }

    let Some(hop) = u32::try_from(atoi(&p[1])).ok().filter(|h| *h <= MAXHOPS) else {
        return ctx.exit_client(cptr, sender_target, me, &format!("Bogus hopcount ({})", p[1]));
    };
    let start = atoi(&p[2]);
    let timestamp = atoi(&p[3]);
    if timestamp < OLDEST_TS || (hop == 1 && start < OLDEST_TS) {
        return ctx.exit_client(cptr, sender_target, me, &format!("Bogus timestamps ({} {})", p[2], p[3]));
    }

    let info = truncate(p[p.len() - 1].as_str(), REALLEN).to_owned();
    if protocol < MINOR_PROTOCOL {
        ctx.notice_opers(&format!(
            "Got incompatible protocol version ({protocol}) from {}",
            link_name(ctx, cptr)
        ));
        return exit_new_server(ctx, cptr, sptr, declared, timestamp, &format!("Incompatible protocol: {proto}"));
    }

    let host = truncate(declared, HOSTLEN).to_owned();
    if !host.bytes().all(|b| (b'!'..=b'~').contains(&b)) || !host.contains('.') {
        ctx.notice_opers(&format!("Bogus server name ({host}) from {}", link_name(ctx, cptr)));
        return ctx.exit_client(cptr, Target::Conn(cptr), me, &format!("Bogus server name ({host})"));
    }

    let Some((server_numeric, capacity)) = numeric::split_server_field(&p[5]) else {
        return exit_new_server(ctx, cptr, sptr, &host, timestamp, &format!("Bogus numeric ({})", p[5]));
    };
    let flags = if p.len() > 7 {
        ServerFlags::from_field(&p[6])
    } else {
        ServerFlags::default()
    };

    let mut hs = PendingHandshake {
        name: host.clone(),
        hop,
        start,
        timestamp,
        protocol,
        junction: proto_field.starts_with('J'),
        proto_field,
        numeric: server_numeric,
        capacity,
        flags,
        info,
        policy: None,
    };

    // ── Leaf/hub policy and access ──────────────────────────────
    let mut line: Option<LinkLine> = None;
    let mut lh_kill: Option<NodeId> = None;
    let mut lh_mask = String::from("!");

    if on_link {
        if hs.info.is_empty() {
            return ctx.exit_client(
                cptr,
                Target::Conn(cptr),
                me,
                &format!("No server info specified for {host}"),
            );
        }
        let link = ctx.link_node(cptr).map(|n| (n.id, n.name.clone(), n.timestamp()));
        let Some((link_id, uplink, link_ts)) = link else {
            return Disposition::Continue;
        };
        hs.policy = ctx.config.policy_for(&uplink).cloned();
        let role = hs.policy.as_ref().map(|p| p.role);
        let max_hops = hs.policy.as_ref().and_then(|p| p.max_hops).unwrap_or(0);

        if role == Some(LinkRole::Leaf) && (max_hops == 0 || hop > max_hops) {
            line = Some(LinkLine::Leaf);
            lh_kill = (timestamp > link_ts).then_some(link_id);
            lh_mask = uplink.clone();
        } else if !matches!(role, Some(LinkRole::Hub | LinkRole::Uworld)) || (max_hops > 0 && hop > max_hops) {
            line = Some(LinkLine::Hub);
            if matches!(role, Some(LinkRole::Hub | LinkRole::Uworld)) {
                lh_mask = uplink.clone();
            }
            if !hs.junction {
                lh_kill = sptr.and_then(|s| first_junction(ctx, s));
            }
        }
    } else {
        if let Some(c) = ctx.connection_mut(cptr) {
            c.name = host.clone();
        }
        if ctx.refused_by_rule(&host, RuleKind::All) {
            ctx.notice_opers(&format!("Refused connection from {host}."));
            return ctx.exit_client(cptr, Target::Conn(cptr), me, "Disallowed by connection rule");
        }
        let Some(policy) = ctx.config.policy_for(&host).cloned() else {
            let reason = format!("Access denied. No conf line for server {host}");
            ctx.notice_opers(&reason);
            return ctx.exit_client(cptr, Target::Conn(cptr), me, &reason);
        };
        let offered = ctx.connection(cptr).and_then(|c| c.password.clone()).unwrap_or_default();
        if !policy.password.is_empty() && offered != policy.password {
            let reason = format!("No Access (passwd mismatch) {host}");
            ctx.notice_opers(&reason);
            return ctx.exit_client(cptr, Target::Conn(cptr), me, &reason);
        }
        if !policy.allows_numeric(&hs.numeric) {
            let reason = format!("Numeric out of range {}", hs.numeric);
            ctx.notice_opers(&format!("{reason} from {host}"));
            return ctx.exit_client(cptr, Target::Conn(cptr), me, &reason);
        }
        if !ctx.config.hub && !ctx.server_links().is_empty() {
            line = Some(LinkLine::LocalLeaf);
        }
        hs.policy = Some(policy);
    }

    let mut ghost = ctx
        .link_node(cptr)
        .and_then(|n| n.server())
        .map_or(0, |s| s.ghost);

    // ── Collisions ──────────────────────────────────────────────
    match resolve_collisions(ctx, req, &hs, sptr, &mut line, &mut lh_kill, &mut ghost) {
        Collision::Done(d) => return d,
        Collision::Clear => {}
    }

    if let Some(active) = line {
        let reason = active.describe(&link_name(ctx, cptr), &host, &lh_mask);
        match lh_kill {
            None => return exit_new_server(ctx, cptr, sptr, &host, timestamp, &reason),
            Some(lh) => {
                let killed = sptr.is_some_and(|s| a_kills_b_too(ctx, lh, s));
                if ctx.exit_client(cptr, Target::Node(lh), me, &reason) == Disposition::ConnectionClosed {
                    return Disposition::ConnectionClosed;
                }
                if killed {
                    return Disposition::Continue;
                }
            }
        }
    }

    if let Some(up) = sptr {
        introduce_remote(ctx, cptr, up, hs);
        return Disposition::Continue;
    }

    // ── First SERVER on this connection ─────────────────────────
    let state = ctx.connection(cptr).map(|c| c.state);
    let mut link_ts = timestamp;
    let my_start = ctx.topology.me().timestamp();
    if start > OLDEST_TS {
        if start < my_start {
            ctx.notice_opers(&format!("got earlier start time: {start} < {my_start}"));
            if let Some(root) = ctx.topology.server_mut(me) {
                root.timestamp = start;
            }
        } else if start > my_start && state == Some(ConnState::Unknown) {
            link_ts = ctx.now;
        }
    }
    burst::server_estab(ctx, cptr, hs, link_ts, ghost)
}

/// Display name of the arrival link for notices.
fn link_name(ctx: &Ircd, conn: ConnId) -> String {
    ctx.link_node(conn)
        .map(|n| n.name.clone())
        .or_else(|| ctx.connection(conn).map(|c| c.name.clone()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| conn.to_string())
}

/// First node flagged as a junction on the way from `from` to the root.
fn first_junction(ctx: &Ircd, from: NodeId) -> Option<NodeId> {
    path_to_root(ctx, from).into_iter().find(|id| {
        ctx.topology
            .get(*id)
            .and_then(|n| n.server())
            .is_some_and(|s| s.flags.junction)
    })
}

/// `from` and its ancestors, excluding the root.
fn path_to_root(ctx: &Ircd, from: NodeId) -> Vec<NodeId> {
    let root = ctx.topology.root();
    let mut out = Vec::new();
    let mut cur = Some(from);
    while let Some(id) = cur.filter(|id| *id != root) {
        out.push(id);
        cur = ctx.topology.get(id).and_then(|n| n.up);
    }
    out
}

fn ts_of(ctx: &Ircd, id: NodeId) -> i64 {
    ctx.topology.get(id).map_or(0, |n| n.timestamp())
}

fn from_of(ctx: &Ircd, id: NodeId) -> Option<ConnId> {
    ctx.topology.get(id).and_then(|n| n.from)
}

/// Name of `id` and the name of what it hangs off.
fn name_and_up(ctx: &Ircd, id: NodeId) -> (String, String) {
    let node = ctx.topology.get(id);
    let name = node.map(|n| n.name.clone()).unwrap_or_default();
    let up = if ctx.is_local(id) {
        ctx.topology.me().name.clone()
    } else {
        node.and_then(|n| n.up)
            .and_then(|u| ctx.topology.get(u))
            .map(|u| u.name.clone())
            .unwrap_or_default()
    };
    (name, up)
}

/// Break loops and duplicates until nothing else carries the new server's
/// name or numeric.
fn resolve_collisions(
    ctx: &mut Ircd,
    req: &Request<'_>,
    hs: &PendingHandshake,
    sptr: Option<NodeId>,
    line: &mut Option<LinkLine>,
    lh_kill: &mut Option<NodeId>,
    ghost: &mut i64,
) -> Collision {
    let cptr = req.conn;
    let me = ctx.topology.root();
    let host = hs.name.as_str();
    let timestamp = hs.timestamp;

    loop {
        let found = ctx.find_any(host).or_else(|| {
            ctx.topology.find_by_numeric(&hs.numeric).map(|id| {
                if id == me {
                    Found::Me
                } else {
                    Found::Node(id)
                }
            })
        });
        let Some(found) = found else {
            return Collision::Clear;
        };

        let acptr = match found {
            Found::Me => {
                let reason = format!("nick collision with me, check server number in M:? ({host})");
                return Collision::Done(ctx.exit_client(cptr, Target::Conn(cptr), me, &reason));
            }
            Found::Link(other) if other == cptr => return Collision::Clear,
            Found::Link(other) => {
                if line.is_none() {
                    let d = ctx.exit_client(cptr, Target::Conn(other), me, "Just connected via another link");
                    if d == Disposition::ConnectionClosed {
                        return Collision::Done(d);
                    }
                }
                return Collision::Clear;
            }
            Found::Node(id) => id,
        };

        let Some(existing) = ctx.topology.get(acptr) else {
            return Collision::Clear;
        };
        if !eq_ignore_case(&existing.name, host) {
            let other = existing.name.clone();
            let wallops = ctx.from_me(TOK_WALLOPS, [format!("SERVER Numeric Collision: {other} != {host}")]);
            ctx.send_to_servers(Some(cptr), &wallops);
            let reason = format!("NUMERIC collision between {host} and {other}. Is your server numeric correct ?");
            return Collision::Done(ctx.exit_client(cptr, Target::Conn(cptr), me, &reason));
        }
        if !existing.is_server() {
            let reason = format!("Nickname {host} already exists!");
            return Collision::Done(ctx.exit_client(cptr, Target::Conn(cptr), me, &reason));
        }
        if existing.info.starts_with("JUPE") || ctx.config.is_uworld(&existing.name) {
            let info = existing.info.clone();
            if sptr.is_none() {
                return Collision::Done(ctx.exit_client(cptr, Target::Conn(cptr), me, &info));
            }
            let sender = sptr
                .and_then(|s| ctx.topology.get(s))
                .map(|s| s.name.clone())
                .unwrap_or_default();
            let wallops = ctx.from_me(
                TOK_WALLOPS,
                [format!("Received :{sender} SERVER {host} from {} !?!", link_name(ctx, cptr))],
            );
            ctx.send(cptr, wallops);
            return Collision::Done(exit_new_server(ctx, cptr, sptr, host, timestamp, &info));
        }

        // Kill the second youngest link.
        let acptr_path = path_to_root(ctx, acptr);
        let sptr_path = sptr.map(|s| path_to_root(ctx, s)).unwrap_or_default();
        let paths = || acptr_path.iter().chain(sptr_path.iter()).copied();

        let mut c3 = Some(acptr);
        for id in paths() {
            if ts_of(ctx, id) > c3.map_or(0, |c| ts_of(ctx, c)) {
                c3 = Some(id);
            }
        }
        let mut c2 = None;
        if c3.is_some_and(|c| timestamp > ts_of(ctx, c)) {
            c3 = None;
            c2 = Some(acptr);
        }
        let ts_or_new = |ctx: &Ircd, c: Option<NodeId>| c.map_or(timestamp, |c| ts_of(ctx, c));
        for id in paths() {
            if Some(id) != c3 && ts_of(ctx, id) > ts_or_new(ctx, c2) {
                c2 = Some(id);
            }
        }
        if c3.is_some() && timestamp > ts_or_new(ctx, c2) {
            c2 = None;
        }

        if ts_or_new(ctx, c2) == ts_or_new(ctx, c3) {
            let newcomer = || {
                let up = sptr
                    .and_then(|s| ctx.topology.get(s))
                    .map_or_else(|| ctx.topology.me().name.clone(), |s| s.name.clone());
                (host.to_owned(), up)
            };
            let (n2, n2up) = c2.map_or_else(newcomer, |c| name_and_up(ctx, c));
            let (n3, n3up) = c3.map_or_else(newcomer, |c| name_and_up(ctx, c));
            let n2 = if n2.as_bytes() > n2up.as_bytes() { n2up } else { n2 };
            let n3 = if n3.as_bytes() > n3up.as_bytes() { n3up } else { n3 };
            if n3.as_bytes() > n2.as_bytes() {
                std::mem::swap(&mut c2, &mut c3);
            }
        }

        let Some(c2) = c2 else {
            let reason = format!(
                "server {host} already exists and is {} seconds younger.",
                ts_of(ctx, acptr) - timestamp
            );
            return Collision::Done(exit_new_server(ctx, cptr, sptr, host, timestamp, &reason));
        };

        if from_of(ctx, c2) == Some(cptr) || sptr.is_some() {
            let mut killed_from = from_of(ctx, c2);
            if line.is_some() {
                if lh_kill.is_some_and(|lh| a_kills_b_too(ctx, lh, c2)) {
                    return Collision::Clear;
                }
                if from_of(ctx, c2) == Some(cptr) || lh_kill.is_some_and(|lh| a_kills_b_too(ctx, c2, lh)) {
                    *line = None;
                } else {
                    *lh_kill = None;
                    return Collision::Clear;
                }
            }
            let d = if ctx.now - *ghost < GHOST_WINDOW {
                killed_from = from_of(ctx, acptr);
                ctx.exit_client(cptr, Target::Node(acptr), me, "Ghost loop")
            } else {
                let reason = format!(
                    "Loop <-- {host} (new link is {} seconds younger)",
                    ts_or_new(ctx, c3) - ts_of(ctx, c2)
                );
                ctx.exit_client(cptr, Target::Node(c2), me, &reason)
            };
            if d == Disposition::ConnectionClosed {
                return Collision::Done(d);
            }
            if killed_from == Some(cptr) {
                return Collision::Done(Disposition::Continue);
            }
        } else {
            if line.is_some() {
                if lh_kill.is_some_and(|lh| a_kills_b_too(ctx, lh, acptr)) {
                    return Collision::Clear;
                }
                if from_of(ctx, acptr) == Some(cptr) || lh_kill.is_some_and(|lh| a_kills_b_too(ctx, acptr, lh)) {
                    *line = None;
                } else {
                    *lh_kill = None;
                    return Collision::Clear;
                }
            }
            *ghost = ctx.now;
            let d = ctx.exit_client(cptr, Target::Node(acptr), me, "Ghost");
            if d == Disposition::ConnectionClosed {
                return Collision::Done(d);
            }
            return Collision::Clear;
        }
    }
}

/// Attach a server announced by an established link and pass it on.
fn introduce_remote(ctx: &mut Ircd, cptr: ConnId, up: NodeId, hs: PendingHandshake) {
    let mut flags = hs.flags;
    if hs.junction {
        flags.burst = true;
        flags.junction = true;
    }
    let new = NewServer {
        name: hs.name.clone(),
        numeric: hs.numeric.clone(),
        info: hs.info.clone(),
        hop: hs.hop,
        from: cptr,
        timestamp: hs.timestamp,
        protocol: hs.protocol,
        capacity: hs.capacity,
        flags,
    };
    if ctx.topology.add_server(up, new).is_none() {
        warn!(server = %hs.name, "introducer vanished");
        return;
    }
    let up_name = ctx.topology.get(up).map(|n| n.name.clone()).unwrap_or_default();
    if hs.junction {
        ctx.notice_opers(&format!("Net junction: {up_name} {}", hs.name));
    }
    info!(server = %hs.name, via = %up_name, hop = hs.hop, "server introduced");

    let up_numeric = ctx.topology.get(up).map(|n| n.numeric.clone()).unwrap_or_default();
    let announce = Message::new(
        TOK_SERVER,
        [
            hs.name.clone(),
            hs.hop.saturating_add(1).to_string(),
            "0".into(),
            hs.timestamp.to_string(),
            hs.proto_field.clone(),
            hs.numeric_field(),
            hs.flags.to_field(),
            hs.info.clone(),
        ],
    )
    .from_numeric(&up_numeric);
    ctx.send_to_servers(Some(cptr), &announce);
}

// ── SQUIT ────────────────────────────────────────────────────────

/// SQUIT, from a server link or an operator.
pub fn m_squit(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    if req.status == Status::Server {
        ms_squit(ctx, req)
    } else {
        mo_squit(ctx, req)
    }
}

/// `SQ <server> <ts> :reason`.
fn ms_squit(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let cptr = req.conn;
    let Some(sender) = req.node().or_else(|| ctx.connection(cptr).and_then(|c| c.node)) else {
        return Disposition::Continue;
    };
    let target = req.param(0).unwrap_or_default();
    let reason = req.param(2).unwrap_or("");
    let root = ctx.topology.root();

    let found = ctx
        .topology
        .find_by_name(target)
        .or_else(|| numeric::canonical_server(target).and_then(|n| ctx.topology.find_by_numeric(&n)));
    let Some(mut victim) = found else {
        debug!(conn = %cptr, target, "SQUIT for unknown server");
        return Disposition::Continue;
    };
    // A SQUIT naming us drops the link it came over.
    if victim == root {
        match ctx.connection(cptr).and_then(|c| c.node) {
            Some(link) => victim = link,
            None => return Disposition::Continue,
        }
    }

    let ts = req.param(1).map_or(0, atoi);
    let known = ts_of(ctx, victim);
    if ts != 0 && ts != known {
        debug!(conn = %cptr, target, ts, known, "ignoring SQUIT with wrong timestamp");
        return Disposition::Continue;
    }
    ctx.exit_client(cptr, Target::Node(victim), sender, reason)
}

/// `SQUIT <server mask> [:reason]`.
fn mo_squit(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let cptr = req.conn;
    let Some(oper) = req.node() else {
        return Disposition::Continue;
    };
    let mask = req.param(0).unwrap_or_default();
    let nick = ctx.topology.get(oper).map(|n| n.name.clone()).unwrap_or_default();
    let reason = req.param(1).map_or_else(|| nick.clone(), str::to_owned);
    let root = ctx.topology.root();

    let victim = ctx.topology.servers_from(root).into_iter().find(|id| {
        *id != root && ctx.topology.get(*id).is_some_and(|n| matches(mask, &n.name))
    });
    let Some(victim) = victim else {
        ctx.reply(cptr, "402", [mask, "No such server"]);
        return Disposition::Continue;
    };
    let name = ctx.topology.get(victim).map(|n| n.name.clone()).unwrap_or_default();
    ctx.notice_opers(&format!("Received SQUIT {name} from {nick} ({reason})"));
    ctx.exit_client(cptr, Target::Node(victim), oper, &reason)
}

// ── CONNECT ──────────────────────────────────────────────────────

/// CONNECT from an operator: `CONNECT <server>`. Only local connects.
pub fn mo_connect(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    if req.status == Status::Server {
        debug!(conn = %req.conn, "remote CONNECT ignored");
        return Disposition::Continue;
    }
    let cptr = req.conn;
    let mask = req.param(0).unwrap_or_default();
    let Some(name) = ctx
        .config
        .links
        .iter()
        .find(|p| matches(mask, &p.name))
        .map(|p| p.name.clone())
    else {
        notice(ctx, cptr, &format!("Connect: Host {mask} not listed in config"));
        return Disposition::Continue;
    };

    match ctx.find_any(&name) {
        Some(Found::Node(id)) => {
            let via = ctx
                .topology
                .get(id)
                .and_then(|n| n.from)
                .map(|c| link_name(ctx, c))
                .unwrap_or_default();
            notice(ctx, cptr, &format!("Connect: Server {name} already exists from {via}."));
        }
        Some(Found::Link(_)) => {
            notice(ctx, cptr, &format!("Connect: Connection to {name} already in progress."));
        }
        Some(Found::Me) => notice(ctx, cptr, "Connect: Cannot connect to myself."),
        None => {
            if ctx.request_connect(&name).is_some() {
                notice(ctx, cptr, &format!("*** Connecting to {name}."));
            } else {
                notice(ctx, cptr, &format!("Connect: No address known for {name}."));
            }
        }
    }
    Disposition::Continue
}

fn notice(ctx: &Ircd, conn: ConnId, text: &str) {
    let Some(nick) = ctx.link_node(conn).map(|n| n.name.clone()) else {
        return;
    };
    let msg = Message::new("NOTICE", [nick, text.to_owned()]).from_name(&ctx.topology.me().name);
    ctx.send(conn, msg);
}
