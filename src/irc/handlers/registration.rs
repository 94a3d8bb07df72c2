//! Connection registration and the user lifecycle: PASS, NICK, USER, QUIT,
//! PING, PONG, ERROR and OPER.

use tracing::{debug, info};

use crate::irc::ircd::{ConnState, Ircd, PendingUser, Target};
use crate::irc::matching::{eq_ignore_case, matches};
use crate::irc::message::Message;
use crate::irc::msgtab::{Disposition, Request, Status, TOK_NICK, TOK_PONG};
use crate::irc::numeric;
use crate::irc::topology::{ConnId, NewUser, NodeId, User, UserModes};
use crate::irc::{atoi, truncate, MAXHOPS, NICKLEN, REALLEN, VERSION};

/// Characters allowed anywhere in a nick besides letters.
const NICK_SPECIAL: &[u8] = b"[]\\`_^{|}";

/// Whether `nick` is acceptable: starts with a letter or special, then
/// letters, digits, specials or `-`.
pub fn valid_nick(nick: &str) -> bool {
    let bytes = nick.as_bytes();
    let Some(first) = bytes.first() else {
        return false;
    };
    bytes.len() <= NICKLEN
        && (first.is_ascii_alphabetic() || NICK_SPECIAL.contains(first))
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || NICK_SPECIAL.contains(b) || *b == b'-')
}

// ── PASS / USER ──────────────────────────────────────────────────

pub fn m_pass(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let password = req.params.join(" ");
    if let Some(c) = ctx.connection_mut(req.conn) {
        c.password = Some(password);
    }
    Disposition::Continue
}

/// `USER <user> <mode> <unused> :<realname>`
pub fn m_user(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(c) = ctx.connection_mut(req.conn) else {
        return Disposition::Continue;
    };
    if c.state != ConnState::Unknown {
        return Disposition::Continue;
    }
    c.user = Some(PendingUser {
        username: req.params[0].clone(),
        realname: req.params[req.params.len() - 1].clone(),
    });
    if c.name.is_empty() {
        return Disposition::Continue;
    }
    register_user(ctx, req.conn)
}

// ── NICK ─────────────────────────────────────────────────────────

pub fn m_nick(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    match req.status {
        Status::Server => ms_nick(ctx, req),
        Status::Unregistered => mr_nick(ctx, req),
        Status::Client | Status::Oper => m_nick_change(ctx, req),
    }
}

/// Validate a nick offered by a local connection, replying on failure.
fn check_local_nick(ctx: &Ircd, conn: ConnId, req: &Request<'_>) -> Option<String> {
    let Some(wanted) = req.param(0).filter(|n| !n.is_empty()) else {
        ctx.reply(conn, "431", ["No nickname given"]);
        return None;
    };
    let nick = truncate(wanted, NICKLEN);
    if !valid_nick(nick) {
        ctx.reply(conn, "432", [wanted, "Erroneous Nickname"]);
        return None;
    }
    Some(nick.to_owned())
}

fn mr_nick(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let conn = req.conn;
    if ctx.connection(conn).map(|c| c.state) != Some(ConnState::Unknown) {
        return Disposition::Continue;
    }
    let Some(nick) = check_local_nick(ctx, conn, req) else {
        return Disposition::Continue;
    };
    let taken = ctx.topology.find_by_name(&nick).is_some()
        || ctx
            .connections()
            .any(|c| c.id != conn && c.state == ConnState::Unknown && eq_ignore_case(&c.name, &nick));
    if taken {
        ctx.reply(conn, "433", [nick.as_str(), "Nickname is already in use."]);
        return Disposition::Continue;
    }
    let ready = match ctx.connection_mut(conn) {
        Some(c) => {
            c.name = nick;
            c.user.is_some()
        }
        None => false,
    };
    if ready {
        register_user(ctx, conn)
    } else {
        Disposition::Continue
    }
}

/// Turn a connection that has sent NICK and USER into a user.
fn register_user(ctx: &mut Ircd, conn: ConnId) -> Disposition {
    let Some(c) = ctx.connection(conn) else {
        return Disposition::Continue;
    };
    let (nick, addr) = (c.name.clone(), c.addr);
    let Some(pending) = c.user.clone() else {
        return Disposition::Continue;
    };
    if ctx.topology.find_by_name(&nick).is_some() {
        ctx.reply(conn, "433", [nick.as_str(), "Nickname is already in use."]);
        if let Some(c) = ctx.connection_mut(conn) {
            c.name.clear();
        }
        return Disposition::Continue;
    }

    let Some(numeric) = ctx.alloc_user_numeric() else {
        let root = ctx.topology.root();
        return ctx.exit_client(conn, Target::Conn(conn), root, "Server full");
    };
    let host = addr.map_or_else(|| "localhost".to_owned(), |a| a.ip().to_string());
    let user = User {
        username: format!("~{}", truncate(&pending.username, 10)),
        host,
        ip: numeric::encode_ip(addr.map(|a| a.ip())),
        modes: UserModes::default(),
        lastnick: ctx.now,
    };
    let root = ctx.topology.root();
    let new = NewUser {
        nick: nick.clone(),
        numeric,
        info: truncate(&pending.realname, REALLEN).to_owned(),
        hop: 0,
        from: conn,
        user,
    };
    let Some(id) = ctx.topology.add_user(root, new) else {
        return Disposition::Continue;
    };
    if let Some(c) = ctx.connection_mut(conn) {
        c.state = ConnState::User;
        c.node = Some(id);
        c.user = None;
    }
    info!(%conn, %nick, "client registered");

    let me = ctx.topology.me();
    let (me_name, start) = (me.name.clone(), me.timestamp());
    ctx.reply(conn, "001", [format!("Welcome to the Internet Relay Network {nick}")]);
    ctx.reply(conn, "002", [format!("Your host is {me_name}, running version {VERSION}")]);
    ctx.reply(conn, "003", [format!("This server was created {start}")]);
    ctx.reply(conn, "004", [me_name.as_str(), VERSION, "oiw", "biklmnopstv"]);

    if let Some(intro) = introduction(ctx, id) {
        ctx.send_to_servers(None, &intro);
    }
    Disposition::Continue
}

/// The NICK line introducing user `id` to a server link.
pub fn introduction(ctx: &Ircd, id: NodeId) -> Option<Message> {
    let node = ctx.topology.get(id)?;
    let user = node.user()?;
    let server = node.up.and_then(|u| ctx.topology.get(u))?;
    let mut params = vec![
        node.name.clone(),
        node.hop.saturating_add(1).to_string(),
        user.lastnick.to_string(),
        user.username.clone(),
        user.host.clone(),
    ];
    let modes = user.modes.letters();
    if !modes.is_empty() {
        params.push(format!("+{modes}"));
    }
    params.extend([user.ip.clone(), node.numeric.clone(), node.info.clone()]);
    Some(Message::new(TOK_NICK, params).from_numeric(&server.numeric))
}

fn m_nick_change(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let conn = req.conn;
    let Some(id) = req.node() else {
        return Disposition::Continue;
    };
    let Some(nick) = check_local_nick(ctx, conn, req) else {
        return Disposition::Continue;
    };
    if let Some(holder) = ctx.topology.find_by_name(&nick) {
        if holder != id {
            ctx.reply(conn, "433", [nick.as_str(), "Nickname is already in use."]);
            return Disposition::Continue;
        }
    }
    let now = ctx.now;
    change_nick(ctx, id, &nick, now, None);
    Disposition::Continue
}

/// Rename `id`, tell local clients that can see it, and propagate.
fn change_nick(ctx: &mut Ircd, id: NodeId, nick: &str, ts: i64, except: Option<ConnId>) {
    let Some(mask) = ctx.user_mask(id) else {
        return;
    };
    let changed = Message::new("NICK", [nick]).from_name(&mask);
    ctx.notify_peers(id, &changed, true);

    ctx.topology.rename(id, nick);
    if let Some(user) = ctx.topology.user_mut(id) {
        user.lastnick = ts;
    }
    let numeric = ctx.topology.get(id).map(|n| n.numeric.clone()).unwrap_or_default();
    let forward = Message::new(TOK_NICK, [nick.to_owned(), ts.to_string()]).from_numeric(&numeric);
    ctx.send_to_servers(except, &forward);
}

/// NICK from a server: a new user (`N nick hop ts user host [+modes] ip
/// numeric :info` from a server) or a nick change (`N nick ts` from a user).
fn ms_nick(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let cptr = req.conn;
    let Some(sender) = req.node() else {
        return Disposition::Continue;
    };
    let Some(sender_is_server) = ctx.topology.get(sender).map(|n| n.is_server()) else {
        return Disposition::Continue;
    };
    let p = req.params;

    if !sender_is_server {
        let Some(nick) = req.param(0) else {
            return Disposition::Continue;
        };
        let ts = req.param(1).map_or(ctx.now, atoi);
        if let Some(holder) = ctx.topology.find_by_name(nick).filter(|h| *h != sender) {
            return nick_collision(ctx, cptr, holder, sender, ts);
        }
        change_nick(ctx, sender, nick, ts, Some(cptr));
        return Disposition::Continue;
    }

    if p.len() < 8 {
        debug!(conn = %cptr, "protocol violation: short NICK introduction");
        return Disposition::Continue;
    }
    let has_modes = p.len() >= 9 && p[5].starts_with('+');
    let (modes, rest) = if has_modes {
        (UserModes::parse(&p[5]), &p[6..])
    } else {
        (UserModes::default(), &p[5..])
    };
    let (ip, yxx, info) = (&rest[0], &rest[1], &rest[rest.len() - 1]);
    let Some(numeric) = numeric::canonical_user(yxx) else {
        debug!(conn = %cptr, numeric = %yxx, "bad user numeric");
        return Disposition::Continue;
    };
    let Some(hop) = u32::try_from(atoi(&p[1])).ok().filter(|h| *h <= MAXHOPS) else {
        debug!(conn = %cptr, hop = %p[1], "bogus hopcount in NICK");
        return Disposition::Continue;
    };
    let nick = p[0].as_str();
    let ts = atoi(&p[2]);

    if let Some(holder) = ctx.topology.find_by_name(nick) {
        let holder_ts = ctx.topology.get(holder).and_then(|n| n.user()).map(|u| u.lastnick);
        match holder_ts {
            None => {
                kill_newcomer(ctx, cptr, &numeric, "Nick collision with a server");
                return Disposition::Continue;
            }
            Some(theirs) if ts > theirs => {
                kill_newcomer(ctx, cptr, &numeric, "Nick collision");
                return Disposition::Continue;
            }
            Some(theirs) => {
                let root = ctx.topology.root();
                let d = ctx.kill_user(cptr, holder, root, "Nick collision", None);
                if d == Disposition::ConnectionClosed {
                    return d;
                }
                if ts == theirs {
                    kill_newcomer(ctx, cptr, &numeric, "Nick collision");
                    return Disposition::Continue;
                }
            }
        }
    }

    let new = NewUser {
        nick: nick.to_owned(),
        numeric,
        info: truncate(info, REALLEN).to_owned(),
        hop,
        from: cptr,
        user: User {
            username: p[3].clone(),
            host: p[4].clone(),
            ip: ip.clone(),
            modes,
            lastnick: ts,
        },
    };
    let Some(id) = ctx.topology.add_user(sender, new) else {
        return Disposition::Continue;
    };
    if let Some(intro) = introduction(ctx, id) {
        ctx.send_to_servers(Some(cptr), &intro);
    }
    Disposition::Continue
}

/// A remote nick change ran into `holder`; the older nick keeps it.
fn nick_collision(ctx: &mut Ircd, cptr: ConnId, holder: NodeId, changer: NodeId, ts: i64) -> Disposition {
    let root = ctx.topology.root();
    let theirs = ctx.topology.get(holder).and_then(|n| n.user()).map_or(0, |u| u.lastnick);
    let mut d = Disposition::Continue;
    if ts >= theirs {
        d = ctx.kill_user(cptr, changer, root, "Nick collision", None);
    }
    if ts <= theirs && d == Disposition::Continue {
        d = ctx.kill_user(cptr, holder, root, "Nick collision", None);
    }
    d
}

/// Kill a user we never created: only the link that sent it needs telling.
fn kill_newcomer(ctx: &Ircd, cptr: ConnId, numeric: &str, reason: &str) {
    let me = ctx.topology.me().name.clone();
    let kill = ctx.from_me(crate::irc::msgtab::TOK_KILL, [numeric.to_owned(), format!("{me} ({reason})")]);
    ctx.send(cptr, kill);
}

// ── QUIT / ERROR ─────────────────────────────────────────────────

pub fn m_quit(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let cptr = req.conn;
    let root = ctx.topology.root();
    match req.status {
        Status::Server => {
            let Some(user) = req.node().filter(|id| ctx.topology.get(*id).is_some_and(|n| !n.is_server())) else {
                return Disposition::Continue;
            };
            let reason = req.param(0).unwrap_or("");
            ctx.exit_client(cptr, Target::Node(user), user, reason)
        }
        Status::Unregistered => ctx.exit_client(cptr, Target::Conn(cptr), root, "Quit"),
        Status::Client | Status::Oper => {
            let reason = match req.param(0).filter(|r| !r.is_empty()) {
                Some(text) => format!("Quit: {text}"),
                None => "Quit".to_owned(),
            };
            let killer = req.node().unwrap_or(root);
            ctx.exit_client(cptr, Target::Conn(cptr), killer, &reason)
        }
    }
}

/// ERROR from a link or a server in handshake: only worth a notice.
pub fn m_error(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let text = req.param(0).unwrap_or("<>");
    let state = ctx.connection(req.conn).map(|c| c.state);
    if !matches!(state, Some(ConnState::Server | ConnState::Handshake | ConnState::Unknown)) {
        return Disposition::Continue;
    }
    let from = req
        .node()
        .and_then(|id| ctx.topology.get(id))
        .map(|n| n.name.clone())
        .or_else(|| ctx.connection(req.conn).map(|c| c.name.clone()))
        .unwrap_or_default();
    ctx.notice_opers(&format!("ERROR :from {from} -- {text}"));
    Disposition::Continue
}

// ── PING / PONG ──────────────────────────────────────────────────

pub fn m_ping(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let me = ctx.topology.me().name.clone();
    let Some(origin) = req.param(0) else {
        ctx.reply(req.conn, "409", ["No origin specified"]);
        return Disposition::Continue;
    };
    let pong = if req.status == Status::Server {
        ctx.from_me(TOK_PONG, [me, origin.to_owned()])
    } else {
        Message::new("PONG", [me.clone(), origin.to_owned()]).from_name(&me)
    };
    ctx.send(req.conn, pong);
    Disposition::Continue
}

/// Activity was already noted by dispatch.
pub fn m_pong(_ctx: &mut Ircd, _req: &Request<'_>) -> Disposition {
    Disposition::Continue
}

// ── OPER ─────────────────────────────────────────────────────────

/// `OPER <name> <password>`
pub fn m_oper(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    if req.status == Status::Server {
        return Disposition::Continue;
    }
    let conn = req.conn;
    let Some(id) = req.node() else {
        return Disposition::Continue;
    };
    if req.status == Status::Oper {
        ctx.reply(conn, "381", ["You are now an IRC operator"]);
        return Disposition::Continue;
    }
    let Some(node) = ctx.topology.get(id) else {
        return Disposition::Continue;
    };
    let Some(user) = node.user() else {
        return Disposition::Continue;
    };
    let userhost = format!("{}@{}", user.username, user.host);
    let nick = node.name.clone();

    let name = &req.params[0];
    let account = ctx
        .config
        .opers
        .iter()
        .find(|o| eq_ignore_case(&o.name, name) && matches(&o.host, &userhost));
    let Some(account) = account else {
        ctx.reply(conn, "491", ["No O-lines for your host"]);
        return Disposition::Continue;
    };
    if account.password != req.params[1] {
        ctx.reply(conn, "464", ["Password Incorrect"]);
        ctx.notice_opers(&format!("Failed OPER attempt by {nick} ({userhost})"));
        return Disposition::Continue;
    }

    if let Some(user) = ctx.topology.user_mut(id) {
        user.modes.oper = true;
        user.modes.wallops = true;
    }
    ctx.reply(conn, "381", ["You are now an IRC operator"]);
    ctx.notice_opers(&format!("{nick} ({userhost}) is now operator (O)"));
    Disposition::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_rules() {
        assert!(valid_nick("wings"));
        assert!(valid_nick("[lagun]"));
        assert!(valid_nick("a-1"));
        assert!(!valid_nick("1abc"));
        assert!(!valid_nick("-abc"));
        assert!(!valid_nick(""));
        assert!(!valid_nick("has space"));
        assert!(!valid_nick("waytoolongnickname"));
    }
}
