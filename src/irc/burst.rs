//! Net burst: what a freshly established link is told, and how the
//! BURST, CREATE, END_OF_BURST and EOB_ACK lines that make up the other
//! side's burst are absorbed.

use tracing::{debug, info, warn};

use super::channel::{parse_burst_members, ChannelModes, Membership};
use super::handlers::registration::introduction;
use super::handlers::server::PendingHandshake;
use super::ircd::{ConnState, Ircd};
use super::message::Message;
use super::msgtab::{
    Disposition, Request, TOK_BURST, TOK_CREATE, TOK_END_OF_BURST, TOK_EOB_ACK, TOK_SERVER, TOK_TOPIC,
};
use super::numeric;
use super::topology::{ConnId, NewServer, NodeId};
use super::{atoi, MAJOR_PROTOCOL};

/// Promote `conn` to a server link and send it our view of the network.
pub fn server_estab(
    ctx: &mut Ircd,
    conn: ConnId,
    hs: PendingHandshake,
    link_ts: i64,
    ghost: i64,
) -> Disposition {
    let state = ctx.connection(conn).map(|c| c.state);
    let me = ctx.topology.me().clone();

    if state == Some(ConnState::Unknown) {
        let password = hs.policy.as_ref().map(|p| p.password.clone()).unwrap_or_default();
        if !password.is_empty() {
            ctx.send(conn, Message::new("PASS", [password]));
        }
        let flags = me.server().map(|s| s.flags.to_field()).unwrap_or_else(|| "+".into());
        ctx.send(
            conn,
            Message::new(
                "SERVER",
                [
                    me.name.clone(),
                    "1".into(),
                    me.timestamp().to_string(),
                    link_ts.to_string(),
                    format!("J{MAJOR_PROTOCOL}"),
                    numeric::server_field(&me.numeric, numeric::MAX_CAPACITY),
                    flags,
                    me.info.clone(),
                ],
            ),
        );
    }

    let mut flags = hs.flags;
    flags.burst = true;
    flags.junction = true;
    let new = NewServer {
        name: hs.name.clone(),
        numeric: hs.numeric.clone(),
        info: hs.info.clone(),
        hop: hs.hop,
        from: conn,
        timestamp: link_ts,
        protocol: hs.protocol,
        capacity: hs.capacity,
        flags,
    };
    let root = ctx.topology.root();
    let Some(node) = ctx.topology.add_server(root, new) else {
        return Disposition::Continue;
    };
    if let Some(server) = ctx.topology.server_mut(node) {
        server.ghost = ghost;
    }
    if let Some(c) = ctx.connection_mut(conn) {
        c.state = ConnState::Server;
        c.node = Some(node);
        c.name = hs.name.clone();
    }
    info!(%conn, server = %hs.name, numeric = %hs.numeric, "link established");
    ctx.notice_opers(&format!("Link with {} established.", hs.name));
    ctx.notice_opers(&format!("Net junction: {} {}", me.name, hs.name));

    let announce = Message::new(
        TOK_SERVER,
        [
            hs.name.clone(),
            "2".into(),
            "0".into(),
            link_ts.to_string(),
            format!("J{MAJOR_PROTOCOL}"),
            hs.numeric_field(),
            hs.flags.to_field(),
            hs.info.clone(),
        ],
    )
    .from_numeric(&me.numeric);
    ctx.send_to_servers(Some(conn), &announce);

    send_burst(ctx, conn);
    Disposition::Continue
}

/// Servers, then users, then channels, then one EB.
fn send_burst(ctx: &Ircd, conn: ConnId) {
    let root = ctx.topology.root();
    let skip = |id: NodeId| ctx.topology.get(id).is_some_and(|n| n.from == Some(conn));

    for id in ctx.topology.servers_from(root) {
        if id == root || skip(id) {
            continue;
        }
        let Some(node) = ctx.topology.get(id) else {
            continue;
        };
        let Some(server) = node.server() else {
            continue;
        };
        let Some(up) = node.up.and_then(|u| ctx.topology.get(u)) else {
            continue;
        };
        let marker = if server.flags.burst { 'J' } else { 'P' };
        let msg = Message::new(
            TOK_SERVER,
            [
                node.name.clone(),
                node.hop.saturating_add(1).to_string(),
                "0".into(),
                server.timestamp.to_string(),
                format!("{marker}{}", server.protocol),
                numeric::server_field(&node.numeric, server.capacity),
                server.flags.to_field(),
                node.info.clone(),
            ],
        )
        .from_numeric(&up.numeric);
        ctx.send(conn, msg);
    }

    for id in ctx.topology.users_from(root) {
        if skip(id) {
            continue;
        }
        if let Some(intro) = introduction(ctx, id) {
            ctx.send(conn, intro);
        }
    }

    let me = &ctx.topology.me().numeric;
    for chan in ctx.channels.iter() {
        let members = chan.burst_members(|id| {
            ctx.topology
                .get(id)
                .filter(|n| n.from != Some(conn))
                .map(|n| n.numeric.clone())
        });
        if members.is_empty() {
            continue;
        }
        let mut params = vec![chan.name.clone(), chan.created.to_string()];
        params.extend(chan.modes.to_words());
        params.push(members);
        if !chan.bans.is_empty() {
            params.push(format!("%{}", chan.bans.join(" ")));
        }
        ctx.send(conn, Message::new(TOK_BURST, params).from_numeric(me));

        if let Some(topic) = &chan.topic {
            ctx.send(
                conn,
                Message::new(TOK_TOPIC, [chan.name.clone(), topic.text.clone()]).from_numeric(me),
            );
        }
    }

    ctx.send(conn, Message::new(TOK_END_OF_BURST, Vec::<String>::new()).from_numeric(me));
}

/// Whether the link a line came over is still mid-burst.
fn link_bursting(ctx: &Ircd, conn: ConnId) -> bool {
    ctx.link_node(conn)
        .and_then(|n| n.server())
        .is_some_and(|s| s.flags.burst || s.flags.burst_ack)
}

/// END_OF_BURST from a server.
pub fn ms_end_of_burst(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(sender) = req.node() else {
        return Disposition::Continue;
    };
    let Some(node) = ctx.topology.get(sender).filter(|n| n.is_server()) else {
        return Disposition::Continue;
    };
    let name = node.name.clone();
    let numeric = node.numeric.clone();
    ctx.notice_opers(&format!("Completed net.burst from {name}."));

    let forward = Message::new(TOK_END_OF_BURST, Vec::<String>::new()).from_numeric(&numeric);
    ctx.send_to_servers(Some(req.conn), &forward);

    if let Some(server) = ctx.topology.server_mut(sender) {
        server.flags.burst = false;
        server.flags.burst_ack = true;
    }
    if ctx.is_local(sender) {
        let ack = ctx.from_me(TOK_EOB_ACK, Vec::<String>::new());
        ctx.send(req.conn, ack);
    }
    Disposition::Continue
}

/// EOB_ACK from a server.
pub fn ms_end_of_burst_ack(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(sender) = req.node() else {
        return Disposition::Continue;
    };
    let Some(node) = ctx.topology.get(sender).filter(|n| n.is_server()) else {
        return Disposition::Continue;
    };
    let name = node.name.clone();
    let numeric = node.numeric.clone();
    ctx.notice_opers(&format!("{name} acknowledged end of net.burst."));

    let forward = Message::new(TOK_EOB_ACK, Vec::<String>::new()).from_numeric(&numeric);
    ctx.send_to_servers(Some(req.conn), &forward);

    if let Some(server) = ctx.topology.server_mut(sender) {
        server.flags.burst_ack = false;
    }
    Disposition::Continue
}

/// BURST: `B #chan ts [+modes [key] [limit]] [members] [%bans]`.
///
/// The older creation time wins. When theirs is older our ops, voices,
/// modes and bans go; when ours is older theirs are ignored and their
/// members join without privileges.
pub fn ms_burst(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(sender) = req.node() else {
        return Disposition::Continue;
    };
    let name = req.params[0].as_str();
    let ts = atoi(&req.params[1]);
    let bursting = link_bursting(ctx, req.conn);

    let existed = ctx.channels.get(name).map(|c| c.created);
    if let Some(ours) = existed.filter(|ours| *ours != ts) {
        if !bursting {
            warn!(conn = %req.conn, channel = name, ours, theirs = ts, "protocol violation: BURST timestamp mismatch outside burst");
        }
    }

    let mut rest = &req.params[2..];
    let mut their_modes = ChannelModes::empty();
    if rest.first().is_some_and(|w| w.starts_with('+')) {
        let used = their_modes.merge_words(rest);
        rest = &rest[used..];
    }
    let mut members = Vec::new();
    let mut bans = Vec::new();
    for word in rest {
        if let Some(list) = word.strip_prefix('%') {
            bans.extend(list.split(' ').filter(|b| !b.is_empty()).map(str::to_owned));
        } else {
            for (n, m) in parse_burst_members(word) {
                match numeric::canonical_user(&n).and_then(|n| ctx.topology.find_by_numeric(&n)) {
                    Some(id) => members.push((id, m)),
                    None => debug!(channel = name, member = %n, "unknown member in BURST"),
                }
            }
        }
    }

    let chan = ctx.channels.get_or_create(name, ts);
    let accept = match existed {
        None => {
            chan.modes = ChannelModes::empty();
            true
        }
        Some(ours) if ts < ours => {
            chan.created = ts;
            chan.reset_privileges();
            true
        }
        Some(ours) => ts == ours,
    };
    if accept {
        merge_modes(&mut chan.modes, &their_modes);
        for ban in bans {
            if !chan.bans.contains(&ban) {
                chan.bans.push(ban);
            }
        }
    }
    let mut joined = Vec::new();
    for (id, m) in members {
        if chan.members.insert(id, if accept { m } else { Membership::default() }).is_none() {
            joined.push(id);
        }
    }
    for id in joined {
        ctx.deliver_join(id, name);
    }

    let numeric = ctx.topology.get(sender).map(|n| n.numeric.clone()).unwrap_or_default();
    let forward = Message::new(TOK_BURST, req.params.iter().cloned()).from_numeric(&numeric);
    ctx.send_to_servers(Some(req.conn), &forward);
    Disposition::Continue
}

fn merge_modes(ours: &mut ChannelModes, theirs: &ChannelModes) {
    ours.invite_only |= theirs.invite_only;
    ours.moderated |= theirs.moderated;
    ours.no_external |= theirs.no_external;
    ours.topic_locked |= theirs.topic_locked;
    ours.private |= theirs.private;
    ours.secret |= theirs.secret;
    if theirs.key.is_some() {
        ours.key.clone_from(&theirs.key);
    }
    if theirs.limit.is_some() {
        ours.limit = theirs.limit;
    }
}

/// CREATE: `C #a,#b ts` from a user.
pub fn ms_create(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(user) = req.node().filter(|id| ctx.topology.get(*id).is_some_and(|n| !n.is_server())) else {
        return Disposition::Continue;
    };
    let ts = atoi(&req.params[1]);
    let bursting = link_bursting(ctx, req.conn);

    for name in req.params[0].split(',').filter(|n| !n.is_empty()) {
        let existed = ctx.channels.get(name).map(|c| c.created);
        let chan = ctx.channels.get_or_create(name, ts);
        let membership = match existed {
            Some(ours) if ts > ours => {
                if !bursting {
                    debug!(channel = name, ours, theirs = ts, "CREATE for an older channel; no ops");
                }
                Membership::default()
            }
            Some(ours) if ts < ours => {
                chan.created = ts;
                chan.reset_privileges();
                Membership::OP
            }
            _ => Membership::OP,
        };
        chan.members.insert(user, membership);
        ctx.deliver_join(user, name);
    }

    let numeric = ctx.topology.get(user).map(|n| n.numeric.clone()).unwrap_or_default();
    let forward = Message::new(TOK_CREATE, req.params.iter().cloned()).from_numeric(&numeric);
    ctx.send_to_servers(Some(req.conn), &forward);
    Disposition::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::conf::Config;
    use tokio::sync::mpsc;

    const NOW: i64 = 1_000_000_000;

    /// A hub with b.lagun.co linked and two of its users, bob (`ABAAA`)
    /// and ann (`ABAAB`). `#lagoon` exists with bob opped, created at `ts`.
    fn hub_with_channel(ts: i64) -> (Ircd, ConnId, mpsc::UnboundedReceiver<Message>) {
        let json = r#"{
            "name": "hub.lagun.co",
            "numeric": "A",
            "hub": true,
            "links": [{"name": "b.lagun.co", "password": "pw", "role": "hub"}]
        }"#;
        let mut ircd = Ircd::new(Config::from_json(json).unwrap(), NOW).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ircd.accept(None, tx);
        ircd.dispatch(conn, "PASS :pw").unwrap();
        ircd.dispatch(conn, &format!("SERVER b.lagun.co 1 {NOW} {NOW} J10 AB]]] +h :B")).unwrap();
        ircd.dispatch(conn, &format!("AB N bob 2 {NOW} b b.host AAAAAA ABAAA :Bob")).unwrap();
        ircd.dispatch(conn, &format!("AB N ann 2 {NOW} a a.host AAAAAA ABAAB :Ann")).unwrap();

        let bob = user(&ircd, "ABAAA");
        ircd.channels.get_or_create("#lagoon", ts).members.insert(bob, Membership::OP);
        (ircd, conn, rx)
    }

    fn user(ircd: &Ircd, numeric: &str) -> NodeId {
        ircd.topology.find_by_numeric(numeric).unwrap()
    }

    fn membership(ircd: &Ircd, numeric: &str) -> Option<Membership> {
        let id = user(ircd, numeric);
        ircd.channels.get("#lagoon").and_then(|c| c.members.get(&id).copied())
    }

    // ── BURST ────────────────────────────────────────────────────

    #[test]
    fn equal_burst_merges_modes_and_ops() {
        let (mut ircd, conn, _rx) = hub_with_channel(NOW + 10);
        ircd.dispatch(conn, &format!("AB B #lagoon {} +m ABAAB:o", NOW + 10)).unwrap();

        let chan = ircd.channels.get("#lagoon").unwrap();
        assert_eq!(chan.created, NOW + 10);
        assert!(chan.modes.moderated);
        assert_eq!(membership(&ircd, "ABAAA"), Some(Membership::OP));
        assert_eq!(membership(&ircd, "ABAAB"), Some(Membership::OP));
    }

    #[test]
    fn younger_burst_joins_without_privileges() {
        let (mut ircd, conn, _rx) = hub_with_channel(NOW + 10);
        ircd.dispatch(conn, &format!("AB B #lagoon {} +m ABAAB:o", NOW + 20)).unwrap();

        let chan = ircd.channels.get("#lagoon").unwrap();
        assert_eq!(chan.created, NOW + 10);
        assert!(!chan.modes.moderated);
        assert_eq!(membership(&ircd, "ABAAA"), Some(Membership::OP));
        assert_eq!(membership(&ircd, "ABAAB"), Some(Membership::default()));
    }

    // ── CREATE ───────────────────────────────────────────────────

    #[test]
    fn create_for_an_older_channel_gets_no_ops() {
        let (mut ircd, conn, _rx) = hub_with_channel(NOW);
        ircd.dispatch(conn, &format!("ABAAB C #lagoon {}", NOW + 5)).unwrap();

        assert_eq!(ircd.channels.get("#lagoon").map(|c| c.created), Some(NOW));
        assert_eq!(membership(&ircd, "ABAAA"), Some(Membership::OP));
        assert_eq!(membership(&ircd, "ABAAB"), Some(Membership::default()));
    }

    #[test]
    fn older_create_takes_the_channel_over() {
        let (mut ircd, conn, _rx) = hub_with_channel(NOW);
        ircd.dispatch(conn, &format!("ABAAB C #lagoon {}", NOW - 5)).unwrap();

        assert_eq!(ircd.channels.get("#lagoon").map(|c| c.created), Some(NOW - 5));
        assert_eq!(membership(&ircd, "ABAAA"), Some(Membership::default()));
        assert_eq!(membership(&ircd, "ABAAB"), Some(Membership::OP));
    }

    #[test]
    fn older_modes_merge() {
        let mut ours = ChannelModes::empty();
        let mut theirs = ChannelModes::empty();
        theirs.moderated = true;
        theirs.key = Some("k".into());
        merge_modes(&mut ours, &theirs);
        assert!(ours.moderated);
        assert_eq!(ours.key.as_deref(), Some("k"));
        assert!(!ours.no_external);
    }
}
