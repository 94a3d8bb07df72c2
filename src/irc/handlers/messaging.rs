//! Routing along the tree: PRIVMSG, NOTICE, WALLOPS and KILL, plus the
//! channel commands JOIN and TOPIC.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::irc::channel::{valid_channel_name, Membership, Topic};
use crate::irc::ircd::{Ircd, Target};
use crate::irc::message::Message;
use crate::irc::msgtab::{
    Disposition, Request, Status, TOK_CREATE, TOK_JOIN, TOK_KILL, TOK_NOTICE, TOK_PRIVMSG, TOK_TOPIC, TOK_WALLOPS,
};
use crate::irc::numeric;
use crate::irc::topology::{ConnId, NodeId};
use crate::irc::atoi;

impl Ircd {
    /// Prefix for delivering something `id` did to a local client.
    fn client_prefix(&self, id: NodeId) -> String {
        self.user_mask(id)
            .or_else(|| self.topology.get(id).map(|n| n.name.clone()))
            .unwrap_or_default()
    }

    /// Whether `id` is a user attached to this server.
    fn is_local_user(&self, id: NodeId) -> bool {
        self.topology.get(id).is_some_and(|n| !n.is_server()) && self.is_local(id)
    }

    /// Send `msg` to every local client sharing a channel with `user`, once
    /// each; with `include_self`, to `user` too if it is local.
    pub fn notify_peers(&self, user: NodeId, msg: &Message, include_self: bool) {
        let mut seen: HashSet<NodeId> = HashSet::new();
        if include_self && self.is_local_user(user) {
            seen.insert(user);
        }
        for chan in self.channels.of_member(user) {
            for member in chan.members.keys() {
                if *member != user && self.is_local_user(*member) {
                    seen.insert(*member);
                }
            }
        }
        for id in seen {
            if let Some(conn) = self.topology.get(id).and_then(|n| n.from) {
                self.send(conn, msg.clone());
            }
        }
    }

    /// Show local members of `channel` that `user` joined it.
    pub fn deliver_join(&self, user: NodeId, channel: &str) {
        let Some(chan) = self.channels.get(channel) else {
            return;
        };
        let msg = Message::new("JOIN", [chan.name.clone()]).from_name(&self.client_prefix(user));
        for member in chan.members.keys() {
            if self.is_local_user(*member) {
                if let Some(conn) = self.topology.get(*member).and_then(|n| n.from) {
                    self.send(conn, msg.clone());
                }
            }
        }
    }

    /// Remove `victim` from the whole network on our own authority.
    pub fn kill_user(
        &mut self,
        cptr: ConnId,
        victim: NodeId,
        killer: NodeId,
        reason: &str,
        except: Option<ConnId>,
    ) -> Disposition {
        let path = format!("{} ({reason})", self.topology.me().name);
        self.kill_with_path(cptr, victim, killer, &path, except)
    }

    /// Remove `victim`, sending KILL with `path` to every server link except
    /// `except`. The victim's own exit sends no QUIT.
    pub fn kill_with_path(
        &mut self,
        cptr: ConnId,
        victim: NodeId,
        killer: NodeId,
        path: &str,
        except: Option<ConnId>,
    ) -> Disposition {
        let Some(node) = self.topology.get(victim) else {
            return Disposition::Continue;
        };
        let (nick, numeric, from) = (node.name.clone(), node.numeric.clone(), node.from);
        let killer_numeric = self
            .topology
            .get(killer)
            .map_or_else(String::new, |k| k.numeric.clone());

        let kill = Message::new(TOK_KILL, [numeric.as_str(), path]).from_numeric(&killer_numeric);
        self.send_to_servers(except, &kill);

        if self.is_local_user(victim) {
            if let Some(conn) = from {
                let notice = Message::new("KILL", [nick.as_str(), path]).from_name(&self.client_prefix(killer));
                self.send(conn, notice);
            }
        }
        info!(%nick, path, "killing user");
        self.mark_killed(victim);
        self.exit_client(cptr, Target::Node(victim), killer, &format!("Killed ({path})"))
    }
}

// ── PRIVMSG / NOTICE ─────────────────────────────────────────────

pub fn m_privmsg(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    relay(ctx, req, false);
    Disposition::Continue
}

pub fn m_notice(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    relay(ctx, req, true);
    Disposition::Continue
}

/// Deliver a PRIVMSG or NOTICE to each comma-separated target. Errors are
/// reported to local clients, and never for NOTICE.
fn relay(ctx: &Ircd, req: &Request<'_>, notice: bool) {
    let (command, token) = if notice {
        ("NOTICE", TOK_NOTICE)
    } else {
        ("PRIVMSG", TOK_PRIVMSG)
    };
    let local = req.status != Status::Server;
    let complain = |code: &str, params: &[&str]| {
        if local && !notice {
            ctx.reply(req.conn, code, params.iter().copied());
        }
    };
    let Some(sender) = req.node() else {
        return;
    };
    let Some(targets) = req.param(0).filter(|t| !t.is_empty()) else {
        complain("411", &[format!("No recipient given ({command})").as_str()]);
        return;
    };
    let Some(text) = req.param(1).filter(|t| !t.is_empty()) else {
        complain("412", &["No text to send"]);
        return;
    };
    let from_numeric = ctx.topology.get(sender).map(|n| n.numeric.clone()).unwrap_or_default();
    let prefix = ctx.client_prefix(sender);

    for target in targets.split(',').filter(|t| !t.is_empty()) {
        if target.starts_with('#') || target.starts_with('&') {
            let Some(chan) = ctx.channels.get(target) else {
                complain("401", &[target, "No such nick/channel"]);
                continue;
            };
            if local && chan.modes.no_external && !chan.members.contains_key(&sender) {
                complain("404", &[target, "Cannot send to channel"]);
                continue;
            }
            let mut links: HashSet<ConnId> = HashSet::new();
            for member in chan.members.keys() {
                if *member == sender {
                    continue;
                }
                let Some(via) = ctx.topology.get(*member).and_then(|n| n.from) else {
                    continue;
                };
                if ctx.is_local_user(*member) {
                    let msg = Message::new(command, [chan.name.as_str(), text]).from_name(&prefix);
                    ctx.send(via, msg);
                } else if via != req.conn {
                    links.insert(via);
                }
            }
            for via in links {
                let msg = Message::new(token, [chan.name.as_str(), text]).from_numeric(&from_numeric);
                ctx.send(via, msg);
            }
            continue;
        }

        let found = if local {
            ctx.topology.find_by_name(target)
        } else {
            numeric::canonical_user(target)
                .and_then(|n| ctx.topology.find_by_numeric(&n))
                .or_else(|| ctx.topology.find_by_name(target))
        };
        let Some(node) = found.and_then(|id| ctx.topology.get(id)).filter(|n| !n.is_server()) else {
            complain("401", &[target, "No such nick/channel"]);
            continue;
        };
        let Some(via) = node.from else {
            continue;
        };
        if ctx.is_local_user(node.id) {
            let msg = Message::new(command, [node.name.as_str(), text]).from_name(&prefix);
            ctx.send(via, msg);
        } else if via == req.conn {
            debug!(conn = %req.conn, target, "message would go back where it came from");
        } else {
            let msg = Message::new(token, [node.numeric.as_str(), text]).from_numeric(&from_numeric);
            ctx.send(via, msg);
        }
    }
}

// ── WALLOPS ──────────────────────────────────────────────────────

pub fn m_wallops(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(sender) = req.node() else {
        return Disposition::Continue;
    };
    let text = req.params[0].as_str();
    let numeric = ctx.topology.get(sender).map(|n| n.numeric.clone()).unwrap_or_default();
    let forward = Message::new(TOK_WALLOPS, [text]).from_numeric(&numeric);
    ctx.send_to_servers(Some(req.conn), &forward);

    let shown = Message::new("WALLOPS", [text]).from_name(&ctx.client_prefix(sender));
    for id in ctx.topology.users_of(ctx.topology.root()) {
        let Some(node) = ctx.topology.get(*id) else {
            continue;
        };
        if node.user().is_some_and(|u| u.modes.wallops) {
            if let Some(conn) = node.from {
                ctx.send(conn, shown.clone());
            }
        }
    }
    Disposition::Continue
}

// ── KILL ─────────────────────────────────────────────────────────

/// KILL from an operator (`KILL nick :reason`) or a server
/// (`D numeric :path`).
pub fn m_kill(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let cptr = req.conn;
    let target = req.params[0].as_str();
    let reason = req.params[1].as_str();

    if req.status == Status::Server {
        let found = numeric::canonical_user(target)
            .and_then(|n| ctx.topology.find_by_numeric(&n))
            .or_else(|| ctx.topology.find_by_name(target));
        let Some(victim) = found.filter(|id| ctx.topology.get(*id).is_some_and(|n| !n.is_server())) else {
            debug!(conn = %cptr, target, "KILL for unknown user");
            return Disposition::Continue;
        };
        let Some(killer) = req.node().or_else(|| ctx.connection(cptr).and_then(|c| c.node)) else {
            return Disposition::Continue;
        };
        let (nick, by) = (
            ctx.topology.get(victim).map(|n| n.name.clone()).unwrap_or_default(),
            ctx.topology.get(killer).map(|n| n.name.clone()).unwrap_or_default(),
        );
        ctx.notice_opers(&format!("Received KILL message for {nick}. From {by} Path: {reason}"));
        return ctx.kill_with_path(cptr, victim, killer, reason, Some(cptr));
    }

    let Some(oper) = req.node() else {
        return Disposition::Continue;
    };
    let Some(victim) = ctx.topology.find_by_name(target) else {
        ctx.reply(cptr, "401", [target, "No such nick/channel"]);
        return Disposition::Continue;
    };
    if ctx.topology.get(victim).is_some_and(|n| n.is_server()) {
        ctx.reply(cptr, "483", ["You can't kill a server!"]);
        return Disposition::Continue;
    }
    let by = ctx.topology.get(oper).map(|n| n.name.clone()).unwrap_or_default();
    ctx.notice_opers(&format!("Received KILL message for {target}. From {by} Path: {reason}"));
    let path = format!("{}!{by} ({reason})", ctx.topology.me().name);
    ctx.kill_with_path(cptr, victim, oper, &path, None)
}

// ── JOIN ─────────────────────────────────────────────────────────

/// JOIN from a local client (`JOIN #a,#b [key,key]`) or a server
/// (`J #chan [ts]` from a user).
pub fn m_join(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(user) = req.node().filter(|id| ctx.topology.get(*id).is_some_and(|n| !n.is_server())) else {
        return Disposition::Continue;
    };
    let numeric = ctx.topology.get(user).map(|n| n.numeric.clone()).unwrap_or_default();

    if req.status == Status::Server {
        let ts = req.param(1).map_or(ctx.now, atoi);
        for name in req.params[0].split(',').filter(|n| valid_channel_name(n)) {
            ctx.channels
                .get_or_create(name, ts)
                .members
                .entry(user)
                .or_insert_with(Membership::default);
            ctx.deliver_join(user, name);
        }
        let forward = Message::new(TOK_JOIN, req.params.iter().cloned()).from_numeric(&numeric);
        ctx.send_to_servers(Some(req.conn), &forward);
        return Disposition::Continue;
    }

    let keys: Vec<&str> = req.param(1).map_or_else(Vec::new, |k| k.split(',').collect());
    for (i, name) in req.params[0].split(',').enumerate() {
        if !valid_channel_name(name) {
            ctx.reply(req.conn, "403", [name, "No such channel"]);
            continue;
        }
        let now = ctx.now;
        let created = match ctx.channels.get(name) {
            Some(chan) if chan.members.contains_key(&user) => continue,
            Some(chan) => {
                let refusal = if chan.modes.invite_only {
                    Some(("473", "Cannot join channel (+i)"))
                } else if chan.modes.key.as_deref().is_some_and(|k| keys.get(i) != Some(&k)) {
                    Some(("475", "Cannot join channel (+k)"))
                } else if chan.modes.limit.is_some_and(|l| chan.members.len() >= l) {
                    Some(("471", "Cannot join channel (+l)"))
                } else {
                    None
                };
                if let Some((code, text)) = refusal {
                    ctx.reply(req.conn, code, [name, text]);
                    continue;
                }
                false
            }
            None => true,
        };

        let chan = ctx.channels.get_or_create(name, now);
        let membership = if created { Membership::OP } else { Membership::default() };
        chan.members.insert(user, membership);
        let (chan_name, chan_ts) = (chan.name.clone(), chan.created);

        let announce = if created {
            Message::new(TOK_CREATE, [chan_name.clone(), chan_ts.to_string()])
        } else {
            Message::new(TOK_JOIN, [chan_name.clone(), chan_ts.to_string()])
        }
        .from_numeric(&numeric);
        ctx.send_to_servers(None, &announce);

        ctx.deliver_join(user, &chan_name);
        send_topic(ctx, req.conn, &chan_name);
        send_names(ctx, req.conn, &chan_name);
    }
    Disposition::Continue
}

fn send_topic(ctx: &Ircd, conn: ConnId, name: &str) {
    if let Some(topic) = ctx.channels.get(name).and_then(|c| c.topic.as_ref()) {
        ctx.reply(conn, "332", [name, topic.text.as_str()]);
    }
}

fn send_names(ctx: &Ircd, conn: ConnId, name: &str) {
    let Some(chan) = ctx.channels.get(name) else {
        return;
    };
    let names: Vec<String> = chan
        .members
        .iter()
        .filter_map(|(id, m)| {
            let nick = &ctx.topology.get(*id)?.name;
            Some(match (m.op, m.voice) {
                (true, _) => format!("@{nick}"),
                (false, true) => format!("+{nick}"),
                _ => nick.clone(),
            })
        })
        .collect();
    ctx.reply(conn, "353", ["=", name, names.join(" ").as_str()]);
    ctx.reply(conn, "366", [name, "End of /NAMES list."]);
}

// ── TOPIC ────────────────────────────────────────────────────────

/// TOPIC from a local client (`TOPIC #chan [:text]`) or a server
/// (`T #chan [setter ts] :text`).
pub fn m_topic(ctx: &mut Ircd, req: &Request<'_>) -> Disposition {
    let Some(sender) = req.node() else {
        return Disposition::Continue;
    };
    let name = req.params[0].as_str();
    let local = req.status != Status::Server;

    if local && req.params.len() < 2 {
        match ctx.channels.get(name) {
            None => ctx.reply(req.conn, "403", [name, "No such channel"]),
            Some(chan) if chan.topic.is_none() => ctx.reply(req.conn, "331", [name, "No topic is set."]),
            Some(_) => send_topic(ctx, req.conn, name),
        }
        return Disposition::Continue;
    }
    let Some(text) = req.params.last().filter(|_| req.params.len() >= 2) else {
        return Disposition::Continue;
    };

    let Some(chan) = ctx.channels.get(name) else {
        if local {
            ctx.reply(req.conn, "403", [name, "No such channel"]);
        }
        return Disposition::Continue;
    };
    if local {
        let Some(membership) = chan.members.get(&sender) else {
            ctx.reply(req.conn, "442", [name, "You're not on that channel"]);
            return Disposition::Continue;
        };
        if chan.modes.topic_locked && !membership.op {
            ctx.reply(req.conn, "482", [name, "You're not channel operator"]);
            return Disposition::Continue;
        }
    }

    let set_by = ctx.topology.get(sender).map(|n| n.name.clone()).unwrap_or_default();
    let now = ctx.now;
    let chan_name = chan.name.clone();
    if let Some(chan) = ctx.channels.get_mut(name) {
        chan.topic = Some(Topic {
            text: text.clone(),
            set_by,
            set_at: now,
        });
    }

    let shown = Message::new("TOPIC", [chan_name.as_str(), text.as_str()]).from_name(&ctx.client_prefix(sender));
    if let Some(chan) = ctx.channels.get(name) {
        for member in chan.members.keys() {
            if ctx.is_local_user(*member) {
                if let Some(conn) = ctx.topology.get(*member).and_then(|n| n.from) {
                    ctx.send(conn, shown.clone());
                }
            }
        }
    }

    let numeric = ctx.topology.get(sender).map(|n| n.numeric.clone()).unwrap_or_default();
    let forward = Message::new(TOK_TOPIC, [chan_name, text.clone()]).from_numeric(&numeric);
    let except = if local { None } else { Some(req.conn) };
    ctx.send_to_servers(except, &forward);
    Disposition::Continue
}

