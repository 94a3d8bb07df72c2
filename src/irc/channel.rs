//! Channel state: modes, topic and membership, keyed by node.

use std::collections::{BTreeMap, HashMap};

use super::matching::fold_key;
use super::topology::NodeId;

/// Per-channel mode flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelModes {
    /// +i: invite only
    pub invite_only: bool,
    /// +m: moderated
    pub moderated: bool,
    /// +n: no external messages
    pub no_external: bool,
    /// +t: only ops can set topic
    pub topic_locked: bool,
    /// +p: private
    pub private: bool,
    /// +s: secret
    pub secret: bool,
    /// +k: channel key
    pub key: Option<String>,
    /// +l: user limit
    pub limit: Option<usize>,
}

impl Default for ChannelModes {
    fn default() -> Self {
        Self {
            invite_only: false,
            moderated: false,
            no_external: true,
            topic_locked: true,
            private: false,
            secret: false,
            key: None,
            limit: None,
        }
    }
}

impl ChannelModes {
    /// No flags at all; what a channel learned from a burst starts with.
    pub fn empty() -> Self {
        Self {
            no_external: false,
            topic_locked: false,
            ..Self::default()
        }
    }

    /// Render as the mode words of a BURST line, e.g. `["+ntk", "key"]`.
    /// Empty when no mode is set.
    pub fn to_words(&self) -> Vec<String> {
        let mut flags = String::from("+");
        let mut params = Vec::new();

        for (set, c) in [
            (self.invite_only, 'i'),
            (self.moderated, 'm'),
            (self.no_external, 'n'),
            (self.private, 'p'),
            (self.secret, 's'),
            (self.topic_locked, 't'),
        ] {
            if set {
                flags.push(c);
            }
        }
        if let Some(ref key) = self.key {
            flags.push('k');
            params.push(key.clone());
        }
        if let Some(limit) = self.limit {
            flags.push('l');
            params.push(limit.to_string());
        }

        if flags == "+" {
            return Vec::new();
        }
        let mut words = vec![flags];
        words.extend(params);
        words
    }

    /// Add the modes of a `+ntk key` word list. Returns how many words
    /// were consumed.
    pub fn merge_words(&mut self, words: &[String]) -> usize {
        let Some(flags) = words.first().and_then(|w| w.strip_prefix('+')) else {
            return 0;
        };
        let mut used = 1;
        for c in flags.chars() {
            match c {
                'i' => self.invite_only = true,
                'm' => self.moderated = true,
                'n' => self.no_external = true,
                'p' => self.private = true,
                's' => self.secret = true,
                't' => self.topic_locked = true,
                'k' => {
                    if let Some(key) = words.get(used) {
                        self.key = Some(key.clone());
                        used += 1;
                    }
                }
                'l' => {
                    if let Some(limit) = words.get(used) {
                        self.limit = limit.parse().ok();
                        used += 1;
                    }
                }
                _ => {}
            }
        }
        used
    }
}

/// A member's privileges in a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Membership {
    pub voice: bool,
    pub op: bool,
}

impl Membership {
    pub const OP: Membership = Membership { voice: false, op: true };

    /// The `:ov` suffix of a BURST member entry.
    fn marker(self) -> &'static str {
        match (self.op, self.voice) {
            (true, true) => ":ov",
            (true, false) => ":o",
            (false, true) => ":v",
            (false, false) => "",
        }
    }

    fn from_marker(marker: &str) -> Self {
        Self {
            op: marker.contains('o'),
            voice: marker.contains('v'),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: i64,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    /// Creation timestamp; the older one wins when two sides disagree.
    pub created: i64,
    pub modes: ChannelModes,
    pub topic: Option<Topic>,
    pub members: BTreeMap<NodeId, Membership>,
    pub bans: Vec<String>,
}

impl Channel {
    pub fn new(name: &str, created: i64) -> Self {
        Self {
            name: name.to_owned(),
            created,
            modes: ChannelModes::default(),
            topic: None,
            members: BTreeMap::new(),
            bans: Vec::new(),
        }
    }

    /// Drop every op and voice and all modes; used when the other side of a
    /// burst proves to have the older channel.
    pub fn reset_privileges(&mut self) {
        for m in self.members.values_mut() {
            *m = Membership::default();
        }
        self.modes = ChannelModes::empty();
        self.bans.clear();
    }

    /// Members rendered as BURST entries: `numeric[:ov]`, comma separated,
    /// grouped so each marker appears once.
    pub fn burst_members(&self, numeric_of: impl Fn(NodeId) -> Option<String>) -> String {
        let mut sorted: Vec<(Membership, String)> = self
            .members
            .iter()
            .filter_map(|(id, m)| numeric_of(*id).map(|n| (*m, n)))
            .collect();
        sorted.sort();

        let mut out = Vec::with_capacity(sorted.len());
        let mut current = Membership::default();
        for (m, numeric) in sorted {
            if m != current {
                out.push(format!("{numeric}{}", m.marker()));
                current = m;
            } else {
                out.push(numeric);
            }
        }
        out.join(",")
    }
}

/// Parse the member list of a BURST line. Markers carry forward to the
/// following entries until the next marker.
pub fn parse_burst_members(list: &str) -> Vec<(String, Membership)> {
    let mut current = Membership::default();
    list.split(',')
        .filter(|e| !e.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((numeric, marker)) => {
                current = Membership::from_marker(marker);
                (numeric.to_owned(), current)
            }
            None => (entry.to_owned(), current),
        })
        .collect()
}

/// All channels, keyed by folded name.
#[derive(Debug, Default)]
pub struct Channels {
    map: HashMap<String, Channel>,
}

impl Channels {
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.map.get(&fold_key(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.map.get_mut(&fold_key(name))
    }

    /// The channel named `name`, created with timestamp `ts` if missing.
    pub fn get_or_create(&mut self, name: &str, ts: i64) -> &mut Channel {
        self.map
            .entry(fold_key(name))
            .or_insert_with(|| Channel::new(name, ts))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove `member` from one channel, dropping the channel once empty.
    pub fn part(&mut self, name: &str, member: NodeId) {
        let key = fold_key(name);
        if let Some(chan) = self.map.get_mut(&key) {
            chan.members.remove(&member);
            if chan.members.is_empty() {
                self.map.remove(&key);
            }
        }
    }

    /// Remove `member` from every channel, dropping channels left empty.
    pub fn remove_member(&mut self, member: NodeId) {
        self.map.retain(|_, chan| {
            chan.members.remove(&member);
            !chan.members.is_empty()
        });
    }

    /// Channels `member` is on.
    pub fn of_member(&self, member: NodeId) -> Vec<&Channel> {
        self.map
            .values()
            .filter(|c| c.members.contains_key(&member))
            .collect()
    }
}

/// Channel names start with `#` or `&` and contain no space, comma or BEL.
pub fn valid_channel_name(name: &str) -> bool {
    name.len() > 1
        && name.len() <= 200
        && (name.starts_with('#') || name.starts_with('&'))
        && !name.contains([' ', ',', '\x07'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_modes_render() {
        assert_eq!(ChannelModes::default().to_words(), vec!["+nt"]);
        assert!(ChannelModes::empty().to_words().is_empty());
    }

    #[test]
    fn key_and_limit_carry_parameters() {
        let mut modes = ChannelModes::empty();
        let words: Vec<String> = ["+ntkl", "sekrit", "42", "ABAAA"].map(String::from).into();
        assert_eq!(modes.merge_words(&words), 3);
        assert_eq!(modes.key.as_deref(), Some("sekrit"));
        assert_eq!(modes.limit, Some(42));
        assert_eq!(modes.to_words(), vec!["+ntkl", "sekrit", "42"]);
    }

    #[test]
    fn burst_member_markers_carry_forward() {
        let members = parse_burst_members("ABAAA,ABAAB:o,ACAAA,ACAAB:v");
        assert_eq!(
            members,
            vec![
                ("ABAAA".to_string(), Membership::default()),
                ("ABAAB".to_string(), Membership::OP),
                ("ACAAA".to_string(), Membership::OP),
                ("ACAAB".to_string(), Membership { voice: true, op: false }),
            ]
        );
    }

    #[test]
    fn membership_is_dropped_with_the_last_member() {
        let mut chans = Channels::default();
        let a = chans.get_or_create("#Lagoon", 1000);
        assert_eq!(a.name, "#Lagoon");
        let id = crate::irc::topology::Topology::new("a.b", "AA", "", 0, Default::default()).root();
        chans.get_or_create("#lagoon", 5).members.insert(id, Membership::OP);
        assert_eq!(chans.get("#LAGOON").map(|c| c.created), Some(1000));
        chans.remove_member(id);
        assert!(chans.is_empty());
    }

    #[test]
    fn channel_names() {
        assert!(valid_channel_name("#lagoon"));
        assert!(!valid_channel_name("#"));
        assert!(!valid_channel_name("lagoon"));
        assert!(!valid_channel_name("#a,b"));
    }
}
