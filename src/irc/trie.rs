//! Command lookup trees.
//!
//! Each level of a [`Trie`] consumes one more leading character of the
//! command (folded to `A` to `Z`). A node reached by a single entry becomes a
//! leaf holding the whole remaining suffix; a node whose path spells an entry
//! exactly holds the empty suffix. Lookups therefore cost the length of the
//! command, independent of how many commands are registered.
//!
//! Two walks are offered. [`Trie::find_exact`] requires the rest of the input
//! to equal the stored suffix, so `NICKSERV` never aliases to `NICK`.
//! [`Trie::find_prefix`] accepts as soon as the suffix's first character
//! agrees, which is only sound for the short, collision-free token set.

/// Why a set of keys could not be turned into a trie.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrieError {
    #[error("empty command key")]
    EmptyKey,
    #[error("command key {0:?} registered twice")]
    Duplicate(String),
    #[error("command key {0:?} diverges from a sibling on a non-alphabetic character")]
    NonAlphabetic(String),
}

#[derive(Debug, Default)]
struct Node {
    /// Remaining suffix and the value it completes.
    terminal: Option<(Box<[u8]>, usize)>,
    children: [Option<Box<Node>>; 26],
}

impl Node {
    fn child(&self, c: u8) -> Option<&Node> {
        let slot = c.checked_sub(b'A')? as usize;
        self.children.get(slot)?.as_deref()
    }
}

/// An immutable lookup tree mapping command keys to table indices.
#[derive(Debug, Default)]
pub struct Trie {
    root: Node,
}

impl Trie {
    /// Build a trie over `(key, value)` pairs. Keys are compared
    /// case-insensitively; order of the input does not matter.
    pub fn build<'a, I>(entries: I) -> Result<Self, TrieError>
    where
        I: IntoIterator<Item = (&'a str, usize)>,
    {
        let mut keyed: Vec<(Vec<u8>, usize)> = entries
            .into_iter()
            .map(|(key, value)| (key.to_ascii_uppercase().into_bytes(), value))
            .collect();
        if keyed.iter().any(|(key, _)| key.is_empty()) {
            return Err(TrieError::EmptyKey);
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut root = Node::default();
        fill_children(&mut root, &keyed, 0)?;
        Ok(Self { root })
    }

    /// Exact, case-insensitive lookup.
    pub fn find_exact(&self, input: &str) -> Option<usize> {
        let bytes = input.as_bytes();
        let mut node = self.root.child(bytes.first()?.to_ascii_uppercase())?;
        let mut i = 1;
        loop {
            if let Some((suffix, value)) = &node.terminal {
                if bytes[i..].eq_ignore_ascii_case(suffix) {
                    return Some(*value);
                }
            }
            node = node.child(bytes.get(i)?.to_ascii_uppercase())?;
            i += 1;
        }
    }

    /// Shortest-unambiguous lookup: the walk stops at the first node whose
    /// suffix begins with the next input character (or is empty at the end
    /// of input).
    pub fn find_prefix(&self, input: &str) -> Option<usize> {
        let bytes = input.as_bytes();
        let mut node = self.root.child(bytes.first()?.to_ascii_uppercase())?;
        let mut i = 1;
        loop {
            let next = bytes.get(i).map_or(0, u8::to_ascii_uppercase);
            if let Some((suffix, value)) = &node.terminal {
                if suffix.first().copied().unwrap_or(0) == next {
                    return Some(*value);
                }
            }
            node = node.child(next)?;
            i += 1;
        }
    }
}

/// Build the subtree for `entries`, which share their first `depth` bytes
/// and are sorted.
fn build_node(entries: &[(Vec<u8>, usize)], depth: usize) -> Result<Node, TrieError> {
    let mut node = Node::default();

    if let [(key, value)] = entries {
        node.terminal = Some((key[depth..].into(), *value));
        return Ok(node);
    }

    let mut rest = entries;
    if let Some(((key, value), tail)) = entries.split_first() {
        if key.len() == depth {
            if let Some((dup, _)) = tail.first().filter(|(k, _)| k.len() == depth) {
                return Err(TrieError::Duplicate(String::from_utf8_lossy(dup).into_owned()));
            }
            node.terminal = Some((Box::default(), *value));
            rest = tail;
        }
    }

    fill_children(&mut node, rest, depth)?;
    Ok(node)
}

/// Group `entries` by their byte at `depth` and hang one child per group.
fn fill_children(
    node: &mut Node,
    entries: &[(Vec<u8>, usize)],
    depth: usize,
) -> Result<(), TrieError> {
    let mut start = 0;
    while start < entries.len() {
        let c = entries[start].0[depth];
        let end = start
            + entries[start..]
                .iter()
                .take_while(|(key, _)| key[depth] == c)
                .count();
        let group = &entries[start..end];

        if !c.is_ascii_uppercase() {
            let key = &group[0].0;
            return Err(if group.len() > 1 && group.iter().all(|(k, _)| k == key) {
                TrieError::Duplicate(String::from_utf8_lossy(key).into_owned())
            } else {
                TrieError::NonAlphabetic(String::from_utf8_lossy(key).into_owned())
            });
        }

        node.children[(c - b'A') as usize] = Some(Box::new(build_node(group, depth + 1)?));
        start = end;
    }
    Ok(())
}
