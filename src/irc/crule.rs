//! Connection rules.
//!
//! A rule is a small boolean expression over the current shape of the
//! network, attached to a link policy. When it evaluates true the link is
//! refused. The text form reads like
//!
//! ```text
//! connected(*.eu.lagun.co) && !directop()
//! ```

use std::fmt;

use super::matching::{eq_ignore_case, matches};
use super::topology::{Node, Topology};

/// Longest word the parser keeps in one piece.
const MAX_WORD_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    And(Box<Rule>, Box<Rule>),
    Or(Box<Rule>, Box<Rule>),
    Not(Box<Rule>),
    /// Some server in the tree, ourselves included, matches the mask.
    Connected(String),
    /// Some directly linked server matches the mask.
    DirectCon(String),
    /// Some server matching the target mask is reached through a directly
    /// linked server matching the neighbour mask.
    Via(String, String),
    /// A local client holds operator privilege.
    DirectOp,
}

impl Rule {
    pub fn and(a: Rule, b: Rule) -> Rule {
        Rule::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Rule, b: Rule) -> Rule {
        Rule::Or(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(a: Rule) -> Rule {
        Rule::Not(Box::new(a))
    }

    pub fn connected(mask: impl Into<String>) -> Rule {
        Rule::Connected(mask.into())
    }

    pub fn directcon(mask: impl Into<String>) -> Rule {
        Rule::DirectCon(mask.into())
    }

    pub fn via(neighbor: impl Into<String>, target: impl Into<String>) -> Rule {
        Rule::Via(neighbor.into(), target.into())
    }

    pub fn directop() -> Rule {
        Rule::DirectOp
    }

    pub fn evaluate(&self, topology: &Topology) -> bool {
        evaluate(self, topology)
    }
}

/// Evaluate `rule` against the live tree. Reads only.
pub fn evaluate(rule: &Rule, topology: &Topology) -> bool {
    let root = topology.root();
    let server_named = |id, mask: &str| {
        topology
            .get(id)
            .filter(|n| n.is_server())
            .is_some_and(|n: &Node| matches(mask, &n.name))
    };

    match rule {
        Rule::And(a, b) => evaluate(a, topology) && evaluate(b, topology),
        Rule::Or(a, b) => evaluate(a, topology) || evaluate(b, topology),
        Rule::Not(a) => !evaluate(a, topology),
        Rule::Connected(mask) => topology
            .servers_from(root)
            .into_iter()
            .any(|id| server_named(id, mask)),
        Rule::DirectCon(mask) => topology
            .children(root)
            .iter()
            .any(|&id| server_named(id, mask)),
        Rule::Via(neighbor, target) => topology.children(root).iter().any(|&link| {
            server_named(link, neighbor)
                && topology
                    .servers_from(link)
                    .into_iter()
                    .any(|id| server_named(id, target))
        }),
        Rule::DirectOp => topology.has_local_oper(),
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::And(a, b) => write!(f, "({a} && {b})"),
            Rule::Or(a, b) => write!(f, "({a} || {b})"),
            Rule::Not(a) => write!(f, "!{a}"),
            Rule::Connected(m) => write!(f, "connected({m})"),
            Rule::DirectCon(m) => write!(f, "directcon({m})"),
            Rule::Via(n, t) => write!(f, "via({n},{t})"),
            Rule::DirectOp => f.write_str("directop()"),
        }
    }
}

/// Why rule text did not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("Unexpected token")]
    UnexpectedToken,
    #[error("Unknown token")]
    UnknownToken,
    #[error("And expr expected")]
    AndExpected,
    #[error("Or expr expected")]
    OrExpected,
    #[error("Primary expected")]
    PrimaryExpected,
    #[error("( expected")]
    OpenExpected,
    #[error(") expected")]
    CloseExpected,
    #[error("Unknown function")]
    UnknownFunction,
    #[error("Argument mismatch")]
    ArgumentMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    End,
    And,
    Or,
    Not,
    Open,
    Close,
    Comma,
    Word,
}

/// Parse the text form of a rule.
pub fn parse(text: &str) -> Result<Rule, RuleError> {
    let mut parser = Parser {
        input: text.as_bytes(),
        pos: 0,
        tok: Token::End,
    };
    parser.advance()?;
    match parser.or_expr()? {
        Some(rule) if parser.tok == Token::End => Ok(rule),
        Some(_) => Err(RuleError::UnexpectedToken),
        None => Err(RuleError::OrExpected),
    }
}

fn is_word_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || matches!(c, b'*' | b'?' | b'.' | b'-')
}

fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'*' | b'?' | b'.' | b'-')
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    tok: Token,
}

impl Parser<'_> {
    /// Read the next token. A word is only peeked: its text is consumed by
    /// [`Parser::word`].
    fn advance(&mut self) -> Result<(), RuleError> {
        loop {
            let Some(&c) = self.input.get(self.pos) else {
                self.tok = Token::End;
                return Ok(());
            };
            self.pos += 1;
            self.tok = match c {
                b' ' | b'\t' => continue,
                // Both operators are doubled, with nothing in between.
                b'&' | b'|' => {
                    if self.input.get(self.pos) != Some(&c) {
                        return Err(RuleError::UnknownToken);
                    }
                    self.pos += 1;
                    if c == b'&' {
                        Token::And
                    } else {
                        Token::Or
                    }
                }
                b'!' => Token::Not,
                b'(' => Token::Open,
                b')' => Token::Close,
                b',' => Token::Comma,
                b':' => Token::End,
                c if is_word_start(c) => {
                    self.pos -= 1;
                    Token::Word
                }
                _ => return Err(RuleError::UnknownToken),
            };
            return Ok(());
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self.pos - start < MAX_WORD_LEN
            && self.input.get(self.pos).copied().is_some_and(is_word_char)
        {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn or_expr(&mut self) -> Result<Option<Rule>, RuleError> {
        let mut acc: Option<Rule> = None;
        loop {
            let next = self.and_expr()?;
            if self.tok == Token::Or {
                let next = next.ok_or(RuleError::AndExpected)?;
                acc = Some(match acc {
                    Some(left) => Rule::or(left, next),
                    None => next,
                });
                self.advance()?;
                continue;
            }
            return match (acc, next) {
                (Some(left), Some(right)) => Ok(Some(Rule::or(left, right))),
                (Some(_), None) => Err(RuleError::AndExpected),
                (None, next) => Ok(next),
            };
        }
    }

    fn and_expr(&mut self) -> Result<Option<Rule>, RuleError> {
        let mut acc: Option<Rule> = None;
        loop {
            let next = self.primary()?;
            if self.tok == Token::And {
                let next = next.ok_or(RuleError::PrimaryExpected)?;
                acc = Some(match acc {
                    Some(left) => Rule::and(left, next),
                    None => next,
                });
                self.advance()?;
                continue;
            }
            return match (acc, next) {
                (Some(left), Some(right)) => Ok(Some(Rule::and(left, right))),
                (Some(_), None) => Err(RuleError::PrimaryExpected),
                (None, next) => Ok(next),
            };
        }
    }

    fn primary(&mut self) -> Result<Option<Rule>, RuleError> {
        match self.tok {
            Token::Open => {
                self.advance()?;
                let inner = self.or_expr()?.ok_or(RuleError::AndExpected)?;
                if self.tok != Token::Close {
                    return Err(RuleError::CloseExpected);
                }
                self.advance()?;
                Ok(Some(inner))
            }
            Token::Not => {
                self.advance()?;
                let inner = self.primary()?.ok_or(RuleError::PrimaryExpected)?;
                Ok(Some(Rule::not(inner)))
            }
            Token::Word => self.function().map(Some),
            _ => Ok(None),
        }
    }

    fn function(&mut self) -> Result<Rule, RuleError> {
        let name = self.word();
        self.advance()?;
        if self.tok != Token::Open {
            return Err(RuleError::OpenExpected);
        }
        let arity = match () {
            _ if eq_ignore_case(&name, "connected") => 1,
            _ if eq_ignore_case(&name, "directcon") => 1,
            _ if eq_ignore_case(&name, "via") => 2,
            _ if eq_ignore_case(&name, "directop") => 0,
            _ => return Err(RuleError::UnknownFunction),
        };
        self.advance()?;
        let mut args = self.arguments()?;
        if self.tok != Token::Close {
            return Err(RuleError::CloseExpected);
        }
        if args.len() != arity {
            return Err(RuleError::ArgumentMismatch);
        }
        self.advance()?;

        let mut take = || args.remove(0);
        Ok(match name.to_ascii_lowercase().as_str() {
            "connected" => Rule::Connected(take()),
            "directcon" => Rule::DirectCon(take()),
            "via" => {
                let neighbor = take();
                Rule::Via(neighbor, take())
            }
            _ => Rule::DirectOp,
        })
    }

    /// Comma-separated arguments. Words inside one argument are joined by a
    /// single space; empty arguments are dropped.
    fn arguments(&mut self) -> Result<Vec<String>, RuleError> {
        let mut args = Vec::new();
        let mut current = String::new();
        loop {
            if self.tok == Token::Word {
                let word = self.word();
                if !current.is_empty() {
                    if current.len() + word.len() + 1 < MAX_WORD_LEN {
                        current.push(' ');
                        current.push_str(&word);
                    }
                } else {
                    current = word;
                }
                self.advance()?;
                continue;
            }
            if !current.is_empty() {
                args.push(std::mem::take(&mut current));
            }
            if self.tok != Token::Comma {
                return Ok(args);
            }
            self.advance()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::topology::{ConnId, NewServer, NewUser, ServerFlags, User, UserModes};
    use pretty_assertions::assert_eq;

    fn server(name: &str, numeric: &str, from: u64) -> NewServer {
        NewServer {
            name: name.into(),
            numeric: numeric.into(),
            info: "test".into(),
            hop: 1,
            from: ConnId(from),
            timestamp: 900_000_000,
            protocol: 10,
            capacity: 4095,
            flags: ServerFlags::default(),
        }
    }

    /// hub.lagun.co -- eu.lagun.co -- leaf.eu.lagun.co
    ///              \- us.lagun.co
    fn network() -> Topology {
        let mut t = Topology::new("hub.lagun.co", "AA", "hub", 900_000_000, ServerFlags::default());
        let eu = t.add_server(t.root(), server("eu.lagun.co", "AB", 1)).unwrap();
        t.add_server(eu, server("leaf.eu.lagun.co", "AC", 1)).unwrap();
        t.add_server(t.root(), server("us.lagun.co", "AD", 2)).unwrap();
        t
    }

    // ── Evaluation ───────────────────────────────────────────────

    #[test]
    fn connected_sees_the_whole_tree() {
        let t = network();
        assert!(Rule::connected("*").evaluate(&t));
        assert!(Rule::connected("leaf.*").evaluate(&t));
        assert!(Rule::connected("hub.lagun.co").evaluate(&t));
        assert!(!Rule::connected("*.net").evaluate(&t));
    }

    #[test]
    fn directcon_ignores_servers_two_hops_away() {
        let t = network();
        assert!(Rule::directcon("eu.*").evaluate(&t));
        assert!(!Rule::directcon("leaf.*").evaluate(&t));
    }

    #[test]
    fn via_follows_the_neighbour_subtree() {
        let t = network();
        assert!(Rule::via("eu.*", "leaf.*").evaluate(&t));
        assert!(Rule::via("eu.*", "eu.*").evaluate(&t));
        assert!(!Rule::via("us.*", "leaf.*").evaluate(&t));
    }

    #[test]
    fn directop_needs_a_local_oper() {
        let mut t = network();
        assert!(!Rule::directop().evaluate(&t));
        let root = t.root();
        t.add_user(
            root,
            NewUser {
                nick: "wings".into(),
                numeric: "AAAAA".into(),
                info: "real".into(),
                hop: 0,
                from: ConnId(9),
                user: User {
                    username: "w".into(),
                    host: "h".into(),
                    ip: "AAAAAA".into(),
                    modes: UserModes::parse("+o"),
                    lastnick: 1,
                },
            },
        )
        .unwrap();
        assert!(Rule::directop().evaluate(&t));
    }

    #[test]
    fn boolean_laws_hold_for_nested_rules() {
        let t = network();
        let yes = Rule::connected("eu.*");
        let no = Rule::connected("*.net");
        for (a, b) in [(&yes, &no), (&no, &yes), (&yes, &yes), (&no, &no)] {
            let (va, vb) = (a.evaluate(&t), b.evaluate(&t));
            assert_eq!(Rule::and(a.clone(), b.clone()).evaluate(&t), va && vb);
            assert_eq!(Rule::or(a.clone(), b.clone()).evaluate(&t), va || vb);
            assert_eq!(Rule::not(Rule::and(a.clone(), b.clone())).evaluate(&t), !va || !vb);
            assert_eq!(Rule::not(Rule::not(a.clone())).evaluate(&t), va);
        }
    }

    // ── Text form ────────────────────────────────────────────────

    #[test]
    fn parses_operators_left_associative() {
        let rule = parse("connected(a) || directcon(b) || directop()").unwrap();
        assert_eq!(
            rule,
            Rule::or(
                Rule::or(Rule::connected("a"), Rule::directcon("b")),
                Rule::directop()
            )
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let rule = parse("connected(a)||connected(b)&&!directop()").unwrap();
        assert_eq!(
            rule,
            Rule::or(
                Rule::connected("a"),
                Rule::and(Rule::connected("b"), Rule::not(Rule::directop()))
            )
        );
    }

    #[test]
    fn colon_ends_the_rule() {
        let rule = parse("via(eu.*, leaf.*) : trailing junk").unwrap();
        assert_eq!(rule, Rule::via("eu.*", "leaf.*"));
    }

    #[test]
    fn display_reparses() {
        let rule = parse("!(connected(*.eu.*) && via(a,b)) || directop()").unwrap();
        assert_eq!(parse(&rule.to_string()).unwrap(), rule);
    }

    #[test]
    fn errors_are_reported_by_kind() {
        assert_eq!(parse(""), Err(RuleError::OrExpected));
        assert_eq!(parse("connected(a) $"), Err(RuleError::UnknownToken));
        assert_eq!(parse("connected(a) &| directop()"), Err(RuleError::UnknownToken));
        assert_eq!(parse("connected(a) ("), Err(RuleError::UnexpectedToken));
        assert_eq!(parse("connected(a) ||"), Err(RuleError::AndExpected));
        assert_eq!(parse("connected(a) &&"), Err(RuleError::PrimaryExpected));
        assert_eq!(parse("!"), Err(RuleError::PrimaryExpected));
        assert_eq!(parse("()"), Err(RuleError::AndExpected));
        assert_eq!(parse("connected"), Err(RuleError::OpenExpected));
        assert_eq!(parse("(connected(a)"), Err(RuleError::CloseExpected));
        assert_eq!(parse("linked(a)"), Err(RuleError::UnknownFunction));
        assert_eq!(parse("via(a)"), Err(RuleError::ArgumentMismatch));
        assert_eq!(parse("directop(x)"), Err(RuleError::ArgumentMismatch));
    }

    #[test]
    fn single_operators_are_not_tokens() {
        assert_eq!(parse("connected(a*) &"), Err(RuleError::UnknownToken));
        assert_eq!(parse("connected(a*) |"), Err(RuleError::UnknownToken));
        assert_eq!(parse("connected(a) & connected(b)"), Err(RuleError::UnknownToken));
        assert_eq!(parse("connected(a) & & connected(b)"), Err(RuleError::UnknownToken));
        assert_eq!(parse("connected(a) &!directop()"), Err(RuleError::UnknownToken));
    }
}
