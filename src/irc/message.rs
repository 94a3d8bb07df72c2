//! Outgoing IRC messages.
//!
//! Inbound lines never become a `Message`: [`super::parse`] tokenises them
//! by the server's own rules. This type is what handlers *emit*: the wire
//! form is
//!   [`:`name SPACE | numeric SPACE] command [SPACE params] [SPACE `:` trailing]
//!
//! Server-to-server traffic carries a bare base64 numeric prefix; client
//! traffic carries a `:name` prefix.

use std::fmt;

/// Who a message claims to come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prefix {
    /// `:name`, a server name or `nick!user@host`.
    Name(String),
    /// A P10 numeric, written without the leading colon.
    Numeric(String),
}

impl Prefix {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Name(s) | Self::Numeric(s) => s,
        }
    }
}

/// A single IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<Prefix>,
    /// The command or token (e.g. `PRIVMSG`, `P`, `001`).
    pub command: String,
    /// Parameters; the last is always written as a trailing param.
    pub params: Vec<String>,
}

impl Message {
    /// Build a prefix-less message.
    pub fn new<I, S>(command: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: None,
            command: command.to_owned(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Attach a `:name` prefix.
    pub fn from_name(mut self, name: &str) -> Self {
        self.prefix = Some(Prefix::Name(name.to_owned()));
        self
    }

    /// Attach a numeric prefix.
    pub fn from_numeric(mut self, numeric: &str) -> Self {
        self.prefix = Some(Prefix::Numeric(numeric.to_owned()));
        self
    }

    /// Serialize to the wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        match &self.prefix {
            Some(Prefix::Name(name)) => {
                out.push(':');
                out.push_str(name);
                out.push(' ');
            }
            Some(Prefix::Numeric(numeric)) => {
                out.push_str(numeric);
                out.push(' ');
            }
            None => {}
        }

        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            // The last parameter always gets `:`, so it may carry spaces.
            out.push_str(" :");
            out.push_str(last);
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
