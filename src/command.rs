//! Commands sent to nodes and the replies they produce

use std::fmt;

/// One operation for a node: a name plus ordered arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<String>,
}

impl Command {
    /// Create a command with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Append several arguments
    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// Parse a whitespace-separated command line, e.g. `"INCRBY counter 1"`
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(Command::new(name).args(parts))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Whether this command goes through the debug channel rather than the log
    pub fn is_debug(&self) -> bool {
        self.name.eq_ignore_ascii_case("RAFT.DEBUG")
    }

    /// Whether this command is harness plumbing that must never be wrapped
    pub fn is_control(&self) -> bool {
        let name = self.name.to_ascii_uppercase();
        name.starts_with("RAFT.") || matches!(name.as_str(), "PING" | "INFO" | "SHUTDOWN")
    }

    /// Wrap the command under `prefix`, e.g. `RAFT INCRBY counter 1`
    pub fn wrapped(&self, prefix: &str) -> Self {
        Command::new(prefix)
            .arg(&self.name)
            .args(self.args.iter())
    }

    pub fn ping() -> Self {
        Command::new("PING")
    }

    pub fn info_raft() -> Self {
        Command::new("INFO").arg("raft")
    }

    pub fn shutdown() -> Self {
        Command::new("SHUTDOWN").arg("NOSAVE")
    }

    pub fn get(key: &str) -> Self {
        Command::new("GET").arg(key)
    }

    pub fn set(key: &str, value: impl ToString) -> Self {
        Command::new("SET").arg(key).arg(value)
    }

    pub fn incrby(key: &str, delta: i64) -> Self {
        Command::new("INCRBY").arg(key).arg(delta)
    }

    pub fn expire(key: &str, ttl: u64) -> Self {
        Command::new("EXPIRE").arg(key).arg(ttl)
    }

    pub fn cluster_init() -> Self {
        Command::new("RAFT.CLUSTER").arg("INIT")
    }

    pub fn node_add(node_id: u64, address: &str) -> Self {
        Command::new("RAFT.NODE").arg("ADD").arg(node_id).arg(address)
    }

    pub fn node_remove(node_id: u64) -> Self {
        Command::new("RAFT.NODE").arg("REMOVE").arg(node_id)
    }

    /// Run `command` against the receiving node's local state only
    pub fn debug_exec(command: Command) -> Self {
        Command::new("RAFT.DEBUG")
            .arg("EXEC")
            .arg(command.name)
            .args(command.args)
    }

    /// Replicated expiration check of `keys` against `ttl`
    pub fn debug_expire(keys: &[&str], ttl: u64) -> Self {
        Command::new("RAFT.DEBUG").arg("EXPIRE").args(keys).arg(ttl)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Successful reply from a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Bulk(Vec<u8>),
    Status(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn bulk(text: impl Into<String>) -> Self {
        Reply::Bulk(text.into().into_bytes())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Integer value of an integer reply or of a numeric bulk/status reply
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            Reply::Bulk(_) | Reply::Status(_) => self.as_str()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text of a bulk or status reply
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Bulk(data) => std::str::from_utf8(data).ok(),
            Reply::Status(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this reply is truthy the way a client library would see it
    pub fn is_truthy(&self) -> bool {
        match self {
            Reply::Nil => false,
            Reply::Int(n) => *n != 0,
            Reply::Bulk(data) => !data.is_empty(),
            Reply::Status(_) => true,
            Reply::Array(items) => !items.is_empty(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "(nil)"),
            Reply::Int(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// An error reply split into its tag and remainder, e.g. `LEADERIS 127.0.0.1:5002`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: String,
    pub message: String,
}

impl ErrorReply {
    /// Split a raw error line; a leading `-` is tolerated
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().trim_start_matches('-');
        match raw.split_once(char::is_whitespace) {
            Some((code, rest)) => ErrorReply {
                code: code.to_string(),
                message: rest.trim().to_string(),
            },
            None => ErrorReply {
                code: raw.to_string(),
                message: String::new(),
            },
        }
    }

    /// Address of the leader if the error carries one
    pub fn leader_hint(&self) -> Option<&str> {
        leader_hint(&self.code, &self.message)
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

/// Extract a `host:port` leader hint from a redirect error
///
/// `LEADERIS <addr>` and `MOVED <slot> <addr>` carry one; other codes don't.
pub fn leader_hint<'a>(code: &str, message: &'a str) -> Option<&'a str> {
    let mut parts = message.split_whitespace();
    let addr = match code.to_ascii_uppercase().as_str() {
        "LEADERIS" => parts.next(),
        "MOVED" | "ASK" => parts.nth(1),
        _ => None,
    }?;
    addr.contains(':').then_some(addr)
}
