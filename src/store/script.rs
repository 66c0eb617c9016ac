//! Server-side compare-and-act scripts
//!
//! A [`Script`] pairs a stable name with its Lua source. Redis runs the
//! source; backends without a scripting engine recognise the built-in
//! scripts and perform the same compare-and-act natively.

/// Named server-side script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    name: &'static str,
    source: &'static str,
}

impl Script {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// KEYS[1] = lock key, ARGV[1] = owner token. Returns 1 if deleted, 0 otherwise.
pub const RELEASE_IF_OWNED: Script = Script::new(
    "release_if_owned",
    r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#,
);

/// KEYS[1] = lock key, ARGV[1] = owner token, ARGV[2] = new ttl in ms.
/// Returns 1 if the expiry was re-armed, 0 otherwise.
pub const EXTEND_IF_OWNED: Script = Script::new(
    "extend_if_owned",
    r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#,
);

/// Script result, independent of the backend's wire types
#[derive(Debug, Clone, PartialEq)]
pub enum EvalReply {
    Nil,
    Int(i64),
    Data(Vec<u8>),
    Status(String),
    Array(Vec<EvalReply>),
}

impl EvalReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EvalReply::Int(n) => Some(*n),
            EvalReply::Data(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// True for a positive integer reply, the convention of the built-in scripts
    pub fn is_truthy(&self) -> bool {
        self.as_int().map(|n| n > 0).unwrap_or(false)
    }
}

impl From<redis::Value> for EvalReply {
    fn from(value: redis::Value) -> Self {
        match value {
            redis::Value::Nil => EvalReply::Nil,
            redis::Value::Int(n) => EvalReply::Int(n),
            redis::Value::BulkString(bytes) => EvalReply::Data(bytes),
            redis::Value::SimpleString(s) => EvalReply::Status(s),
            redis::Value::Okay => EvalReply::Status("OK".to_string()),
            redis::Value::Array(items) => {
                EvalReply::Array(items.into_iter().map(EvalReply::from).collect())
            }
            other => EvalReply::Status(format!("{:?}", other)),
        }
    }
}
