use serde_json::Value;

use crate::channel::{BridgeResult, ChannelError};

// -------------------------------------------------------------------------------------------------------

/// Key under which the engine expects the primary user-agent argument.
pub const PRIMARY_USER_AGENT_ARG: &str = "tether.primary_user_agent";

const LIBRARY_USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

/// The identification string this library appends to every channel's argument list.
pub fn library_user_agent() -> &'static str {
    LIBRARY_USER_AGENT
}

// -------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Integer(i32),
    Str(String),
}

/// A single entry of the engine-facing argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelArg {
    pub key: String,
    pub value: ArgValue,
}

/// Ordered argument list handed to the engine at channel creation.
/// Owned by the encoder until the facade passes it to the engine; dropped on
/// every exit path, so a failed encoding pass leaves nothing behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelArgs {
    entries: Vec<ChannelArg>,
}

impl ChannelArgs {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelArg> {
        self.entries.iter()
    }

    /// First entry with the given key, if any.
    pub fn lookup(&self, key: &str) -> Option<&ArgValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }
}

// -------------------------------------------------------------------------------------------------------

/// Convert a host options mapping into the engine argument list.
///
/// `None` and json `null` are treated the same as an empty mapping. Values
/// must be integers (fitting `i32`) or strings; anything else fails the whole
/// pass with a type mismatch. The user-agent argument is injected exactly
/// once: standalone if the key is absent, appended after the user's value
/// (space separated) if the user supplied a string under the same key. An
/// integer under the user-agent key passes through untouched.
pub fn encode_channel_args(options: Option<&Value>) -> BridgeResult<ChannelArgs> {
    let empty = serde_json::Map::new();
    let map = match options {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(ChannelError::TypeMismatch(format!(
                "channel options must be an object with string keys and integer or string values, got {}",
                json_kind(other)
            ))
            .into());
        }
    };

    let mut entries = Vec::with_capacity(map.len() + 1);
    let mut has_user_agent = false;
    for (key, value) in map {
        if key == PRIMARY_USER_AGENT_ARG {
            has_user_agent = true;
        }
        let value = match value {
            Value::Number(n) => match n.as_i64().and_then(|v| i32::try_from(v).ok()) {
                Some(v) => ArgValue::Integer(v),
                None => {
                    return Err(ChannelError::TypeMismatch(format!(
                        "channel option {key:?} must be a 32 bit integer or a string"
                    ))
                    .into());
                }
            },
            Value::String(s) => {
                // the library user agent rides after the application's own value
                if key == PRIMARY_USER_AGENT_ARG {
                    ArgValue::Str(format!("{s} {LIBRARY_USER_AGENT}"))
                } else {
                    ArgValue::Str(s.clone())
                }
            }
            other => {
                return Err(ChannelError::TypeMismatch(format!(
                    "channel option {key:?} must be an integer or a string, got {}",
                    json_kind(other)
                ))
                .into());
            }
        };
        entries.push(ChannelArg {
            key: key.clone(),
            value,
        });
    }

    if !has_user_agent {
        entries.push(ChannelArg {
            key: PRIMARY_USER_AGENT_ARG.to_string(),
            value: ArgValue::Str(LIBRARY_USER_AGENT.to_string()),
        });
    }

    Ok(ChannelArgs { entries })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// -------------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------------
