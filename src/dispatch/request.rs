use serde_json::Value;
use thiserror::Error;

use super::args::Arguments;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub args: Arguments,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("message is {len} bytes, the limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("invalid JSON: {0}")]
    BadJson(String),
    #[error("'command' must be a non-empty string")]
    MissingCommand,
    #[error("'args' must be an object")]
    ArgsNotObject,
    #[error("expected command(arg, ...), got {0:?}")]
    Malformed(String),
    #[error("argument {0} is empty")]
    EmptyArgument(usize),
    #[error("{command} takes {expected} arguments, got {given}")]
    TooManyArguments {
        command: String,
        expected: usize,
        given: usize,
    },
}

fn valid_command(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl Request {
    /// Parses either `{"command": .., "args": {..}}` or the positional `command(a, b, c)` form.
    ///
    /// Positional arguments are named through `params`, which returns the parameter list of
    /// a known command. Arguments of unknown commands are keyed by position.
    pub fn parse<'p>(
        raw: &str,
        params: impl Fn(&str) -> Option<&'p [&'p str]>,
    ) -> Result<Self, ParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }
        if raw.starts_with('{') {
            Self::parse_json(raw)
        } else {
            Self::parse_positional(raw, params)
        }
    }

    fn parse_json(raw: &str) -> Result<Self, ParseError> {
        let message: Value =
            serde_json::from_str(raw).map_err(|e| ParseError::BadJson(e.to_string()))?;
        let command = match message.get("command") {
            Some(Value::String(command)) if valid_command(command.trim()) => {
                command.trim().to_owned()
            }
            _ => return Err(ParseError::MissingCommand),
        };
        let args = match message.get("args") {
            None | Some(Value::Null) => Arguments::default(),
            Some(Value::Object(fields)) => fields
                .iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        Value::Null => return None,
                        Value::String(s) => s.clone(),
                        // nested values stay as JSON text, e.g. a list of positions
                        other => other.to_string(),
                    };
                    Some((key.clone(), value))
                })
                .collect(),
            Some(_) => return Err(ParseError::ArgsNotObject),
        };
        Ok(Self { command, args })
    }

    fn parse_positional<'p>(
        raw: &str,
        params: impl Fn(&str) -> Option<&'p [&'p str]>,
    ) -> Result<Self, ParseError> {
        let (command, rest) = match raw.split_once('(') {
            Some((command, rest)) => (command.trim(), Some(rest)),
            None => (raw, None),
        };
        if !valid_command(command) {
            return Err(ParseError::Malformed(raw.to_owned()));
        }
        let inner = match rest {
            None => "",
            Some(rest) => rest
                .trim_end()
                .strip_suffix(')')
                .ok_or_else(|| ParseError::Malformed(raw.to_owned()))?,
        };
        let values: Vec<&str> = if inner.trim().is_empty() {
            vec![]
        } else {
            inner.split(',').map(str::trim).collect()
        };
        if let Some(i) = values.iter().position(|v| v.is_empty()) {
            return Err(ParseError::EmptyArgument(i));
        }
        let args = match params(command) {
            Some(names) if values.len() > names.len() => {
                return Err(ParseError::TooManyArguments {
                    command: command.to_owned(),
                    expected: names.len(),
                    given: values.len(),
                })
            }
            Some(names) => names
                .iter()
                .zip(&values)
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            None => values
                .iter()
                .enumerate()
                .map(|(i, value)| (i.to_string(), value.to_string()))
                .collect(),
        };
        Ok(Self {
            command: command.to_owned(),
            args,
        })
    }
}
