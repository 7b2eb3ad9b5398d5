use crate::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    #[error("missing argument '{0}'")]
    Missing(String),
    #[error("argument '{name}' must be an integer, got {value:?}")]
    NotAnInteger { name: String, value: String },
    #[error("position {0} is outside the world")]
    OutOfBounds(BlockPos),
    #[error("invalid '{name}': {reason}")]
    Invalid { name: String, reason: String },
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Named string arguments of a request. Typed access happens per handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments(BTreeMap<String, String>);

impl FromIterator<(String, String)> for Arguments {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Arguments {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn required(&self, name: &str) -> Result<&str, ArgError> {
        self.get(name).ok_or_else(|| ArgError::Missing(name.to_owned()))
    }

    pub fn int(&self, name: &str) -> Result<i32, ArgError> {
        let value = self.required(name)?;
        value.trim().parse().map_err(|_| ArgError::NotAnInteger {
            name: name.to_owned(),
            value: value.to_owned(),
        })
    }

    /// An integer within `range`, e.g. a radius.
    pub fn int_in(
        &self,
        name: &str,
        range: std::ops::RangeInclusive<i32>,
    ) -> Result<i32, ArgError> {
        let value = self.int(name)?;
        if range.contains(&value) {
            Ok(value)
        } else {
            Err(ArgError::Invalid {
                name: name.to_owned(),
                reason: format!("{value} is not in {}..={}", range.start(), range.end()),
            })
        }
    }

    /// A block position inside the world.
    pub fn pos(&self, x: &str, y: &str, z: &str) -> Result<BlockPos, ArgError> {
        let pos = V3(self.int(x)?, self.int(y)?, self.int(z)?);
        if pos.in_bounds() {
            Ok(pos)
        } else {
            Err(ArgError::OutOfBounds(pos))
        }
    }

    /// A column `(x, z)` inside the world's horizontal bounds, returned at y = 0.
    pub fn column(&self, x: &str, z: &str) -> Result<BlockPos, ArgError> {
        let pos = V3(self.int(x)?, 0, self.int(z)?);
        if pos.in_bounds() {
            Ok(pos)
        } else {
            Err(ArgError::OutOfBounds(pos))
        }
    }

    pub fn block(&self, name: &str) -> Result<Block, ArgError> {
        Ok(Block::from_name(self.required(name)?)?)
    }
}

/// Reads `[[x,y,z], ...]` or `x:y:z;x:y:z`.
pub fn parse_positions(name: &str, raw: &str) -> Result<Vec<BlockPos>, ArgError> {
    let invalid = |reason: String| ArgError::Invalid {
        name: name.to_owned(),
        reason,
    };
    let raw = raw.trim();
    let positions: Vec<BlockPos> = if raw.starts_with('[') {
        serde_json::from_str::<Vec<[i32; 3]>>(raw)
            .map_err(|e| invalid(e.to_string()))?
            .into_iter()
            .map(|[x, y, z]| V3(x, y, z))
            .collect()
    } else {
        raw.split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                let coords: Vec<i32> = p
                    .split(':')
                    .map(|c| c.trim().parse())
                    .collect::<Result<_, _>>()
                    .map_err(|_| invalid(format!("bad position {p:?}")))?;
                match coords[..] {
                    [x, y, z] => Ok(V3(x, y, z)),
                    _ => Err(invalid(format!("bad position {p:?}"))),
                }
            })
            .collect::<Result<_, _>>()?
    };
    if positions.is_empty() {
        return Err(invalid("no positions given".to_owned()));
    }
    match positions.iter().find(|p| !p.in_bounds()) {
        Some(&pos) => Err(ArgError::OutOfBounds(pos)),
        None => Ok(positions),
    }
}
