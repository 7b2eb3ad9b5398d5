use std::fmt;

use thiserror::Error;

pub const MIN_Y: i32 = -64;
pub const MAX_Y: i32 = 319;
pub const MAX_HORIZONTAL: i32 = 30_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct V3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}
#[allow(non_snake_case)]
pub const fn V3<T>(x: T, y: T, z: T) -> V3<T> {
    V3 { x, y, z }
}

pub type BlockPos = V3<i32>;

impl V3<i32> {
    pub fn region(&self) -> RegionKey {
        RegionKey { x: self.x >> 4, z: self.z >> 4 }
    }
    pub fn in_bounds(&self) -> bool {
        (MIN_Y..=MAX_Y).contains(&self.y)
            && self.x.abs() <= MAX_HORIZONTAL
            && self.z.abs() <= MAX_HORIZONTAL
    }
}
impl fmt::Display for V3<i32> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A 16-wide chunk column. Mutations are grouped by the column they land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub x: i32,
    pub z: i32,
}
impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("unknown block type '{0}'")]
    Unknown(String),
    #[error("block type '{0}' is not allowed")]
    Forbidden(String),
}

/// Palette id of a block. Fits in the 15 bits a chunk stores per position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u16);

const BLOCKS: &[&str] = &[
    "air",
    "stone",
    "granite",
    "diorite",
    "andesite",
    "grass_block",
    "dirt",
    "cobblestone",
    "oak_planks",
    "spruce_planks",
    "birch_planks",
    "oak_log",
    "sand",
    "gravel",
    "glass",
    "bricks",
    "stone_bricks",
    "sandstone",
    "white_wool",
    "red_wool",
    "blue_wool",
    "yellow_wool",
    "green_wool",
    "black_wool",
    "glowstone",
    "obsidian",
    "oak_door",
    "glass_pane",
    "water",
    "lava",
    "copper_block",
    "quartz_block",
];

const FORBIDDEN: &[&str] = &["tnt", "end_crystal", "respawn_anchor", "bed"];

impl Block {
    pub const AIR: Block = Block(0);
    pub const STONE: Block = Block(1);
    pub const ANDESITE: Block = Block(4);
    pub const GLASS: Block = Block(14);
    pub const OAK_PLANKS: Block = Block(8);

    /// Accepts `stone`, `STONE` and `minecraft:stone`.
    pub fn from_name(name: &str) -> Result<Self, BlockError> {
        let trimmed = name.trim();
        let lower = trimmed.to_ascii_lowercase();
        let bare = lower.strip_prefix("minecraft:").unwrap_or(&lower);
        if bare.is_empty()
            || bare.len() > 64
            || !bare.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(BlockError::Unknown(trimmed.to_owned()));
        }
        if FORBIDDEN.iter().any(|f| bare.contains(f)) {
            log::warn!("dangerous block rejected: {trimmed}");
            return Err(BlockError::Forbidden(trimmed.to_owned()));
        }
        BLOCKS
            .iter()
            .position(|b| *b == bare)
            .map(|id| Block(id as u16))
            .ok_or_else(|| BlockError::Unknown(trimmed.to_owned()))
    }
    pub fn from_id(id: u16) -> Option<Self> {
        ((id as usize) < BLOCKS.len()).then_some(Block(id))
    }
    pub fn id(&self) -> u16 {
        self.0
    }
    pub fn name(&self) -> &'static str {
        BLOCKS.get(self.0 as usize).copied().unwrap_or("unknown")
    }
    pub fn is_air(&self) -> bool {
        self.0 == 0
    }
}
impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "minecraft:{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_of_negative_coordinates_rounds_down() {
        assert_eq!(V3(-1, 70, -16).region(), RegionKey { x: -1, z: -1 });
        assert_eq!(V3(-17, 0, 15).region(), RegionKey { x: -2, z: 0 });
        assert_eq!(V3(31, 0, 16).region(), RegionKey { x: 1, z: 1 });
    }

    #[test]
    fn bounds_follow_world_height() {
        assert!(V3(0, MIN_Y, 0).in_bounds());
        assert!(V3(0, MAX_Y, 0).in_bounds());
        assert!(!V3(0, MAX_Y + 1, 0).in_bounds());
        assert!(!V3(MAX_HORIZONTAL + 1, 64, 0).in_bounds());
    }

    #[test]
    fn block_names_are_normalized() {
        assert_eq!(Block::from_name("stone"), Ok(Block::STONE));
        assert_eq!(Block::from_name("minecraft:STONE"), Ok(Block::STONE));
        assert_eq!(Block::from_name("  andesite "), Ok(Block::ANDESITE));
        assert_eq!(Block::from_name("oak_planks"), Ok(Block::OAK_PLANKS));
        assert_eq!(Block::from_name("glass"), Ok(Block::GLASS));
        assert_eq!(Block::STONE.to_string(), "minecraft:stone");
    }

    #[test]
    fn dangerous_and_unknown_blocks_are_rejected() {
        assert!(matches!(Block::from_name("tnt"), Err(BlockError::Forbidden(_))));
        assert!(matches!(Block::from_name("minecraft:red_bed"), Err(BlockError::Forbidden(_))));
        assert!(matches!(Block::from_name("unobtainium"), Err(BlockError::Unknown(_))));
        assert!(matches!(Block::from_name("stone;drop"), Err(BlockError::Unknown(_))));
        assert!(matches!(Block::from_name(""), Err(BlockError::Unknown(_))));
    }

    #[test]
    fn ids_round_trip_through_the_table() {
        for id in 0..BLOCKS.len() as u16 {
            let block = Block::from_id(id).unwrap();
            assert_eq!(Block::from_name(block.name()), Ok(block));
        }
        assert_eq!(Block::from_id(BLOCKS.len() as u16), None);
    }
}
