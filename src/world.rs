use crate::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

// The world is a collaborator, not part of the command core.
//   The core only ever asks it to apply one mutation at a time and trusts
//   the answer it gets back. It never assumes a write landed.
//
// Derived state (what viewers see, indexes, lighting) is refreshed per region,
// so the batch engine reports which regions it touched once it has a bunch of them.
pub trait World: Send + Sync {
    fn apply_mutation(&self, target: BlockPos, payload: &MutationSpec) -> Result<(), WorldError>;
    /// Best-effort hint that `region` should refresh its derived state.
    fn notify_region_changed(&self, region: RegionKey);
    fn block_at(&self, target: BlockPos) -> Result<Block, WorldError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MutationSpec {
    Set(Block),
    Clear,
}
impl MutationSpec {
    pub fn block(&self) -> Block {
        match self {
            MutationSpec::Set(block) => *block,
            MutationSpec::Clear => Block::AIR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("position {0} is outside the world")]
    OutOfBounds(BlockPos),
    #[error("world rejected mutation at {pos}: {reason}")]
    Rejected { pos: BlockPos, reason: String },
    #[error("world unavailable: {0}")]
    Unavailable(String),
}

const SECTIONS: usize = 24;
const BLOCKS_PER_WORD: i32 = 4;
const BITS_PER_BLOCK: i32 = 15;
const BLOCK_MASK: u64 = 0b11111_11111_11111;
const WORDS_PER_CHUNK: usize = (16 * 16 * 384) / BLOCKS_PER_WORD as usize;

pub struct Chunk {
    nonaircounts: [u16; SECTIONS],
    blocks: Box<[u64]>,
    revision: u64,
}
impl Chunk {
    fn empty() -> Self {
        Self {
            nonaircounts: [0; SECTIONS],
            blocks: vec![0u64; WORDS_PER_CHUNK].into_boxed_slice(),
            revision: 0,
        }
    }
    fn index(pos: BlockPos) -> (usize, i32) {
        let idx = (pos.y - MIN_Y) * 16 * 16 + pos.z.rem_euclid(16) * 16 + pos.x.rem_euclid(16);
        ((idx / BLOCKS_PER_WORD) as usize, (idx % BLOCKS_PER_WORD) * BITS_PER_BLOCK)
    }
    fn get(&self, pos: BlockPos) -> u16 {
        let (word, shift) = Self::index(pos);
        ((self.blocks[word] >> shift) & BLOCK_MASK) as u16
    }
    fn set(&mut self, pos: BlockPos, id: u16) {
        let (word, shift) = Self::index(pos);
        let long = &mut self.blocks[word];
        let old = (*long >> shift) & BLOCK_MASK;
        *long = (*long & !(BLOCK_MASK << shift)) | (id as u64) << shift;
        let section = ((pos.y - MIN_Y) / 16) as usize;
        if old == 0 && id != 0 {
            self.nonaircounts[section] += 1;
        } else if old != 0 && id == 0 {
            self.nonaircounts[section] -= 1;
        }
    }
    pub fn non_air(&self) -> u32 {
        self.nonaircounts.iter().map(|&n| n as u32).sum()
    }
}

#[derive(Default)]
struct LevelState {
    chunks: HashMap<RegionKey, Chunk>,
    dirty: BTreeSet<RegionKey>,
}

/// In-memory block world. Chunk columns are created on first write and never unloaded.
#[derive(Default)]
pub struct Level {
    state: Mutex<LevelState>,
}
impl Level {
    pub fn new() -> Self {
        Self::default()
    }
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LevelState>, WorldError> {
        self.state
            .lock()
            .map_err(|_| WorldError::Unavailable("level state poisoned".to_owned()))
    }
    pub fn non_air_in(&self, region: RegionKey) -> u32 {
        self.lock()
            .ok()
            .and_then(|state| state.chunks.get(&region).map(Chunk::non_air))
            .unwrap_or(0)
    }
    pub fn revision(&self, region: RegionKey) -> u64 {
        self.lock()
            .ok()
            .and_then(|state| state.chunks.get(&region).map(|c| c.revision))
            .unwrap_or(0)
    }
    /// Regions that were notified since the last call.
    pub fn take_dirty(&self) -> Vec<RegionKey> {
        match self.lock() {
            Ok(mut state) => std::mem::take(&mut state.dirty).into_iter().collect(),
            Err(_) => vec![],
        }
    }
    pub fn loaded_chunks(&self) -> usize {
        self.lock().map(|state| state.chunks.len()).unwrap_or(0)
    }
}
impl World for Level {
    fn apply_mutation(&self, target: BlockPos, payload: &MutationSpec) -> Result<(), WorldError> {
        if !target.in_bounds() {
            return Err(WorldError::OutOfBounds(target));
        }
        let mut state = self.lock()?;
        let region = target.region();
        let id = payload.block().id();
        match state.chunks.get_mut(&region) {
            Some(chunk) => chunk.set(target, id),
            // clearing an unloaded chunk is a no-op, it is already air
            None if id == 0 => {}
            None => {
                let mut chunk = Chunk::empty();
                chunk.set(target, id);
                state.chunks.insert(region, chunk);
            }
        }
        Ok(())
    }
    fn notify_region_changed(&self, region: RegionKey) {
        if let Ok(mut state) = self.lock() {
            if let Some(chunk) = state.chunks.get_mut(&region) {
                chunk.revision += 1;
            }
            state.dirty.insert(region);
            log::trace!("region {region} marked for refresh");
        }
    }
    fn block_at(&self, target: BlockPos) -> Result<Block, WorldError> {
        if !target.in_bounds() {
            return Err(WorldError::OutOfBounds(target));
        }
        let state = self.lock()?;
        let id = state
            .chunks
            .get(&target.region())
            .map_or(0, |chunk| chunk.get(target));
        Block::from_id(id)
            .ok_or_else(|| WorldError::Unavailable(format!("corrupt block id {id} at {target}")))
    }
}
