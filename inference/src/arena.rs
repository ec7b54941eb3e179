//! Scratch memory arena
//!
//! A first-fit allocator over large 32-byte aligned backing blocks. Regions
//! are handed out as [`ArenaHandle`]s rather than pointers: each handle
//! records the arena generation it was issued in, and [`Arena::reset`]
//! advances the generation, so a handle kept across a reset fails with
//! [`Error::StaleHandle`] instead of aliasing a newer allocation.
//!
//! The arena has no internal locking. Callers sharing one across threads
//! must wrap it in a mutex.

use crate::aligned::{checked_align_up, AlignedBuf, ALIGNMENT};
use crate::dtype::Element;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Available to the next allocation
    Free,
    /// Handed out until the next reset
    Retired,
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    block: usize,
    offset: usize,
    size: usize,
    state: ChunkState,
}

/// Opaque reference to an arena region, valid until the next reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaHandle {
    chunk: usize,
    generation: u64,
    len: usize,
}

impl ArenaHandle {
    /// Requested length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Location of a region inside the arena's backing blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub block: usize,
    pub offset: usize,
}

/// Arena bookkeeping snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub reserved_bytes: usize,
    pub used_bytes: usize,
    pub blocks: usize,
    pub free_chunks: usize,
    pub growth_events: usize,
    pub generation: u64,
}

pub struct Arena {
    blocks: Vec<AlignedBuf>,
    /// Chunk slab; a handle's chunk id indexes it
    chunks: Vec<Chunk>,
    /// Chunk ids in first-fit scan order
    order: Vec<usize>,
    generation: u64,
    reserved: usize,
    used: usize,
    growth_events: usize,
}

impl Arena {
    /// Create an arena with one backing block of at least `initial_bytes`
    pub fn new(initial_bytes: usize) -> Result<Self> {
        let mut arena = Self {
            blocks: Vec::new(),
            chunks: Vec::new(),
            order: Vec::new(),
            generation: 0,
            reserved: 0,
            used: 0,
            growth_events: 0,
        };
        let size = checked_align_up(initial_bytes.max(ALIGNMENT)).ok_or(Error::OutOfMemory {
            requested: initial_bytes,
        })?;
        arena.add_block(size)?;
        Ok(arena)
    }

    /// Hand out a 32-byte aligned region of at least `size` bytes.
    ///
    /// Contents are whatever the previous user of the region left behind.
    pub fn allocate(&mut self, size: usize) -> Result<ArenaHandle> {
        let rounded = checked_align_up(size.max(1))
            .ok_or(Error::OutOfMemory { requested: size })?;

        loop {
            if let Some(pos) = self.first_fit(rounded) {
                let id = self.order[pos];
                self.split(pos, rounded);
                let chunk = &mut self.chunks[id];
                chunk.state = ChunkState::Retired;
                self.used += chunk.size;
                return Ok(ArenaHandle {
                    chunk: id,
                    generation: self.generation,
                    len: size,
                });
            }
            self.grow(rounded)?;
        }
    }

    /// Allocate room for `count` elements of `T`
    pub fn allocate_for<T: Element>(&mut self, count: usize) -> Result<ArenaHandle> {
        let bytes = count
            .checked_mul(T::WIDTH)
            .ok_or(Error::OutOfMemory { requested: usize::MAX })?;
        self.allocate(bytes)
    }

    /// Return every region to the free list and invalidate all handles.
    /// Reserved memory is kept.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.chunks.clear();
        self.order.clear();
        for (block, buf) in self.blocks.iter().enumerate() {
            self.order.push(self.chunks.len());
            self.chunks.push(Chunk {
                block,
                offset: 0,
                size: buf.len(),
                state: ChunkState::Free,
            });
        }
        self.used = 0;
        log::debug!(
            "arena reset: generation {}, {} bytes in {} blocks",
            self.generation,
            self.reserved,
            self.blocks.len()
        );
    }

    pub fn bytes(&self, handle: &ArenaHandle) -> Result<&[u8]> {
        let (block, offset) = self.resolve(handle)?;
        Ok(&self.blocks[block].as_bytes()[offset..offset + handle.len])
    }

    pub fn bytes_mut(&mut self, handle: &ArenaHandle) -> Result<&mut [u8]> {
        let (block, offset) = self.resolve(handle)?;
        Ok(&mut self.blocks[block].as_bytes_mut()[offset..offset + handle.len])
    }

    /// Typed view of a region; the length must be a multiple of `T`'s size
    pub fn slice<T: Element>(&self, handle: &ArenaHandle) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.bytes(handle)?)
            .map_err(|e| Error::UnsupportedAccess(format!("arena view: {:?}", e)))
    }

    pub fn slice_mut<T: Element>(&mut self, handle: &ArenaHandle) -> Result<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.bytes_mut(handle)?)
            .map_err(|e| Error::UnsupportedAccess(format!("arena view: {:?}", e)))
    }

    /// Where a live handle points
    pub fn region(&self, handle: &ArenaHandle) -> Result<Region> {
        let (block, offset) = self.resolve(handle)?;
        Ok(Region { block, offset })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved_bytes: self.reserved,
            used_bytes: self.used,
            blocks: self.blocks.len(),
            free_chunks: self
                .chunks
                .iter()
                .filter(|c| c.state == ChunkState::Free)
                .count(),
            growth_events: self.growth_events,
            generation: self.generation,
        }
    }

    fn resolve(&self, handle: &ArenaHandle) -> Result<(usize, usize)> {
        let stale = Error::StaleHandle {
            handle: handle.generation,
            current: self.generation,
        };
        if handle.generation != self.generation {
            return Err(stale);
        }
        match self.chunks.get(handle.chunk) {
            Some(chunk) if chunk.state == ChunkState::Retired && handle.len <= chunk.size => {
                Ok((chunk.block, chunk.offset))
            }
            _ => Err(stale),
        }
    }

    /// Position in `order` of the first free chunk holding `size` bytes
    fn first_fit(&self, size: usize) -> Option<usize> {
        self.order.iter().position(|&id| {
            let chunk = &self.chunks[id];
            chunk.state == ChunkState::Free && chunk.size >= size
        })
    }

    /// Shrink the chunk at `pos` to `size`, threading the remainder into the
    /// scan order right after it
    fn split(&mut self, pos: usize, size: usize) {
        let id = self.order[pos];
        let chunk = self.chunks[id];
        if chunk.size <= size {
            return;
        }
        let remainder = Chunk {
            block: chunk.block,
            offset: chunk.offset + size,
            size: chunk.size - size,
            state: ChunkState::Free,
        };
        self.chunks[id].size = size;
        self.order.insert(pos + 1, self.chunks.len());
        self.chunks.push(remainder);
    }

    fn grow(&mut self, needed: usize) -> Result<()> {
        let size = checked_align_up(needed.max(self.reserved / 2))
            .ok_or(Error::OutOfMemory { requested: needed })?;
        self.add_block(size)?;
        self.growth_events += 1;
        log::debug!(
            "arena grew by {} bytes to {} ({} blocks)",
            size,
            self.reserved,
            self.blocks.len()
        );
        Ok(())
    }

    fn add_block(&mut self, size: usize) -> Result<()> {
        let buf = AlignedBuf::zeroed(size)?;
        let block = self.blocks.len();
        self.blocks.push(buf);
        self.order.push(self.chunks.len());
        self.chunks.push(Chunk {
            block,
            offset: 0,
            size,
            state: ChunkState::Free,
        });
        self.reserved += size;
        Ok(())
    }
}
