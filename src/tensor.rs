use std::mem::size_of;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use itertools::Itertools;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::index_space::TiledIndexSpace;
use crate::tile::Tile;

/// Permutational symmetry of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Symmetry {
    #[default]
    None,
    /// `X[a.., b..] == X[b.., a..]` for the two halves of the index list.
    PairExchange,
}

impl Symmetry {
    /// Whether the block is stored, as opposed to derived from its mirror.
    pub fn is_canonical(&self, coords: &[usize]) -> bool {
        match self {
            Symmetry::None => true,
            Symmetry::PairExchange => {
                let half = coords.len() / 2;
                coords[..half] <= coords[half..]
            },
        }
    }

    /// Stored block that `coords` is read from.
    pub fn canonical(&self, coords: &[usize]) -> Vec<usize> {
        if self.is_canonical(coords) { coords.to_vec() } else { Self::mirror(coords) }
    }

    fn mirror(coords: &[usize]) -> Vec<usize> {
        let half = coords.len() / 2;
        coords[half..].iter().chain(&coords[..half]).copied().collect()
    }

    /// Axis permutation exchanging the two index halves.
    pub fn mirror_perm(ndim: usize) -> Vec<usize> {
        let half = ndim / 2;
        (half..ndim).chain(0..half).collect()
    }
}

/// How [`DistTensor::put_block`] combines a block with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    Set,
    Add,
}

fn read_tile(slot: &RwLock<Tile>) -> Result<RwLockReadGuard<'_, Tile>> {
    slot.read().map_err(|_| Error::Protocol("tile lock poisoned".into()))
}

fn write_tile(slot: &RwLock<Tile>) -> Result<RwLockWriteGuard<'_, Tile>> {
    slot.write().map_err(|_| Error::Protocol("tile lock poisoned".into()))
}

pub(crate) fn dense_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Block storage of one address space; `None` marks blocks that are not stored
/// because of symmetry.
#[derive(Debug)]
struct TileStore {
    tiles: Vec<Option<RwLock<Tile>>>,
    owned_bytes: Vec<usize>,
}

#[derive(Debug)]
pub struct DistTensor {
    name: String,
    spaces: Vec<TiledIndexSpace>,
    symmetry: Symmetry,
    store: RwLock<Option<Arc<TileStore>>>,
}

impl DistTensor {
    pub fn new(name: &str, spaces: Vec<TiledIndexSpace>) -> Self {
        Self { name: name.to_string(), spaces, symmetry: Symmetry::None, store: RwLock::new(None) }
    }

    pub fn with_symmetry(mut self, symmetry: Symmetry) -> Result<Self> {
        if symmetry == Symmetry::PairExchange {
            let ndim = self.spaces.len();
            if ndim == 0 || ndim % 2 != 0 {
                return Err(Error::InvalidOperation(format!(
                    "pair exchange symmetry of {} needs an even number of indices, got {ndim}",
                    self.name
                )));
            }
            if self.spaces[..ndim / 2] != self.spaces[ndim / 2..] {
                return Err(Error::InvalidOperation(format!(
                    "pair exchange symmetry of {} needs identical spaces in both index halves",
                    self.name
                )));
            }
        }
        self.symmetry = symmetry;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spaces(&self) -> &[TiledIndexSpace] {
        &self.spaces
    }

    pub fn ndim(&self) -> usize {
        self.spaces.len()
    }

    /// Dense shape, in elements.
    pub fn shape(&self) -> Vec<usize> {
        self.spaces.iter().map(|space| space.extent()).collect()
    }

    /// Number of tiles along each dimension.
    pub fn grid(&self) -> Vec<usize> {
        self.spaces.iter().map(|space| space.num_tiles()).collect()
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn is_allocated(&self) -> Result<bool> {
        Ok(self.read_store()?.is_some())
    }

    fn read_store(&self) -> Result<RwLockReadGuard<'_, Option<Arc<TileStore>>>> {
        self.store.read().map_err(|_| Error::Protocol(format!("storage handle of {} poisoned", self.name)))
    }

    fn store(&self) -> Result<Arc<TileStore>> {
        self.read_store()?.clone().ok_or_else(|| Error::Protocol(format!("tensor {} is not allocated", self.name)))
    }

    fn set_store(&self, store: Option<Arc<TileStore>>) -> Result<()> {
        *self.store.write().map_err(|_| Error::Protocol(format!("storage handle of {} poisoned", self.name)))? = store;
        Ok(())
    }

    /* #region block indexing */

    pub(crate) fn linear_index(&self, coords: &[usize]) -> Result<usize> {
        if coords.len() != self.spaces.len() {
            return Err(Error::InvalidOperation(format!(
                "block {coords:?} does not match the {} indices of {}",
                self.spaces.len(),
                self.name
            )));
        }
        let mut linear = 0;
        for (&tile, space) in coords.iter().zip(&self.spaces) {
            let tiles = space.tiles();
            if !tiles.contains(&tile) {
                return Err(Error::InvalidOperation(format!("tile {tile} lies outside of {space} in {}", self.name)));
            }
            linear = linear * tiles.len() + (tile - tiles.start);
        }
        Ok(linear)
    }

    fn block_coords(&self, mut linear: usize) -> Vec<usize> {
        let mut coords = vec![0; self.spaces.len()];
        for (axis, space) in self.spaces.iter().enumerate().rev() {
            let tiles = space.tiles();
            coords[axis] = tiles.start + linear % tiles.len();
            linear /= tiles.len();
        }
        coords
    }

    pub fn num_blocks(&self) -> usize {
        self.grid().iter().product()
    }

    /// All block coordinates in linear order, including mirrored ones.
    pub fn blocks(&self) -> Vec<Vec<usize>> {
        (0..self.num_blocks()).map(|linear| self.block_coords(linear)).collect()
    }

    /// Stored blocks owned by the calling rank.
    pub fn owned_blocks(&self, ec: &ExecutionContext) -> Vec<Vec<usize>> {
        self.blocks_of(ec, ec.rank())
    }

    fn blocks_of(&self, ec: &ExecutionContext, rank: usize) -> Vec<Vec<usize>> {
        (0..self.num_blocks())
            .filter(|&linear| ec.owner(linear) == rank)
            .map(|linear| self.block_coords(linear))
            .filter(|coords| self.symmetry.is_canonical(coords))
            .collect()
    }

    pub fn block_dims(&self, coords: &[usize]) -> Vec<usize> {
        coords.iter().zip(&self.spaces).map(|(&tile, space)| space.tile_size(tile)).collect()
    }

    /// Rank owning the stored block `coords` is read from.
    pub fn owner(&self, ec: &ExecutionContext, coords: &[usize]) -> Result<usize> {
        Ok(ec.owner(self.linear_index(&self.symmetry.canonical(coords))?))
    }

    /// Start offsets (into the dense array) of the contiguous rows of a block,
    /// and the row length.
    fn block_rows(&self, coords: &[usize]) -> (Vec<usize>, usize) {
        let strides = dense_strides(&self.shape());
        let dims = self.block_dims(coords);
        let base: usize = coords
            .iter()
            .zip(&self.spaces)
            .zip(&strides)
            .map(|((&tile, space), stride)| (space.tile_offset(tile) - space.offset()) * stride)
            .sum();
        let last = dims.len() - 1;
        if last == 0 {
            return (vec![base], dims[0]);
        }
        let rows = dims[..last]
            .iter()
            .map(|&d| 0..d)
            .multi_cartesian_product()
            .map(|index| base + index.iter().zip(&strides).map(|(i, stride)| i * stride).sum::<usize>())
            .collect();
        (rows, dims[last])
    }

    /* #endregion */

    /* #region allocation */

    /// Collective allocation of zero-initialized storage.
    ///
    /// The owned bytes of every rank are reserved before any tile is created.
    pub fn allocate(&self, ec: &ExecutionContext) -> Result<()> {
        if self.spaces.is_empty() {
            return Err(Error::InvalidOperation(format!("tensor {} has no indices", self.name)));
        }
        if self.is_allocated()? {
            return Err(Error::Protocol(format!("tensor {} allocated twice", self.name)));
        }

        let store = ec.node_local(&format!("allocate {}", self.name), || {
            let mut owned_bytes = vec![0; ec.nranks()];
            for linear in 0..self.num_blocks() {
                let coords = self.block_coords(linear);
                if self.symmetry.is_canonical(&coords) {
                    let elements = self.block_dims(&coords).iter().product::<usize>();
                    owned_bytes[ec.owner(linear)] += elements * size_of::<f64>();
                }
            }
            ec.memory().reserve(&self.name, &owned_bytes)?;

            let tiles = (0..self.num_blocks())
                .map(|linear| {
                    let coords = self.block_coords(linear);
                    self.symmetry.is_canonical(&coords).then(|| RwLock::new(Tile::zeros(self.block_dims(&coords))))
                })
                .collect();
            Ok(Arc::new(TileStore { tiles, owned_bytes }))
        })?;
        self.set_store(Some(store))
    }

    /// Collective release of the storage.
    pub fn deallocate(&self, ec: &ExecutionContext) -> Result<()> {
        let store = self.store()?;
        ec.node_local(&format!("deallocate {}", self.name), || ec.memory().release(&store.owned_bytes))?;
        self.set_store(None)
    }

    /* #endregion */

    /* #region block access */

    fn slot<'s>(&self, store: &'s TileStore, coords: &[usize]) -> Result<&'s RwLock<Tile>> {
        let linear = self.linear_index(coords)?;
        store.tiles[linear]
            .as_ref()
            .ok_or_else(|| Error::Protocol(format!("block {coords:?} of {} is not stored", self.name)))
    }

    /// Copy of a block; mirrored blocks of symmetric tensors are derived from
    /// the stored block by exchanging the index halves.
    pub fn get_block(&self, coords: &[usize]) -> Result<Tile> {
        let store = self.store()?;
        let canonical = self.symmetry.canonical(coords);
        let linear = self.linear_index(&canonical)?;
        let slot = store.tiles[linear]
            .as_ref()
            .ok_or_else(|| Error::Protocol(format!("block {canonical:?} of {} is not stored", self.name)))?;
        let tile = read_tile(slot)?.clone();
        if canonical == coords { Ok(tile) } else { Ok(tile.permuted(&Symmetry::mirror_perm(coords.len()))) }
    }

    /// Write a block owned by the calling rank.
    pub fn put_block(&self, ec: &ExecutionContext, coords: &[usize], tile: Tile, update: Update) -> Result<()> {
        let store = self.store()?;
        if !self.symmetry.is_canonical(coords) {
            return Err(Error::InvalidOperation(format!(
                "block {coords:?} of symmetric tensor {} is not stored",
                self.name
            )));
        }
        let linear = self.linear_index(coords)?;
        let owner = ec.owner(linear);
        if owner != ec.rank() {
            return Err(Error::Protocol(format!(
                "rank {} wrote block {coords:?} of {} owned by rank {owner}",
                ec.rank(),
                self.name
            )));
        }
        let slot = store.tiles[linear]
            .as_ref()
            .ok_or_else(|| Error::Protocol(format!("block {coords:?} of {} is not stored", self.name)))?;
        let mut stored = write_tile(slot)?;
        if stored.dims() != tile.dims() {
            return Err(Error::InvalidOperation(format!(
                "block {coords:?} of {} has dims {:?}, got {:?}",
                self.name,
                stored.dims(),
                tile.dims()
            )));
        }
        match update {
            Update::Set => *stored = tile,
            Update::Add => stored.axpy(1.0, &tile),
        }
        Ok(())
    }

    /// Collective exchange of the owned blocks, for groups whose ranks do not
    /// share tile storage. Every rank then reads current values of all blocks.
    pub fn publish(&self, ec: &ExecutionContext) -> Result<()> {
        if ec.shares_memory() {
            return Ok(());
        }
        let store = self.store()?;
        let mut local = vec![];
        for coords in self.owned_blocks(ec) {
            local.extend_from_slice(read_tile(self.slot(&store, &coords)?)?.data());
        }
        let gathered: Vec<Vec<f64>> = ec.all_gather(&format!("publish {}", self.name), &local)?;
        for (rank, data) in gathered.into_iter().enumerate().filter(|&(rank, _)| rank != ec.rank()) {
            let mut offset = 0;
            for coords in self.blocks_of(ec, rank) {
                let mut tile = write_tile(self.slot(&store, &coords)?)?;
                let len = tile.len();
                let chunk = data.get(offset..offset + len).ok_or_else(|| {
                    Error::Protocol(format!("rank {rank} published {} values of {}", data.len(), self.name))
                })?;
                tile.data_mut().copy_from_slice(chunk);
                offset += len;
            }
        }
        Ok(())
    }

    /// Collective distribution of a dense row-major array; every rank stores
    /// the blocks it owns.
    pub fn scatter(&self, ec: &ExecutionContext, dense: &[f64]) -> Result<()> {
        let local = (|| {
            let len = self.shape().iter().product::<usize>();
            if dense.len() != len {
                return Err(Error::InvalidOperation(format!(
                    "cannot scatter {} values into {} of shape {:?}",
                    dense.len(),
                    self.name,
                    self.shape()
                )));
            }
            for coords in self.owned_blocks(ec) {
                let (rows, row_len) = self.block_rows(&coords);
                let data = rows.iter().flat_map(|&start| &dense[start..start + row_len]).copied().collect();
                self.put_block(ec, &coords, Tile::from_vec(self.block_dims(&coords), data), Update::Set)?;
            }
            Ok(())
        })();
        ec.agree(&format!("scatter {}", self.name), local)?;
        self.publish(ec)
    }

    /// Dense row-major copy of the whole tensor.
    pub fn to_dense(&self) -> Result<Vec<f64>> {
        let mut dense = vec![0.0; self.shape().iter().product()];
        for coords in self.blocks() {
            let tile = self.get_block(&coords)?;
            let (rows, row_len) = self.block_rows(&coords);
            for (start, chunk) in rows.into_iter().zip(tile.data().chunks(row_len)) {
                dense[start..start + row_len].copy_from_slice(chunk);
            }
        }
        Ok(dense)
    }

    /// Single element; `index` is relative to the declared spaces.
    pub fn element(&self, index: &[usize]) -> Result<f64> {
        if index.len() != self.spaces.len() {
            return Err(Error::InvalidOperation(format!("index {index:?} does not match {}", self.name)));
        }
        let mut coords = Vec::with_capacity(index.len());
        let mut local = Vec::with_capacity(index.len());
        for (&i, space) in index.iter().zip(&self.spaces) {
            let tile = (i < space.extent())
                .then(|| space.tile_of(space.offset() + i))
                .flatten()
                .ok_or_else(|| Error::InvalidOperation(format!("index {index:?} out of bounds for {}", self.name)))?;
            coords.push(tile);
            local.push(space.offset() + i - space.tile_offset(tile));
        }
        let tile = self.get_block(&coords)?;
        let offset: usize = local.iter().zip(tile.strides()).map(|(i, s)| i * s).sum();
        Ok(tile.data()[offset])
    }

    /* #endregion */
}

/// Allocate several tensors, in order.
pub fn allocate_all(ec: &ExecutionContext, tensors: &[&DistTensor]) -> Result<()> {
    tensors.iter().try_for_each(|tensor| tensor.allocate(ec))
}

/// Deallocate several tensors, in order.
pub fn free_tensors(ec: &ExecutionContext, tensors: &[&DistTensor]) -> Result<()> {
    tensors.iter().try_for_each(|tensor| tensor.deallocate(ec))
}
