use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_LABEL_ID: AtomicUsize = AtomicUsize::new(0);

const ALL: &str = "all";

/// How a dimension is cut into tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TilingPolicy {
    /// Tiles of (at most) the given size; each named sub-space is tiled on its own.
    Uniform(usize),
    /// Explicit tile boundaries `0 = b0 < b1 < ... < bn = extent`.
    Boundaries(Vec<usize>),
}

#[derive(Debug)]
struct SpaceData {
    id: usize,
    name: String,
    tile_sizes: Vec<usize>,
    /// Cumulative offsets: `[0, s0, s0+s1, ..., extent]`.
    offsets: Vec<usize>,
    /// Named sub-spaces as tile ranges, sorted by position.
    named: Vec<(String, Range<usize>)>,
}

/// Tiled index space, or a named view (sub-space) of one.
///
/// Cloning is cheap; all views of a space share the same tiling.
#[derive(Debug, Clone)]
pub struct TiledIndexSpace {
    data: Arc<SpaceData>,
    view: String,
    tiles: Range<usize>,
}

pub struct TiledIndexSpaceBuilder {
    name: String,
    extent: usize,
    sub_spaces: Vec<(String, Range<usize>)>,
    tiling: TilingPolicy,
}

impl TiledIndexSpaceBuilder {
    /// Declare a named sub-range `range` (in element units).
    pub fn sub_space(mut self, name: &str, range: Range<usize>) -> Self {
        self.sub_spaces.push((name.to_string(), range));
        self
    }

    pub fn tiling(mut self, tiling: TilingPolicy) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn build(self) -> Result<TiledIndexSpace> {
        let TiledIndexSpaceBuilder { name, extent, mut sub_spaces, tiling } = self;
        let config_err = |msg: String| Error::Configuration(format!("index space {name}: {msg}"));

        if extent == 0 {
            return Err(config_err("extent must be positive".into()));
        }

        // named sub-ranges must partition [0, extent)
        for (i, (sub, range)) in sub_spaces.iter().enumerate() {
            if sub == ALL {
                return Err(config_err(format!("sub-space name \"{ALL}\" is reserved")));
            }
            if sub_spaces[..i].iter().any(|(other, _)| other == sub) {
                return Err(config_err(format!("sub-space {sub} declared twice")));
            }
            if range.start >= range.end {
                return Err(config_err(format!("sub-space {sub} has empty range {range:?}")));
            }
        }
        sub_spaces.sort_by_key(|(_, range)| range.start);
        let mut cursor = 0;
        for (sub, range) in &sub_spaces {
            if range.start < cursor {
                return Err(config_err(format!("sub-space {sub} {range:?} overlaps a previous sub-space")));
            }
            if range.start > cursor {
                return Err(config_err(format!("gap {:?} before sub-space {sub}", cursor..range.start)));
            }
            cursor = range.end;
        }
        if !sub_spaces.is_empty() && cursor != extent {
            return Err(config_err(format!("sub-spaces cover 0..{cursor}, extent is {extent}")));
        }

        let segments: Vec<Range<usize>> = if sub_spaces.is_empty() {
            vec![0..extent]
        } else {
            sub_spaces.iter().map(|(_, range)| range.clone()).collect()
        };

        let boundaries = match tiling {
            TilingPolicy::Uniform(0) => return Err(config_err("tile size must be positive".into())),
            TilingPolicy::Uniform(size) => {
                let mut boundaries = vec![0];
                for segment in &segments {
                    let mut lo = segment.start;
                    while lo < segment.end {
                        lo = (lo + size).min(segment.end);
                        boundaries.push(lo);
                    }
                }
                boundaries
            },
            TilingPolicy::Boundaries(boundaries) => {
                if boundaries.first() != Some(&0) || boundaries.last() != Some(&extent) {
                    return Err(config_err(format!("tile boundaries must run from 0 to {extent}")));
                }
                if boundaries.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(config_err("tile boundaries must be strictly increasing".into()));
                }
                for segment in &segments {
                    if boundaries.binary_search(&segment.start).is_err() || boundaries.binary_search(&segment.end).is_err()
                    {
                        return Err(config_err(format!("sub-space range {segment:?} is not aligned to tile boundaries")));
                    }
                }
                boundaries
            },
        };

        let tile_sizes = boundaries.windows(2).map(|w| w[1] - w[0]).collect::<Vec<usize>>();
        let tile_index = |offset: usize| boundaries.binary_search(&offset).unwrap_or_default();
        let named = sub_spaces
            .into_iter()
            .map(|(sub, range)| {
                let tiles = tile_index(range.start)..tile_index(range.end);
                (sub, tiles)
            })
            .collect();

        let ntiles = tile_sizes.len();
        let data = SpaceData { id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed), name, tile_sizes, offsets: boundaries, named };
        Ok(TiledIndexSpace { data: Arc::new(data), view: ALL.to_string(), tiles: 0..ntiles })
    }
}

impl TiledIndexSpace {
    pub fn builder(name: &str, extent: usize) -> TiledIndexSpaceBuilder {
        TiledIndexSpaceBuilder { name: name.to_string(), extent, sub_spaces: vec![], tiling: TilingPolicy::Uniform(extent) }
    }

    /// Space without sub-spaces, tiled uniformly.
    pub fn uniform(name: &str, extent: usize, tile_size: usize) -> Result<Self> {
        Self::builder(name, extent).tiling(TilingPolicy::Uniform(tile_size)).build()
    }

    /// Name of the root space.
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Name of this view ("all" for the root).
    pub fn view_name(&self) -> &str {
        &self.view
    }

    /// Number of elements covered by this view.
    pub fn extent(&self) -> usize {
        self.data.offsets[self.tiles.end] - self.data.offsets[self.tiles.start]
    }

    /// Element offset of this view inside the root space.
    pub fn offset(&self) -> usize {
        self.data.offsets[self.tiles.start]
    }

    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Global (root) tile ids covered by this view.
    pub fn tiles(&self) -> Range<usize> {
        self.tiles.clone()
    }

    /// Number of tiles in the root space.
    pub fn root_num_tiles(&self) -> usize {
        self.data.tile_sizes.len()
    }

    pub fn root_extent(&self) -> usize {
        self.data.offsets[self.data.tile_sizes.len()]
    }

    pub fn tile_size(&self, tile: usize) -> usize {
        self.data.tile_sizes[tile]
    }

    pub fn tile_offset(&self, tile: usize) -> usize {
        self.data.offsets[tile]
    }

    pub fn tile_range(&self, tile: usize) -> Range<usize> {
        self.data.offsets[tile]..self.data.offsets[tile + 1]
    }

    /// Boundaries of the root space, `[0, ..., extent]`.
    pub fn boundaries(&self) -> &[usize] {
        &self.data.offsets
    }

    /// Tile (root id) holding element `index` of the root space.
    pub fn tile_of(&self, index: usize) -> Option<usize> {
        if index >= self.root_extent() {
            return None;
        }
        Some(self.data.offsets.partition_point(|&offset| offset <= index) - 1)
    }

    /// The whole space this view belongs to.
    pub fn root(&self) -> TiledIndexSpace {
        TiledIndexSpace { data: self.data.clone(), view: ALL.to_string(), tiles: 0..self.root_num_tiles() }
    }

    /// Named sub-space; "all" gives the root.
    pub fn sub(&self, name: &str) -> Result<TiledIndexSpace> {
        if name == ALL {
            return Ok(self.root());
        }
        self.data
            .named
            .iter()
            .find(|(sub, _)| sub == name)
            .map(|(sub, tiles)| TiledIndexSpace { data: self.data.clone(), view: sub.clone(), tiles: tiles.clone() })
            .ok_or_else(|| Error::Configuration(format!("index space {} has no sub-space {name}", self.data.name)))
    }

    /// Names of the declared sub-spaces, in order.
    pub fn names(&self) -> Vec<&str> {
        self.data.named.iter().map(|(sub, _)| sub.as_str()).collect()
    }

    /// Whether both views belong to the same tiled space.
    pub fn same_root(&self, other: &TiledIndexSpace) -> bool {
        self.data.id == other.data.id
    }

    /// Whether `other` is a view of the same space lying inside this view.
    pub fn contains(&self, other: &TiledIndexSpace) -> bool {
        self.same_root(other) && self.tiles.start <= other.tiles.start && other.tiles.end <= self.tiles.end
    }

    pub fn label(&self, name: &str) -> Result<TiledIndexLabel> {
        Ok(TiledIndexLabel::new(self.sub(name)?))
    }

    /// `N` distinct labels over the named sub-space.
    ///
    /// ```norun
    /// let [p, q, r, s] = mo.labels::<4>("all")?;
    /// ```
    pub fn labels<const N: usize>(&self, name: &str) -> Result<[TiledIndexLabel; N]> {
        let space = self.sub(name)?;
        Ok(std::array::from_fn(|_| TiledIndexLabel::new(space.clone())))
    }
}

impl PartialEq for TiledIndexSpace {
    fn eq(&self, other: &Self) -> bool {
        self.same_root(other) && self.tiles == other.tiles
    }
}

impl Eq for TiledIndexSpace {}

impl fmt::Display for TiledIndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.data.name, self.view)
    }
}

/// Index symbol bound to a (sub-)space.
///
/// Two labels denote the same index only if they are the same label.
#[derive(Debug, Clone)]
pub struct TiledIndexLabel {
    id: usize,
    space: TiledIndexSpace,
}

impl TiledIndexLabel {
    fn new(space: TiledIndexSpace) -> Self {
        Self { id: NEXT_LABEL_ID.fetch_add(1, Ordering::Relaxed), space }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn space(&self) -> &TiledIndexSpace {
        &self.space
    }
}

impl PartialEq for TiledIndexLabel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TiledIndexLabel {}

impl std::hash::Hash for TiledIndexLabel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for TiledIndexLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.space, self.id)
    }
}
