use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use itertools::Itertools;
use rayon::prelude::*;

use crate::context::{ExecutionContext, ExecutionHw};
use crate::error::{Error, Result};
use crate::index_space::TiledIndexLabel;
use crate::prelude::DeviceTsr;
use crate::tensor::{DistTensor, Symmetry, Update};
use crate::tile::{PairContraction, Tile};

/* #region labeled tensor */

/// Tensor reference with one index label per dimension.
#[derive(Debug, Clone)]
pub struct LabeledTensor<'a> {
    tensor: &'a DistTensor,
    labels: Vec<TiledIndexLabel>,
}

impl DistTensor {
    pub fn at(&self, labels: &[TiledIndexLabel]) -> LabeledTensor<'_> {
        LabeledTensor { tensor: self, labels: labels.to_vec() }
    }
}

impl<'a> LabeledTensor<'a> {
    pub fn tensor(&self) -> &'a DistTensor {
        self.tensor
    }

    pub fn labels(&self) -> &[TiledIndexLabel] {
        &self.labels
    }

    fn position(&self, label: &TiledIndexLabel) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    fn contains(&self, label: &TiledIndexLabel) -> bool {
        self.position(label).is_some()
    }

    /// Blocks covered by the labels' sub-spaces.
    fn region(&self) -> Vec<Vec<usize>> {
        tile_product(self.labels.iter().map(|label| label.space().tiles()).collect())
    }
}

impl fmt::Display for LabeledTensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self.labels.iter().map(|label| format!("{label}")).join(", ");
        write!(f, "{}({labels})", self.tensor.name())
    }
}

fn tile_product(ranges: Vec<Range<usize>>) -> Vec<Vec<usize>> {
    if ranges.is_empty() {
        return vec![vec![]];
    }
    ranges.into_iter().multi_cartesian_product().collect()
}

fn key(tensor: &DistTensor) -> usize {
    tensor as *const DistTensor as usize
}

/* #endregion */

/* #region operation records */

#[derive(Debug, Clone)]
enum Operation<'a> {
    Allocate(&'a DistTensor),
    Deallocate(&'a DistTensor),
    Fill { lhs: LabeledTensor<'a>, value: f64 },
    Assign { lhs: LabeledTensor<'a>, alpha: f64, rhs: LabeledTensor<'a> },
    Contract { lhs: LabeledTensor<'a>, alpha: f64, a: LabeledTensor<'a>, b: LabeledTensor<'a>, accumulate: bool },
}

impl Operation<'_> {
    fn reads(&self) -> Vec<usize> {
        match self {
            Operation::Allocate(_) | Operation::Deallocate(_) | Operation::Fill { .. } => vec![],
            Operation::Assign { rhs, .. } => vec![key(rhs.tensor)],
            Operation::Contract { lhs, a, b, accumulate, .. } => {
                let mut reads = vec![key(a.tensor), key(b.tensor)];
                if *accumulate {
                    reads.push(key(lhs.tensor));
                }
                reads
            },
        }
    }

    fn writes(&self) -> usize {
        match self {
            Operation::Allocate(t) | Operation::Deallocate(t) => key(t),
            Operation::Fill { lhs, .. } | Operation::Assign { lhs, .. } | Operation::Contract { lhs, .. } => key(lhs.tensor),
        }
    }

    fn describe(&self) -> String {
        match self {
            Operation::Allocate(t) => format!("allocate {}", t.name()),
            Operation::Deallocate(t) => format!("deallocate {}", t.name()),
            Operation::Fill { lhs, value } => format!("{lhs} = {value}"),
            Operation::Assign { lhs, alpha, rhs } => format!("{lhs} = {alpha} * {rhs}"),
            Operation::Contract { lhs, alpha, a, b, accumulate } => {
                let op = if *accumulate { "+=" } else { "=" };
                format!("{lhs} {op} {alpha} * {a} * {b}")
            },
        }
    }
}

/// Dependency levels of the records; records of one level are independent.
fn plan_levels(accesses: &[(Vec<usize>, usize)]) -> Vec<Vec<usize>> {
    let mut level_of: Vec<usize> = Vec::with_capacity(accesses.len());
    for (i, (reads, write)) in accesses.iter().enumerate() {
        let level = (0..i)
            .filter(|&j| {
                let (earlier_reads, earlier_write) = &accesses[j];
                earlier_write == write || earlier_reads.contains(write) || reads.contains(earlier_write)
            })
            .map(|j| level_of[j] + 1)
            .max()
            .unwrap_or(0);
        level_of.push(level);
    }
    let nlevels = level_of.iter().max().map_or(0, |&l| l + 1);
    let mut levels = vec![vec![]; nlevels];
    level_of.iter().enumerate().for_each(|(i, &l)| levels[l].push(i));
    levels
}

/* #endregion */

/* #region validation */

fn invalid(msg: String) -> Error {
    Error::InvalidOperation(msg)
}

fn validate_reference(r: &LabeledTensor) -> Result<()> {
    let tensor = r.tensor;
    if r.labels.len() != tensor.ndim() {
        return Err(invalid(format!("{} has {} indices but is referenced as {r}", tensor.name(), tensor.ndim())));
    }
    for (axis, (label, space)) in r.labels.iter().zip(tensor.spaces()).enumerate() {
        if !space.contains(label.space()) {
            return Err(invalid(format!("label {label} of {r} does not belong to space {space} of index {axis}")));
        }
        if r.labels[..axis].contains(label) {
            return Err(invalid(format!("label {label} repeats within {r}")));
        }
    }
    Ok(())
}

fn validate_output(lhs: &LabeledTensor, inputs: &[&LabeledTensor]) -> Result<()> {
    validate_reference(lhs)?;
    if inputs.iter().any(|input| key(input.tensor) == key(lhs.tensor)) {
        return Err(invalid(format!("{lhs} is both read and written by one operation")));
    }
    if lhs.tensor.symmetry() == Symmetry::PairExchange {
        let half = lhs.labels.len() / 2;
        let first = lhs.labels[..half].iter().map(|label| label.space());
        let second = lhs.labels[half..].iter().map(|label| label.space());
        if first.ne(second) {
            return Err(invalid(format!("output region {lhs} of a pair-symmetric tensor is not symmetric")));
        }
    }
    Ok(())
}

fn validate_assign(lhs: &LabeledTensor, rhs: &LabeledTensor) -> Result<()> {
    validate_output(lhs, &[rhs])?;
    validate_reference(rhs)?;
    if lhs.labels.len() != rhs.labels.len() || lhs.labels.iter().any(|label| !rhs.contains(label)) {
        return Err(invalid(format!("{lhs} and {rhs} do not carry the same labels")));
    }
    Ok(())
}

fn validate_contract(lhs: &LabeledTensor, a: &LabeledTensor, b: &LabeledTensor) -> Result<()> {
    validate_output(lhs, &[a, b])?;
    validate_reference(a)?;
    validate_reference(b)?;
    for label in &lhs.labels {
        match (a.contains(label), b.contains(label)) {
            (true, true) => return Err(invalid(format!("free label {label} of {lhs} appears in both {a} and {b}"))),
            (false, false) => return Err(invalid(format!("free label {label} of {lhs} appears in neither {a} nor {b}"))),
            _ => (),
        }
    }
    for (factor, other) in [(a, b), (b, a)] {
        for label in &factor.labels {
            if !lhs.contains(label) && !other.contains(label) {
                return Err(invalid(format!("label {label} of {factor} is neither free nor contracted")));
            }
        }
    }
    Ok(())
}

/* #endregion */

/* #region kernels */

#[derive(Debug, Clone, Copy)]
enum Slot {
    Out(usize),
    Summed(usize),
}

fn resolve(slots: &[Slot], out: &[usize], summed: &[usize]) -> Vec<usize> {
    slots
        .iter()
        .map(|slot| match slot {
            Slot::Out(i) => out[*i],
            Slot::Summed(i) => summed[*i],
        })
        .collect()
}

/// Per-operation data needed to compute one output block.
enum Kernel<'a> {
    Fill { value: f64 },
    Assign { alpha: f64, rhs: &'a DistTensor, rhs_slots: Vec<Slot>, perm: Vec<usize> },
    Contract {
        alpha: f64,
        accumulate: bool,
        a: &'a DistTensor,
        b: &'a DistTensor,
        a_slots: Vec<Slot>,
        b_slots: Vec<Slot>,
        summed_tiles: Vec<Vec<usize>>,
        pair: PairContraction,
    },
}

fn contract_kernel<'a>(
    lhs: &LabeledTensor<'a>,
    alpha: f64,
    a: &LabeledTensor<'a>,
    b: &LabeledTensor<'a>,
    accumulate: bool,
) -> Kernel<'a> {
    let summed = a.labels.iter().filter(|label| !lhs.contains(label)).cloned().collect::<Vec<_>>();
    let free_a = (0..a.labels.len()).filter(|&i| lhs.contains(&a.labels[i])).collect::<Vec<_>>();
    let free_b = (0..b.labels.len()).filter(|&i| lhs.contains(&b.labels[i])).collect::<Vec<_>>();

    let a_perm = free_a.iter().copied().chain(summed.iter().filter_map(|label| a.position(label))).collect();
    let b_perm = summed.iter().filter_map(|label| b.position(label)).chain(free_b.iter().copied()).collect();
    let product = free_a.iter().map(|&i| &a.labels[i]).chain(free_b.iter().map(|&i| &b.labels[i])).collect::<Vec<_>>();
    let out_perm = lhs.labels.iter().filter_map(|label| product.iter().position(|&p| p == label)).collect();
    let pair = PairContraction { a_perm, b_perm, n_free_a: free_a.len(), n_summed: summed.len(), out_perm };

    let slots = |factor: &LabeledTensor| {
        factor
            .labels
            .iter()
            .map(|label| match lhs.position(label) {
                Some(i) => Slot::Out(i),
                None => Slot::Summed(summed.iter().position(|s| s == label).unwrap_or_default()),
            })
            .collect::<Vec<Slot>>()
    };
    Kernel::Contract {
        alpha,
        accumulate,
        a: a.tensor,
        b: b.tensor,
        a_slots: slots(a),
        b_slots: slots(b),
        summed_tiles: tile_product(summed.iter().map(|label| label.space().tiles()).collect()),
        pair,
    }
}

fn assign_kernel<'a>(lhs: &LabeledTensor<'a>, alpha: f64, rhs: &LabeledTensor<'a>) -> Kernel<'a> {
    let rhs_slots = rhs.labels.iter().map(|label| Slot::Out(lhs.position(label).unwrap_or_default())).collect();
    let perm = lhs.labels.iter().map(|label| rhs.position(label).unwrap_or_default()).collect();
    Kernel::Assign { alpha, rhs: rhs.tensor, rhs_slots, perm }
}

impl Kernel<'_> {
    fn compute(&self, lhs: &DistTensor, coords: &[usize], device: &DeviceTsr) -> Result<Tile> {
        let mut tile = Tile::zeros(lhs.block_dims(coords));
        match self {
            Kernel::Fill { value } => tile.fill(*value),
            Kernel::Assign { alpha, rhs, rhs_slots, perm } => {
                let source = rhs.get_block(&resolve(rhs_slots, coords, &[]))?;
                tile.axpy(*alpha, &source.permuted(perm));
            },
            Kernel::Contract { alpha, accumulate, a, b, a_slots, b_slots, summed_tiles, pair } => {
                if *accumulate {
                    tile = lhs.get_block(coords)?;
                }
                for summed in summed_tiles {
                    let a_tile = a.get_block(&resolve(a_slots, coords, summed))?;
                    let b_tile = b.get_block(&resolve(b_slots, coords, summed))?;
                    pair.accumulate(&mut tile, *alpha, &a_tile, &b_tile, device);
                }
            },
        }
        if tile.first_non_finite().is_some() {
            return Err(Error::Numerical { tensor: lhs.name().to_string(), tile: coords.to_vec() });
        }
        Ok(tile)
    }
}

/* #endregion */

/* #region scheduler */

/// Builder of a batch of symbolic operations.
///
/// Records run in dependency levels with a collective between levels; each
/// rank computes the canonical output blocks it owns.
pub struct Scheduler<'a> {
    ec: &'a ExecutionContext,
    ops: Vec<Operation<'a>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(ec: &'a ExecutionContext) -> Self {
        Self { ec, ops: vec![] }
    }

    pub fn allocate(mut self, tensors: &[&'a DistTensor]) -> Self {
        self.ops.extend(tensors.iter().map(|&t| Operation::Allocate(t)));
        self
    }

    pub fn deallocate(mut self, tensors: &[&'a DistTensor]) -> Self {
        self.ops.extend(tensors.iter().map(|&t| Operation::Deallocate(t)));
        self
    }

    pub fn fill(mut self, lhs: LabeledTensor<'a>, value: f64) -> Self {
        self.ops.push(Operation::Fill { lhs, value });
        self
    }

    /// `lhs = rhs`, with the indices permuted by label.
    pub fn assign(self, lhs: LabeledTensor<'a>, rhs: LabeledTensor<'a>) -> Self {
        self.assign_scaled(lhs, 1.0, rhs)
    }

    /// `lhs = alpha * rhs`
    pub fn assign_scaled(mut self, lhs: LabeledTensor<'a>, alpha: f64, rhs: LabeledTensor<'a>) -> Self {
        self.ops.push(Operation::Assign { lhs, alpha, rhs });
        self
    }

    /// `lhs = a * b`, summing over the labels shared by `a` and `b`.
    pub fn contract(mut self, lhs: LabeledTensor<'a>, a: LabeledTensor<'a>, b: LabeledTensor<'a>) -> Self {
        self.ops.push(Operation::Contract { lhs, alpha: 1.0, a, b, accumulate: false });
        self
    }

    /// `lhs += alpha * a * b`
    pub fn contract_add(
        mut self,
        lhs: LabeledTensor<'a>,
        alpha: f64,
        a: LabeledTensor<'a>,
        b: LabeledTensor<'a>,
    ) -> Self {
        self.ops.push(Operation::Contract { lhs, alpha, a, b, accumulate: true });
        self
    }

    fn validate(&self) -> Result<()> {
        // allocation state as of the record being checked
        let mut allocated: HashMap<usize, bool> = HashMap::new();
        let is_allocated = |tensor: &DistTensor, allocated: &HashMap<usize, bool>| -> Result<bool> {
            match allocated.get(&key(tensor)) {
                Some(&state) => Ok(state),
                None => tensor.is_allocated(),
            }
        };

        for op in &self.ops {
            match op {
                Operation::Allocate(t) => {
                    if is_allocated(t, &allocated)? {
                        return Err(invalid(format!("tensor {} is allocated twice", t.name())));
                    }
                    allocated.insert(key(t), true);
                },
                Operation::Deallocate(t) => {
                    if !is_allocated(t, &allocated)? {
                        return Err(invalid(format!("tensor {} is deallocated while not allocated", t.name())));
                    }
                    allocated.insert(key(t), false);
                },
                Operation::Fill { lhs, .. } => validate_output(lhs, &[])?,
                Operation::Assign { lhs, rhs, .. } => validate_assign(lhs, rhs)?,
                Operation::Contract { lhs, a, b, .. } => validate_contract(lhs, a, b)?,
            }
            let tensors: Vec<&DistTensor> = match op {
                Operation::Allocate(_) | Operation::Deallocate(_) => vec![],
                Operation::Fill { lhs, .. } => vec![lhs.tensor],
                Operation::Assign { lhs, rhs, .. } => vec![lhs.tensor, rhs.tensor],
                Operation::Contract { lhs, a, b, .. } => vec![lhs.tensor, a.tensor, b.tensor],
            };
            for tensor in tensors {
                if !is_allocated(tensor, &allocated)? {
                    return Err(invalid(format!("{} used while not allocated: {}", tensor.name(), op.describe())));
                }
            }
        }
        Ok(())
    }

    /// Validate, plan, and run the recorded operations.
    pub fn execute(self, exhw: ExecutionHw) -> Result<()> {
        self.validate()?;
        let accesses = self.ops.iter().map(|op| (op.reads(), op.writes())).collect::<Vec<_>>();
        let levels = plan_levels(&accesses);

        let ec = self.ec;
        if ec.is_designated_writer() {
            tracing::debug!("scheduled {} operations in {} levels", self.ops.len(), levels.len());
            for (level, ops) in levels.iter().enumerate() {
                for &i in ops {
                    tracing::debug!("level {level}: {}", self.ops[i].describe());
                }
            }
        }

        let device = DeviceTsr::default();
        for (level, ops) in levels.iter().enumerate() {
            // a failed computation must not skip the collectives of this level
            let mut local: Result<()> = Ok(());
            for &i in ops {
                match &self.ops[i] {
                    Operation::Allocate(t) => t.allocate(ec)?,
                    Operation::Deallocate(t) => t.deallocate(ec)?,
                    op if local.is_ok() => local = self.run(op, exhw, &device),
                    _ => (),
                }
            }
            ec.agree(&format!("scheduler level {level}"), local)?;

            let mut written: Vec<&DistTensor> = vec![];
            for &i in ops {
                let lhs = match &self.ops[i] {
                    Operation::Fill { lhs, .. } | Operation::Assign { lhs, .. } | Operation::Contract { lhs, .. } => lhs.tensor,
                    Operation::Allocate(_) | Operation::Deallocate(_) => continue,
                };
                if !written.iter().any(|t| key(t) == key(lhs)) {
                    written.push(lhs);
                }
            }
            for tensor in written {
                tensor.publish(ec)?;
            }
        }
        Ok(())
    }

    fn run(&self, op: &Operation<'a>, exhw: ExecutionHw, device: &DeviceTsr) -> Result<()> {
        let (lhs, kernel) = match op {
            Operation::Fill { lhs, value } => (lhs, Kernel::Fill { value: *value }),
            Operation::Assign { lhs, alpha, rhs } => (lhs, assign_kernel(lhs, *alpha, rhs)),
            Operation::Contract { lhs, alpha, a, b, accumulate } => (lhs, contract_kernel(lhs, *alpha, a, b, *accumulate)),
            Operation::Allocate(_) | Operation::Deallocate(_) => return Ok(()),
        };
        let tensor = lhs.tensor;
        let blocks = lhs
            .region()
            .into_iter()
            .filter(|coords| tensor.symmetry().is_canonical(coords))
            .filter(|coords| tensor.owner(self.ec, coords).is_ok_and(|owner| owner == self.ec.rank()))
            .collect::<Vec<_>>();

        let compute = |coords: &Vec<usize>| kernel.compute(tensor, coords, device);
        let tiles: Vec<Result<Tile>> = match exhw {
            ExecutionHw::Cpu => blocks.iter().map(compute).collect(),
            ExecutionHw::Accelerated => blocks.par_iter().map(compute).collect(),
        };
        for (coords, tile) in blocks.iter().zip(tiles) {
            tensor.put_block(self.ec, coords, tile?, Update::Set)?;
        }
        Ok(())
    }
}

/* #endregion */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessGroup;
    use crate::index_space::{TiledIndexSpace, TilingPolicy};

    fn matrix(rows: usize, cols: usize, seed: f64) -> Vec<f64> {
        (0..rows * cols).map(|x| ((x as f64) * 0.37 + seed).cos()).collect()
    }

    fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|l| a[i * k + l] * b[l * n + j]).sum();
            }
        }
        c
    }

    fn run_matmul(exhw: ExecutionHw, nranks: usize) -> Vec<Vec<f64>> {
        let rows = TiledIndexSpace::builder("I", 7).tiling(TilingPolicy::Boundaries(vec![0, 3, 4, 7])).build().unwrap();
        let inner = TiledIndexSpace::uniform("K", 5, 2).unwrap();
        let cols = TiledIndexSpace::uniform("J", 4, 3).unwrap();
        let [i] = rows.labels::<1>("all").unwrap();
        let [k] = inner.labels::<1>("all").unwrap();
        let [j] = cols.labels::<1>("all").unwrap();
        let (a_dense, b_dense) = (matrix(7, 5, 0.1), matrix(5, 4, 0.7));

        ProcessGroup::new(nranks)
            .execution_hw(exhw)
            .launch(|ec| {
                let a = DistTensor::new("A", vec![rows.clone(), inner.clone()]);
                let b = DistTensor::new("B", vec![inner.clone(), cols.clone()]);
                let c = DistTensor::new("C", vec![rows.clone(), cols.clone()]);
                Scheduler::new(ec).allocate(&[&a, &b]).execute(ec.exhw())?;
                a.scatter(ec, &a_dense)?;
                b.scatter(ec, &b_dense)?;
                Scheduler::new(ec)
                    .allocate(&[&c])
                    .contract(c.at(&[i.clone(), j.clone()]), a.at(&[i.clone(), k.clone()]), b.at(&[k.clone(), j.clone()]))
                    .deallocate(&[&a, &b])
                    .execute(ec.exhw())?;
                let dense = c.to_dense()?;
                c.deallocate(ec)?;
                Ok(dense)
            })
            .unwrap()
    }

    #[test]
    fn test_contraction_matches_reference() {
        let reference = matmul(&matrix(7, 5, 0.1), &matrix(5, 4, 0.7), 7, 5, 4);
        for c in run_matmul(ExecutionHw::Cpu, 3) {
            for (x, y) in c.iter().zip(&reference) {
                approx::assert_abs_diff_eq!(x, y, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_execution_hw_gives_identical_results() {
        let cpu = run_matmul(ExecutionHw::Cpu, 2);
        let accelerated = run_matmul(ExecutionHw::Accelerated, 2);
        assert_eq!(cpu, accelerated);
        // group size does not change results either
        assert_eq!(cpu[0], run_matmul(ExecutionHw::Cpu, 1)[0]);
    }

    #[test]
    fn test_transposed_output_and_sub_space_sum() {
        // C(j, i) = sum_{k in occ} A(i, k) B(k, j)
        let mo = TiledIndexSpace::builder("MO", 5)
            .sub_space("occ", 0..2)
            .sub_space("virt", 2..5)
            .tiling(TilingPolicy::Uniform(2))
            .build()
            .unwrap();
        let [i, j] = mo.labels::<2>("all").unwrap();
        let [k] = mo.labels::<1>("occ").unwrap();
        let (a_dense, b_dense) = (matrix(5, 5, 0.3), matrix(5, 5, 1.1));

        let out = ProcessGroup::new(2)
            .launch(|ec| {
                let a = DistTensor::new("A", vec![mo.clone(), mo.clone()]);
                let b = DistTensor::new("B", vec![mo.clone(), mo.clone()]);
                let c = DistTensor::new("C", vec![mo.clone(), mo.clone()]);
                Scheduler::new(ec).allocate(&[&a, &b, &c]).execute(ExecutionHw::Cpu)?;
                a.scatter(ec, &a_dense)?;
                b.scatter(ec, &b_dense)?;
                Scheduler::new(ec)
                    .contract(c.at(&[j.clone(), i.clone()]), a.at(&[i.clone(), k.clone()]), b.at(&[k.clone(), j.clone()]))
                    .execute(ExecutionHw::Cpu)?;
                let dense = c.to_dense()?;
                Scheduler::new(ec).deallocate(&[&a, &b, &c]).execute(ExecutionHw::Cpu)?;
                Ok(dense)
            })
            .unwrap();
        for jj in 0..5 {
            for ii in 0..5 {
                let reference: f64 = (0..2).map(|kk| a_dense[ii * 5 + kk] * b_dense[kk * 5 + jj]).sum();
                approx::assert_abs_diff_eq!(out[0][jj * 5 + ii], reference, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_fill_assign_and_accumulate() {
        let space = TiledIndexSpace::uniform("X", 3, 2).unwrap();
        let [p, q] = space.labels::<2>("all").unwrap();
        let out = ProcessGroup::new(3)
            .launch(|ec| {
                let x = DistTensor::new("X", vec![space.clone(), space.clone()]);
                let y = DistTensor::new("Y", vec![space.clone(), space.clone()]);
                Scheduler::new(ec)
                    .allocate(&[&x, &y])
                    .fill(x.at(&[p.clone(), q.clone()]), 2.0)
                    .assign_scaled(y.at(&[q.clone(), p.clone()]), -0.5, x.at(&[p.clone(), q.clone()]))
                    .execute(ExecutionHw::Cpu)?;
                let z = DistTensor::new("Z", vec![space.clone(), space.clone()]);
                let [r] = space.labels::<1>("all").unwrap();
                Scheduler::new(ec)
                    .allocate(&[&z])
                    .assign(z.at(&[p.clone(), q.clone()]), x.at(&[p.clone(), q.clone()]))
                    .contract_add(z.at(&[p.clone(), q.clone()]), 1.0, y.at(&[p.clone(), r.clone()]), x.at(&[r, q.clone()]))
                    .deallocate(&[&x, &y])
                    .execute(ExecutionHw::Cpu)?;
                let dense = z.to_dense()?;
                z.deallocate(ec)?;
                Ok(dense)
            })
            .unwrap();
        // z = 2 + sum_r (-1) * 2 = 2 - 6
        assert!(out.iter().all(|z| z.iter().all(|&v| v == -4.0)));
    }

    #[test]
    fn test_invalid_operations() {
        let mo = TiledIndexSpace::builder("MO", 4)
            .sub_space("occ", 0..2)
            .sub_space("virt", 2..4)
            .tiling(TilingPolicy::Uniform(2))
            .build()
            .unwrap();
        let ao = TiledIndexSpace::uniform("AO", 4, 2).unwrap();
        let [p, q, r] = mo.labels::<3>("all").unwrap();
        let [i] = mo.labels::<1>("occ").unwrap();
        let [mu] = ao.labels::<1>("all").unwrap();

        let out = ProcessGroup::new(2)
            .launch(|ec| {
                let x = DistTensor::new("X", vec![mo.clone(), mo.clone()]);
                let y = DistTensor::new("Y", vec![mo.clone(), mo.clone()]);
                let s = DistTensor::new("S", vec![mo.clone(), mo.clone()]).with_symmetry(Symmetry::PairExchange)?;
                let unallocated = DistTensor::new("U", vec![mo.clone(), mo.clone()]);
                Scheduler::new(ec).allocate(&[&x, &y, &s]).execute(ExecutionHw::Cpu)?;

                let attempts = vec![
                    // wrong number of labels
                    Scheduler::new(ec).fill(x.at(&[p.clone()]), 1.0),
                    // label of another space
                    Scheduler::new(ec).fill(x.at(&[p.clone(), mu.clone()]), 1.0),
                    // repeated label
                    Scheduler::new(ec).assign(x.at(&[p.clone(), p.clone()]), y.at(&[p.clone(), p.clone()])),
                    // free label on both factors
                    Scheduler::new(ec).contract(
                        x.at(&[p.clone(), q.clone()]),
                        y.at(&[p.clone(), q.clone()]),
                        s.at(&[q.clone(), p.clone()]),
                    ),
                    // dangling label
                    Scheduler::new(ec).contract(
                        x.at(&[p.clone(), q.clone()]),
                        y.at(&[p.clone(), r.clone()]),
                        s.at(&[i.clone(), q.clone()]),
                    ),
                    // use before allocate
                    Scheduler::new(ec).assign(x.at(&[p.clone(), q.clone()]), unallocated.at(&[p.clone(), q.clone()])),
                    // asymmetric region of a symmetric output
                    Scheduler::new(ec).fill(s.at(&[i.clone(), q.clone()]), 1.0),
                    // in-place update
                    Scheduler::new(ec).assign(x.at(&[p.clone(), q.clone()]), x.at(&[q.clone(), p.clone()])),
                    // double allocation
                    Scheduler::new(ec).allocate(&[&x]),
                ];
                let rejected = attempts
                    .into_iter()
                    .map(|s| matches!(s.execute(ExecutionHw::Cpu), Err(Error::InvalidOperation(_))))
                    .collect::<Vec<bool>>();
                Scheduler::new(ec).deallocate(&[&x, &y, &s]).execute(ExecutionHw::Cpu)?;
                Ok(rejected)
            })
            .unwrap();
        for rejected in out {
            assert!(rejected.iter().all(|&r| r), "{rejected:?}");
        }
    }

    #[test]
    fn test_non_finite_is_reported_on_every_rank() {
        let space = TiledIndexSpace::uniform("X", 4, 2).unwrap();
        let [p, q, r] = space.labels::<3>("all").unwrap();
        let mut a_dense = vec![1.0; 16];
        a_dense[2 * 4 + 3] = f64::INFINITY;
        let out = ProcessGroup::new(3)
            .launch(|ec| {
                let a = DistTensor::new("A", vec![space.clone(), space.clone()]);
                let c = DistTensor::new("C", vec![space.clone(), space.clone()]);
                Scheduler::new(ec).allocate(&[&a, &c]).execute(ExecutionHw::Cpu)?;
                a.scatter(ec, &a_dense)?;
                let result = Scheduler::new(ec)
                    .contract(c.at(&[p.clone(), q.clone()]), a.at(&[p.clone(), r.clone()]), a.at(&[r.clone(), q.clone()]))
                    .execute(ExecutionHw::Accelerated);
                Ok(result.err())
            })
            .unwrap();
        for err in out {
            match err {
                Some(Error::Numerical { tensor, tile }) => {
                    assert_eq!(tensor, "C");
                    // row 2 lives in tile 1; the lowest failing rank reports first
                    assert_eq!(tile[0], 1);
                },
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn test_plan_levels() {
        // 0: alloc T; 1: T = ..; 2: alloc U; 3: U = f(T); 4: V = g(W); 5: dealloc T
        let (t, u, v, w) = (1, 2, 3, 4);
        let accesses = vec![(vec![], t), (vec![], t), (vec![], u), (vec![t], u), (vec![w], v), (vec![], t)];
        let levels = plan_levels(&accesses);
        assert_eq!(levels, vec![vec![0, 2, 4], vec![1], vec![3], vec![5]]);
    }
}
