use crate::prelude::*;

/// Dense row-major block of a distributed tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    dims: Vec<usize>,
    data: Vec<f64>,
}

fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

fn is_identity(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &p)| i == p)
}

impl Tile {
    pub fn zeros(dims: Vec<usize>) -> Self {
        let len = dims.iter().product();
        Self { dims, data: vec![0.0; len] }
    }

    pub fn from_vec(dims: Vec<usize>, data: Vec<f64>) -> Self {
        debug_assert_eq!(dims.iter().product::<usize>(), data.len());
        Self { dims, data }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn strides(&self) -> Vec<usize> {
        row_major_strides(&self.dims)
    }

    /// Axis permutation: axis `i` of the result is axis `perm[i]` of `self`.
    pub fn permuted(&self, perm: &[usize]) -> Tile {
        debug_assert_eq!(perm.len(), self.dims.len());
        if is_identity(perm) {
            return self.clone();
        }
        let in_strides = self.strides();
        let dims = perm.iter().map(|&p| self.dims[p]).collect::<Vec<usize>>();
        let strides = perm.iter().map(|&p| in_strides[p]).collect::<Vec<usize>>();

        let mut data = Vec::with_capacity(self.data.len());
        let mut index = vec![0; dims.len()];
        let mut offset = 0;
        for _ in 0..self.data.len() {
            data.push(self.data[offset]);
            // odometer increment over the output index
            for axis in (0..dims.len()).rev() {
                index[axis] += 1;
                offset += strides[axis];
                if index[axis] < dims[axis] {
                    break;
                }
                offset -= strides[axis] * dims[axis];
                index[axis] = 0;
            }
        }
        Tile { dims, data }
    }

    /// `self += alpha * other`
    pub fn axpy(&mut self, alpha: f64, other: &Tile) {
        debug_assert_eq!(self.dims, other.dims);
        self.data.iter_mut().zip(&other.data).for_each(|(x, y)| *x += alpha * y);
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    /// Position of the first NaN/Inf element.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.data.iter().position(|x| !x.is_finite())
    }
}

/// Index bookkeeping for one tile-pair contraction.
///
/// Operand `a` is permuted to `(free_a.., summed..)`, operand `b` to
/// `(summed.., free_b..)`; the product carries `(free_a.., free_b..)` and is
/// permuted by `out_perm` into the output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairContraction {
    pub a_perm: Vec<usize>,
    pub b_perm: Vec<usize>,
    pub n_free_a: usize,
    pub n_summed: usize,
    pub out_perm: Vec<usize>,
}

impl PairContraction {
    /// `c += alpha * a * b` for one tile triple.
    pub fn accumulate(&self, c: &mut Tile, alpha: f64, a: &Tile, b: &Tile, device: &DeviceTsr) {
        let a_t = a.permuted(&self.a_perm);
        let b_t = b.permuted(&self.b_perm);
        let m = a_t.dims[..self.n_free_a].iter().product::<usize>();
        let k = a_t.dims[self.n_free_a..].iter().product::<usize>();
        let n = b_t.dims[self.n_summed..].iter().product::<usize>();
        let product_dims =
            a_t.dims[..self.n_free_a].iter().chain(&b_t.dims[self.n_summed..]).copied().collect::<Vec<usize>>();

        let a_mat = rt::asarray((a_t.data, [m, k].c(), device));
        let b_mat = rt::asarray((b_t.data, [k, n].c(), device));

        if is_identity(&self.out_perm) {
            // product order is already the output order: accumulate in place
            let mut c_mat = rt::asarray((&mut c.data, [m, n].c(), device));
            c_mat.matmul_from(&a_mat, &b_mat, alpha, 1.0);
        } else {
            let mut product = vec![0.0; m * n];
            {
                let mut p_mat = rt::asarray((&mut product, [m, n].c(), device));
                p_mat.matmul_from(&a_mat, &b_mat, 1.0, 0.0);
            }
            let product = Tile::from_vec(product_dims, product).permuted(&self.out_perm);
            c.axpy(alpha, &product);
        }
    }
}
