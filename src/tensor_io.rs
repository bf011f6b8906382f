use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use itertools::Itertools;
use npyz::WriterBuilder;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::tensor::{DistTensor, Symmetry, dense_strides};

/// Largest relative deviation between mirrored elements of a pair exchange tensor file.
pub const SYMMETRY_TOLERANCE: f64 = 1e-12;

/// Write a dense row-major array as `.npy`.
pub fn write_npy(path: &Path, shape: &[usize], data: &[f64]) -> Result<()> {
    let file = File::create(path).map_err(|err| Error::io(path, err))?;
    let shape = shape.iter().map(|&x| x as u64).collect::<Vec<u64>>();
    let mut writer = npyz::WriteOptions::<f64>::new()
        .default_dtype()
        .shape(&shape)
        .writer(BufWriter::new(file))
        .begin_nd()
        .map_err(|err| Error::io(path, err))?;
    writer.extend(data.iter().copied()).map_err(|err| Error::io(path, err))?;
    writer.finish().map_err(|err| Error::io(path, err))
}

/// Read a `.npy` file holding C-ordered `f64` data.
pub fn read_npy(path: &Path) -> Result<(Vec<usize>, Vec<f64>)> {
    let file = File::open(path).map_err(|err| Error::io(path, err))?;
    let npy = npyz::NpyFile::new(BufReader::new(file)).map_err(|err| Error::format(path, err.to_string()))?;
    if npy.order() != npyz::Order::C {
        return Err(Error::format(path, "array is not stored in C order"));
    }
    let shape = npy.shape().iter().map(|&x| x as usize).collect::<Vec<usize>>();
    let data = npy.into_vec::<f64>().map_err(|err| Error::format(path, err.to_string()))?;
    if data.len() != shape.iter().product::<usize>() {
        return Err(Error::format(path, format!("{} values for shape {shape:?}", data.len())));
    }
    Ok((shape, data))
}

/// Check that `data` equals itself with the two index halves exchanged.
fn check_pair_exchange(path: &Path, shape: &[usize], data: &[f64]) -> Result<()> {
    let half = shape.len() / 2;
    let strides = dense_strides(shape);
    let mirrored_strides = [&strides[half..], &strides[..half]].concat();
    for (flat, index) in shape.iter().map(|&n| 0..n).multi_cartesian_product().enumerate() {
        let mirrored = index.iter().zip(&mirrored_strides).map(|(i, stride)| i * stride).sum::<usize>();
        let (x, y) = (data[flat], data[mirrored]);
        if (x - y).abs() > SYMMETRY_TOLERANCE * x.abs().max(y.abs()).max(1.0) {
            return Err(Error::format(
                path,
                format!("element {index:?} is {x:e} but its pair exchange mirror is {y:e}"),
            ));
        }
    }
    Ok(())
}

impl DistTensor {
    /// Collective write; the designated writer gathers and writes the file.
    pub fn write_to_disk(&self, ec: &ExecutionContext, path: &Path) -> Result<()> {
        ec.collective(&format!("write {} (gather)", self.name()))?;
        let shape = self.shape();
        ec.designated(&format!("write {}", self.name()), || write_npy(path, &shape, &self.to_dense()?))
    }

    /// Collective read into an allocated tensor of the stored shape.
    ///
    /// A pair exchange tensor only keeps canonical blocks, so the file must be
    /// symmetric under exchange of the index halves.
    pub fn read_from_disk(&self, ec: &ExecutionContext, path: &Path) -> Result<()> {
        if !self.is_allocated()? {
            return Err(Error::InvalidOperation(format!("tensor {} must be allocated before reading", self.name())));
        }
        let shape = self.shape();
        let data = ec.designated(&format!("read {}", self.name()), || {
            let (stored, data) = read_npy(path)?;
            if stored != shape {
                return Err(Error::format(path, format!("stored shape {stored:?}, tensor {} has {shape:?}", self.name())));
            }
            if self.symmetry() == Symmetry::PairExchange {
                check_pair_exchange(path, &shape, &data)?;
            }
            Ok(data)
        })?;
        self.scatter(ec, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessGroup;
    use crate::index_space::TiledIndexSpace;

    fn values(n: usize) -> Vec<f64> {
        (0..n).map(|x| (x as f64).sin()).collect()
    }

    #[test]
    fn test_roundtrip_across_group_sizes_and_tilings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chol.cholv2");
        let dense = values(6 * 6 * 5);

        let mo = TiledIndexSpace::uniform("MO", 6, 4).unwrap();
        let ci = TiledIndexSpace::uniform("CI", 5, 2).unwrap();
        ProcessGroup::new(3)
            .launch(|ec| {
                let t = DistTensor::new("chol", vec![mo.clone(), mo.clone(), ci.clone()]);
                t.allocate(ec)?;
                t.scatter(ec, &dense)?;
                t.write_to_disk(ec, &path)?;
                t.deallocate(ec)
            })
            .unwrap();

        let mo = TiledIndexSpace::uniform("MO", 6, 1).unwrap();
        let ci = TiledIndexSpace::uniform("CI", 5, 5).unwrap();
        let read = ProcessGroup::new(2)
            .designated_writer(1)
            .launch(|ec| {
                let t = DistTensor::new("chol", vec![mo.clone(), mo.clone(), ci.clone()]);
                t.allocate(ec)?;
                t.read_from_disk(ec, &path)?;
                let dense = t.to_dense()?;
                t.deallocate(ec)?;
                Ok(dense)
            })
            .unwrap();
        assert!(read.iter().all(|r| r == &dense));
    }

    #[test]
    fn test_symmetric_tensor_is_written_dense() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.f1_mo");
        let mo = TiledIndexSpace::uniform("MO", 3, 2).unwrap();
        let dense = vec![1., 2., 3., 2., 4., 5., 3., 5., 6.];
        ProcessGroup::new(2)
            .launch(|ec| {
                let t = DistTensor::new("h", vec![mo.clone(), mo.clone()]).with_symmetry(Symmetry::PairExchange)?;
                t.allocate(ec)?;
                t.scatter(ec, &dense)?;
                t.write_to_disk(ec, &path)?;
                t.deallocate(ec)
            })
            .unwrap();
        let (shape, data) = read_npy(&path).unwrap();
        assert_eq!(shape, vec![3, 3]);
        assert_eq!(data, dense);
    }

    #[test]
    fn test_shape_mismatch_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.npy");
        write_npy(&path, &[4, 3], &values(12)).unwrap();
        let space = TiledIndexSpace::uniform("MO", 4, 2).unwrap();
        let result = ProcessGroup::new(2).launch(|ec| {
            let t = DistTensor::new("x", vec![space.clone(), space.clone()]);
            t.allocate(ec)?;
            t.read_from_disk(ec, &path)
        });
        assert!(matches!(result, Err(Error::Format { .. })));
    }

    #[test]
    fn test_asymmetric_file_into_pair_exchange_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.f1_mo");
        // h[0, 2] != h[2, 0]
        write_npy(&path, &[3, 3], &[1., 2., 3., 2., 4., 5., 7., 5., 6.]).unwrap();
        let mo = TiledIndexSpace::uniform("MO", 3, 2).unwrap();
        let seen = std::sync::Mutex::new(vec![]);
        let result = ProcessGroup::new(2).launch(|ec| {
            let t = DistTensor::new("h", vec![mo.clone(), mo.clone()]).with_symmetry(Symmetry::PairExchange)?;
            t.allocate(ec)?;
            let outcome = t.read_from_disk(ec, &path);
            seen.lock().unwrap().push(matches!(outcome, Err(Error::Format { .. })));
            t.deallocate(ec)?;
            outcome
        });
        assert!(matches!(result, Err(Error::Format { .. })));
        assert_eq!(seen.into_inner().unwrap(), vec![true, true]);

        // rounding noise below the tolerance is accepted
        let path = dir.path().join("v.cholv2");
        let mut v = (0..16).map(|x| ((x / 4) * (x % 4) + x / 4 + x % 4) as f64).collect::<Vec<f64>>();
        v[1] += 1e-14;
        write_npy(&path, &[2, 2, 2, 2], &v).unwrap();
        let p = TiledIndexSpace::uniform("P", 2, 1).unwrap();
        let read = ProcessGroup::new(2)
            .launch(|ec| {
                let t = DistTensor::new("v", vec![p.clone(), p.clone(), p.clone(), p.clone()])
                    .with_symmetry(Symmetry::PairExchange)?;
                t.allocate(ec)?;
                t.read_from_disk(ec, &path)?;
                let element = t.element(&[0, 0, 0, 1])?;
                t.deallocate(ec)?;
                Ok(element)
            })
            .unwrap();
        assert_eq!(read, vec![v[1], v[1]]);
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.npy");
        assert!(matches!(read_npy(&missing), Err(Error::Io { .. })));

        let corrupt = dir.path().join("corrupt.npy");
        std::fs::write(&corrupt, b"not a numpy file").unwrap();
        assert!(matches!(read_npy(&corrupt), Err(Error::Format { .. })));
    }
}
