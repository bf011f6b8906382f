use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::structs::{FciOptions, SystemData};
use crate::tensor::DistTensor;

/* #region file layout */

/// `<output_dir>/<prefix>.<basis>_files/<scf_type>/<prefix>.<basis>.{f1_mo,cholv2,cholcount}`,
/// and the FCIDUMP under `fci/` of the same directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    /// `<prefix>.<basis>`, the stem of every file name.
    pub out_fp: String,
    pub files_dir: PathBuf,
    pub files_prefix: PathBuf,
    pub f1_file: PathBuf,
    pub v2_file: PathBuf,
    pub count_file: PathBuf,
    pub fci_dir: PathBuf,
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

impl CheckpointPaths {
    pub fn new(output_dir: &Path, sys_data: &SystemData) -> Self {
        let out_fp = format!("{}.{}", sys_data.output_file_prefix, sys_data.basis);
        let files_dir = output_dir.join(format!("{out_fp}_files")).join(&sys_data.scf_type);
        let files_prefix = files_dir.join(&out_fp);
        Self {
            f1_file: with_suffix(&files_prefix, ".f1_mo"),
            v2_file: with_suffix(&files_prefix, ".cholv2"),
            count_file: with_suffix(&files_prefix, ".cholcount"),
            fci_dir: files_dir.join("fci"),
            out_fp,
            files_dir,
            files_prefix,
        }
    }

    /// Prefix of the files handed to the downstream solver.
    pub fn fci_prefix(&self) -> PathBuf {
        self.fci_dir.join(&self.out_fp)
    }

    pub fn fcidump_file(&self) -> PathBuf {
        with_suffix(&self.fci_prefix(), ".fcidump")
    }
}

/// What a run does with the checkpoint files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointAction {
    /// Read the tensors; the Cholesky stage is skipped.
    Restore,
    /// Compute the tensors and write them.
    Persist,
    /// Compute the tensors, no checkpoint I/O.
    Ephemeral,
}

impl CheckpointAction {
    /// Restore when asked to, or when both tensor files are present.
    pub fn decide(options: &FciOptions, paths: &CheckpointPaths) -> Self {
        if options.readt || (paths.f1_file.exists() && paths.v2_file.exists()) {
            CheckpointAction::Restore
        } else if options.writet {
            CheckpointAction::Persist
        } else {
            CheckpointAction::Ephemeral
        }
    }
}

/* #endregion */

/* #region restart */

/// Read the factorization rank stored in a count file.
pub fn read_chol_count(path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
    text.trim().parse::<usize>().map_err(|err| Error::format(path, format!("invalid vector count: {err}")))
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    paths: CheckpointPaths,
}

impl CheckpointManager {
    pub fn new(paths: CheckpointPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &CheckpointPaths {
        &self.paths
    }

    /// Vector count, read by the designated writer and shared with all ranks.
    pub fn chol_count(&self, ec: &ExecutionContext) -> Result<usize> {
        ec.designated("read cholcount", || read_chol_count(&self.paths.count_file))
    }

    /// Create the checkpoint directory; existing directories are fine.
    pub fn ensure_dir(&self, ec: &ExecutionContext, dir: &Path) -> Result<()> {
        ec.designated(&format!("create {}", dir.display()), || {
            std::fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))
        })
    }

    /// Read both tensors into allocated tensors shaped for `count` vectors.
    pub fn restore(&self, ec: &ExecutionContext, d_f1: &DistTensor, chol: &DistTensor, count: usize) -> Result<()> {
        let stored = chol.shape().last().copied().unwrap_or_default();
        if stored != count {
            return Err(Error::format(
                &self.paths.count_file,
                format!("count {count} does not match the {stored} vectors of {}", chol.name()),
            ));
        }
        d_f1.read_from_disk(ec, &self.paths.f1_file)?;
        chol.read_from_disk(ec, &self.paths.v2_file)?;
        ec.barrier()
    }

    /// Write both tensors and the vector count.
    pub fn persist(&self, ec: &ExecutionContext, d_f1: &DistTensor, chol: &DistTensor, count: usize) -> Result<()> {
        self.ensure_dir(ec, &self.paths.files_dir)?;
        d_f1.write_to_disk(ec, &self.paths.f1_file)?;
        chol.write_to_disk(ec, &self.paths.v2_file)?;
        let count_file = &self.paths.count_file;
        ec.designated("write cholcount", || {
            std::fs::write(count_file, format!("{count}\n")).map_err(|err| Error::io(count_file, err))
        })?;
        ec.barrier()
    }
}

/* #endregion */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessGroup;
    use crate::index_space::TiledIndexSpace;
    use crate::tensor::Symmetry;

    fn sys_data() -> SystemData {
        let options = FciOptions { output_file_prefix: "h2o".into(), basis: "sto-3g".into(), ..Default::default() };
        SystemData::restricted(7, 7, 10, 9.1, &options).unwrap()
    }

    #[test]
    fn test_paths_layout() {
        let paths = CheckpointPaths::new(Path::new("/work"), &sys_data());
        assert_eq!(paths.out_fp, "h2o.sto-3g");
        assert_eq!(paths.files_dir, PathBuf::from("/work/h2o.sto-3g_files/restricted"));
        assert_eq!(paths.f1_file, PathBuf::from("/work/h2o.sto-3g_files/restricted/h2o.sto-3g.f1_mo"));
        assert_eq!(paths.v2_file, PathBuf::from("/work/h2o.sto-3g_files/restricted/h2o.sto-3g.cholv2"));
        assert_eq!(paths.count_file, PathBuf::from("/work/h2o.sto-3g_files/restricted/h2o.sto-3g.cholcount"));
        assert_eq!(paths.fcidump_file(), PathBuf::from("/work/h2o.sto-3g_files/restricted/fci/h2o.sto-3g.fcidump"));
    }

    #[test]
    fn test_decide() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::new(dir.path(), &sys_data());
        let mut options = FciOptions::default();
        assert_eq!(CheckpointAction::decide(&options, &paths), CheckpointAction::Ephemeral);
        options.writet = true;
        assert_eq!(CheckpointAction::decide(&options, &paths), CheckpointAction::Persist);

        std::fs::create_dir_all(&paths.files_dir).unwrap();
        std::fs::write(&paths.f1_file, b"").unwrap();
        // one file is not enough
        assert_eq!(CheckpointAction::decide(&options, &paths), CheckpointAction::Persist);
        std::fs::write(&paths.v2_file, b"").unwrap();
        assert_eq!(CheckpointAction::decide(&options, &paths), CheckpointAction::Restore);

        let other = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::new(other.path(), &sys_data());
        let options = FciOptions { readt: true, ..Default::default() };
        assert_eq!(CheckpointAction::decide(&options, &paths), CheckpointAction::Restore);
    }

    #[test]
    fn test_persist_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointPaths::new(dir.path(), &sys_data()));
        let f1 = (0..9).map(|x| ((x / 3) + (x % 3)) as f64).collect::<Vec<f64>>();
        let chol = (0..18).map(|x| x as f64 * 0.25).collect::<Vec<f64>>();

        let write_mo = TiledIndexSpace::uniform("MO", 3, 2).unwrap();
        let write_ci = TiledIndexSpace::uniform("CI", 2, 1).unwrap();
        ProcessGroup::new(2)
            .launch(|ec| {
                let d_f1 = DistTensor::new("d_f1", vec![write_mo.clone(), write_mo.clone()])
                    .with_symmetry(Symmetry::PairExchange)?;
                let v = DistTensor::new("cholVpr", vec![write_mo.clone(), write_mo.clone(), write_ci.clone()]);
                d_f1.allocate(ec)?;
                v.allocate(ec)?;
                d_f1.scatter(ec, &f1)?;
                v.scatter(ec, &chol)?;
                manager.persist(ec, &d_f1, &v, 2)?;
                // a second persist reuses the directory
                manager.persist(ec, &d_f1, &v, 2)?;
                d_f1.deallocate(ec)?;
                v.deallocate(ec)
            })
            .unwrap();
        assert_eq!(std::fs::read_to_string(&manager.paths().count_file).unwrap(), "2\n");

        let read_mo = TiledIndexSpace::uniform("MO", 3, 3).unwrap();
        let restored = ProcessGroup::new(3)
            .launch(|ec| {
                let count = manager.chol_count(ec)?;
                let ci = TiledIndexSpace::uniform("CI", count, 2)?;
                let d_f1 =
                    DistTensor::new("d_f1", vec![read_mo.clone(), read_mo.clone()]).with_symmetry(Symmetry::PairExchange)?;
                let v = DistTensor::new("cholVpr", vec![read_mo.clone(), read_mo.clone(), ci]);
                d_f1.allocate(ec)?;
                v.allocate(ec)?;
                manager.restore(ec, &d_f1, &v, count)?;
                Ok((d_f1.to_dense()?, v.to_dense()?))
            })
            .unwrap();
        for (d_f1, v) in restored {
            assert_eq!(d_f1, f1);
            assert_eq!(v, chol);
        }
    }

    #[test]
    fn test_restore_without_files_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointPaths::new(dir.path(), &sys_data()));
        let result = ProcessGroup::new(2).launch(|ec| manager.chol_count(ec));
        assert!(matches!(result, Err(Error::Io { .. })));

        let mo = TiledIndexSpace::uniform("MO", 3, 2).unwrap();
        let ci = TiledIndexSpace::uniform("CI", 2, 2).unwrap();
        let result = ProcessGroup::new(2).launch(|ec| {
            let d_f1 = DistTensor::new("d_f1", vec![mo.clone(), mo.clone()]);
            let v = DistTensor::new("cholVpr", vec![mo.clone(), mo.clone(), ci.clone()]);
            d_f1.allocate(ec)?;
            v.allocate(ec)?;
            manager.restore(ec, &d_f1, &v, 2)
        });
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn test_corrupt_count_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.cholcount");
        std::fs::write(&path, "twelve\n").unwrap();
        assert!(matches!(read_chol_count(&path), Err(Error::Format { .. })));
        std::fs::write(&path, " 12 \n").unwrap();
        assert_eq!(read_chol_count(&path).unwrap(), 12);
    }

    #[test]
    fn test_ensure_dir_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointPaths::new(dir.path(), &sys_data()));
        let files_dir = manager.paths().files_dir.clone();
        std::fs::create_dir_all(&files_dir).unwrap();
        let sentinel = files_dir.join("keep.txt");
        std::fs::write(&sentinel, "earlier run\n").unwrap();

        ProcessGroup::new(3)
            .launch(|ec| {
                manager.ensure_dir(ec, &files_dir)?;
                manager.ensure_dir(ec, &files_dir)?;
                manager.ensure_dir(ec, &files_dir.join("fci"))
            })
            .unwrap();
        assert_eq!(std::fs::read_to_string(&sentinel).unwrap(), "earlier run\n");
        assert_eq!(std::fs::read_dir(&files_dir).unwrap().count(), 2);
    }
}
