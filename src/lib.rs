#![allow(clippy::deref_addrof)]

pub mod prelude;

pub mod checkpoint;
pub mod context;
pub mod driver;
pub mod error;
pub mod fcidump;
pub mod index_space;
#[cfg(feature = "use_mpi")]
pub(crate) mod mpiutils;
pub mod scf;
pub mod scheduler;
pub mod solver;
pub mod structs;
pub mod tensor;
pub mod tensor_io;
pub mod tile;
pub mod transform;
pub mod util;

#[test]
fn playground_ri_rhf() {
    use crate::prelude::*;

    let cint_data = init_h2o_def2_tzvp();
    let aux_cint_data = init_h2o_def2_jk();
    let source = RiRhfSource::new(cint_data, aux_cint_data, &FciOptions::default());
    let scf = source.scf().unwrap();
    println!("Total RHF energy: {:?}", scf.e_tot);
    let chol = source.cholesky(&scf).unwrap();
    println!("Cholesky vectors: {}", chol.count);
}

#[test]
fn playground_ri_rhf_fcidump() {
    use crate::prelude::*;

    let dir = tempfile::tempdir().unwrap();
    let options = FciOptions {
        nproc: 2,
        tile_size: 20,
        writet: true,
        output_file_prefix: "h2o".into(),
        basis: "def2-tzvp".into(),
        output_dir: dir.path().to_path_buf(),
        backend: Backend::Threads,
        ..Default::default()
    };
    let source = RiRhfSource::new(init_h2o_def2_tzvp(), init_h2o_def2_jk(), &options);
    let results = fci_driver(&source, &options, None).unwrap();
    println!("FCIDUMP: {}", results.fcidump_path.display());

    // the second run restores the transformed tensors
    let results = fci_driver(&source, &options, None).unwrap();
    assert_eq!(results.checkpoint_action, CheckpointAction::Restore);
    let data = read_fcidump(&results.fcidump_path).unwrap();
    assert_eq!(data.header.nelec, 10);
}
