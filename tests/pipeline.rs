use std::path::Path;

use approx::assert_relative_eq;
use showcase_workshop_rstsr_fcidump::prelude::*;
use showcase_workshop_rstsr_fcidump::util::tsr_from_vec;

const NBF: usize = 4;
const NAUX: usize = 3;
const E_NUC: f64 = 1.2345678901234;

fn lcao() -> Vec<f64> {
    (0..NBF * NBF).map(|x| ((x as f64) * 0.37 + 0.2).cos() * if x % (NBF + 1) == 0 { 1.0 } else { 0.3 }).collect()
}

fn symmetric(seed: f64) -> Vec<f64> {
    let mut m = vec![0.0; NBF * NBF];
    for i in 0..NBF {
        for j in 0..=i {
            let value = ((i * NBF + j) as f64 * seed).sin();
            m[i * NBF + j] = value;
            m[j * NBF + i] = value;
        }
    }
    m
}

fn cderi() -> Vec<f64> {
    let mut l = vec![0.0; NBF * NBF * NAUX];
    for c in 0..NAUX {
        let m = symmetric(0.91 + c as f64 * 0.17);
        for mu in 0..NBF {
            for nu in 0..NBF {
                l[(mu * NBF + nu) * NAUX + c] = m[mu * NBF + nu] / (c + 1) as f64;
            }
        }
    }
    l
}

fn source(options: &FciOptions) -> DenseSource {
    let sys_data = SystemData::restricted(NBF, NBF, 2, E_NUC, options).unwrap();
    DenseSource::new(
        sys_data,
        tsr_from_vec(lcao(), vec![NBF, NBF]),
        tsr_from_vec(symmetric(0.53), vec![NBF, NBF]),
        tsr_from_vec(symmetric(0.29), vec![NBF, NBF]),
        tsr_from_vec(cderi(), vec![NBF, NBF, NAUX]),
    )
    .unwrap()
}

fn options(dir: &Path) -> FciOptions {
    FciOptions {
        tile_size: 3,
        nproc: 2,
        output_file_prefix: "model".into(),
        basis: "min".into(),
        output_dir: dir.to_path_buf(),
        backend: Backend::Threads,
        ..Default::default()
    }
}

/// `Cᵀ M C` for a row-major `[NBF, NBF]` matrix.
fn rotate(m: &[f64]) -> Vec<f64> {
    let c = lcao();
    let mut out = vec![0.0; NBF * NBF];
    for p in 0..NBF {
        for q in 0..NBF {
            for mu in 0..NBF {
                for nu in 0..NBF {
                    out[p * NBF + q] += c[mu * NBF + p] * m[mu * NBF + nu] * c[nu * NBF + q];
                }
            }
        }
    }
    out
}

#[test]
fn test_four_orbital_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let options = options(dir.path());
    let results = fci_driver(&source(&options), &options, None).unwrap();
    assert_eq!(results.checkpoint_action, CheckpointAction::Ephemeral);
    assert_eq!(results.chol_count, NAUX);
    assert_eq!(
        results.fcidump_path,
        dir.path().join("model.min_files").join("restricted").join("fci").join("model.min.fcidump")
    );

    let data = read_fcidump(&results.fcidump_path).unwrap();
    assert_eq!((data.header.norb, data.header.nelec, data.header.ms2), (NBF, 2, 0));
    assert_eq!(data.header.orbsym, vec![1; NBF]);
    assert_relative_eq!(data.core_energy, E_NUC, max_relative = 1e-14);

    let h_mo = rotate(&symmetric(0.53));
    for p in 0..NBF {
        for q in 0..NBF {
            assert_relative_eq!(data.h1(p, q), h_mo[p * NBF + q], epsilon = 1e-14, max_relative = 1e-10);
        }
    }

    let l = cderi();
    let l_mo = (0..NAUX)
        .map(|c| rotate(&(0..NBF * NBF).map(|x| l[x * NAUX + c]).collect::<Vec<f64>>()))
        .collect::<Vec<Vec<f64>>>();
    for (p, r, q, s) in itertools::iproduct!(0..NBF, 0..NBF, 0..NBF, 0..NBF) {
        let reference: f64 = l_mo.iter().map(|m| m[p * NBF + r] * m[q * NBF + s]).sum();
        assert_relative_eq!(data.eri(p, r, q, s), reference, epsilon = 1e-14, max_relative = 1e-10);
    }
}

#[test]
fn test_restart_reproduces_fcidump() {
    let dir = tempfile::tempdir().unwrap();
    let options = FciOptions { writet: true, ..options(dir.path()) };
    let first = fci_driver(&source(&options), &options, None).unwrap();
    assert_eq!(first.checkpoint_action, CheckpointAction::Persist);
    let files_dir = dir.path().join("model.min_files").join("restricted");
    for ext in ["f1_mo", "cholv2", "cholcount"] {
        assert!(files_dir.join(format!("model.min.{ext}")).exists());
    }
    let expected = std::fs::read_to_string(&first.fcidump_path).unwrap();

    // a run that never touches checkpoint files gives the same file
    let ephemeral_dir = tempfile::tempdir().unwrap();
    let ephemeral_options = self::options(ephemeral_dir.path());
    let ephemeral = fci_driver(&source(&ephemeral_options), &ephemeral_options, None).unwrap();
    assert_eq!(ephemeral.checkpoint_action, CheckpointAction::Ephemeral);
    assert!(!ephemeral_dir.path().join("model.min_files").join("restricted").join("model.min.cholv2").exists());
    assert_eq!(std::fs::read_to_string(&ephemeral.fcidump_path).unwrap(), expected);

    // different tiling and group size on restart
    let options = FciOptions { readt: true, writet: false, tile_size: 2, nproc: 3, ..options };
    let second = fci_driver(&source(&options), &options, None).unwrap();
    assert_eq!(second.checkpoint_action, CheckpointAction::Restore);
    assert_eq!(second.chol_count, NAUX);
    assert_eq!(std::fs::read_to_string(&second.fcidump_path).unwrap(), expected);

    // present files trigger the restore without readt
    let options = FciOptions { readt: false, ..options };
    let third = fci_driver(&source(&options), &options, None).unwrap();
    assert_eq!(third.checkpoint_action, CheckpointAction::Restore);
    assert_eq!(std::fs::read_to_string(&third.fcidump_path).unwrap(), expected);
}

#[test]
fn test_restore_without_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let options = FciOptions { readt: true, ..options(dir.path()) };
    let err = fci_driver(&source(&options), &options, None).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Restore));
    assert!(matches!(err.root(), Error::Io { .. }));
    assert!(!dir.path().join("model.min_files").join("restricted").join("fci").exists());
}

#[test]
fn test_output_independent_of_group_size_and_hw() {
    let mut outputs = vec![];
    let runs = [
        (1, 4, false, Backend::Threads),
        (3, 1, true, Backend::Threads),
        (2, 3, true, Backend::Threads),
        // every rank holds a private copy of the tiles, as MPI processes do
        (3, 2, false, Backend::ThreadsPrivateMemory),
    ];
    for (nproc, tile_size, accelerated, backend) in runs {
        let dir = tempfile::tempdir().unwrap();
        let options = FciOptions { nproc, tile_size, accelerated, backend, ..options(dir.path()) };
        let results = fci_driver(&source(&options), &options, None).unwrap();
        outputs.push(std::fs::read_to_string(&results.fcidump_path).unwrap());
    }
    assert!(outputs.iter().all(|output| output == &outputs[0]));
}

#[test]
fn test_memory_limit() {
    let dir = tempfile::tempdir().unwrap();
    let options = FciOptions { memory_per_rank: Some(256), ..options(dir.path()) };
    let err = fci_driver(&source(&options), &options, None).unwrap_err();
    assert!(matches!(err.root(), Error::Resource { .. }));
}

#[test]
fn test_fewer_orbitals_than_basis_functions() {
    // three basis functions, two molecular orbitals
    let (nbf, nmo, naux) = (3, 2, 2);
    let dir = tempfile::tempdir().unwrap();
    let options = FciOptions { tile_size: 2, ..options(dir.path()) };
    let sys_data = SystemData::restricted(nbf, nmo, 2, E_NUC, &options).unwrap();
    let lcao = vec![0.9, 0.1, 0.2, -0.8, 0.3, 0.4];
    let hcore = vec![-1.0, 0.2, 0.1, 0.2, -0.7, 0.05, 0.1, 0.05, -0.4];
    let cderi = (0..nbf * nbf * naux)
        .map(|x| {
            let (mu, nu, c) = (x / (nbf * naux), (x / naux) % nbf, x % naux);
            0.3 / (1.0 + (mu + nu) as f64 + c as f64)
        })
        .collect::<Vec<f64>>();
    let source = DenseSource::new(
        sys_data,
        tsr_from_vec(lcao, vec![nbf, nmo]),
        tsr_from_vec(hcore.clone(), vec![nbf, nbf]),
        tsr_from_vec(hcore, vec![nbf, nbf]),
        tsr_from_vec(cderi, vec![nbf, nbf, naux]),
    )
    .unwrap();

    let results = fci_driver(&source, &options, None).unwrap();
    let data = read_fcidump(&results.fcidump_path).unwrap();
    assert_eq!(data.header.norb, nmo);
    assert_eq!(data.header.orbsym, vec![1; nmo]);
    assert_eq!(data.h1.len(), nmo * nmo);
}
