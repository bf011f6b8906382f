use std::path::PathBuf;
use std::time::Instant;

use crate::checkpoint::{CheckpointAction, CheckpointManager, CheckpointPaths};
use crate::context::ExecutionContext;
use crate::error::{Error, Result, Stage, StageExt};
use crate::fcidump::generate_fcidump;
use crate::index_space::{TiledIndexSpace, TilingPolicy};
use crate::scf::IntegralSource;
use crate::solver::FciSolver;
use crate::structs::{FciOptions, FciResults, SystemData};
use crate::tensor::{DistTensor, Symmetry, allocate_all, free_tensors};
use crate::transform::{reconstruct_two_electron, rotate_one_electron, transform_cholesky_vectors};
use crate::util;

fn log_elapsed(ec: &ExecutionContext, what: &str, time: Instant) {
    if ec.is_designated_writer() {
        tracing::info!("Time elapsed ({what}): {:.3?}", time.elapsed());
    }
}

/// MO space split into occupied and virtual orbitals, tiled per sub-space.
pub fn mo_space(sys_data: &SystemData, tile_size: usize) -> Result<TiledIndexSpace> {
    let (nocc, nmo) = (sys_data.nocc, sys_data.nmo);
    let mut builder = TiledIndexSpace::builder("MO", nmo).tiling(TilingPolicy::Uniform(tile_size));
    if nocc > 0 && nocc < nmo {
        builder = builder.sub_space("occ", 0..nocc).sub_space("virt", nocc..nmo);
    }
    builder.build()
}

/// Dense upstream data, flattened row-major so every rank can scatter it.
struct DenseInputs {
    lcao: Vec<f64>,
    hcore: Vec<f64>,
    fock: Vec<f64>,
    /// Cholesky vectors and their count; absent when restoring.
    chol: Option<(Vec<f64>, usize)>,
}

fn scattered(ec: &ExecutionContext, name: &str, spaces: Vec<TiledIndexSpace>, dense: &[f64]) -> Result<DistTensor> {
    let tensor = DistTensor::new(name, spaces);
    tensor.allocate(ec)?;
    tensor.scatter(ec, dense)?;
    Ok(tensor)
}

fn restore_tensors(
    ec: &ExecutionContext,
    manager: &CheckpointManager,
    mo: &TiledIndexSpace,
    tile_size: usize,
) -> Result<(DistTensor, DistTensor, usize)> {
    let count = manager.chol_count(ec)?;
    let ci = TiledIndexSpace::uniform("CI", count, tile_size)?;
    let d_f1 = DistTensor::new("d_f1", vec![mo.clone(), mo.clone()]).with_symmetry(Symmetry::PairExchange)?;
    let chol = DistTensor::new("cholVpr", vec![mo.clone(), mo.clone(), ci]);
    allocate_all(ec, &[&d_f1, &chol])?;
    manager.restore(ec, &d_f1, &chol, count)?;
    Ok((d_f1, chol, count))
}

struct RankContext<'a> {
    options: &'a FciOptions,
    sys_data: &'a SystemData,
    paths: &'a CheckpointPaths,
    action: CheckpointAction,
    ao: &'a TiledIndexSpace,
    mo: &'a TiledIndexSpace,
    inputs: &'a DenseInputs,
    solver: Option<&'a dyn FciSolver>,
}

impl RankContext<'_> {
    fn run(&self, ec: &ExecutionContext) -> Result<(PathBuf, usize)> {
        let Self { options, sys_data, paths, action, ao, mo, inputs, solver } = *self;
        let manager = CheckpointManager::new(paths.clone());

        let lcao = scattered(ec, "lcao", vec![ao.clone(), mo.clone()], &inputs.lcao).in_stage(Stage::BasisRotation)?;

        let (d_f1, chol, count) = match (&inputs.chol, action) {
            (None, _) | (_, CheckpointAction::Restore) => {
                let time = Instant::now();
                let restored = restore_tensors(ec, &manager, mo, options.tile_size).in_stage(Stage::Restore)?;
                log_elapsed(ec, "restore", time);
                restored
            },
            (Some((chol_ao, count)), action) => {
                let time = Instant::now();
                let f_ao = scattered(ec, "F_AO", vec![ao.clone(), ao.clone()], &inputs.fock)
                    .in_stage(Stage::BasisRotation)?;
                let d_f1 = rotate_one_electron(ec, "d_f1", &lcao, &f_ao).in_stage(Stage::BasisRotation)?;
                log_elapsed(ec, "basis rotation", time);

                let time = Instant::now();
                let chol = (|| -> Result<DistTensor> {
                    let ci = TiledIndexSpace::uniform("CI", *count, options.tile_size)?;
                    let chol_ao = scattered(ec, "cholVuv", vec![ao.clone(), ao.clone(), ci], chol_ao)?;
                    transform_cholesky_vectors(ec, &lcao, &chol_ao)
                })()
                .in_stage(Stage::CholeskyTransform)?;
                log_elapsed(ec, "cholesky transform", time);

                if action == CheckpointAction::Persist {
                    let time = Instant::now();
                    manager.persist(ec, &d_f1, &chol, *count).in_stage(Stage::Persist)?;
                    log_elapsed(ec, "persist", time);
                }
                (d_f1, chol, *count)
            },
        };
        ec.barrier()?;

        let time = Instant::now();
        let full_v2 = reconstruct_two_electron(ec, &chol).in_stage(Stage::Reconstruction)?;
        chol.deallocate(ec)?;
        log_elapsed(ec, "two-electron reconstruction", time);

        let time = Instant::now();
        let files_prefix = (|| -> Result<PathBuf> {
            let hcore_ao = scattered(ec, "hcore", vec![ao.clone(), ao.clone()], &inputs.hcore)?;
            generate_fcidump(ec, sys_data, paths, &lcao, &hcore_ao, &full_v2)
        })()
        .in_stage(Stage::Export)?;
        log_elapsed(ec, "fcidump", time);

        if options.fci {
            match solver {
                Some(solver) => {
                    let time = Instant::now();
                    solver.solve(ec, sys_data, &files_prefix).in_stage(Stage::Solve)?;
                    log_elapsed(ec, solver.name(), time);
                },
                None if ec.is_designated_writer() => tracing::warn!("fci requested but no solver is configured"),
                None => (),
            }
        }

        free_tensors(ec, &[&lcao, &d_f1, &full_v2])?;
        ec.flush_and_sync()?;
        Ok((files_prefix, count))
    }
}

/// Run the integral transformation and export for one system.
pub fn fci_driver(
    source: &dyn IntegralSource,
    options: &FciOptions,
    solver: Option<&dyn FciSolver>,
) -> Result<FciResults> {
    let time = Instant::now();
    options.validate()?;

    let scf = source.scf().in_stage(Stage::Scf)?;
    let sys_data = scf.sys_data.clone();
    let paths = CheckpointPaths::new(&options.output_dir, &sys_data);
    let action = CheckpointAction::decide(options, &paths);
    tracing::info!("Checkpoint action {action:?} in {}", paths.files_dir.display());

    let chol = match action {
        CheckpointAction::Restore => None,
        CheckpointAction::Persist | CheckpointAction::Ephemeral => {
            let time = Instant::now();
            let output = source.cholesky(&scf).in_stage(Stage::Cholesky)?;
            tracing::info!("Time elapsed (cholesky, {} vectors): {:.3?}", output.count, time.elapsed());
            Some((util::tsr_to_vec(&output.vectors), output.count))
        },
    };
    let inputs = DenseInputs {
        lcao: util::tsr_to_vec(&scf.lcao),
        hcore: util::tsr_to_vec(&scf.hcore),
        fock: util::tsr_to_vec(&scf.fock),
        chol,
    };
    drop(scf);

    let ao = TiledIndexSpace::uniform("AO", sys_data.nbf, options.tile_size)?;
    let mo = mo_space(&sys_data, options.tile_size)?;
    let rank_context = RankContext {
        options,
        sys_data: &sys_data,
        paths: &paths,
        action,
        ao: &ao,
        mo: &mo,
        inputs: &inputs,
        solver,
    };
    let per_rank = options.process_group().launch(|ec| rank_context.run(ec))?;
    // every rank returns the shared prefix and count
    let (files_prefix, chol_count) =
        per_rank.into_iter().next().ok_or_else(|| Error::Protocol("no rank returned a result".into()))?;
    tracing::info!("Time elapsed (fci driver): {:.3?}", time.elapsed());

    Ok(FciResults {
        fcidump_path: paths.fcidump_file(),
        files_prefix,
        checkpoint_action: action,
        chol_count,
        solve_requested: options.fci && solver.is_some(),
    })
}
