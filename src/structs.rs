use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointAction;
use crate::context::{Backend, ExecutionHw};
use crate::prelude::*;

/* #region system data */

/// Metadata of the reference calculation, produced by the SCF stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemData {
    /// Basis functions after removal of linear dependencies.
    pub nbf: usize,
    pub nbf_orig: usize,
    pub nmo: usize,
    pub nocc: usize,
    pub nvir: usize,
    pub n_occ_alpha: usize,
    pub n_occ_beta: usize,
    pub is_unrestricted: bool,
    /// Nuclear repulsion (core) energy.
    pub e_nuc: f64,
    pub output_file_prefix: String,
    pub basis: String,
    pub scf_type: String,
}

impl SystemData {
    /// Closed-shell system description.
    pub fn restricted(nbf: usize, nmo: usize, nelec: usize, e_nuc: f64, options: &FciOptions) -> Result<Self> {
        if nelec % 2 != 0 {
            return Err(Error::Configuration(format!("restricted reference needs an even electron count, got {nelec}")));
        }
        let nocc = nelec / 2;
        if nocc > nmo || nmo > nbf || nmo == 0 {
            return Err(Error::Configuration(format!("inconsistent orbital counts: nbf {nbf}, nmo {nmo}, nocc {nocc}")));
        }
        Ok(Self {
            nbf,
            nbf_orig: nbf,
            nmo,
            nocc,
            nvir: nmo - nocc,
            n_occ_alpha: nocc,
            n_occ_beta: nocc,
            is_unrestricted: false,
            e_nuc,
            output_file_prefix: options.output_file_prefix.clone(),
            basis: options.basis.clone(),
            scf_type: "restricted".to_string(),
        })
    }

    pub fn nelectrons(&self) -> usize {
        self.n_occ_alpha + self.n_occ_beta
    }

    /// Twice the spin projection.
    pub fn ms2(&self) -> i64 {
        self.n_occ_alpha as i64 - self.n_occ_beta as i64
    }
}

/* #endregion */

/* #region configuration */

/// Options of one integral transformation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FciOptions {
    pub tile_size: usize,
    /// Ranks of the process group; an MPI group takes its size from the world communicator.
    pub nproc: usize,
    pub backend: Backend,
    /// Bytes of distributed tensor storage per rank; unlimited if absent.
    pub memory_per_rank: Option<usize>,
    pub designated_writer: usize,
    /// Restore the transformed tensors from checkpoint files.
    pub readt: bool,
    /// Persist the transformed tensors when they are computed.
    pub writet: bool,
    /// Run the downstream solver after export.
    pub fci: bool,
    pub accelerated: bool,
    pub output_file_prefix: String,
    pub basis: String,
    /// Directory the output tree is placed in.
    pub output_dir: PathBuf,
}

impl Default for FciOptions {
    fn default() -> Self {
        Self {
            tile_size: 40,
            nproc: 1,
            backend: Backend::default(),
            memory_per_rank: None,
            designated_writer: 0,
            readt: false,
            writet: false,
            fci: false,
            accelerated: false,
            output_file_prefix: "fci".to_string(),
            basis: "basis".to_string(),
            output_dir: PathBuf::from("."),
        }
    }
}

impl FciOptions {
    pub fn exhw(&self) -> ExecutionHw {
        if self.accelerated { ExecutionHw::Accelerated } else { ExecutionHw::Cpu }
    }

    pub fn process_group(&self) -> ProcessGroup {
        ProcessGroup::new(self.nproc)
            .designated_writer(self.designated_writer)
            .memory_per_rank(self.memory_per_rank)
            .execution_hw(self.exhw())
            .backend(self.backend)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(Error::Configuration("tile_size must be positive".into()));
        }
        if self.nproc == 0 {
            return Err(Error::Configuration("nproc must be positive".into()));
        }
        if self.output_file_prefix.is_empty() || self.output_file_prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::Configuration(format!(
                "output_file_prefix must be a plain file name, got {:?}",
                self.output_file_prefix
            )));
        }
        Ok(())
    }
}

/// Options of the reference RI-RHF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScfConfig {
    pub max_cycle: usize,
    pub conv_tol_e: f64,
}

impl Default for ScfConfig {
    fn default() -> Self {
        Self { max_cycle: 40, conv_tol_e: 1.0e-10 }
    }
}

/* #endregion */

/* #region stage results */

/// Output of the SCF stage; AO quantities are row-major `[nbf, nbf]`, the
/// coefficients `[nbf, nmo]`.
pub struct ScfOutput {
    pub sys_data: SystemData,
    pub lcao: Tsr,
    pub hcore: Tsr,
    pub fock: Tsr,
    /// Reference energy, when the source computed one.
    pub e_tot: Option<f64>,
}

/// Factorized two-electron integrals `(μν|κλ) ≈ Σ_c L(μ,ν,c) L(κ,λ,c)`,
/// shaped `[nbf, nbf, count]`.
pub struct CholeskyOutput {
    pub vectors: Tsr,
    pub count: usize,
}

/// What a finished run hands to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FciResults {
    pub files_prefix: PathBuf,
    pub fcidump_path: PathBuf,
    pub checkpoint_action: CheckpointAction,
    pub chol_count: usize,
    pub solve_requested: bool,
}

/* #endregion */
