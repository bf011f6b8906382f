#![allow(unused)]

/* #region for API callers */

pub use crate::checkpoint::{CheckpointAction, CheckpointManager, CheckpointPaths};
pub use crate::context::{Backend, ExecutionContext, ExecutionHw, ProcessGroup};
pub use crate::driver::fci_driver;
pub use crate::error::{Error, Result, Stage, StageExt};
pub use crate::fcidump::{FcidumpData, read_fcidump};
pub use crate::index_space::{TiledIndexLabel, TiledIndexSpace, TilingPolicy};
pub use crate::scf::{DenseSource, IntegralSource, RiRhfSource};
pub use crate::scheduler::{LabeledTensor, Scheduler};
pub use crate::solver::{ExternalCommandSolver, FciSolver};
pub use crate::structs::{CholeskyOutput, FciOptions, FciResults, ScfConfig, ScfOutput, SystemData};
pub use crate::tensor::{DistTensor, Symmetry, Update};

/* #endregion */

/* #region for developers */

// RSTSR backend specification
#[cfg(not(feature = "use_openblas"))]
pub(crate) type DeviceTsr = DeviceFaer;
#[cfg(feature = "use_openblas")]
pub(crate) type DeviceTsr = DeviceOpenBLAS;

pub(crate) use libcint::prelude::*;
pub(crate) use rayon::prelude::*;
pub(crate) use rstsr::prelude::*;

pub(crate) use crate::*;

pub(crate) type Tsr<D = IxD> = Tensor<f64, DeviceTsr, D>;
pub(crate) type TsrView<'a, D = IxD> = TensorView<'a, f64, DeviceTsr, D>;

/* #endregion */
