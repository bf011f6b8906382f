use std::cell::OnceCell;
use std::path::Path;

use crate::prelude::*;
use crate::tensor_io::read_npy;

/// Producer of the SCF reference and of the factorized two-electron
/// integrals. `cholesky` is only called when the tensors are not restored
/// from a checkpoint.
pub trait IntegralSource {
    fn scf(&self) -> Result<ScfOutput>;
    fn cholesky(&self, scf: &ScfOutput) -> Result<CholeskyOutput>;
}

/* #region RI-RHF */

/// Nuclear repulsion `Σ_{A<B} Z_A Z_B / R_AB`.
pub fn get_energy_nuc(cint_data: &CInt) -> f64 {
    let device = DeviceTsr::default();
    let coords = cint_data.atom_coords().into_iter().flatten().collect::<Vec<f64>>();
    let coords = rt::asarray((coords, &device)).into_shape((-1, 3));
    let charges = rt::asarray((cint_data.atom_charges(), &device));

    // every pair counted twice; the diagonal vanishes
    let mut dist = rt::sci::cdist((coords.view(), coords.view()));
    dist.diagonal_mut(None).fill(f64::INFINITY);
    let charge_products = &charges * charges.i((.., None));
    0.5 * (charge_products / dist).sum()
}

/// Coulomb matrix `J[μν] = Σ_P L[μν,P] Σ_κλ L[κλ,P] D[κλ]`.
fn coulomb(cderi: &Tsr, dm: TsrView, nao: usize, naux: usize) -> Tsr {
    let cderi_flat = cderi.reshape([nao * nao, naux]);
    let rho = dm.reshape(nao * nao) % &cderi_flat;
    (cderi_flat % rho).into_shape([nao, nao])
}

/// Exchange matrix of the doubly occupied orbitals, `K = 2 Σ_iP (L C)[μ,P,i] (L C)[ν,P,i]`.
fn exchange(cderi: &Tsr, mo_coeff: TsrView, nao: usize, naux: usize, nocc: usize) -> Tsr {
    let occ_coeff = mo_coeff.i((.., ..nocc));
    let half = (cderi.reshape([nao, nao * naux]).t() % occ_coeff).into_shape([nao, naux * nocc]);
    2.0_f64 * (&half % half.t())
}

/// Whitened three-center integrals, row-major `[nao, nao, naux]`.
pub fn get_cderi(cint_data: &CInt, aux_cint_data: &CInt) -> Tsr {
    let nao = cint_data.nao();
    let naux = aux_cint_data.nao();

    let int3c2e = util::intor_3c2e_row_major(cint_data, aux_cint_data, "int3c2e");
    let int2c2e = util::intor_row_major(aux_cint_data, "int2c2e");

    let int3c2e_trans = int3c2e.into_shape([nao * nao, naux]).into_reverse_axes();
    let int2c2e_l = rt::linalg::cholesky((int2c2e.view(), Lower));
    let cderi = rt::linalg::solve_triangular((int2c2e_l.view(), int3c2e_trans, Lower));
    cderi.into_reverse_axes().into_shape([nao, nao, naux])
}

pub struct RiRhfSource {
    cint_data: CInt,
    aux_cint_data: CInt,
    config: ScfConfig,
    options: FciOptions,
    cderi: OnceCell<Tsr>,
}

impl RiRhfSource {
    pub fn new(cint_data: CInt, aux_cint_data: CInt, options: &FciOptions) -> Self {
        Self { cint_data, aux_cint_data, config: ScfConfig::default(), options: options.clone(), cderi: OnceCell::new() }
    }

    pub fn config(mut self, config: ScfConfig) -> Self {
        self.config = config;
        self
    }

    fn cderi(&self) -> &Tsr {
        self.cderi.get_or_init(|| get_cderi(&self.cint_data, &self.aux_cint_data))
    }
}

impl IntegralSource for RiRhfSource {
    fn scf(&self) -> Result<ScfOutput> {
        let time = std::time::Instant::now();
        let device = DeviceTsr::default();
        let cint_data = &self.cint_data;

        let nelec = cint_data.atom_charges().into_iter().sum::<f64>().round() as usize;
        let nao = cint_data.nao();
        let naux = self.aux_cint_data.nao();
        let sys_data = SystemData::restricted(nao, nao, nelec, get_energy_nuc(cint_data), &self.options)?;
        let nocc = sys_data.nocc;
        tracing::info!("Nuclear repulsion energy: {}", sys_data.e_nuc);

        let hcore = util::intor_row_major(cint_data, "int1e_kin") + util::intor_row_major(cint_data, "int1e_nuc");
        let ovlp = util::intor_row_major(cint_data, "int1e_ovlp");
        let cderi = self.cderi();

        let get_fock = |dm: &Tsr, mo_coeff: &Tsr| -> Tsr {
            &hcore + coulomb(cderi, dm.view(), nao, naux) - 0.5_f64 * exchange(cderi, mo_coeff.view(), nao, naux, nocc)
        };

        let get_e_elec = |dm: &Tsr, fock: &Tsr| -> f64 {
            let eng_scratch = 0.5_f64 * (&hcore + fock);
            (dm * &eng_scratch).sum()
        };

        let mut dm = ovlp.zeros_like();
        let mut mo_coeff = rt::zeros(([nao, nao], &device));
        let mut mo_energy = rt::zeros(([nao], &device));
        let mut e_elec = 0.0;
        let mut converged = false;
        for cycle in 0..self.config.max_cycle {
            let fock = get_fock(&dm, &mo_coeff);
            let e_cycle = get_e_elec(&dm, &fock);
            tracing::debug!("SCF cycle {cycle}: E_elec = {e_cycle:.12}");
            if cycle > 0 && (e_cycle - e_elec).abs() < self.config.conv_tol_e {
                e_elec = e_cycle;
                converged = true;
                break;
            }
            e_elec = e_cycle;
            (mo_energy, mo_coeff) = rt::linalg::eigh((fock.view(), ovlp.view())).into();
            dm = 2.0_f64 * mo_coeff.i((.., ..nocc)) % mo_coeff.i((.., ..nocc)).t();
        }
        if !converged {
            tracing::warn!("RI-RHF not converged in {} cycles", self.config.max_cycle);
        }
        if nocc > 0 {
            tracing::debug!("HOMO energy: {}", mo_energy[[nocc - 1]]);
        }

        let fock = get_fock(&dm, &mo_coeff);
        let e_tot = sys_data.e_nuc + e_elec;
        tracing::info!("Total elec energy: {e_elec}");
        tracing::info!("Total RHF energy: {e_tot}");
        tracing::info!("Time elapsed (RI-RHF): {:.3?}", time.elapsed());

        Ok(ScfOutput { sys_data, lcao: mo_coeff, hcore, fock, e_tot: Some(e_tot) })
    }

    fn cholesky(&self, scf: &ScfOutput) -> Result<CholeskyOutput> {
        let vectors = self.cderi().clone();
        let count = self.aux_cint_data.nao();
        let nbf = scf.sys_data.nbf;
        if vectors.shape().to_vec() != vec![nbf, nbf, count] {
            return Err(Error::Configuration(format!(
                "auxiliary basis does not match the SCF basis of {nbf} functions"
            )));
        }
        Ok(CholeskyOutput { vectors, count })
    }
}

/* #endregion */

/* #region dense input */

/// SCF data and Cholesky vectors supplied as dense row-major tensors.
pub struct DenseSource {
    sys_data: SystemData,
    lcao: Tsr,
    hcore: Tsr,
    fock: Tsr,
    cderi: Tsr,
}

fn check_shape(name: &str, tsr: &Tsr, expected: &[usize]) -> Result<()> {
    let shape = tsr.shape().to_vec();
    if shape != expected {
        return Err(Error::Configuration(format!("{name} has shape {shape:?}, expected {expected:?}")));
    }
    Ok(())
}

impl DenseSource {
    /// `lcao` is `[nbf, nmo]`, `hcore` and `fock` `[nbf, nbf]`, `cderi`
    /// `[nbf, nbf, count]`.
    pub fn new(sys_data: SystemData, lcao: Tsr, hcore: Tsr, fock: Tsr, cderi: Tsr) -> Result<Self> {
        let (nbf, nmo) = (sys_data.nbf, sys_data.nmo);
        check_shape("lcao", &lcao, &[nbf, nmo])?;
        check_shape("hcore", &hcore, &[nbf, nbf])?;
        check_shape("fock", &fock, &[nbf, nbf])?;
        let count = cderi.shape().last().copied().unwrap_or_default();
        check_shape("cderi", &cderi, &[nbf, nbf, count])?;
        if count == 0 {
            return Err(Error::Configuration("cderi holds no vectors".into()));
        }
        Ok(Self { sys_data, lcao, hcore, fock, cderi })
    }

    /// Read the four tensors from `.npy` files (C order).
    pub fn from_npy(
        lcao: &Path,
        hcore: &Path,
        fock: &Path,
        cderi: &Path,
        nelec: usize,
        e_nuc: f64,
        options: &FciOptions,
    ) -> Result<Self> {
        let load = |path: &Path| -> Result<(Vec<usize>, Tsr)> {
            let (shape, data) = read_npy(path)?;
            Ok((shape.clone(), util::tsr_from_vec(data, shape)))
        };
        let (lcao_shape, lcao) = load(lcao)?;
        let (nbf, nmo) = match lcao_shape[..] {
            [nbf, nmo] => (nbf, nmo),
            _ => return Err(Error::Configuration(format!("lcao must be a matrix, got shape {lcao_shape:?}"))),
        };
        let sys_data = SystemData::restricted(nbf, nmo, nelec, e_nuc, options)?;
        Self::new(sys_data, lcao, load(hcore)?.1, load(fock)?.1, load(cderi)?.1)
    }
}

impl IntegralSource for DenseSource {
    fn scf(&self) -> Result<ScfOutput> {
        Ok(ScfOutput {
            sys_data: self.sys_data.clone(),
            lcao: self.lcao.clone(),
            hcore: self.hcore.clone(),
            fock: self.fock.clone(),
            e_tot: None,
        })
    }

    fn cholesky(&self, _scf: &ScfOutput) -> Result<CholeskyOutput> {
        let count = self.cderi.shape().last().copied().unwrap_or_default();
        Ok(CholeskyOutput { vectors: self.cderi.clone(), count })
    }
}

/* #endregion */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_io::write_npy;

    #[test]
    fn test_dense_source_from_npy() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, shape: &[usize]| {
            let path = dir.path().join(name);
            let size = shape.iter().product::<usize>();
            write_npy(&path, shape, &(0..size).map(|x| x as f64).collect::<Vec<f64>>()).unwrap();
            path
        };
        let lcao = write("lcao.npy", &[3, 2]);
        let hcore = write("hcore.npy", &[3, 3]);
        let fock = write("fock.npy", &[3, 3]);
        let cderi = write("cderi.npy", &[3, 3, 4]);

        let options = FciOptions::default();
        let source = DenseSource::from_npy(&lcao, &hcore, &fock, &cderi, 2, 0.5, &options).unwrap();
        let scf = source.scf().unwrap();
        assert_eq!((scf.sys_data.nbf, scf.sys_data.nmo, scf.sys_data.nocc), (3, 2, 1));
        assert_eq!(scf.lcao[[2, 1]], 5.0);
        assert_eq!(scf.e_tot, None);
        let chol = source.cholesky(&scf).unwrap();
        assert_eq!(chol.count, 4);
        assert_eq!(util::tsr_to_vec(&chol.vectors)[35], 35.0);

        // fock with the shape of the coefficients
        let result = DenseSource::from_npy(&lcao, &hcore, &lcao, &cderi, 2, 0.5, &options);
        assert!(matches!(result, Err(Error::Configuration(_))));
        // odd electron count for a restricted reference
        let result = DenseSource::from_npy(&lcao, &hcore, &fock, &cderi, 3, 0.5, &options);
        assert!(matches!(result, Err(Error::Configuration(_))));
        let result = DenseSource::from_npy(&dir.path().join("none.npy"), &hcore, &fock, &cderi, 2, 0.5, &options);
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn test_coulomb_and_exchange_against_loops() {
        let (nao, naux, nocc) = (3, 2, 1);
        let l = (0..nao * nao * naux)
            .map(|x| {
                let (mu, nu, p) = (x / (nao * naux), (x / naux) % nao, x % naux);
                ((mu + nu) as f64 * 0.7 + p as f64).cos()
            })
            .collect::<Vec<f64>>();
        let c = vec![0.9, 0.2, -0.1, 0.3, 0.8, 0.4, 0.1, -0.5, 0.7];
        let dm = (0..nao * nao).map(|x| 2.0 * c[(x / nao) * nao] * c[(x % nao) * nao]).collect::<Vec<f64>>();

        let cderi = util::tsr_from_vec(l.clone(), vec![nao, nao, naux]);
        let j = util::tsr_to_vec(&coulomb(&cderi, util::tsr_from_vec(dm.clone(), vec![nao, nao]).view(), nao, naux));
        let k = exchange(&cderi, util::tsr_from_vec(c.clone(), vec![nao, nao]).view(), nao, naux, nocc);
        let k = util::tsr_to_vec(&k);

        let at = |mu: usize, nu: usize, p: usize| l[(mu * nao + nu) * naux + p];
        for (mu, nu) in itertools::iproduct!(0..nao, 0..nao) {
            let mut j_ref = 0.0;
            let mut k_ref = 0.0;
            for (ka, la, p) in itertools::iproduct!(0..nao, 0..nao, 0..naux) {
                j_ref += at(mu, nu, p) * at(ka, la, p) * dm[ka * nao + la];
                k_ref += at(mu, ka, p) * at(nu, la, p) * dm[ka * nao + la];
            }
            approx::assert_relative_eq!(j[mu * nao + nu], j_ref, epsilon = 1e-12);
            approx::assert_relative_eq!(k[mu * nao + nu], k_ref, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_energy_nuc_h2o() {
        let cint_data = init_h2o_def2_tzvp();
        let e_nuc = get_energy_nuc(&cint_data);
        assert!(e_nuc > 0.0);
    }
}
