//! AO to MO transformation of the one- and two-electron quantities.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::index_space::TiledIndexSpace;
use crate::scheduler::Scheduler;
use crate::tensor::{DistTensor, Symmetry};

fn lcao_spaces(lcao: &DistTensor) -> Result<(TiledIndexSpace, TiledIndexSpace)> {
    match lcao.spaces() {
        [ao, mo] => Ok((ao.clone(), mo.clone())),
        _ => Err(Error::InvalidOperation(format!("{} must be indexed as [AO, MO]", lcao.name()))),
    }
}

/// `H_mo(z1,z2) = Σ_μν LCAO(μ,z1) H(μ,ν) LCAO(ν,z2)`; deallocates `h_ao`.
pub fn rotate_one_electron(ec: &ExecutionContext, name: &str, lcao: &DistTensor, h_ao: &DistTensor) -> Result<DistTensor> {
    let (ao, mo) = lcao_spaces(lcao)?;
    let [z1, z2] = mo.labels::<2>("all")?;
    let [mu, nu] = ao.labels::<2>("all")?;

    let tmp = DistTensor::new(&format!("{name}_tmp"), vec![mo.clone(), ao.clone()]);
    let h_mo = DistTensor::new(name, vec![mo.clone(), mo]).with_symmetry(Symmetry::PairExchange)?;

    Scheduler::new(ec)
        .allocate(&[&tmp, &h_mo])
        .contract(tmp.at(&[z1.clone(), nu.clone()]), lcao.at(&[mu.clone(), z1.clone()]), h_ao.at(&[mu, nu.clone()]))
        .contract(h_mo.at(&[z1.clone(), z2.clone()]), tmp.at(&[z1, nu.clone()]), lcao.at(&[nu, z2]))
        .deallocate(&[&tmp, h_ao])
        .execute(ec.exhw())?;
    Ok(h_mo)
}

/// `Chol(z1,z2,c) = Σ_μν LCAO(μ,z1) L(μ,ν,c) LCAO(ν,z2)`; deallocates `chol_ao`.
pub fn transform_cholesky_vectors(ec: &ExecutionContext, lcao: &DistTensor, chol_ao: &DistTensor) -> Result<DistTensor> {
    let (ao, mo) = lcao_spaces(lcao)?;
    let ci = match chol_ao.spaces() {
        [_, _, ci] => ci.clone(),
        _ => return Err(Error::InvalidOperation(format!("{} must be indexed as [AO, AO, CI]", chol_ao.name()))),
    };
    let [z1, z2] = mo.labels::<2>("all")?;
    let [mu, nu] = ao.labels::<2>("all")?;
    let [c] = ci.labels::<1>("all")?;

    let tmp = DistTensor::new("cholVpr_tmp", vec![mo.clone(), ao, ci.clone()]);
    let chol = DistTensor::new("cholVpr", vec![mo.clone(), mo, ci]);

    Scheduler::new(ec)
        .allocate(&[&tmp, &chol])
        .contract(
            tmp.at(&[z1.clone(), nu.clone(), c.clone()]),
            lcao.at(&[mu.clone(), z1.clone()]),
            chol_ao.at(&[mu, nu.clone(), c.clone()]),
        )
        .contract(chol.at(&[z1.clone(), z2.clone(), c.clone()]), tmp.at(&[z1, nu.clone(), c]), lcao.at(&[nu, z2]))
        .deallocate(&[&tmp, chol_ao])
        .execute(ec.exhw())?;
    Ok(chol)
}

/// `V(p,r,q,s) = Σ_c Chol(p,r,c) Chol(q,s,c)`, i.e. chemist's `(pr|qs)`.
///
/// Only the pair-exchange unique blocks are computed and stored.
pub fn reconstruct_two_electron(ec: &ExecutionContext, chol: &DistTensor) -> Result<DistTensor> {
    let (mo, ci) = match chol.spaces() {
        [mo, _, ci] => (mo.clone(), ci.clone()),
        _ => return Err(Error::InvalidOperation(format!("{} must be indexed as [MO, MO, CI]", chol.name()))),
    };
    let [p, q, r, s] = mo.labels::<4>("all")?;
    let [c] = ci.labels::<1>("all")?;

    let full_v2 = DistTensor::new("full_v2", vec![mo.clone(), mo.clone(), mo.clone(), mo])
        .with_symmetry(Symmetry::PairExchange)?;
    Scheduler::new(ec)
        .allocate(&[&full_v2])
        .contract(
            full_v2.at(&[p.clone(), r.clone(), q.clone(), s.clone()]),
            chol.at(&[p, r, c.clone()]),
            chol.at(&[q, s, c]),
        )
        .execute(ec.exhw())?;
    Ok(full_v2)
}
