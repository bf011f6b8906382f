//! FCIDUMP export of the MO integrals.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::checkpoint::{CheckpointManager, CheckpointPaths};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::structs::SystemData;
use crate::tensor::DistTensor;
use crate::transform;

/// Integrals smaller than this are not written.
pub const FCIDUMP_THRESHOLD: f64 = 1.0e-15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcidumpHeader {
    pub norb: usize,
    pub nelec: usize,
    pub ms2: i64,
    pub orbsym: Vec<i32>,
    pub isym: i32,
    pub uhf: bool,
}

/// One label per exported orbital (per spin orbital if unrestricted); no
/// point group symmetry is used, so all are 1.
pub fn symmetry_labels(sys_data: &SystemData) -> Vec<i32> {
    let n = if sys_data.is_unrestricted { 2 * sys_data.nmo } else { sys_data.nmo };
    vec![1; n]
}

fn pair_index(i: usize, j: usize) -> usize {
    i * (i + 1) / 2 + j
}

fn format_value(value: f64) -> String {
    // Fortran-style mantissa in [0.1, 1)
    if value == 0.0 {
        return format!("{:>24}", "0.0000000000000000E+00");
    }
    let exponent = value.abs().log10().floor() as i32 + 1;
    let mut mantissa = value / 10f64.powi(exponent);
    let mut exponent = exponent;
    if mantissa.abs() >= 1.0 {
        mantissa /= 10.0;
        exponent += 1;
    }
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{:>20.16}E{sign}{:02}", mantissa, exponent.abs())
}

fn push_line(out: &mut String, value: f64, i: usize, j: usize, k: usize, l: usize) {
    let _ = writeln!(out, "{} {i:>4} {j:>4} {k:>4} {l:>4}", format_value(value));
}

/// Render the FCIDUMP text from the MO one-electron operator and the
/// pair-symmetric `(pr|qs)` tensor.
pub fn render_fcidump(header: &FcidumpHeader, h_mo: &DistTensor, full_v2: &DistTensor, core_energy: f64) -> Result<String> {
    let norb = header.norb;
    if h_mo.shape() != vec![norb; 2] || full_v2.shape() != vec![norb; 4] {
        return Err(Error::InvalidOperation(format!(
            "cannot export {:?} and {:?} for {norb} orbitals",
            h_mo.shape(),
            full_v2.shape()
        )));
    }

    let mut out = String::new();
    let orbsym = header.orbsym.iter().map(|s| format!("{s},")).collect::<String>();
    let uhf = if header.uhf { ".TRUE." } else { ".FALSE." };
    let _ = writeln!(out, " &FCI NORB={:>4},NELEC={:>4},MS2={:>2},", header.norb, header.nelec, header.ms2);
    let _ = writeln!(out, "  ORBSYM={orbsym}");
    let _ = writeln!(out, "  ISYM={},", header.isym);
    let _ = writeln!(out, "  UHF={uhf},");
    let _ = writeln!(out, " &END");

    // unique integrals, gathered block by block; mirrored blocks hold part of them
    let mut eri = vec![];
    for coords in full_v2.blocks() {
        let tile = full_v2.get_block(&coords)?;
        let ranges = coords
            .iter()
            .zip(full_v2.spaces())
            .map(|(&t, space)| {
                let range = space.tile_range(t);
                range.start - space.offset()..range.end - space.offset()
            })
            .collect::<Vec<_>>();
        let mut values = tile.data().iter();
        for i in ranges[0].clone() {
            for j in ranges[1].clone() {
                for k in ranges[2].clone() {
                    for l in ranges[3].clone() {
                        let value = values.next().copied().unwrap_or_default();
                        if i >= j && k >= l && pair_index(i, j) >= pair_index(k, l) && value.abs() >= FCIDUMP_THRESHOLD {
                            eri.push(([i, j, k, l], value));
                        }
                    }
                }
            }
        }
    }
    eri.sort_by_key(|(index, _)| *index);
    for ([i, j, k, l], value) in eri {
        push_line(&mut out, value, i + 1, j + 1, k + 1, l + 1);
    }

    let h1 = h_mo.to_dense()?;
    for i in 0..norb {
        for j in 0..=i {
            let value = h1[i * norb + j];
            if value.abs() >= FCIDUMP_THRESHOLD {
                push_line(&mut out, value, i + 1, j + 1, 0, 0);
            }
        }
    }
    push_line(&mut out, core_energy, 0, 0, 0, 0);
    Ok(out)
}

/// Write the FCIDUMP file; only the designated writer touches the disk.
pub fn write_fcidump_file(
    ec: &ExecutionContext,
    sys_data: &SystemData,
    h_mo: &DistTensor,
    full_v2: &DistTensor,
    orbsym: &[i32],
    path: &Path,
) -> Result<()> {
    let norb = h_mo.shape()[0];
    let labels = if sys_data.is_unrestricted { 2 * norb } else { norb };
    if orbsym.len() != labels {
        return Err(Error::InvalidOperation(format!("{} orbital symmetry labels for NORB {norb}", orbsym.len())));
    }
    let header = FcidumpHeader {
        norb,
        nelec: sys_data.nelectrons(),
        ms2: sys_data.ms2(),
        orbsym: orbsym.to_vec(),
        isym: 1,
        uhf: sys_data.is_unrestricted,
    };
    ec.collective("fcidump (gather)")?;
    ec.designated("write fcidump", || {
        let text = render_fcidump(&header, h_mo, full_v2, sys_data.e_nuc)?;
        std::fs::write(path, text).map_err(|err| Error::io(path, err))
    })
}

/// Rotate the core Hamiltonian to the MO basis and write the FCIDUMP file.
///
/// Consumes `hcore_ao`; returns the prefix of the FCI files.
pub fn generate_fcidump(
    ec: &ExecutionContext,
    sys_data: &SystemData,
    paths: &CheckpointPaths,
    lcao: &DistTensor,
    hcore_ao: &DistTensor,
    full_v2: &DistTensor,
) -> Result<PathBuf> {
    let hcore_mo = transform::rotate_one_electron(ec, "hcore_mo", lcao, hcore_ao)?;
    CheckpointManager::new(paths.clone()).ensure_dir(ec, &paths.fci_dir)?;

    let symvec = symmetry_labels(sys_data);
    let fcidump_file = paths.fcidump_file();
    write_fcidump_file(ec, sys_data, &hcore_mo, full_v2, &symvec, &fcidump_file)?;
    if ec.is_designated_writer() {
        tracing::info!("FCIDUMP written to {}", fcidump_file.display());
    }

    hcore_mo.deallocate(ec)?;
    Ok(paths.fci_prefix())
}

/* #region reader */

/// Parsed FCIDUMP file with dense, symmetry-expanded integrals.
#[derive(Debug, Clone)]
pub struct FcidumpData {
    pub header: FcidumpHeader,
    /// `[norb, norb]`
    pub h1: Vec<f64>,
    /// `[norb, norb, norb, norb]`, chemist's notation
    pub eri: Vec<f64>,
    pub core_energy: f64,
}

impl FcidumpData {
    pub fn h1(&self, i: usize, j: usize) -> f64 {
        self.h1[i * self.header.norb + j]
    }

    pub fn eri(&self, i: usize, j: usize, k: usize, l: usize) -> f64 {
        let n = self.header.norb;
        self.eri[((i * n + j) * n + k) * n + l]
    }
}

fn namelist_value<'a>(namelist: &'a str, key: &str) -> Option<&'a str> {
    let start = namelist.find(&format!("{key}="))? + key.len() + 1;
    let rest = &namelist[start..];
    // values end where the next KEY= starts
    let end = rest
        .char_indices()
        .filter(|&(_, c)| c.is_ascii_alphabetic())
        .map(|(i, _)| i)
        .find(|&i| rest[i..].split(['=', ',']).next().is_some_and(|word| rest[i + word.len()..].starts_with('=')))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().trim_end_matches(','))
}

pub fn read_fcidump(path: &Path) -> Result<FcidumpData> {
    let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
    let end = text.find("&END").ok_or_else(|| Error::format(path, "missing &END"))?;
    let namelist = text[..end].replace(['\n', ' '], "");
    let body = text[end..].lines().skip(1);

    let parse_usize = |key: &str| -> Result<usize> {
        namelist_value(&namelist, key)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::format(path, format!("missing or invalid {key}")))
    };
    let norb = parse_usize("NORB")?;
    let nelec = parse_usize("NELEC")?;
    let ms2 = namelist_value(&namelist, "MS2")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::format(path, "missing or invalid MS2"))?;
    let isym = namelist_value(&namelist, "ISYM").and_then(|v| v.parse().ok()).unwrap_or(1);
    let orbsym: Vec<i32> = namelist_value(&namelist, "ORBSYM")
        .map(|v| v.split(',').filter(|s| !s.is_empty()).filter_map(|s| s.parse().ok()).collect())
        .unwrap_or_default();
    let uhf = namelist_value(&namelist, "UHF").is_some_and(|v| v.contains("TRUE"));
    let labels = if uhf { 2 * norb } else { norb };
    if !orbsym.is_empty() && orbsym.len() != labels {
        return Err(Error::format(path, format!("{} ORBSYM entries for NORB {norb}", orbsym.len())));
    }

    let n = norb;
    let mut h1 = vec![0.0; n * n];
    let mut eri = vec![0.0; n * n * n * n];
    let mut core_energy = 0.0;
    for (lineno, line) in body.enumerate() {
        let fields = line.split_whitespace().collect::<Vec<&str>>();
        if fields.is_empty() {
            continue;
        }
        let bad_line = || Error::format(path, format!("malformed integral line {}: {line:?}", lineno + 1));
        if fields.len() != 5 {
            return Err(bad_line());
        }
        let value = fields[0].replace(['D', 'd'], "E").parse::<f64>().map_err(|_| bad_line())?;
        let idx = fields[1..]
            .iter()
            .map(|f| f.parse::<usize>().map_err(|_| bad_line()))
            .collect::<Result<Vec<usize>>>()?;
        if idx.iter().any(|&x| x > n) {
            return Err(bad_line());
        }
        match (idx[0], idx[1], idx[2], idx[3]) {
            (0, 0, 0, 0) => core_energy = value,
            (i, j, 0, 0) if i > 0 && j > 0 => {
                let (i, j) = (i - 1, j - 1);
                h1[i * n + j] = value;
                h1[j * n + i] = value;
            },
            (i, j, k, l) if i > 0 && j > 0 && k > 0 && l > 0 => {
                let (i, j, k, l) = (i - 1, j - 1, k - 1, l - 1);
                for (a, b, c, d) in [(i, j, k, l), (j, i, k, l), (i, j, l, k), (j, i, l, k)] {
                    eri[((a * n + b) * n + c) * n + d] = value;
                    eri[((c * n + d) * n + a) * n + b] = value;
                }
            },
            _ => return Err(bad_line()),
        }
    }

    let header = FcidumpHeader { norb, nelec, ms2, orbsym, isym, uhf };
    Ok(FcidumpData { header, h1, eri, core_energy })
}

/* #endregion */
