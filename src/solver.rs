use std::path::{Path, PathBuf};
use std::process::Command;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::structs::SystemData;

/// Consumer of the exported integral files.
///
/// `solve` is called collectively on every rank with the prefix of the FCI
/// files (`<files_dir>/fci/<prefix>.<basis>`).
pub trait FciSolver: Send + Sync {
    fn name(&self) -> &str;
    fn solve(&self, ec: &ExecutionContext, sys_data: &SystemData, files_prefix: &Path) -> Result<()>;
}

/// Runs an external program with the FCIDUMP path as its last argument.
#[derive(Debug, Clone)]
pub struct ExternalCommandSolver {
    program: PathBuf,
    args: Vec<String>,
}

impl ExternalCommandSolver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: vec![] }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn run(&self, sys_data: &SystemData, fcidump: &Path) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(fcidump)
            .env("FCI_NORB", sys_data.nbf_orig.to_string())
            .env("FCI_NELEC", sys_data.nelectrons().to_string())
            .output()
            .map_err(|err| Error::io(&self.program, err))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            tracing::info!("[{}] {line}", self.name());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = format!("{} exited with {}: {}", self.name(), output.status, stderr.trim());
            return Err(Error::io(&self.program, std::io::Error::other(reason)));
        }
        Ok(())
    }
}

impl FciSolver for ExternalCommandSolver {
    fn name(&self) -> &str {
        self.program.file_name().and_then(|name| name.to_str()).unwrap_or("external solver")
    }

    fn solve(&self, ec: &ExecutionContext, sys_data: &SystemData, files_prefix: &Path) -> Result<()> {
        let mut fcidump = files_prefix.as_os_str().to_owned();
        fcidump.push(".fcidump");
        let fcidump = PathBuf::from(fcidump);
        ec.designated(&format!("solver {}", self.name()), || self.run(sys_data, &fcidump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessGroup;
    use crate::structs::FciOptions;

    fn sys_data() -> SystemData {
        SystemData::restricted(4, 4, 2, 0.7, &FciOptions::default()).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_external_command_receives_fcidump_path() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("h2.sto-3g");
        let marker = dir.path().join("seen");
        // the script records its last argument
        let solver = ExternalCommandSolver::new("sh")
            .args(["-c", &format!("echo \"$0\" > {}", marker.display())]);
        assert_eq!(solver.name(), "sh");

        let sys_data = sys_data();
        ProcessGroup::new(3).designated_writer(2).launch(|ec| solver.solve(ec, &sys_data, &prefix)).unwrap();
        let seen = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(seen.trim(), dir.path().join("h2.sto-3g.fcidump").display().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_fails_every_rank() {
        let solver = ExternalCommandSolver::new("sh").args(["-c", "exit 3"]);
        let sys_data = sys_data();
        let out = ProcessGroup::new(2).launch(|ec| {
            let result = solver.solve(ec, &sys_data, Path::new("x"));
            // all ranks see the same error before leaving
            Ok(matches!(result, Err(Error::Io { .. })))
        });
        assert_eq!(out.unwrap(), vec![true, true]);
    }

    #[test]
    fn test_missing_program() {
        let solver = ExternalCommandSolver::new("/nonexistent/fci-solver");
        let sys_data = sys_data();
        let result = ProcessGroup::new(1).launch(|ec| solver.solve(ec, &sys_data, Path::new("x")));
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}
