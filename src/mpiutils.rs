use mpi::datatype::PartitionMut;
use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::traits::*;

use crate::context::Transport;
use crate::error::{Error, Result};

/// Largest message handed to a single MPI broadcast.
const CHUNK: usize = 256 * 1024 * 1024;

/// Ranks as processes of the MPI world communicator.
///
/// Processes do not share memory; every rank keeps its own copy of the tile
/// storage and owners publish their blocks after each write phase.
pub struct MpiTransport {
    world: SimpleCommunicator,
}

impl MpiTransport {
    pub fn world() -> Result<Self> {
        if !mpi::environment::is_initialized() {
            return Err(Error::Configuration("MPI must be initialized before the process group is launched".into()));
        }
        Ok(Self { world: SimpleCommunicator::world() })
    }

    pub fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    /// Byte strings of every rank, in rank order.
    fn gather_bytes(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        let nranks = self.world.size() as usize;
        let send_count = i32::try_from(local.len())
            .map_err(|_| Error::Protocol(format!("message of {} bytes exceeds an MPI count", local.len())))?;
        let mut recv_counts = vec![0i32; nranks];
        self.world.all_gather_into(&send_count, &mut recv_counts[..]);

        let mut recv_displacements = vec![0i32; nranks];
        for i in 1..nranks {
            recv_displacements[i] = recv_displacements[i - 1] + recv_counts[i - 1];
        }
        let total_recv = recv_counts.iter().map(|&c| c as usize).sum::<usize>();
        let mut recv_contig = vec![0u8; total_recv];
        {
            let mut recv_part = PartitionMut::new(&mut recv_contig[..], &recv_counts[..], &recv_displacements[..]);
            self.world.all_gather_varcount_into(local, &mut recv_part);
        }
        Ok(recv_counts
            .iter()
            .zip(&recv_displacements)
            .map(|(&count, &start)| recv_contig[start as usize..(start + count) as usize].to_vec())
            .collect())
    }
}

impl Transport for MpiTransport {
    fn nranks(&self) -> usize {
        self.world.size() as usize
    }

    fn shares_memory(&self) -> bool {
        false
    }

    fn sync(&self, _rank: usize, tag: &str) -> Result<()> {
        let tags = self.gather_bytes(tag.as_bytes())?;
        if tags.iter().all(|t| t == tag.as_bytes()) {
            return Ok(());
        }
        let seen = tags
            .iter()
            .enumerate()
            .map(|(r, t)| format!("rank {r} at {:?}", String::from_utf8_lossy(t)))
            .collect::<Vec<_>>();
        Err(Error::Protocol(format!("collective call order diverged: {}", seen.join(", "))))
    }

    fn broadcast(&self, rank: usize, root: usize, tag: &str, mut bytes: Vec<u8>) -> Result<Vec<u8>> {
        self.sync(rank, tag)?;
        let root_process = self.world.process_at_rank(root as i32);

        let mut len = bytes.len() as u64;
        root_process.broadcast_into(&mut len);
        if rank != root {
            bytes.resize(len as usize, 0u8);
        }
        let mut off = 0usize;
        while off < bytes.len() {
            let end = (off + CHUNK).min(bytes.len());
            root_process.broadcast_into(&mut bytes[off..end]);
            off = end;
        }
        Ok(bytes)
    }

    fn all_gather(&self, rank: usize, tag: &str, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.sync(rank, tag)?;
        self.gather_bytes(&bytes)
    }

    fn abort(&self, rank: usize, err: &Error) {
        tracing::error!("rank {rank} aborts the MPI job: {err}");
        self.world.abort(1)
    }

    fn depart(&self, _rank: usize) {}
}
