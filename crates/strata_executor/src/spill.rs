//! On-disk spill partitions for hash grouping.
//!
//! Rows that miss the hash table after it switched to spilling are written
//! to one of `fan_out` partition files, chosen by the top hash bits
//! below those used at shallower levels. The hash table picks buckets from
//! the low bits, so rows sharing a partition still spread over buckets. Each partition file is a sequence of
//! length-prefixed bincode `OwnedRow` records. The spill directory is
//! removed when the last owner drops.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use strata_common::config::SpillConfig;
use strata_common::datum::OwnedRow;
use strata_common::error::ExecutionError;

/// Partition of `hash` at recursion `depth` for a power-of-two `fan_out`.
pub fn partition_of(hash: u32, depth: u32, fan_out: usize) -> usize {
    let bits = fan_out.trailing_zeros();
    let used = bits.saturating_mul(depth + 1).min(32);
    (((hash as u64) >> (32 - used)) as usize) & (fan_out - 1)
}

struct PartitionWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    rows: u64,
}

/// Partition files being written for one grouping pass.
pub struct SpillPartitions {
    dir: tempfile::TempDir,
    fan_out: usize,
    depth: u32,
    partitions: Vec<PartitionWriter>,
    bytes_written: u64,
}

impl SpillPartitions {
    pub fn create(config: &SpillConfig, depth: u32) -> Result<Self, ExecutionError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("strata_spill");
            b
        };
        let dir = if config.temp_dir.is_empty() {
            builder.tempdir()
        } else {
            std::fs::create_dir_all(&config.temp_dir)
                .map_err(|e| ExecutionError::SpillSetup(format!("{}: {}", config.temp_dir, e)))?;
            builder.tempdir_in(&config.temp_dir)
        }
        .map_err(|e| ExecutionError::SpillSetup(e.to_string()))?;

        let fan_out = config.partitions.max(2).next_power_of_two();
        let partitions = (0..fan_out)
            .map(|i| PartitionWriter {
                path: dir.path().join(format!("part_{:02}_{:03}.bin", depth, i)),
                writer: None,
                rows: 0,
            })
            .collect();
        tracing::debug!(
            "spill partitions created at {} (depth {}, fan-out {})",
            dir.path().display(),
            depth,
            fan_out
        );
        Ok(Self {
            dir,
            fan_out,
            depth,
            partitions,
            bytes_written: 0,
        })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn rows_written(&self) -> u64 {
        self.partitions.iter().map(|p| p.rows).sum()
    }

    pub fn write(&mut self, hash: u32, row: &OwnedRow) -> Result<(), ExecutionError> {
        let idx = partition_of(hash, self.depth, self.fan_out);
        let part = &mut self.partitions[idx];
        let bytes = bincode::serialize(row)
            .map_err(|e| ExecutionError::SpillIo(format!("serialize: {}", e)))?;
        let writer = match part.writer.as_mut() {
            Some(w) => w,
            None => {
                let file = File::create(&part.path).map_err(spill_io)?;
                part.writer.insert(BufWriter::new(file))
            }
        };
        writer
            .write_all(&(bytes.len() as u32).to_le_bytes())
            .map_err(spill_io)?;
        writer.write_all(&bytes).map_err(spill_io)?;
        part.rows += 1;
        self.bytes_written += bytes.len() as u64 + 4;
        Ok(())
    }

    /// Flush every partition; the result owns the files.
    pub fn finish(mut self) -> Result<SpillRun, ExecutionError> {
        let mut partitions = Vec::new();
        for part in self.partitions.iter_mut() {
            if let Some(mut w) = part.writer.take() {
                w.flush().map_err(spill_io)?;
            }
            if part.rows > 0 {
                partitions.push(SpilledPartition {
                    path: part.path.clone(),
                    rows: part.rows,
                });
            }
        }
        tracing::debug!(
            "spill depth {} finished: {} rows in {} partitions, {} bytes",
            self.depth,
            partitions.iter().map(|p| p.rows).sum::<u64>(),
            partitions.len(),
            self.bytes_written
        );
        Ok(SpillRun {
            _dir: self.dir,
            partitions,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SpilledPartition {
    pub path: PathBuf,
    pub rows: u64,
}

impl SpilledPartition {
    pub fn reader(&self) -> Result<PartitionReader, ExecutionError> {
        let file = File::open(&self.path).map_err(spill_io)?;
        Ok(PartitionReader {
            reader: BufReader::new(file),
            remaining: self.rows,
        })
    }
}

/// Finished partitions of one pass. Dropping it deletes the files.
pub struct SpillRun {
    _dir: tempfile::TempDir,
    pub partitions: Vec<SpilledPartition>,
}

pub struct PartitionReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl PartitionReader {
    pub fn next_row(&mut self) -> Result<Option<OwnedRow>, ExecutionError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).map_err(spill_io)?;
        let mut data = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        self.reader.read_exact(&mut data).map_err(spill_io)?;
        bincode::deserialize(&data)
            .map(Some)
            .map_err(|e| ExecutionError::SpillIo(format!("deserialize: {}", e)))
    }

    /// Up to `max` rows.
    pub fn next_chunk(&mut self, max: usize) -> Result<Vec<OwnedRow>, ExecutionError> {
        let mut out = Vec::with_capacity(max.min(self.remaining as usize));
        while out.len() < max {
            match self.next_row()? {
                Some(r) => out.push(r),
                None => break,
            }
        }
        Ok(out)
    }
}

fn spill_io(e: std::io::Error) -> ExecutionError {
    ExecutionError::SpillIo(e.to_string())
}
