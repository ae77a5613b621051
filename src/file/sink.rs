//! The write pipeline: producers hand off whole extents, a pool of
//! compressor threads pack them concurrently, and a single writer thread
//! drains the queue strictly in admission order (spec §3 "write pipeline",
//! §4.3).
//!
//! One mutex guards all shared state; three condition variables separate
//! the three things threads wait for, rather than one that would wake
//! everyone on every change: `available_queue_cond` (a producer waiting for
//! room), `available_work_cond` (a compressor waiting for an unclaimed
//! item), `available_write_cond` (the writer waiting for the head of the
//! queue to become ready).
//!
//! Compression is the one step that can run out of order — a later extent
//! may finish packing before an earlier one. To keep on-disk order equal to
//! admission order without serializing compression, each worker packs with
//! `previous_chain = 0` and the writer XORs in the real predecessor chain
//! once it reaches the head of the queue (`chain(a, b, 0) ^ p == chain(a, b,
//! p)`, since XOR is associative), patching the chain field and header
//! checksum in place before the bytes hit disk.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::codec::compress::CompressModeMask;
use crate::codec::{self, checksum};
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::file::tail::{Tail, TAIL_SIZE};
use crate::file::{encode_library_block, index_extent_type, MAGIC};
use crate::stats::Stats;

/// Tuning knobs for a [`Sink`]'s write pipeline.
pub struct SinkConfig {
    pub compressor_count: usize,
    /// Producers block in [`Sink::write_extent`] once the sum of queued
    /// extents' in-memory size reaches this (spec §4.3).
    pub max_bytes_in_progress: usize,
    /// Queue depth, as a multiple of `compressor_count`, at which producers
    /// also block (spec §4.3: "or the queue holds `>= 2 * n_compressors`
    /// items").
    pub max_queue_depth_factor: usize,
    pub compress_mask: CompressModeMask,
    pub compress_level: u32,
    pub fsync_on_close: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            compressor_count: num_cpus::get().max(1),
            max_bytes_in_progress: 64 * 1024 * 1024,
            max_queue_depth_factor: 2,
            compress_mask: CompressModeMask::ALL,
            compress_level: 6,
            fsync_on_close: false,
        }
    }
}

/// Called once per committed extent, with its file offset, while the writer
/// still holds the pipeline lock (spec §4.3). The accompanying
/// [`WriterTurn`] is the only way to call [`WriterTurn::rotate`].
pub type CommitCallback = dyn Fn(u64, &Extent, &mut WriterTurn) + Send + Sync;

struct QueueItem {
    id: u64,
    extent: Extent,
    in_progress: bool,
    /// Packed bytes with the chain field computed against `previous_chain =
    /// 0`, plus that zero-based chain value.
    compressed: Option<(Vec<u8>, u32)>,
    byte_cost: usize,
}

struct SinkState {
    file: File,
    queue: VecDeque<QueueItem>,
    next_id: u64,
    bytes_in_progress: usize,
    chain: u32,
    offset: u64,
    index_entries: Vec<(u64, String)>,
    closing: bool,
    shutdown: bool,
}

struct SinkShared {
    state: Mutex<SinkState>,
    available_queue_cond: Condvar,
    available_work_cond: Condvar,
    available_write_cond: Condvar,
    config: SinkConfig,
    stats: Stats,
    on_commit: Option<Box<CommitCallback>>,
}

/// The token handed to a [`CommitCallback`]. Its existence is what proves
/// the caller is running on the writer thread's own turn, with the
/// pipeline's lock already held — the only place [`rotate`](WriterTurn::rotate)
/// is allowed to run.
pub struct WriterTurn<'a> {
    state: &'a mut SinkState,
}

impl<'a> WriterTurn<'a> {
    /// Finalize the current file (index extent + tail) and continue writing
    /// to `new_path` under `library_xml`, without draining the in-flight
    /// pipeline (spec §4.3 "rotate").
    pub fn rotate(&mut self, new_path: impl AsRef<Path>, library_xml: &str) -> Result<()> {
        finalize_file(self.state)?;
        let mut new_file = File::create(new_path.as_ref())?;
        new_file.write_all(&MAGIC)?;
        let lib_block = encode_library_block(library_xml);
        new_file.write_all(&lib_block)?;
        self.state.file = new_file;
        self.state.offset = (MAGIC.len() + lib_block.len()) as u64;
        self.state.chain = 0;
        self.state.index_entries.clear();
        Ok(())
    }
}

/// A sink writing one extent file. Owns `compressor_count` compressor
/// threads and one writer thread for its whole lifetime; both are joined by
/// [`Sink::close`].
pub struct Sink {
    shared: Arc<SinkShared>,
    compressors: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Sink {
    /// Create `path`, write its magic and type library, and start the
    /// pipeline's threads.
    pub fn create(path: impl AsRef<Path>, library_xml: &str, config: SinkConfig) -> Result<Sink> {
        Self::create_with_callback(path, library_xml, config, None)
    }

    pub fn create_with_callback(
        path: impl AsRef<Path>,
        library_xml: &str,
        config: SinkConfig,
        on_commit: Option<Box<CommitCallback>>,
    ) -> Result<Sink> {
        let mut file = File::create(path.as_ref())?;
        file.write_all(&MAGIC)?;
        let lib_block = encode_library_block(library_xml);
        file.write_all(&lib_block)?;
        let offset = (MAGIC.len() + lib_block.len()) as u64;

        let state = SinkState {
            file,
            queue: VecDeque::new(),
            next_id: 0,
            bytes_in_progress: 0,
            chain: 0,
            offset,
            index_entries: Vec::new(),
            closing: false,
            shutdown: false,
        };
        let shared = Arc::new(SinkShared {
            state: Mutex::new(state),
            available_queue_cond: Condvar::new(),
            available_work_cond: Condvar::new(),
            available_write_cond: Condvar::new(),
            config,
            stats: Stats::new(),
            on_commit,
        });

        let mut compressors = Vec::with_capacity(shared.config.compressor_count);
        for _ in 0..shared.config.compressor_count {
            let shared = Arc::clone(&shared);
            compressors.push(std::thread::spawn(move || compressor_loop(shared)));
        }
        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || writer_loop(shared))
        };

        Ok(Sink { shared, compressors, writer: Some(writer) })
    }

    /// Enqueue `extent`. Blocks while the pipeline is at capacity (spec
    /// §4.3), not until it's written.
    pub fn write_extent(&self, extent: Extent) -> Result<()> {
        let byte_cost = extent.fixed_bytes().len() + extent.variable_bytes().len();
        let max_queue = self.shared.config.max_queue_depth_factor * self.shared.config.compressor_count;

        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.closing {
                return Err(Error::RequestError("write_extent called after close".into()));
            }
            if state.bytes_in_progress < self.shared.config.max_bytes_in_progress
                && state.queue.len() < max_queue.max(1)
            {
                break;
            }
            state = self.shared.available_queue_cond.wait(state).unwrap();
        }

        let id = state.next_id;
        state.next_id += 1;
        state.bytes_in_progress += byte_cost;
        state.queue.push_back(QueueItem { id, extent, in_progress: false, compressed: None, byte_cost });
        drop(state);
        self.shared.available_work_cond.notify_all();
        Ok(())
    }

    /// Block until every currently-queued extent has been written.
    pub fn flush_pending(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        while !state.queue.is_empty() {
            state = self.shared.available_write_cond.wait(state).unwrap();
        }
        Ok(())
    }

    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Flush, write the index extent and tail, and join every pipeline
    /// thread.
    pub fn close(mut self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closing = true;
            state.shutdown = true;
        }
        self.shared.available_work_cond.notify_all();
        self.shared.available_write_cond.notify_all();

        for handle in self.compressors.drain(..) {
            handle.join().expect("compressor thread panicked");
        }
        if let Some(handle) = self.writer.take() {
            handle.join().expect("writer thread panicked");
        }
        Ok(())
    }
}

fn compressor_loop(shared: Arc<SinkShared>) {
    loop {
        let mut state = shared.state.lock().unwrap();
        let claim = state
            .queue
            .iter()
            .position(|item| !item.in_progress && item.compressed.is_none());
        let Some(idx) = claim else {
            // No claimable item: every queued extent is either compressed
            // or being compressed by another worker.
            if state.shutdown {
                return;
            }
            let _ = shared.available_work_cond.wait(state).unwrap();
            continue;
        };
        state.queue[idx].in_progress = true;
        let id = state.queue[idx].id;
        let extent = state.queue[idx].extent.clone();
        drop(state);

        let packed = codec::pack_oriented(&extent, shared.config.compress_mask, shared.config.compress_level, 0, false);

        let packed = packed.map_err(|e| log::error!("extent {id} failed to compress: {e}")).ok();

        let mut state = shared.state.lock().unwrap();
        if let Some(item) = state.queue.iter_mut().find(|i| i.id == id) {
            item.in_progress = false;
            item.compressed = packed;
        }
        drop(state);
        shared.available_write_cond.notify_all();
    }
}

fn writer_loop(shared: Arc<SinkShared>) {
    loop {
        let mut state = shared.state.lock().unwrap();
        loop {
            let ready = state
                .queue
                .front()
                .map(|item| !item.in_progress && item.compressed.is_some())
                .unwrap_or(false);
            if !ready {
                break;
            }
            let item = state.queue.pop_front().unwrap();
            state.bytes_in_progress -= item.byte_cost;
            let (mut bytes, chain_zero) = item.compressed.unwrap();
            let real_chain = chain_zero ^ state.chain;
            patch_chained_checksum(&mut bytes, real_chain);

            let written_offset = state.offset;
            state.file.write_all(&bytes).expect("extent write failed");
            state.chain = real_chain;
            state.offset += bytes.len() as u64;
            state.index_entries.push((written_offset, item.extent.ty.name.clone()));
            shared.stats.record_commit(item.extent.n_records() as u64, bytes.len() as u64);

            if let Some(callback) = &shared.on_commit {
                let mut turn = WriterTurn { state: &mut *state };
                callback(written_offset, &item.extent, &mut turn);
            }
        }
        shared.available_queue_cond.notify_all();
        shared.available_write_cond.notify_all();

        if state.closing && state.queue.is_empty() {
            finalize_file(&mut state).expect("failed to finalize extent file");
            if shared.config.fsync_on_close {
                state.file.sync_all().expect("fsync on close failed");
            }
            return;
        }
        let _ = shared.available_write_cond.wait(state).unwrap();
    }
}

/// Write the index extent (one row per data extent: offset + type name) and
/// the fixed-size tail, finalizing the current file (spec §3, §4.3).
fn finalize_file(state: &mut SinkState) -> Result<()> {
    let ty = index_extent_type();
    let offset_field = ty.field("extent_offset").expect("reserved field").clone();
    let name_field = ty.field("type_name").expect("reserved field").clone();
    let mut index_extent = Extent::new_empty(std::sync::Arc::clone(&ty));
    for (offset, name) in &state.index_entries {
        let r = index_extent.append_record();
        index_extent.set_i64(r, &offset_field, *offset as i64)?;
        index_extent.set_variable32(r, &name_field, name.as_bytes())?;
    }

    let (index_bytes, _) = codec::pack(&index_extent, CompressModeMask::ALL, 6, 0)?;
    let index_extent_offset = state.offset;
    state.file.write_all(&index_bytes)?;
    state.offset += index_bytes.len() as u64;

    let tail = Tail {
        index_extent_offset,
        index_extent_len: index_bytes.len() as u32,
        chained_checksum: state.chain,
    };
    state.file.write_all(&tail.encode())?;
    state.offset += TAIL_SIZE as u64;
    Ok(())
}

/// Overwrite the chain field of an already-assembled packed extent with
/// `real_chain` and recompute the header checksum that covers it. Only ever
/// applied to native-endian output, since a sink never emits a flipped file.
fn patch_chained_checksum(bytes: &mut [u8], real_chain: u32) {
    bytes[12..16].copy_from_slice(&real_chain.to_le_bytes());
    let name_len = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
    let name_padded = (name_len + 7) & !7;
    let end = codec::HEADER_BASE_SIZE + name_padded;
    let mut header_tail = Vec::with_capacity(codec::HEADER_BASE_SIZE - 4 + name_padded);
    header_tail.extend_from_slice(&bytes[4..codec::HEADER_BASE_SIZE]);
    header_tail.extend_from_slice(&bytes[codec::HEADER_BASE_SIZE..end]);
    let header_checksum = checksum::adler32(&header_tail);
    bytes[0..4].copy_from_slice(&header_checksum.to_le_bytes());
}
