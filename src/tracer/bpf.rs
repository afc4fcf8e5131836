//! BPF program loading, attachment, and ring buffer reading.
//!
//! Implements the [`Tracer`] trait using aya. All code is gated behind
//! `#[cfg(feature = "bpf")]`.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tokio::io::unix::AsyncFd;

use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::{Array, MapData, RingBuf};
use aya::programs::{BtfTracePoint, TracePoint};
use aya::{Btf, Ebpf, EbpfLoader};

use super::event::SourceKind;
use super::parse::parse_record;
use super::{ErrorHandler, SampleSender, Tracer, TracerConfig};

/// Compiled block latency object, embedded at build time.
///
/// `include_bytes_aligned!` guarantees the alignment aya's ELF parser needs.
const BLOCK_OBJ: &[u8] =
    aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/blk_latency.bpf.o"));

/// Compiled syscall latency object, embedded at build time.
const SYSCALL_OBJ: &[u8] =
    aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/syscall_latency.bpf.o"));

/// Length of `task_struct::comm`, including the trailing NUL.
const TASK_COMM_LEN: usize = 16;

/// Report a parse error summary every N failures.
const PARSE_ERROR_LOG_INTERVAL: u64 = 1000;

/// BPF-backed tracer for one latency source.
pub struct BpfTracer {
    cfg: TracerConfig,
    sender: SampleSender,
    error_handlers: Vec<ErrorHandler>,
    ebpf: Option<Ebpf>,
    read_task: Option<tokio::task::JoinHandle<()>>,
}

impl BpfTracer {
    pub fn new(cfg: TracerConfig, sender: SampleSender) -> Self {
        Self {
            cfg,
            sender,
            error_handlers: Vec::with_capacity(2),
            ebpf: None,
            read_task: None,
        }
    }
}

impl Tracer for BpfTracer {
    async fn start(&mut self, ctx: tokio_util::sync::CancellationToken) -> Result<()> {
        remove_memlock_limit()?;

        let obj = match self.cfg.kind {
            SourceKind::Block => BLOCK_OBJ,
            SourceKind::Syscall => SYSCALL_OBJ,
        };

        let mut ebpf = EbpfLoader::new()
            .set_max_entries("events", self.cfg.ring_buffer_size)
            .load(obj)
            .context("loading BPF objects")?;

        match self.cfg.kind {
            SourceKind::Block => {
                program_device_filter(&mut ebpf, &self.cfg.entity_filter)?;
                attach_block(&mut ebpf)?;
            }
            SourceKind::Syscall => {
                program_syscall_filter(
                    &mut ebpf,
                    &self.cfg.entity_filter,
                    self.cfg.process_name.as_deref(),
                )?;
                attach_syscalls(&mut ebpf)?;
            }
        }

        let events_map = ebpf
            .take_map("events")
            .ok_or_else(|| anyhow!("events map not found"))?;
        let ring_buf =
            RingBuf::try_from(events_map).context("creating ring buffer from events map")?;

        let sender = self.sender.clone();
        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));

        let handle = tokio::spawn(async move {
            read_loop(ring_buf, sender, error_handlers, ctx).await;
        });

        self.read_task = Some(handle);
        self.ebpf = Some(ebpf);

        tracing::info!(
            source = %self.cfg.kind,
            ring_buffer_size = self.cfg.ring_buffer_size,
            filtered_entities = self.cfg.entity_filter.len(),
            "BPF tracer started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The read task exits when the CancellationToken is cancelled.
        if let Some(handle) = self.read_task.take() {
            handle.await.context("waiting for read task")?;
        }

        // Dropping the Ebpf object detaches all programs and closes maps.
        self.ebpf = None;

        tracing::info!("BPF tracer stopped");
        Ok(())
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }
}

// ---------------------------------------------------------------------------
// Ring buffer read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    ring_buf: RingBuf<MapData>,
    sender: SampleSender,
    error_handlers: Arc<Vec<ErrorHandler>>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut async_fd = match AsyncFd::new(ring_buf) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "failed to create async fd for ring buffer");
            return;
        }
    };

    let mut parse_errors: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = async_fd.readable_mut() => {
                let mut guard = match result {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(error = %e, "ring buffer poll error");
                        report_error(&error_handlers, anyhow!("{e}"));
                        continue;
                    }
                };

                let now = Instant::now();
                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    match parse_record(&item) {
                        Ok(record) => {
                            if !sender.deliver(record, now) {
                                tracing::debug!("event queue closed, stopping reader");
                                return;
                            }
                        }
                        Err(e) => {
                            sender.stats().record_parse_error();
                            parse_errors += 1;
                            if parse_errors % PARSE_ERROR_LOG_INTERVAL == 1 {
                                tracing::warn!(error = %e, total = parse_errors, "record parse error");
                            }
                        }
                    }
                }

                guard.clear_ready();
            }
        }
    }
}

fn report_error(handlers: &[ErrorHandler], err: anyhow::Error) {
    for handler in handlers {
        handler(anyhow!("{err}"));
    }
}

// ---------------------------------------------------------------------------
// Filter maps
// ---------------------------------------------------------------------------

fn program_device_filter(ebpf: &mut Ebpf, devices: &[u32]) -> Result<()> {
    {
        let mut map: BpfHashMap<_, u32, u8> = BpfHashMap::try_from(
            ebpf.map_mut("dev_filter")
                .ok_or_else(|| anyhow!("dev_filter map not found"))?,
        )?;
        for &dev in devices {
            map.insert(dev, 1, 0)
                .with_context(|| format!("adding device {dev:#x} to dev_filter"))?;
        }
    }

    let mut config: Array<_, u8> = Array::try_from(
        ebpf.map_mut("lat_config")
            .ok_or_else(|| anyhow!("lat_config map not found"))?,
    )?;
    config
        .set(0, u8::from(!devices.is_empty()), 0)
        .context("setting filter_enabled")?;

    Ok(())
}

fn program_syscall_filter(
    ebpf: &mut Ebpf,
    syscalls: &[u32],
    process_name: Option<&str>,
) -> Result<()> {
    {
        let mut map: BpfHashMap<_, u32, u8> = BpfHashMap::try_from(
            ebpf.map_mut("syscall_filter")
                .ok_or_else(|| anyhow!("syscall_filter map not found"))?,
        )?;
        for &nr in syscalls {
            map.insert(nr, 1, 0)
                .with_context(|| format!("adding syscall {nr} to syscall_filter"))?;
        }
    }

    if let Some(name) = process_name {
        let mut comm = [0u8; TASK_COMM_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_COMM_LEN - 1);
        comm[..len].copy_from_slice(&bytes[..len]);

        let mut map: Array<_, [u8; TASK_COMM_LEN]> = Array::try_from(
            ebpf.map_mut("target_comm")
                .ok_or_else(|| anyhow!("target_comm map not found"))?,
        )?;
        map.set(0, comm, 0).context("setting target_comm")?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Program attachment
// ---------------------------------------------------------------------------

fn attach_block(ebpf: &mut Ebpf) -> Result<()> {
    let btf = Btf::from_sys_fs().context("loading kernel BTF")?;

    for name in ["block_rq_issue", "block_rq_complete"] {
        let prog: &mut BtfTracePoint = ebpf
            .program_mut(name)
            .ok_or_else(|| anyhow!("program {name} not found"))?
            .try_into()?;
        prog.load(name, &btf)
            .with_context(|| format!("loading program {name}"))?;
        prog.attach()
            .with_context(|| format!("attaching tp_btf/{name}"))?;
        tracing::debug!(name, "attached BTF tracepoint");
    }

    Ok(())
}

fn attach_syscalls(ebpf: &mut Ebpf) -> Result<()> {
    for (prog_name, tp_name) in [
        ("trace_sys_enter", "sys_enter"),
        ("trace_sys_exit", "sys_exit"),
    ] {
        let prog: &mut TracePoint = ebpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow!("program {prog_name} not found"))?
            .try_into()?;
        prog.load()
            .with_context(|| format!("loading program {prog_name}"))?;
        prog.attach("raw_syscalls", tp_name)
            .with_context(|| format!("attaching tracepoint raw_syscalls/{tp_name}"))?;
        tracing::debug!(group = "raw_syscalls", name = tp_name, "attached tracepoint");
    }

    Ok(())
}

/// Lifts RLIMIT_MEMLOCK so map allocation works on kernels without
/// memcg-based BPF accounting.
fn remove_memlock_limit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: setrlimit only reads the provided struct.
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
        return Err(std::io::Error::last_os_error()).context("removing memlock limit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bpf_elf(obj: &[u8]) {
        assert!(obj.len() > 64, "BPF object is too small: {} bytes", obj.len());

        let magic = obj.get(..4).expect("BPF object too small for magic");
        assert_eq!(magic, b"\x7fELF", "invalid ELF magic: {magic:02x?}");

        let ei_class = obj.get(4).copied().expect("missing EI_CLASS");
        assert_eq!(ei_class, 2, "not 64-bit ELF (EI_CLASS={ei_class})");

        let em_lo = obj.get(18).copied().expect("missing e_machine lo");
        let em_hi = obj.get(19).copied().expect("missing e_machine hi");
        let e_machine = u16::from_le_bytes([em_lo, em_hi]);
        assert_eq!(e_machine, 247, "e_machine is not EM_BPF (got {e_machine})");
    }

    #[test]
    fn test_bpf_objects_are_valid_elf() {
        assert_bpf_elf(BLOCK_OBJ);
        assert_bpf_elf(SYSCALL_OBJ);
    }

    #[test]
    fn test_bpf_object_alignment() {
        for obj in [BLOCK_OBJ, SYSCALL_OBJ] {
            let ptr = obj.as_ptr() as usize;
            assert_eq!(ptr % 8, 0, "BPF object pointer {ptr:#x} is not 8-byte aligned");
        }
    }
}
