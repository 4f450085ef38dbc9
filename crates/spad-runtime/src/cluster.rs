//! Kernel launch.
//!
//! [`System::launch`] plans the kernel's scratchpad layout, then runs one
//! thread per core (compute cores and a data mover in every cluster) plus
//! one DMA worker per cluster. All cores rendezvous at a global barrier
//! before the launch returns.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use spad_core::{DType, Result, Shape, SpadError, Tensor};

use crate::barrier::HwBarrier;
use crate::config::ClusterConfig;
use crate::dma::{DmaCommand, DmaEngine};
use crate::memory::{MainMemory, TensorRef};
use crate::role::{Role, Topology};
use crate::scratchpad::{ScratchpadArena, Tcdm};

/// A kernel split into a data-mover program and a compute program.
///
/// Both programs must cross the cluster barrier the same number of times.
pub trait ClusterKernel: Sync {
    /// Scratchpad buffers and any other per-launch constants.
    type Layout: Sync;

    fn name(&self) -> &'static str;

    /// Validate the problem and lay out the TCDM. Runs once, on the host.
    fn plan(&self, config: &ClusterConfig, arena: &mut ScratchpadArena) -> Result<Self::Layout>;

    /// Program of the data-mover core of every cluster.
    fn transfer_task(&self, ctx: &TransferContext<'_>, layout: &Self::Layout) -> Result<()>;

    /// Program of every compute core.
    fn compute_task(&self, ctx: &ComputeContext<'_>, layout: &Self::Layout) -> Result<()>;
}

/// What every core can see: its place in the system, its cluster's TCDM
/// and the cluster barrier.
pub struct CoreContext<'a> {
    topology: Topology,
    tcdm: &'a Tcdm,
    barrier: &'a HwBarrier,
    crossings: Cell<u64>,
}

impl<'a> CoreContext<'a> {
    fn new(topology: Topology, tcdm: &'a Tcdm, barrier: &'a HwBarrier) -> Self {
        Self {
            topology,
            tcdm,
            barrier,
            crossings: Cell::new(0),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn tcdm(&self) -> &'a Tcdm {
        self.tcdm
    }

    /// Wait for every core of this cluster.
    pub fn cluster_barrier(&self) -> Result<()> {
        self.barrier.wait()?;
        self.crossings.set(self.crossings.get() + 1);
        Ok(())
    }

    pub fn barrier_crossings(&self) -> u64 {
        self.crossings.get()
    }
}

/// Context of a compute core.
pub struct ComputeContext<'a> {
    core: CoreContext<'a>,
}

impl ComputeContext<'_> {
    /// Index of this core among the cluster's compute cores.
    pub fn compute_idx(&self) -> usize {
        self.core.topology.cluster_core_idx()
    }

    pub fn compute_cores(&self) -> usize {
        self.core.topology.compute_core_num()
    }
}

impl<'a> Deref for ComputeContext<'a> {
    type Target = CoreContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

/// Context of the data-mover core. Only this core can reach the DMA engine.
pub struct TransferContext<'a> {
    core: CoreContext<'a>,
    dma: &'a DmaEngine<'a>,
}

impl<'a> TransferContext<'a> {
    pub fn dma(&self) -> &'a DmaEngine<'a> {
        self.dma
    }
}

impl<'a> Deref for TransferContext<'a> {
    type Target = CoreContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

/// Summary of one launch.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub kernel: &'static str,
    pub clusters: usize,
    pub cores_per_cluster: usize,
    /// Cluster-barrier crossings per core, for each cluster.
    pub barrier_crossings: Vec<u64>,
    pub dma_transfers: u64,
    pub dma_bytes: u64,
    pub scratchpad_bytes: usize,
    pub elapsed: Duration,
}

impl fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} cluster(s) x {} cores, {} barrier phase(s), {} DMA transfers ({} bytes), {} bytes TCDM, {:.3?}",
            self.kernel,
            self.clusters,
            self.cores_per_cluster,
            self.barrier_crossings.first().copied().unwrap_or(0),
            self.dma_transfers,
            self.dma_bytes,
            self.scratchpad_bytes,
            self.elapsed,
        )
    }
}

/// The whole accelerator: shared main memory plus per-cluster TCDMs.
pub struct System {
    config: ClusterConfig,
    main: MainMemory,
    tcdms: Vec<Tcdm>,
}

impl System {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let main = MainMemory::new(config.main_memory_bytes);
        let tcdms = (0..config.num_clusters)
            .map(|_| Tcdm::new(config.tcdm_bytes))
            .collect();
        tracing::debug!(
            clusters = config.num_clusters,
            cores = config.cores_per_cluster(),
            tcdm_bytes = config.tcdm_bytes,
            "system created"
        );
        Ok(Self {
            config,
            main,
            tcdms,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn main_memory(&self) -> &MainMemory {
        &self.main
    }

    pub fn main_memory_mut(&mut self) -> &mut MainMemory {
        &mut self.main
    }

    pub fn upload(&mut self, tensor: &Tensor) -> Result<TensorRef> {
        self.main.upload(tensor)
    }

    pub fn alloc(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<TensorRef> {
        self.main.alloc(shape, dtype)
    }

    pub fn download(&self, tensor: &TensorRef) -> Result<Tensor> {
        self.main.download(tensor)
    }

    /// Run `kernel` on every core of every cluster and wait for it.
    pub fn launch<K: ClusterKernel>(&mut self, kernel: &K) -> Result<LaunchReport> {
        let _span = tracing::info_span!("launch", kernel = kernel.name()).entered();

        let mut arena = ScratchpadArena::new(self.config.tcdm_bytes);
        let layout = kernel.plan(&self.config, &mut arena)?;
        tracing::debug!(
            used = arena.used(),
            remaining = arena.remaining(),
            buffers = arena.slots().len(),
            "scratchpad planned"
        );
        for slot in arena.slots() {
            tracing::trace!(name = %slot.name, offset = slot.offset, bytes = slot.size_bytes, "buffer");
        }

        let num_clusters = self.config.num_clusters;
        let cores = self.config.cores_per_cluster();
        let global = HwBarrier::new("global", self.config.total_cores());
        let mut receivers: Vec<Receiver<DmaCommand>> = Vec::with_capacity(num_clusters);
        let units: Vec<ClusterUnit<'_>> = self
            .tcdms
            .iter()
            .enumerate()
            .map(|(idx, tcdm)| {
                let (dma, rx) = DmaEngine::new(idx, self.main.region(), tcdm.region());
                receivers.push(rx);
                ClusterUnit {
                    idx,
                    tcdm,
                    dma,
                    barrier: HwBarrier::new("cluster", cores),
                }
            })
            .collect();

        let start = Instant::now();
        let outcomes: Vec<CoreOutcome> = thread::scope(|s| {
            for (unit, rx) in units.iter().zip(receivers) {
                s.spawn(move || unit.dma.serve(rx));
            }

            let mut handles = Vec::with_capacity(num_clusters * cores);
            for unit in &units {
                for core in 0..cores {
                    let topology = Topology::new(unit.idx, num_clusters, core, cores - 1);
                    let (layout, global) = (&layout, &global);
                    let handle = s.spawn(move || run_core(kernel, layout, topology, unit, global));
                    handles.push((unit.idx, core, handle));
                }
            }

            let outcomes = handles
                .into_iter()
                .map(|(cluster, core, handle)| {
                    handle.join().unwrap_or_else(|payload| CoreOutcome {
                        cluster,
                        core,
                        crossings: 0,
                        fault: Some(Fault::from_panic(payload)),
                    })
                })
                .collect();

            for unit in &units {
                unit.dma.shutdown();
            }
            outcomes
        });
        let elapsed = start.elapsed();

        if let Some((outcome, fault)) = root_fault(&outcomes) {
            tracing::error!(
                cluster = outcome.cluster,
                core = outcome.core,
                "kernel faulted: {}",
                fault.message
            );
            return Err(SpadError::CoreFault {
                cluster: outcome.cluster,
                core: outcome.core,
                message: fault.message.clone(),
            });
        }

        let barrier_crossings = units
            .iter()
            .map(|unit| cluster_crossings(unit.idx, &outcomes))
            .collect::<Result<Vec<_>>>()?;
        let (dma_transfers, dma_bytes) = units.iter().fold((0, 0), |(t, b), unit| {
            let stats = unit.dma.stats();
            (t + stats.transfers, b + stats.bytes)
        });

        let report = LaunchReport {
            kernel: kernel.name(),
            clusters: num_clusters,
            cores_per_cluster: cores,
            barrier_crossings,
            dma_transfers,
            dma_bytes,
            scratchpad_bytes: arena.used(),
            elapsed,
        };
        tracing::info!(
            dma_transfers,
            dma_bytes,
            elapsed_us = elapsed.as_micros() as u64,
            "launch complete"
        );
        Ok(report)
    }
}

struct ClusterUnit<'m> {
    idx: usize,
    tcdm: &'m Tcdm,
    dma: DmaEngine<'m>,
    barrier: HwBarrier,
}

struct Fault {
    message: String,
    /// Raised because another core faulted first.
    secondary: bool,
}

impl Fault {
    fn from_error(err: SpadError) -> Self {
        let secondary = matches!(err, SpadError::BarrierFault { .. });
        Self {
            message: err.to_string(),
            secondary,
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {s}")
        } else {
            "panicked".to_string()
        };
        Self {
            message,
            secondary: false,
        }
    }
}

struct CoreOutcome {
    cluster: usize,
    core: usize,
    crossings: u64,
    fault: Option<Fault>,
}

fn guarded(task: impl FnOnce() -> Result<()>) -> std::result::Result<(), Fault> {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Fault::from_error(err)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}

fn run_core<K: ClusterKernel>(
    kernel: &K,
    layout: &K::Layout,
    topology: Topology,
    unit: &ClusterUnit<'_>,
    global: &HwBarrier,
) -> CoreOutcome {
    let _span = tracing::debug_span!(
        "core",
        cluster = topology.cluster_idx(),
        core = topology.cluster_core_idx(),
        global = topology.global_core_idx()
    )
    .entered();
    let core = CoreContext::new(topology, unit.tcdm, &unit.barrier);

    let (result, crossings) = match topology.role() {
        Role::Compute => {
            let ctx = ComputeContext { core };
            let result = guarded(|| kernel.compute_task(&ctx, layout));
            (result, ctx.barrier_crossings())
        }
        Role::DataMover => {
            let ctx = TransferContext {
                core,
                dma: &unit.dma,
            };
            let result = guarded(|| {
                kernel.transfer_task(&ctx, layout)?;
                ctx.dma().wait_all();
                Ok(())
            });
            (result, ctx.barrier_crossings())
        }
    };

    let fault = match result {
        Ok(()) => {
            unit.barrier.retire();
            global.wait().err().map(Fault::from_error)
        }
        Err(fault) => {
            let reason = format!(
                "core {} of cluster {} faulted",
                topology.cluster_core_idx(),
                topology.cluster_idx()
            );
            unit.barrier.poison(&reason);
            global.poison(&reason);
            Some(fault)
        }
    };
    tracing::trace!(crossings, faulted = fault.is_some(), "core done");

    CoreOutcome {
        cluster: topology.cluster_idx(),
        core: topology.cluster_core_idx(),
        crossings,
        fault,
    }
}

/// The fault that started it all: the first one not caused by a poisoned
/// barrier, or failing that the first one at all.
fn root_fault(outcomes: &[CoreOutcome]) -> Option<(&CoreOutcome, &Fault)> {
    let mut faults = outcomes
        .iter()
        .filter_map(|o| o.fault.as_ref().map(|f| (o, f)));
    let first = faults.clone().next()?;
    Some(faults.find(|(_, f)| !f.secondary).unwrap_or(first))
}

/// Barrier crossings shared by every core of `cluster`. Cores that crossed a
/// different number of times than the first one are reported as a fault.
fn cluster_crossings(cluster: usize, outcomes: &[CoreOutcome]) -> Result<u64> {
    let mut cores = outcomes.iter().filter(|o| o.cluster == cluster);
    let Some(first) = cores.next() else {
        return Ok(0);
    };
    match cores.find(|o| o.crossings != first.crossings) {
        Some(odd) => {
            tracing::error!(
                cluster,
                core = odd.core,
                expected = first.crossings,
                got = odd.crossings,
                "uneven barrier crossings"
            );
            Err(SpadError::CoreFault {
                cluster,
                core: odd.core,
                message: format!(
                    "crossed {} cluster barriers, core {} crossed {}",
                    odd.crossings, first.core, first.crossings
                ),
            })
        }
        None => Ok(first.crossings),
    }
}
