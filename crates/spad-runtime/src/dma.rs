//! Per-cluster DMA engine.
//!
//! The data-mover core enqueues 2D transfers; a worker thread executes them
//! in FIFO order and publishes completion. Transfers are asynchronous with
//! respect to the issuing core until it calls [`DmaEngine::wait_all`].

use std::sync::mpsc::{self, Receiver, Sender};

use parking_lot::{Condvar, Mutex};
use spad_core::{Result, SpadError};

use crate::memory::{Endpoint, SharedRegion};

/// Monotonic handle of an issued transfer.
pub type TxId = u64;

/// A strided block copy: `repetitions` rows of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer2d {
    pub dst: Endpoint,
    pub src: Endpoint,
    pub size: usize,
    pub dst_stride: usize,
    pub src_stride: usize,
    pub repetitions: usize,
}

impl Transfer2d {
    /// Total payload in bytes.
    pub fn bytes(&self) -> usize {
        self.size * self.repetitions
    }

    fn extent(&self, stride: usize) -> usize {
        match self.repetitions {
            0 => 0,
            n => (n - 1) * stride + self.size,
        }
    }
}

pub(crate) enum DmaCommand {
    Transfer(TxId, Transfer2d),
    Shutdown,
}

/// Traffic counters of one engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaStats {
    pub transfers: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Progress {
    issued: TxId,
    completed: TxId,
    stats: DmaStats,
}

/// DMA engine connecting main memory with one cluster's TCDM.
pub struct DmaEngine<'m> {
    cluster: usize,
    main: &'m SharedRegion,
    tcdm: &'m SharedRegion,
    queue: Mutex<Sender<DmaCommand>>,
    progress: Mutex<Progress>,
    idle: Condvar,
}

impl<'m> DmaEngine<'m> {
    pub(crate) fn new(
        cluster: usize,
        main: &'m SharedRegion,
        tcdm: &'m SharedRegion,
    ) -> (Self, Receiver<DmaCommand>) {
        let (tx, rx) = mpsc::channel();
        let engine = Self {
            cluster,
            main,
            tcdm,
            queue: Mutex::new(tx),
            progress: Mutex::new(Progress::default()),
            idle: Condvar::new(),
        };
        (engine, rx)
    }

    /// Start a strided copy of `repetitions` rows of `size` bytes.
    pub fn start_2d(
        &self,
        dst: Endpoint,
        src: Endpoint,
        size: usize,
        dst_stride: usize,
        src_stride: usize,
        repetitions: usize,
    ) -> Result<TxId> {
        self.start(Transfer2d {
            dst,
            src,
            size,
            dst_stride,
            src_stride,
            repetitions,
        })
    }

    /// Start a contiguous copy of `size` bytes.
    pub fn start_1d(&self, dst: Endpoint, src: Endpoint, size: usize) -> Result<TxId> {
        self.start_2d(dst, src, size, size, size, 1)
    }

    pub fn start(&self, transfer: Transfer2d) -> Result<TxId> {
        self.validate(&transfer)?;
        let queue = self.queue.lock();
        let mut progress = self.progress.lock();
        let id = progress.issued + 1;
        queue
            .send(DmaCommand::Transfer(id, transfer))
            .map_err(|_| SpadError::DmaUnavailable {
                cluster: self.cluster,
            })?;
        progress.issued = id;
        tracing::trace!(cluster = self.cluster, id, bytes = transfer.bytes(), "dma start");
        Ok(id)
    }

    /// Block until transfer `id` (and every earlier one) has landed.
    pub fn wait(&self, id: TxId) {
        let mut progress = self.progress.lock();
        while progress.completed < id {
            self.idle.wait(&mut progress);
        }
    }

    /// Block until every issued transfer has landed.
    pub fn wait_all(&self) {
        let mut progress = self.progress.lock();
        while progress.completed < progress.issued {
            self.idle.wait(&mut progress);
        }
    }

    pub fn stats(&self) -> DmaStats {
        self.progress.lock().stats
    }

    /// Worker loop. Runs until [`DmaEngine::shutdown`] or until every
    /// sender is gone.
    pub(crate) fn serve(&self, commands: Receiver<DmaCommand>) {
        for command in commands {
            match command {
                DmaCommand::Transfer(id, transfer) => {
                    self.execute(&transfer);
                    let mut progress = self.progress.lock();
                    progress.completed = id;
                    progress.stats.transfers += 1;
                    progress.stats.bytes += transfer.bytes() as u64;
                    self.idle.notify_all();
                }
                DmaCommand::Shutdown => break,
            }
        }
        tracing::trace!(cluster = self.cluster, "dma worker stopped");
    }

    pub(crate) fn shutdown(&self) {
        // A worker that is already gone needs no shutdown.
        let _ = self.queue.lock().send(DmaCommand::Shutdown);
    }

    fn region(&self, endpoint: Endpoint) -> &'m SharedRegion {
        match endpoint {
            Endpoint::Main(_) => self.main,
            Endpoint::Tcdm(_) => self.tcdm,
        }
    }

    fn validate(&self, t: &Transfer2d) -> Result<()> {
        if t.repetitions > 1 && t.dst_stride < t.size {
            return Err(SpadError::InvalidConfig(format!(
                "dma destination rows overlap: stride {} < row size {}",
                t.dst_stride, t.size
            )));
        }
        self.region(t.dst).check(t.dst.offset(), t.extent(t.dst_stride))?;
        self.region(t.src).check(t.src.offset(), t.extent(t.src_stride))?;
        Ok(())
    }

    fn execute(&self, t: &Transfer2d) {
        let dst = self.region(t.dst);
        let src = self.region(t.src);
        for rep in 0..t.repetitions {
            // SAFETY: bounds were validated at issue time; the kernel's
            // barrier phases keep every other accessor off both ranges
            // until the issuing core has waited for this transfer.
            unsafe {
                dst.copy_from(
                    t.dst.offset() + rep * t.dst_stride,
                    src,
                    t.src.offset() + rep * t.src_stride,
                    t.size,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_engine(f: impl FnOnce(&DmaEngine<'_>, &SharedRegion, &SharedRegion)) {
        let main = SharedRegion::new("main memory", 4096);
        let tcdm = SharedRegion::new("tcdm", 1024);
        let (engine, rx) = DmaEngine::new(0, &main, &tcdm);
        std::thread::scope(|s| {
            s.spawn(|| engine.serve(rx));
            f(&engine, &main, &tcdm);
            engine.shutdown();
        });
    }

    #[test]
    fn test_strided_gather() {
        with_engine(|dma, main, tcdm| {
            unsafe {
                let m = main.slice_mut::<f32>(0, 16);
                for (i, v) in m.iter_mut().enumerate() {
                    *v = i as f32;
                }
            }
            // Column block [1..3) of a 4x4 matrix.
            dma.start_2d(Endpoint::Tcdm(0), Endpoint::Main(4), 8, 8, 16, 4)
                .unwrap();
            dma.wait_all();
            let t = unsafe { tcdm.slice::<f32>(0, 8) };
            assert_eq!(t, &[1.0, 2.0, 5.0, 6.0, 9.0, 10.0, 13.0, 14.0]);
            assert_eq!(dma.stats(), DmaStats { transfers: 1, bytes: 32 });
        });
    }

    #[test]
    fn test_ids_are_ordered() {
        with_engine(|dma, _, _| {
            let a = dma.start_1d(Endpoint::Tcdm(0), Endpoint::Main(0), 64).unwrap();
            let b = dma.start_1d(Endpoint::Main(64), Endpoint::Tcdm(0), 64).unwrap();
            assert!(b > a);
            dma.wait(b);
            assert_eq!(dma.stats().transfers, 2);
        });
    }

    #[test]
    fn test_out_of_bounds_rejected_at_issue() {
        with_engine(|dma, _, _| {
            let err = dma
                .start_2d(Endpoint::Tcdm(0), Endpoint::Main(0), 512, 512, 512, 4)
                .unwrap_err();
            assert!(matches!(err, SpadError::OutOfBounds { region: "tcdm", .. }));
            dma.wait_all();
            assert_eq!(dma.stats().transfers, 0);
        });
    }

    #[test]
    fn test_zero_repetitions_is_a_noop() {
        with_engine(|dma, _, _| {
            dma.start_2d(Endpoint::Tcdm(0), Endpoint::Main(0), 16, 16, 16, 0)
                .unwrap();
            dma.wait_all();
            assert_eq!(dma.stats().bytes, 0);
        });
    }
}
