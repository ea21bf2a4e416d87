// SPDX-License-Identifier: CEPL-1.0
//! Per-frame fence/semaphore handshake and swapchain invalidation handling.
//!
//! `FramePacer` owns the ordering; a `FrameBackend` owns the GPU objects.
//! Each frame slot has a command buffer, an in-flight fence and an
//! image-available semaphore. Each swapchain image has a render-finished
//! semaphore.
//!
//! STRICT PER-FRAME ORDER:
//! 1) wait slot fence (previous submission from this slot is done)
//! 2) acquire (signals the slot's image-available semaphore)
//! 3) wait for the fence of any other slot still rendering into that image
//! 4) reset slot fence, only after a successful acquire
//! 5) record + submit (waits image-available, signals render-finished + fence);
//!    if either fails, release the slot so its fence and semaphore are not stranded
//! 6) present (waits render-finished), then rebuild if anything asked for it
//! 7) advance slot
use anyhow::Result;
use bitflags::bitflags;
use tracing::{debug, info, warn};

bitflags! {
    /// Why the swapchain has to be rebuilt.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct RebuildFlags: u8 {
        const RESIZED = 1 << 0;
        const SUBOPTIMAL = 1 << 1;
        const OUT_OF_DATE = 1 << 2;
        const SETTINGS = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Optimal,
    Suboptimal,
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image: u32, rebuilt: bool },
    /// Acquire reported out-of-date; the swapchain was rebuilt and nothing was drawn.
    Skipped { reason: RebuildFlags },
}

/// GPU side of the frame loop. `slot` is in `0..frames_in_flight`,
/// `image` is a swapchain image index.
pub trait FrameBackend {
    /// Block until the slot's in-flight fence is signaled.
    fn wait_slot(&mut self, slot: usize) -> Result<()>;
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire(&mut self, slot: usize) -> Result<Acquired>;
    /// Re-record the slot's command buffer targeting `image`.
    fn record(&mut self, slot: usize, image: u32) -> Result<()>;
    fn submit(&mut self, slot: usize, image: u32) -> Result<()>;
    /// Called after `reset_slot` when nothing could be submitted for the slot.
    /// Consumes the slot's image-available semaphore and signals its fence
    /// without drawing.
    fn release_slot(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image: u32) -> Result<Presented>;
    /// Tear down and recreate swapchain, image views and framebuffers.
    /// Returns the new swapchain image count.
    fn rebuild_swapchain(&mut self) -> Result<usize>;
}

#[derive(Debug)]
pub struct FramePacer {
    frames_in_flight: usize,
    current: usize,
    // slot whose submission last targeted each swapchain image
    image_owner: Vec<Option<usize>>,
    pending: RebuildFlags,
    frames_drawn: u64,
}

impl FramePacer {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        FramePacer {
            frames_in_flight: frames_in_flight.max(1),
            current: 0,
            image_owner: vec![None; image_count],
            pending: RebuildFlags::empty(),
            frames_drawn: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn pending(&self) -> RebuildFlags {
        self.pending
    }

    /// Schedule a rebuild after the next present.
    pub fn request_rebuild(&mut self, reason: RebuildFlags) {
        self.pending |= reason;
    }

    /// Forget pending reasons and image ownership after the backend rebuilt
    /// its swapchain outside of `draw_frame`.
    pub fn on_swapchain_rebuilt(&mut self, image_count: usize) {
        self.pending = RebuildFlags::empty();
        self.image_owner.clear();
        self.image_owner.resize(image_count, None);
    }

    pub fn draw_frame<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<FrameOutcome> {
        let slot = self.current;

        backend.wait_slot(slot)?;

        let (image, acquire_suboptimal) = match backend.acquire(slot)? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::OutOfDate => {
                // Fence was not reset, so the next wait on this slot returns at once.
                let reason = self.pending | RebuildFlags::OUT_OF_DATE;
                self.rebuild(backend, reason)?;
                return Ok(FrameOutcome::Skipped { reason });
            }
        };
        if acquire_suboptimal {
            self.pending |= RebuildFlags::SUBOPTIMAL;
        }

        let idx = image as usize;
        if idx >= self.image_owner.len() {
            self.image_owner.resize(idx + 1, None);
        }
        if let Some(owner) = self.image_owner[idx] {
            if owner != slot {
                debug!(image, owner, slot, "image still owned by another slot");
                backend.wait_slot(owner)?;
            }
        }
        self.image_owner[idx] = Some(slot);

        backend.reset_slot(slot)?;
        let queued = backend
            .record(slot, image)
            .and_then(|()| backend.submit(slot, image));
        if let Err(e) = queued {
            if let Err(release) = backend.release_slot(slot) {
                warn!("slot {slot} not released after a failed frame: {release:#}");
            }
            self.image_owner[idx] = None;
            return Err(e);
        }
        self.frames_drawn += 1;

        match backend.present(slot, image)? {
            Presented::Optimal => {}
            Presented::Suboptimal => self.pending |= RebuildFlags::SUBOPTIMAL,
            Presented::OutOfDate => self.pending |= RebuildFlags::OUT_OF_DATE,
        }

        let rebuilt = !self.pending.is_empty();
        if rebuilt {
            self.rebuild(backend, self.pending)?;
        }

        self.current = (self.current + 1) % self.frames_in_flight;
        Ok(FrameOutcome::Presented {
            slot,
            image,
            rebuilt,
        })
    }

    fn rebuild<B: FrameBackend + ?Sized>(&mut self, backend: &mut B, reason: RebuildFlags) -> Result<()> {
        info!("swapchain rebuild ({:?})", reason);
        let image_count = backend.rebuild_swapchain()?;
        self.on_swapchain_rebuilt(image_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Ev {
        Wait(usize),
        Reset(usize),
        Acquire(usize),
        Record(usize, u32),
        Submit(usize, u32),
        Present(usize, u32),
        Release(usize),
        Rebuild,
    }

    /// Simulated GPU. Work submitted on a slot completes when the CPU waits on
    /// that slot's fence. Every protocol violation panics.
    struct MockGpu {
        events: Vec<Ev>,
        fence_signaled: Vec<bool>,
        gpu_busy: Vec<bool>,
        acquire_signaled: Vec<bool>,
        swapchain_stale: bool,
        image_count: usize,
        next_image: u32,
        rebuild_image_count: usize,
        acquire_script: VecDeque<Acquired>,
        present_script: VecDeque<Presented>,
        fail_record: bool,
        fail_submit: bool,
    }

    impl MockGpu {
        fn new(slots: usize, image_count: usize) -> Self {
            MockGpu {
                events: Vec::new(),
                fence_signaled: vec![true; slots],
                gpu_busy: vec![false; slots],
                acquire_signaled: vec![false; slots],
                swapchain_stale: false,
                image_count,
                next_image: 0,
                rebuild_image_count: image_count,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                fail_record: false,
                fail_submit: false,
            }
        }

        fn count(&self, ev: Ev) -> usize {
            self.events.iter().filter(|e| **e == ev).count()
        }

        fn position(&self, ev: Ev) -> Option<usize> {
            self.events.iter().position(|e| *e == ev)
        }
    }

    impl FrameBackend for MockGpu {
        fn wait_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Ev::Wait(slot));
            if self.gpu_busy[slot] {
                self.gpu_busy[slot] = false;
                self.fence_signaled[slot] = true;
            }
            assert!(
                self.fence_signaled[slot],
                "deadlock: waiting on slot {slot} fence with nothing submitted"
            );
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Ev::Reset(slot));
            assert!(self.fence_signaled[slot], "reset of a fence still in flight");
            self.fence_signaled[slot] = false;
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<Acquired> {
            self.events.push(Ev::Acquire(slot));
            assert!(
                !self.acquire_signaled[slot],
                "slot {slot} image-available semaphore signaled twice"
            );
            let res = self.acquire_script.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count as u32;
                Acquired::Image {
                    index,
                    suboptimal: false,
                }
            });
            if let Acquired::Image { .. } = res {
                self.acquire_signaled[slot] = true;
            }
            Ok(res)
        }

        fn record(&mut self, slot: usize, image: u32) -> Result<()> {
            self.events.push(Ev::Record(slot, image));
            assert!(!self.gpu_busy[slot], "recording over an in-flight command buffer");
            assert!(!self.swapchain_stale, "recording against a stale swapchain");
            if std::mem::take(&mut self.fail_record) {
                anyhow::bail!("record failed");
            }
            Ok(())
        }

        fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
            self.events.push(Ev::Submit(slot, image));
            assert!(
                self.acquire_signaled[slot],
                "submit without a signaled image-available semaphore"
            );
            assert!(!self.fence_signaled[slot], "submit with a signaled fence");
            if std::mem::take(&mut self.fail_submit) {
                anyhow::bail!("queue_submit failed");
            }
            self.acquire_signaled[slot] = false;
            self.gpu_busy[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> Result<Presented> {
            self.events.push(Ev::Present(slot, image));
            let res = self.present_script.pop_front().unwrap_or(Presented::Optimal);
            if res != Presented::Optimal {
                self.swapchain_stale = true;
            }
            Ok(res)
        }

        fn release_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Ev::Release(slot));
            assert!(!self.fence_signaled[slot], "release of a fence that was never reset");
            assert!(!self.gpu_busy[slot], "release of a slot with work in flight");
            // empty batch: waits the acquire semaphore, signals the fence
            self.acquire_signaled[slot] = false;
            self.gpu_busy[slot] = true;
            Ok(())
        }

        fn rebuild_swapchain(&mut self) -> Result<usize> {
            self.events.push(Ev::Rebuild);
            self.swapchain_stale = false;
            self.image_count = self.rebuild_image_count;
            self.next_image = 0;
            Ok(self.image_count)
        }
    }

    fn slots_of(outcomes: &[FrameOutcome]) -> Vec<usize> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                FrameOutcome::Presented { slot, .. } => Some(*slot),
                FrameOutcome::Skipped { .. } => None,
            })
            .collect()
    }

    #[test]
    fn slots_rotate_modulo_frames_in_flight() {
        let mut gpu = MockGpu::new(3, 3);
        let mut pacer = FramePacer::new(3, 3);
        let outcomes: Vec<_> = (0..7).map(|_| pacer.draw_frame(&mut gpu).unwrap()).collect();
        assert_eq!(slots_of(&outcomes), vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(pacer.current_slot(), 1);
        assert_eq!(pacer.frames_drawn(), 7);
        assert_eq!(gpu.count(Ev::Rebuild), 0);
    }

    #[test]
    fn single_frame_in_flight_always_uses_slot_zero() {
        let mut gpu = MockGpu::new(1, 2);
        let mut pacer = FramePacer::new(1, 2);
        for _ in 0..4 {
            pacer.draw_frame(&mut gpu).unwrap();
        }
        assert_eq!(pacer.current_slot(), 0);
        assert_eq!(gpu.count(Ev::Wait(0)), 4);
    }

    #[test]
    fn zero_frames_in_flight_is_clamped_to_one() {
        let pacer = FramePacer::new(0, 2);
        assert_eq!(pacer.frames_in_flight(), 1);
    }

    #[test]
    fn slot_is_waited_before_its_command_buffer_is_reused() {
        let mut gpu = MockGpu::new(2, 3);
        let mut pacer = FramePacer::new(2, 3);
        for _ in 0..20 {
            pacer.draw_frame(&mut gpu).unwrap();
        }
        // every record is preceded by a wait on the same slot since its last submit
        let mut waited = [true, true];
        for ev in &gpu.events {
            match *ev {
                Ev::Wait(s) => waited[s] = true,
                Ev::Submit(s, _) => waited[s] = false,
                Ev::Record(s, _) => assert!(waited[s], "slot {s} recorded without a wait"),
                _ => {}
            }
        }
    }

    #[test]
    fn acquire_precedes_submit_once_per_frame() {
        let mut gpu = MockGpu::new(2, 3);
        let mut pacer = FramePacer::new(2, 3);
        for _ in 0..6 {
            pacer.draw_frame(&mut gpu).unwrap();
        }
        let acquires = gpu.events.iter().filter(|e| matches!(e, Ev::Acquire(_))).count();
        let submits = gpu.events.iter().filter(|e| matches!(e, Ev::Submit(..))).count();
        assert_eq!(acquires, 6);
        assert_eq!(submits, 6);
        for frame in gpu.events.split(|e| matches!(e, Ev::Present(..))) {
            let a = frame.iter().position(|e| matches!(e, Ev::Acquire(_)));
            let s = frame.iter().position(|e| matches!(e, Ev::Submit(..)));
            if let (Some(a), Some(s)) = (a, s) {
                assert!(a < s);
            }
        }
    }

    #[test]
    fn out_of_date_acquire_rebuilds_and_keeps_slot() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.acquire_script.push_back(Acquired::OutOfDate);
        let mut pacer = FramePacer::new(2, 3);

        let out = pacer.draw_frame(&mut gpu).unwrap();
        assert_eq!(
            out,
            FrameOutcome::Skipped {
                reason: RebuildFlags::OUT_OF_DATE
            }
        );
        assert_eq!(pacer.current_slot(), 0);
        assert_eq!(gpu.events, vec![Ev::Wait(0), Ev::Acquire(0), Ev::Rebuild]);

        // the fence was never reset, so the retry on the same slot proceeds
        let out = pacer.draw_frame(&mut gpu).unwrap();
        assert!(matches!(out, FrameOutcome::Presented { slot: 0, .. }));
        assert_eq!(pacer.current_slot(), 1);
    }

    #[test]
    fn suboptimal_present_rebuilds_before_next_record() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.present_script.push_back(Presented::Suboptimal);
        let mut pacer = FramePacer::new(2, 3);

        let first = pacer.draw_frame(&mut gpu).unwrap();
        assert_eq!(
            first,
            FrameOutcome::Presented {
                slot: 0,
                image: 0,
                rebuilt: true
            }
        );
        pacer.draw_frame(&mut gpu).unwrap();

        let rebuild = gpu.position(Ev::Rebuild).unwrap();
        let present = gpu.position(Ev::Present(0, 0)).unwrap();
        let next_record = gpu.position(Ev::Record(1, 0)).unwrap();
        assert!(present < rebuild && rebuild < next_record);
        assert!(pacer.pending().is_empty());
    }

    #[test]
    fn out_of_date_present_still_advances_slot() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.present_script.push_back(Presented::OutOfDate);
        let mut pacer = FramePacer::new(2, 3);

        let out = pacer.draw_frame(&mut gpu).unwrap();
        assert!(matches!(out, FrameOutcome::Presented { rebuilt: true, .. }));
        assert_eq!(pacer.current_slot(), 1);
        assert_eq!(gpu.count(Ev::Rebuild), 1);
    }

    #[test]
    fn suboptimal_acquire_draws_then_rebuilds() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.acquire_script.push_back(Acquired::Image {
            index: 1,
            suboptimal: true,
        });
        let mut pacer = FramePacer::new(2, 3);

        let out = pacer.draw_frame(&mut gpu).unwrap();
        assert_eq!(
            out,
            FrameOutcome::Presented {
                slot: 0,
                image: 1,
                rebuilt: true
            }
        );
        let submit = gpu.position(Ev::Submit(0, 1)).unwrap();
        let rebuild = gpu.position(Ev::Rebuild).unwrap();
        assert!(submit < rebuild);
    }

    #[test]
    fn resize_request_rebuilds_after_present() {
        let mut gpu = MockGpu::new(2, 3);
        let mut pacer = FramePacer::new(2, 3);
        pacer.draw_frame(&mut gpu).unwrap();

        pacer.request_rebuild(RebuildFlags::RESIZED);
        assert_eq!(pacer.pending(), RebuildFlags::RESIZED);
        let out = pacer.draw_frame(&mut gpu).unwrap();
        assert!(matches!(out, FrameOutcome::Presented { slot: 1, rebuilt: true, .. }));
        assert_eq!(gpu.events.last(), Some(&Ev::Rebuild));
        assert!(pacer.pending().is_empty());
    }

    #[test]
    fn image_held_by_other_slot_waits_on_that_slot() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.acquire_script.push_back(Acquired::Image {
            index: 2,
            suboptimal: false,
        });
        gpu.acquire_script.push_back(Acquired::Image {
            index: 2,
            suboptimal: false,
        });
        let mut pacer = FramePacer::new(2, 3);
        pacer.draw_frame(&mut gpu).unwrap();
        gpu.events.clear();

        pacer.draw_frame(&mut gpu).unwrap();
        assert_eq!(
            &gpu.events[..4],
            &[Ev::Wait(1), Ev::Acquire(1), Ev::Wait(0), Ev::Reset(1)]
        );
    }

    #[test]
    fn rebuild_adopts_new_image_count() {
        let mut gpu = MockGpu::new(2, 2);
        gpu.rebuild_image_count = 4;
        gpu.acquire_script.push_back(Acquired::OutOfDate);
        let mut pacer = FramePacer::new(2, 2);
        pacer.draw_frame(&mut gpu).unwrap();
        assert_eq!(pacer.image_owner.len(), 4);

        for _ in 0..8 {
            pacer.draw_frame(&mut gpu).unwrap();
        }
        assert_eq!(pacer.frames_drawn(), 8);
    }

    /// Neither a fence nor an acquire semaphore may be left waiting on work
    /// that was never submitted.
    fn assert_slot_settled(gpu: &MockGpu, slot: usize) {
        assert!(
            gpu.fence_signaled[slot] || gpu.gpu_busy[slot],
            "slot {slot} fence unsignaled with nothing submitted"
        );
        assert!(!gpu.acquire_signaled[slot], "slot {slot} acquire semaphore left signaled");
    }

    #[test]
    fn failed_record_releases_the_slot() {
        let mut gpu = MockGpu::new(2, 3);
        gpu.fail_record = true;
        let mut pacer = FramePacer::new(2, 3);

        assert!(pacer.draw_frame(&mut gpu).is_err());
        assert_eq!(
            gpu.events,
            vec![
                Ev::Wait(0),
                Ev::Acquire(0),
                Ev::Reset(0),
                Ev::Record(0, 0),
                Ev::Release(0)
            ]
        );
        assert_slot_settled(&gpu, 0);
        assert_eq!(pacer.current_slot(), 0);
        assert_eq!(pacer.frames_drawn(), 0);

        // the same slot draws again without blocking forever
        let out = pacer.draw_frame(&mut gpu).unwrap();
        assert!(matches!(out, FrameOutcome::Presented { slot: 0, .. }));
        assert_eq!(pacer.frames_drawn(), 1);
    }

    #[test]
    fn failed_submit_releases_the_slot() {
        let mut gpu = MockGpu::new(2, 3);
        let mut pacer = FramePacer::new(2, 3);
        pacer.draw_frame(&mut gpu).unwrap();

        gpu.fail_submit = true;
        gpu.events.clear();
        assert!(pacer.draw_frame(&mut gpu).is_err());
        assert_eq!(gpu.count(Ev::Release(1)), 1);
        assert_eq!(gpu.count(Ev::Present(1, 1)), 0);
        assert_slot_settled(&gpu, 1);

        for _ in 0..4 {
            pacer.draw_frame(&mut gpu).unwrap();
        }
        assert_eq!(pacer.frames_drawn(), 5);
    }

    #[test]
    fn successful_frames_never_release() {
        let mut gpu = MockGpu::new(2, 2);
        let mut pacer = FramePacer::new(2, 2);
        for _ in 0..6 {
            pacer.draw_frame(&mut gpu).unwrap();
        }
        assert!(!gpu.events.iter().any(|e| matches!(e, Ev::Release(_))));
    }
}
