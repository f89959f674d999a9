//! Capture orchestration: the analysis guard, cancellation-aware descriptor
//! extraction and the deduplicating sample set.

use presence_core::{AnalysisError, Descriptor, DescriptorService, Sample, StillImage};
use presence_hw::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Whether analysis failures reach the user.
///
/// Automatic enrollment ticks are `Silent`; manual taps and verification
/// captures are `Surfaced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Silent,
    Surfaced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Descriptor(Descriptor),
    Rejected(AnalysisError),
    /// The session closed before extraction finished; the result was dropped.
    Cancelled,
}

/// Held while one descriptor extraction runs. Dropping it clears the guard.
pub struct AnalysisTicket<'a> {
    busy: &'a AtomicBool,
}

impl Drop for AnalysisTicket<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Turns stills into descriptors, one extraction at a time per capture slot.
pub struct CaptureOrchestrator {
    descriptors: DescriptorService,
    busy: AtomicBool,
}

impl CaptureOrchestrator {
    pub fn new(descriptors: DescriptorService) -> Self {
        Self {
            descriptors,
            busy: AtomicBool::new(false),
        }
    }

    pub fn descriptors(&self) -> &DescriptorService {
        &self.descriptors
    }

    pub fn is_analyzing(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim the slot. Returns `None` while another extraction is in flight.
    pub fn begin(&self) -> Option<AnalysisTicket<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| AnalysisTicket { busy: &self.busy })
    }

    /// Extract a descriptor unless `cancel` fires first.
    ///
    /// The ticket proves the caller holds the slot.
    pub async fn analyze(
        &self,
        _ticket: &AnalysisTicket<'_>,
        image: &StillImage,
        cancel: &CancellationToken,
    ) -> AnalysisOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => AnalysisOutcome::Cancelled,
            result = self.descriptors.compute_descriptor(image) => {
                if cancel.is_cancelled() {
                    return AnalysisOutcome::Cancelled;
                }
                match result {
                    Ok(descriptor) => AnalysisOutcome::Descriptor(descriptor),
                    Err(e) => AnalysisOutcome::Rejected(e),
                }
            }
        }
    }
}

/// Encode a preview frame into the still representation used for analysis.
pub fn still_from_frame(frame: Frame) -> Result<StillImage, presence_core::StillImageError> {
    StillImage::from_gray(frame.data, frame.width, frame.height)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added { count: usize },
    Duplicate,
    Full,
}

/// Ordered samples with a hard capacity and bit-identical image rejection.
#[derive(Debug)]
pub struct SampleSet {
    samples: Vec<Sample>,
    capacity: usize,
}

impl SampleSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn admit(&mut self, sample: Sample) -> Admission {
        if self.contains_image(&sample.image) {
            return Admission::Duplicate;
        }
        if self.is_full() {
            return Admission::Full;
        }
        self.samples.push(sample);
        Admission::Added {
            count: self.samples.len(),
        }
    }

    pub fn contains_image(&self, image: &StillImage) -> bool {
        self.samples.iter().any(|s| s.image.same_bytes(image))
    }

    pub fn pop(&mut self) -> Option<Sample> {
        self.samples.pop()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Full and every sample carries a descriptor.
    pub fn is_complete(&self) -> bool {
        self.is_full() && self.samples.iter().all(Sample::is_analyzed)
    }

    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }
}
