use crate::signal::Batch;

/// Fixed-depth jitter buffer: plays decoded batches back one frame per tick.
///
/// A batch that arrives while the current one is still playing waits in a
/// single pending slot and takes over only after the current batch's last
/// frame. If no new batch arrives, playback stalls on the finished one.
#[derive(Debug, Default)]
pub struct PlaybackBuffer {
    current: Option<Batch>,
    pending: Option<Batch>,
    spent: Option<Batch>,
    frame: usize,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `batch` behind the one playing. Returns an unplayed batch it displaced.
    pub fn offer(&mut self, batch: Batch) -> Option<Batch> {
        self.pending.replace(batch)
    }

    /// Next frame to play, or `None` when stalled.
    pub fn advance(&mut self) -> Option<(&Batch, usize)> {
        let exhausted = self
            .current
            .as_ref()
            .is_none_or(|batch| self.frame >= batch.shape().frames);
        if exhausted && let Some(next) = self.pending.take() {
            if let Some(done) = self.current.replace(next) {
                self.spent = Some(done);
            }
            self.frame = 0;
        }

        let batch = self.current.as_ref()?;
        if self.frame >= batch.shape().frames {
            return None;
        }
        let frame = self.frame;
        self.frame += 1;
        Some((batch, frame))
    }

    /// Take back the batch that finished playing, for reuse as scratch.
    pub fn reclaim(&mut self) -> Option<Batch> {
        self.spent.take()
    }

    /// Frames of the current batch not yet played.
    pub fn remaining(&self) -> usize {
        self.current
            .as_ref()
            .map_or(0, |batch| batch.shape().frames.saturating_sub(self.frame))
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
