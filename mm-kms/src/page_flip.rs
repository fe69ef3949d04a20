// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use tracing::debug;

use crate::{
    crtc::Crtc,
    waking_sender::{Callback, WakingSender},
    KmsError,
};

/// Receives the outcome of a requested page flip. Exactly one method is
/// called per request, on the main context.
pub trait PageFlipFeedback: Send {
    fn flipped(self: Box<Self>, crtc: &Arc<Crtc>, sequence: u32, sec: u32, usec: u32);
    /// The flip was rejected, and the frame was shown using a full mode set
    /// instead.
    fn mode_set_fallback(self: Box<Self>, crtc: &Arc<Crtc>);
    /// The flip never happened. The error is None if it was explicitly
    /// discarded.
    fn discarded(self: Box<Self>, crtc: &Arc<Crtc>, error: Option<&KmsError>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageFlipOutcome {
    Flipped { sequence: u32, sec: u32, usec: u32 },
    ModeSetFallback,
    Discarded(Option<String>),
}

impl<F> PageFlipFeedback for F
where
    F: FnOnce(&Arc<Crtc>, PageFlipOutcome) + Send,
{
    fn flipped(self: Box<Self>, crtc: &Arc<Crtc>, sequence: u32, sec: u32, usec: u32) {
        (*self)(
            crtc,
            PageFlipOutcome::Flipped {
                sequence,
                sec,
                usec,
            },
        )
    }

    fn mode_set_fallback(self: Box<Self>, crtc: &Arc<Crtc>) {
        (*self)(crtc, PageFlipOutcome::ModeSetFallback)
    }

    fn discarded(self: Box<Self>, crtc: &Arc<Crtc>, error: Option<&KmsError>) {
        (*self)(crtc, PageFlipOutcome::Discarded(error.map(|e| e.to_string())))
    }
}

/// One requested flip, in flight. Owned by whichever engine queue it is
/// waiting in, and consumed when its outcome is delivered.
pub(crate) struct PageFlipData {
    crtc: Arc<Crtc>,
    feedback: Box<dyn PageFlipFeedback>,
    timings: (u32, u32, u32),
}

impl std::fmt::Debug for PageFlipData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFlipData")
            .field("crtc", &self.crtc.id())
            .field("timings", &self.timings)
            .finish()
    }
}

impl PageFlipData {
    pub fn new(crtc: Arc<Crtc>, feedback: Box<dyn PageFlipFeedback>) -> Self {
        Self {
            crtc,
            feedback,
            timings: (0, 0, 0),
        }
    }

    pub fn crtc(&self) -> &Arc<Crtc> {
        &self.crtc
    }

    pub fn set_timings(&mut self, sequence: u32, sec: u32, usec: u32) {
        self.timings = (sequence, sec, usec);
    }

    pub fn flipped(self, callbacks: &WakingSender<Callback>) {
        let Self {
            crtc,
            feedback,
            timings: (sequence, sec, usec),
        } = self;

        queue(callbacks, move || {
            feedback.flipped(&crtc, sequence, sec, usec)
        });
    }

    pub fn mode_set_fallback(self, callbacks: &WakingSender<Callback>) {
        let Self { crtc, feedback, .. } = self;
        queue(callbacks, move || feedback.mode_set_fallback(&crtc));
    }

    pub fn discard(self, callbacks: &WakingSender<Callback>, error: Option<KmsError>) {
        let Self { crtc, feedback, .. } = self;
        queue(callbacks, move || feedback.discarded(&crtc, error.as_ref()));
    }
}

fn queue(callbacks: &WakingSender<Callback>, f: impl FnOnce() + Send + 'static) {
    if callbacks.send(Box::new(f)).is_err() {
        debug!("main context is gone, dropping page flip feedback");
    }
}
