// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Applies sealed updates using the legacy (non-atomic) ioctls, and tracks
//! every page flip from submission until its outcome is delivered.
//!
//! Flips that the kernel rejects with `EBUSY` are retried once per refresh
//! period of the CRTC's last mode. While any retry is pending, completions
//! for other flips are held back and delivered in arrival order once the
//! retries drain, so that feedback is never reordered around a retry.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time,
};

use rustix::io::Errno;
use tracing::{debug, error, trace, warn};

use crate::{
    backend::ObjectId,
    crtc::Crtc,
    device::DeviceId,
    impl_device::ImplDevice,
    mode::ModeInfo,
    page_flip::PageFlipData,
    plane::PlaneType,
    update::{
        AssignPlaneFlags, ConnectorProperty, CrtcGamma, KmsFeedback, ModeSet, PageFlip,
        PlaneAssignment, PlaneFeedback, SealedUpdate,
    },
    waking_sender::{Callback, WakingSender},
    KmsError,
};

/// Used when the cached mode has no usable refresh rate.
const DEFAULT_RETRY_PERIOD: time::Duration = time::Duration::from_micros(16_667);

type CrtcKey = (DeviceId, u32);

fn crtc_key(crtc: &Crtc) -> CrtcKey {
    (crtc.device_id(), crtc.id())
}

/// The last mode set applied to a CRTC, reused for flip retries and for
/// falling back to a mode set.
#[derive(Debug, Clone)]
struct CachedModeSet {
    connectors: Vec<u32>,
    mode: ModeInfo,
}

#[derive(Debug)]
struct RetryPageFlip {
    crtc: Arc<Crtc>,
    fb_id: u32,
    period: time::Duration,
    retry_at: time::Instant,
    data: PageFlipData,
}

#[derive(Debug)]
enum Postponed {
    Flipped(PageFlipData),
    ModeSetFallback(PageFlipData),
}

#[derive(Debug, Default)]
pub(crate) struct LegacyEngine {
    cached_mode_sets: HashMap<CrtcKey, CachedModeSet>,
    pending_retries: Vec<RetryPageFlip>,
    /// Flips that were replaced by a mode set, waiting for the next idle
    /// dispatch to report it.
    mode_set_fallbacks: Vec<PageFlipData>,
    postponed: VecDeque<Postponed>,
}

fn device_for(devices: &mut [ImplDevice], id: DeviceId) -> Result<&mut ImplDevice, KmsError> {
    devices
        .iter_mut()
        .find(|dev| dev.id() == id)
        .ok_or(KmsError::UnknownDevice(id))
}

fn retry_period(mode: &ModeInfo) -> time::Duration {
    mode.refresh_period().unwrap_or(DEFAULT_RETRY_PERIOD)
}

impl LegacyEngine {
    /// Applies an update. Connector properties, mode sets, and gamma are
    /// applied first, and any failure there fails the whole update. Cursor
    /// failures are reported per plane. Page flips are submitted last.
    pub fn process_update(
        &mut self,
        devices: &mut [ImplDevice],
        update: &mut SealedUpdate,
        callbacks: &WakingSender<Callback>,
        now: time::Instant,
    ) -> KmsFeedback {
        let page_flips = update.take_page_flips();

        if let Err(err) = self.apply_configuration(devices, update) {
            debug!(%err, "update failed");
            let failed_planes = discarded_plane_feedback(update);
            for flip in page_flips {
                PageFlipData::new(flip.crtc, flip.feedback).discard(callbacks, Some(err.clone()));
            }

            return KmsFeedback::failed(failed_planes, err);
        }

        let failed_planes = self.process_plane_assignments(devices, update);

        let mut page_flips = page_flips.into_iter();
        while let Some(flip) = page_flips.next() {
            if let Err(err) = self.process_page_flip(devices, update, flip, callbacks, now) {
                for flip in page_flips {
                    PageFlipData::new(flip.crtc, flip.feedback)
                        .discard(callbacks, Some(err.clone()));
                }

                return KmsFeedback::failed(failed_planes, err);
            }
        }

        KmsFeedback::passed(failed_planes)
    }

    fn apply_configuration(
        &mut self,
        devices: &mut [ImplDevice],
        update: &SealedUpdate,
    ) -> Result<(), KmsError> {
        for prop in update.connector_properties() {
            process_connector_property(devices, prop)?;
        }

        for mode_set in update.mode_sets() {
            self.process_mode_set(devices, update, mode_set)?;
        }

        for gamma in update.crtc_gammas() {
            process_crtc_gamma(devices, gamma)?;
        }

        Ok(())
    }

    fn process_mode_set(
        &mut self,
        devices: &mut [ImplDevice],
        update: &SealedUpdate,
        mode_set: &ModeSet,
    ) -> Result<(), KmsError> {
        let crtc = &mode_set.crtc;
        let device = device_for(devices, crtc.device_id())?;
        let backend = device.backend();

        let Some(mode) = &mode_set.mode else {
            trace!(crtc_id = crtc.id(), "turning off CRTC");
            backend
                .set_crtc(crtc.id(), 0, 0, 0, &[], None)
                .map_err(|errno| KmsError::ModeSetOff {
                    crtc_id: crtc.id(),
                    errno,
                })?;

            self.cached_mode_sets.remove(&crtc_key(crtc));
            return Ok(());
        };

        let assignment = update
            .primary_plane_assignment(crtc)
            .ok_or(KmsError::MissingPrimaryPlaneAssignment(crtc.id()))?;

        if let Some(plane_id) = assignment.plane.id() {
            for (prop_id, value) in &assignment.plane_properties {
                backend
                    .set_property(ObjectId::Plane(plane_id), *prop_id, *value)
                    .map_err(|errno| KmsError::SetProperty {
                        kind: "plane",
                        id: plane_id,
                        prop_id: *prop_id,
                        errno,
                    })?;
            }
        }

        let (x, y) = src_origin(assignment);
        let connectors: Vec<u32> = mode_set.connectors.iter().map(|c| c.id()).collect();

        trace!(crtc_id = crtc.id(), %mode, ?connectors, "setting mode");
        backend
            .set_crtc(crtc.id(), assignment.fb_id, x, y, &connectors, Some(mode))
            .map_err(|errno| KmsError::ModeSet {
                crtc_id: crtc.id(),
                mode: mode.name.clone(),
                errno,
            })?;

        self.cached_mode_sets.insert(
            crtc_key(crtc),
            CachedModeSet {
                connectors,
                mode: mode.clone(),
            },
        );

        Ok(())
    }

    fn process_plane_assignments(
        &mut self,
        devices: &mut [ImplDevice],
        update: &SealedUpdate,
    ) -> Vec<PlaneFeedback> {
        let mut failed = Vec::new();
        for assignment in update.plane_assignments() {
            let res = match assignment.plane.plane_type() {
                // Handled by the mode set or page flip.
                PlaneType::Primary => continue,
                PlaneType::Overlay => Err(KmsError::OverlayUnsupported),
                PlaneType::Cursor => device_for(devices, assignment.crtc.device_id())
                    .and_then(|device| process_cursor(device, assignment)),
            };

            if let Err(error) = res {
                debug!(crtc_id = assignment.crtc.id(), %error, "plane assignment failed");
                failed.push(PlaneFeedback {
                    plane: assignment.plane.clone(),
                    crtc: assignment.crtc.clone(),
                    error,
                });
            }
        }

        failed
    }

    /// Submits one flip. On error, the flip's feedback has already been
    /// told it was discarded.
    fn process_page_flip(
        &mut self,
        devices: &mut [ImplDevice],
        update: &SealedUpdate,
        flip: PageFlip,
        callbacks: &WakingSender<Callback>,
        now: time::Instant,
    ) -> Result<(), KmsError> {
        let PageFlip {
            crtc,
            feedback,
            custom,
        } = flip;

        let data = PageFlipData::new(crtc.clone(), feedback);
        let fb_id = update
            .primary_plane_assignment(&crtc)
            .map(|pa| pa.fb_id)
            .unwrap_or_default();

        let device = match device_for(devices, crtc.device_id()) {
            Ok(device) => device,
            Err(err) => {
                data.discard(callbacks, Some(err.clone()));
                return Err(err);
            }
        };

        let res = match custom {
            Some(func) => func(device.backend(), &crtc),
            None => device.backend().page_flip(crtc.id(), fb_id),
        };

        let err = match res {
            Ok(()) => {
                trace!(crtc_id = crtc.id(), fb_id, "page flip submitted");
                device.push_pending_flip(data);
                return Ok(());
            }
            Err(errno) if errno == Errno::BUSY => {
                match self.cached_mode_sets.get(&crtc_key(&crtc)) {
                    Some(cached) => {
                        let period = retry_period(&cached.mode);
                        debug!(crtc_id = crtc.id(), ?period, "page flip busy, retrying");
                        self.pending_retries.push(RetryPageFlip {
                            crtc,
                            fb_id,
                            period,
                            retry_at: now + period,
                            data,
                        });

                        return Ok(());
                    }
                    None => KmsError::NoModeSetForRetry(crtc.id()),
                }
            }
            Err(errno) if errno == Errno::INVAL => {
                debug!(crtc_id = crtc.id(), "page flip rejected, falling back to mode set");
                match self.mode_set_fallback(device, update, &crtc) {
                    Ok(()) => {
                        self.mode_set_fallbacks.push(data);
                        callbacks.wake();
                        return Ok(());
                    }
                    Err(err) => err,
                }
            }
            Err(errno) => KmsError::PageFlip {
                crtc_id: crtc.id(),
                errno,
            },
        };

        data.discard(callbacks, Some(err.clone()));
        Err(err)
    }

    fn mode_set_fallback(
        &self,
        device: &ImplDevice,
        update: &SealedUpdate,
        crtc: &Crtc,
    ) -> Result<(), KmsError> {
        let cached = self
            .cached_mode_sets
            .get(&crtc_key(crtc))
            .ok_or(KmsError::MissingModeSetForFallback)?;

        let (fb_id, x, y) = match update.primary_plane_assignment(crtc) {
            Some(assignment) => {
                let (x, y) = src_origin(assignment);
                (assignment.fb_id, x, y)
            }
            None => (0, 0, 0),
        };

        device
            .backend()
            .set_crtc(crtc.id(), fb_id, x, y, &cached.connectors, Some(&cached.mode))
            .map_err(|errno| KmsError::ModeSet {
                crtc_id: crtc.id(),
                mode: cached.mode.name.clone(),
                errno,
            })
    }

    /// Called for each page flip event from the kernel.
    pub fn handle_page_flip_callback(
        &mut self,
        data: PageFlipData,
        callbacks: &WakingSender<Callback>,
    ) {
        if self.pending_retries.is_empty() {
            data.flipped(callbacks);
        } else {
            trace!(crtc_id = data.crtc().id(), "postponing page flip feedback");
            self.postponed.push_back(Postponed::Flipped(data));
        }
    }

    /// Resubmits every retry that is due.
    pub fn retry_page_flips(
        &mut self,
        devices: &mut [ImplDevice],
        callbacks: &WakingSender<Callback>,
        now: time::Instant,
    ) {
        let retries = std::mem::take(&mut self.pending_retries);
        for mut retry in retries {
            if retry.retry_at > now {
                self.pending_retries.push(retry);
                continue;
            }

            let device = match device_for(devices, retry.crtc.device_id()) {
                Ok(device) => device,
                Err(err) => {
                    retry.data.discard(callbacks, Some(err));
                    continue;
                }
            };

            match device.backend().page_flip(retry.crtc.id(), retry.fb_id) {
                Ok(()) => {
                    trace!(crtc_id = retry.crtc.id(), "page flip retry submitted");
                    device.push_pending_flip(retry.data);
                }
                Err(errno) if errno == Errno::BUSY => {
                    // The mode may have changed since the flip was first
                    // submitted.
                    if let Some(cached) = self.cached_mode_sets.get(&crtc_key(&retry.crtc)) {
                        retry.period = retry_period(&cached.mode);
                    }

                    retry.retry_at += retry.period;
                    self.pending_retries.push(retry);
                }
                Err(errno) => {
                    let err = KmsError::PageFlip {
                        crtc_id: retry.crtc.id(),
                        errno,
                    };

                    // EPERM means we lost DRM master, which is expected on
                    // VT switch.
                    if errno != Errno::PERM {
                        error!(%err, "failed to retry page flip");
                    }

                    retry.data.discard(callbacks, Some(err));
                }
            }
        }

        if self.pending_retries.is_empty() {
            self.flush_postponed(callbacks);
        }
    }

    /// When the next retry is due, if any are pending.
    pub fn next_retry_deadline(&self) -> Option<time::Instant> {
        self.pending_retries.iter().map(|r| r.retry_at).min()
    }

    /// Drops all pending retries, reporting them as discarded.
    pub fn discard_pending_page_flips(&mut self, callbacks: &WakingSender<Callback>) {
        for retry in self.pending_retries.drain(..) {
            trace!(crtc_id = retry.crtc.id(), "discarding page flip retry");
            retry.data.discard(callbacks, None);
        }

        self.flush_postponed(callbacks);
    }

    /// Reports mode set fallbacks from earlier updates.
    pub fn dispatch_idle(&mut self, callbacks: &WakingSender<Callback>) {
        let fallbacks = std::mem::take(&mut self.mode_set_fallbacks);
        for data in fallbacks {
            if self.pending_retries.is_empty() {
                data.mode_set_fallback(callbacks);
            } else {
                self.postponed.push_back(Postponed::ModeSetFallback(data));
            }
        }
    }

    fn flush_postponed(&mut self, callbacks: &WakingSender<Callback>) {
        for postponed in self.postponed.drain(..) {
            match postponed {
                Postponed::Flipped(data) => data.flipped(callbacks),
                Postponed::ModeSetFallback(data) => data.mode_set_fallback(callbacks),
            }
        }
    }

    /// Adds a fake cursor plane to every CRTC that lacks a real one, since
    /// the legacy cursor ioctls work on any CRTC.
    pub fn notify_device_created(&mut self, device: &mut ImplDevice) {
        let crtcs = device.crtcs().to_vec();
        for crtc in crtcs {
            if !device.has_plane_for(&crtc, PlaneType::Cursor) {
                device.add_fake_plane(PlaneType::Cursor, &crtc);
            }
        }
    }

    /// Forgets everything related to a device that is going away. Any flips
    /// still in flight are discarded.
    pub fn notify_device_removed(
        &mut self,
        device: &mut ImplDevice,
        callbacks: &WakingSender<Callback>,
    ) {
        let id = device.id();
        self.cached_mode_sets.retain(|(dev, _), _| *dev != id);

        let (removed, kept) = std::mem::take(&mut self.pending_retries)
            .into_iter()
            .partition::<Vec<_>, _>(|r| r.crtc.device_id() == id);
        self.pending_retries = kept;

        let (fallbacks, kept) = std::mem::take(&mut self.mode_set_fallbacks)
            .into_iter()
            .partition::<Vec<_>, _>(|data| data.crtc().device_id() == id);
        self.mode_set_fallbacks = kept;

        let discarded = removed
            .into_iter()
            .map(|r| r.data)
            .chain(fallbacks)
            .chain(device.take_pending_flips());

        for data in discarded {
            data.discard(callbacks, None);
        }

        if self.pending_retries.is_empty() {
            self.flush_postponed(callbacks);
        }
    }
}

fn src_origin(assignment: &PlaneAssignment) -> (u32, u32) {
    (
        assignment.src_rect.x.to_int().max(0) as u32,
        assignment.src_rect.y.to_int().max(0) as u32,
    )
}

fn process_connector_property(
    devices: &mut [ImplDevice],
    prop: &ConnectorProperty,
) -> Result<(), KmsError> {
    let connector = &prop.connector;
    let device = device_for(devices, connector.device_id())?;

    trace!(
        connector = connector.name(),
        prop_id = prop.prop_id,
        value = prop.value,
        "setting connector property"
    );

    device
        .backend()
        .set_property(ObjectId::Connector(connector.id()), prop.prop_id, prop.value)
        .map_err(|errno| KmsError::SetProperty {
            kind: "connector",
            id: connector.id(),
            prop_id: prop.prop_id,
            errno,
        })
}

fn process_crtc_gamma(devices: &mut [ImplDevice], gamma: &CrtcGamma) -> Result<(), KmsError> {
    let crtc = &gamma.crtc;
    let device = device_for(devices, crtc.device_id())?;

    trace!(crtc_id = crtc.id(), size = gamma.ramp.size(), "setting gamma");
    device
        .backend()
        .set_gamma(crtc.id(), &gamma.ramp)
        .map_err(|errno| KmsError::Gamma {
            crtc_id: crtc.id(),
            errno,
        })
}

fn process_cursor(device: &ImplDevice, assignment: &PlaneAssignment) -> Result<(), KmsError> {
    let backend = device.backend();
    let crtc_id = assignment.crtc.id();

    if !assignment.flags.contains(AssignPlaneFlags::FB_UNCHANGED) {
        let width = assignment.dst_rect.width.to_int().max(0) as u32;
        let height = assignment.dst_rect.height.to_int().max(0) as u32;
        let handle = assignment.fb_id;

        let res = match assignment.cursor_hotspot {
            Some((hot_x, hot_y)) => backend
                .set_cursor2(crtc_id, handle, width, height, hot_x, hot_y)
                .or_else(|_| backend.set_cursor(crtc_id, handle, width, height)),
            None => backend.set_cursor(crtc_id, handle, width, height),
        };

        res.map_err(KmsError::Cursor)?;
    }

    let x = assignment.dst_rect.x.to_int();
    let y = assignment.dst_rect.y.to_int();
    if let Err(errno) = backend.move_cursor(crtc_id, x, y) {
        warn!(crtc_id, %errno, "failed to move cursor");
    }

    Ok(())
}

fn discarded_plane_feedback(update: &SealedUpdate) -> Vec<PlaneFeedback> {
    update
        .plane_assignments()
        .iter()
        .filter(|pa| pa.plane.plane_type() != PlaneType::Primary)
        .map(|pa| PlaneFeedback {
            plane: pa.plane.clone(),
            crtc: pa.crtc.clone(),
            error: KmsError::Discarded,
        })
        .collect()
}
