// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Transactions. A [KmsUpdate] collects staged changes from arbitrary code;
//! sealing it produces a [SealedUpdate], which can no longer be changed and
//! is handed to the execution engine for exactly one submission.

use std::sync::Arc;

use rustix::io::Errno;

use crate::{
    backend::DrmBackend,
    connector::Connector,
    crtc::{Crtc, GammaRamp},
    fixed::FixedRect,
    mode::ModeInfo,
    page_flip::PageFlipFeedback,
    plane::{Plane, PlaneType},
    KmsError,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AssignPlaneFlags: u32 {
        /// The framebuffer is the one already on the plane, so the plane
        /// doesn't need to be reprogrammed.
        const FB_UNCHANGED = 1 << 0;
    }
}

#[derive(Debug)]
pub struct ConnectorProperty {
    pub connector: Arc<Connector>,
    pub prop_id: u32,
    pub value: u64,
}

#[derive(Debug)]
pub struct ModeSet {
    pub crtc: Arc<Crtc>,
    pub connectors: Vec<Arc<Connector>>,
    /// None turns the CRTC off.
    pub mode: Option<ModeInfo>,
}

#[derive(Debug)]
pub struct CrtcGamma {
    pub crtc: Arc<Crtc>,
    pub ramp: GammaRamp,
}

#[derive(Debug)]
pub struct PlaneAssignment {
    pub crtc: Arc<Crtc>,
    pub plane: Arc<Plane>,
    pub fb_id: u32,
    pub src_rect: FixedRect,
    pub dst_rect: FixedRect,
    pub flags: AssignPlaneFlags,
    pub cursor_hotspot: Option<(i32, i32)>,
    pub plane_properties: Vec<(u32, u64)>,
}

impl PlaneAssignment {
    pub fn set_plane_property(&mut self, prop_id: u32, value: u64) {
        self.plane_properties.push((prop_id, value));
    }

    pub fn set_cursor_hotspot(&mut self, x: i32, y: i32) {
        self.cursor_hotspot = Some((x, y));
    }
}

/// Submits a page flip through some path other than the standard ioctl.
/// The flip must still produce a page flip event on the CRTC.
pub type CustomPageFlipFn = Box<dyn FnOnce(&dyn DrmBackend, &Crtc) -> Result<(), Errno> + Send>;

pub struct PageFlip {
    pub crtc: Arc<Crtc>,
    pub(crate) feedback: Box<dyn PageFlipFeedback>,
    pub(crate) custom: Option<CustomPageFlipFn>,
}

impl std::fmt::Debug for PageFlip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFlip")
            .field("crtc", &self.crtc.id())
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct KmsUpdate {
    connector_properties: Vec<ConnectorProperty>,
    mode_sets: Vec<ModeSet>,
    crtc_gammas: Vec<CrtcGamma>,
    plane_assignments: Vec<PlaneAssignment>,
    page_flips: Vec<PageFlip>,
}

impl KmsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.connector_properties.is_empty()
            && self.mode_sets.is_empty()
            && self.crtc_gammas.is_empty()
            && self.plane_assignments.is_empty()
            && self.page_flips.is_empty()
    }

    pub fn assign_plane(
        &mut self,
        crtc: &Arc<Crtc>,
        plane: &Arc<Plane>,
        fb_id: u32,
        src_rect: FixedRect,
        dst_rect: FixedRect,
        flags: AssignPlaneFlags,
    ) -> &mut PlaneAssignment {
        self.plane_assignments.push(PlaneAssignment {
            crtc: crtc.clone(),
            plane: plane.clone(),
            fb_id,
            src_rect,
            dst_rect,
            flags,
            cursor_hotspot: None,
            plane_properties: Vec::new(),
        });

        let last = self.plane_assignments.len() - 1;
        &mut self.plane_assignments[last]
    }

    /// Detaches any framebuffer from the plane.
    pub fn unassign_plane(
        &mut self,
        crtc: &Arc<Crtc>,
        plane: &Arc<Plane>,
    ) -> &mut PlaneAssignment {
        self.assign_plane(
            crtc,
            plane,
            0,
            FixedRect::default(),
            FixedRect::default(),
            AssignPlaneFlags::empty(),
        )
    }

    pub fn mode_set(
        &mut self,
        crtc: &Arc<Crtc>,
        connectors: Vec<Arc<Connector>>,
        mode: Option<ModeInfo>,
    ) {
        self.mode_sets.push(ModeSet {
            crtc: crtc.clone(),
            connectors,
            mode,
        });
    }

    pub fn set_connector_property(
        &mut self,
        connector: &Arc<Connector>,
        prop_id: u32,
        value: u64,
    ) {
        self.connector_properties.push(ConnectorProperty {
            connector: connector.clone(),
            prop_id,
            value,
        });
    }

    pub fn set_crtc_gamma(&mut self, crtc: &Arc<Crtc>, ramp: GammaRamp) {
        self.crtc_gammas.push(CrtcGamma {
            crtc: crtc.clone(),
            ramp,
        });
    }

    /// Requests a flip to the primary plane's framebuffer. Exactly one of the
    /// feedback's methods will be called on the main context.
    pub fn page_flip(&mut self, crtc: &Arc<Crtc>, feedback: Box<dyn PageFlipFeedback>) {
        self.page_flips.push(PageFlip {
            crtc: crtc.clone(),
            feedback,
            custom: None,
        });
    }

    pub fn custom_page_flip(
        &mut self,
        crtc: &Arc<Crtc>,
        feedback: Box<dyn PageFlipFeedback>,
        func: CustomPageFlipFn,
    ) {
        self.page_flips.push(PageFlip {
            crtc: crtc.clone(),
            feedback,
            custom: Some(func),
        });
    }

    pub fn primary_plane_assignment(&self, crtc: &Crtc) -> Option<&PlaneAssignment> {
        find_primary_plane_assignment(&self.plane_assignments, crtc)
    }

    pub fn seal(self) -> SealedUpdate {
        SealedUpdate { inner: self }
    }
}

fn find_primary_plane_assignment<'a>(
    assignments: &'a [PlaneAssignment],
    crtc: &Crtc,
) -> Option<&'a PlaneAssignment> {
    assignments
        .iter()
        .find(|pa| std::ptr::eq(&*pa.crtc, crtc) && pa.plane.plane_type() == PlaneType::Primary)
}

/// An update that can no longer be modified.
#[derive(Debug)]
pub struct SealedUpdate {
    inner: KmsUpdate,
}

impl SealedUpdate {
    pub fn connector_properties(&self) -> &[ConnectorProperty] {
        &self.inner.connector_properties
    }

    pub fn mode_sets(&self) -> &[ModeSet] {
        &self.inner.mode_sets
    }

    pub fn crtc_gammas(&self) -> &[CrtcGamma] {
        &self.inner.crtc_gammas
    }

    pub fn plane_assignments(&self) -> &[PlaneAssignment] {
        &self.inner.plane_assignments
    }

    pub fn page_flips(&self) -> &[PageFlip] {
        &self.inner.page_flips
    }

    pub fn primary_plane_assignment(&self, crtc: &Crtc) -> Option<&PlaneAssignment> {
        find_primary_plane_assignment(&self.inner.plane_assignments, crtc)
    }

    /// Moves the flip requests out, for the engine to take ownership of.
    pub(crate) fn take_page_flips(&mut self) -> Vec<PageFlip> {
        std::mem::take(&mut self.inner.page_flips)
    }
}

#[derive(Debug, Clone)]
pub struct PlaneFeedback {
    pub plane: Arc<Plane>,
    pub crtc: Arc<Crtc>,
    pub error: KmsError,
}

/// The result of submitting an update.
#[derive(Debug, Clone)]
pub struct KmsFeedback {
    error: Option<KmsError>,
    failed_planes: Vec<PlaneFeedback>,
}

impl KmsFeedback {
    pub(crate) fn passed(failed_planes: Vec<PlaneFeedback>) -> Self {
        Self {
            error: None,
            failed_planes,
        }
    }

    pub(crate) fn failed(failed_planes: Vec<PlaneFeedback>, error: KmsError) -> Self {
        Self {
            error: Some(error),
            failed_planes,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&KmsError> {
        self.error.as_ref()
    }

    pub fn failed_planes(&self) -> &[PlaneFeedback] {
        &self.failed_planes
    }

    pub fn result(&self) -> Result<(), KmsError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
