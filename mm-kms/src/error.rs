// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{path::PathBuf, sync::Arc};

use rustix::io::Errno;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KmsError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: Arc<std::io::Error>,
    },
    #[error("Failed to activate universal planes: {0}")]
    UniversalPlanes(Errno),
    #[error("failed to query DRM resources: {0}")]
    Resources(Errno),
    #[error("failed to query {kind} {id}: {errno}")]
    Query {
        kind: &'static str,
        id: u32,
        errno: Errno,
    },
    #[error("failed to set property {prop_id} on {kind} {id}: {errno}")]
    SetProperty {
        kind: &'static str,
        id: u32,
        prop_id: u32,
        errno: Errno,
    },
    #[error("Missing primary plane assignment for legacy mode set on CRTC {0}")]
    MissingPrimaryPlaneAssignment(u32),
    #[error("drmModeSetCrtc mode '{mode}' on CRTC {crtc_id} failed: {errno}")]
    ModeSet {
        crtc_id: u32,
        mode: String,
        errno: Errno,
    },
    #[error("drmModeSetCrtc (off) on CRTC {crtc_id} failed: {errno}")]
    ModeSetOff { crtc_id: u32, errno: Errno },
    #[error("drmModeCrtcSetGamma on CRTC {crtc_id} failed: {errno}")]
    Gamma { crtc_id: u32, errno: Errno },
    #[error("drmModeSetCursor failed: {0}")]
    Cursor(Errno),
    #[error("Overlay planes cannot be assigned")]
    OverlayUnsupported,
    #[error("Missing mode set for page flip fallback")]
    MissingModeSetForFallback,
    #[error("Page flip of {0} failed, and no mode set available")]
    NoModeSetForRetry(u32),
    #[error("drmModePageFlip on CRTC {crtc_id} failed: {errno}")]
    PageFlip { crtc_id: u32, errno: Errno },
    #[error("Discarded")]
    Discarded,
    #[error("failed to dispatch DRM events: {0}")]
    Dispatch(Errno),
    #[error("timed out waiting for DRM events")]
    DispatchTimeout,
    #[error("unknown device {0:?}")]
    UnknownDevice(crate::DeviceId),
    #[error("unexpected OS error: {0}")]
    Io(#[from] Arc<std::io::Error>),
}

// In order to let KmsError implement Clone, we wrap io::Error in Arc; this
// keeps the ? operator working for plain io::Error.
impl From<std::io::Error> for KmsError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl KmsError {
    /// The kernel error behind this failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::UniversalPlanes(errno)
            | Self::Resources(errno)
            | Self::Cursor(errno)
            | Self::Dispatch(errno) => Some(*errno),
            Self::Query { errno, .. }
            | Self::SetProperty { errno, .. }
            | Self::ModeSet { errno, .. }
            | Self::ModeSetOff { errno, .. }
            | Self::Gamma { errno, .. }
            | Self::PageFlip { errno, .. } => Some(*errno),
            Self::Open { source, .. } | Self::Io(source) => Errno::from_io_error(source),
            _ => None,
        }
    }
}
