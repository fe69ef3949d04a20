// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The kernel DRM/KMS surface the rest of the crate is written against.
//!
//! Every method maps onto one legacy ioctl (or one libdrm-style query) and
//! reports failures as the raw [Errno], so that callers can react to `EBUSY`
//! and `EINVAL` specifically. [crate::drm::DrmDevice] implements this over a
//! real device node.

use std::{os::fd::RawFd, path::Path, time};

use rustix::io::Errno;

use crate::{crtc::GammaRamp, mode::ModeInfo, KmsError};

pub type BackendResult<T> = Result<T, Errno>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Connector(u32),
    Crtc(u32),
    Plane(u32),
}

impl ObjectId {
    pub fn id(&self) -> u32 {
        match self {
            ObjectId::Connector(id) | ObjectId::Crtc(id) | ObjectId::Plane(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ObjectId::Connector(_) => "connector",
            ObjectId::Crtc(_) => "CRTC",
            ObjectId::Plane(_) => "plane",
        }
    }
}

/// Object ids in enumeration order. The position of a CRTC or encoder in
/// these lists is its index for possible-CRTC and clone bitmasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: Connection,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub modes: Vec<ModeInfo>,
    pub encoders: Vec<u32>,
    /// The current encoder, or zero.
    pub encoder_id: u32,
    /// Property ids and their current values.
    pub props: Vec<(u32, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    /// Set if a mode is currently programmed.
    pub mode: Option<ModeInfo>,
    pub gamma_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: u32,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEnum {
    pub name: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Range { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    Enum(Vec<PropertyEnum>),
    Bitmask(Vec<PropertyEnum>),
    Blob,
    Object,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: u32,
    pub name: String,
    pub kind: PropertyKind,
}

impl PropertyInfo {
    pub fn is_range(&self) -> bool {
        matches!(self.kind, PropertyKind::Range { .. })
    }

    pub fn is_enum(&self) -> bool {
        matches!(self.kind, PropertyKind::Enum(_))
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.kind, PropertyKind::Blob)
    }

    /// Looks up the name of an enum or bitmask entry by value.
    pub fn enum_name(&self, value: u64) -> Option<&str> {
        match &self.kind {
            PropertyKind::Enum(values) | PropertyKind::Bitmask(values) => values
                .iter()
                .find(|v| v.value == value)
                .map(|v| v.name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmEvent {
    PageFlip {
        crtc_id: u32,
        sequence: u32,
        sec: u32,
        usec: u32,
    },
}

pub trait DrmBackend: Send {
    /// The fd to watch for readability, if there is one.
    fn raw_fd(&self) -> Option<RawFd>;

    fn enable_universal_planes(&self) -> BackendResult<()>;
    /// The maximum cursor size supported by the driver, if it reports one.
    fn cursor_size(&self) -> Option<(u64, u64)>;

    fn resources(&self) -> BackendResult<Resources>;
    fn plane_ids(&self) -> BackendResult<Vec<u32>>;
    fn connector(&self, id: u32, force_probe: bool) -> BackendResult<ConnectorInfo>;
    fn encoder(&self, id: u32) -> BackendResult<EncoderInfo>;
    fn crtc(&self, id: u32) -> BackendResult<CrtcInfo>;
    fn plane(&self, id: u32) -> BackendResult<PlaneInfo>;

    fn object_properties(&self, object: ObjectId) -> BackendResult<Vec<(u32, u64)>>;
    fn property(&self, id: u32) -> BackendResult<PropertyInfo>;
    fn property_blob(&self, blob_id: u32) -> BackendResult<Vec<u8>>;
    fn set_property(&self, object: ObjectId, prop_id: u32, value: u64) -> BackendResult<()>;

    /// Programs a CRTC. A `None` mode turns the CRTC off.
    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> BackendResult<()>;
    fn gamma(&self, crtc_id: u32, size: usize) -> BackendResult<GammaRamp>;
    fn set_gamma(&self, crtc_id: u32, ramp: &GammaRamp) -> BackendResult<()>;

    fn set_cursor2(
        &self,
        crtc_id: u32,
        handle: u32,
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> BackendResult<()>;
    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> BackendResult<()>;
    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> BackendResult<()>;

    /// Schedules a flip, requesting a completion event.
    fn page_flip(&self, crtc_id: u32, fb_id: u32) -> BackendResult<()>;

    /// Reads pending events without blocking. Returns `EAGAIN` if there are
    /// none.
    fn read_events(&self) -> BackendResult<Vec<DrmEvent>>;
    /// Blocks until the device is readable, or the timeout expires. Returns
    /// false on timeout.
    fn wait_readable(&self, timeout: time::Duration) -> BackendResult<bool>;
}

/// Opens and closes device nodes on behalf of the coordinator, which never
/// touches device paths itself.
pub trait Launcher {
    fn open_restricted(&self, path: &Path) -> Result<Box<dyn DrmBackend>, KmsError>;
    fn close_restricted(&self, backend: Box<dyn DrmBackend>);
}
