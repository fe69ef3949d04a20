// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{
    os::fd::RawFd,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    connector::Connector,
    crtc::Crtc,
    plane::{Plane, PlaneType},
};

/// Identifies a device for the lifetime of the coordinator. Entities refer
/// back to their device by id, never by ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kms-device-{}", self.0)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// The GPU the firmware initialized the console on.
        const BOOT_VGA = 1 << 0;
        const PLATFORM_DEVICE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub cursor_width: Option<u64>,
    pub cursor_height: Option<u64>,
}

/// A copy of an impl device's entity lists, taken inside the impl context.
#[derive(Debug, Clone)]
pub(crate) struct DeviceSnapshot {
    pub raw_fd: Option<RawFd>,
    pub caps: DeviceCaps,
    pub connectors: Vec<Arc<Connector>>,
    pub crtcs: Vec<Arc<Crtc>>,
    pub planes: Vec<Arc<Plane>>,
}

/// The main-context view of a GPU. The entity lists are snapshots, replaced
/// wholesale whenever the device's resources are refreshed.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    path: PathBuf,
    flags: DeviceFlags,
    caps: DeviceCaps,

    connectors: Vec<Arc<Connector>>,
    crtcs: Vec<Arc<Crtc>>,
    planes: Vec<Arc<Plane>>,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        path: PathBuf,
        flags: DeviceFlags,
        snapshot: DeviceSnapshot,
    ) -> Self {
        Self {
            id,
            path,
            flags,
            caps: snapshot.caps,
            connectors: snapshot.connectors,
            crtcs: snapshot.crtcs,
            planes: snapshot.planes,
        }
    }

    pub(crate) fn update_states(&mut self, snapshot: DeviceSnapshot) {
        self.connectors = snapshot.connectors;
        self.crtcs = snapshot.crtcs;
        self.planes = snapshot.planes;
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    pub fn connectors(&self) -> &[Arc<Connector>] {
        &self.connectors
    }

    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.crtcs
    }

    pub fn planes(&self) -> &[Arc<Plane>] {
        &self.planes
    }

    pub fn connector_by_name(&self, name: &str) -> Option<&Arc<Connector>> {
        self.connectors.iter().find(|c| c.name() == name)
    }

    pub fn primary_plane_for(&self, crtc: &Crtc) -> Option<&Arc<Plane>> {
        find_plane_for(&self.planes, crtc, PlaneType::Primary)
    }

    pub fn cursor_plane_for(&self, crtc: &Crtc) -> Option<&Arc<Plane>> {
        find_plane_for(&self.planes, crtc, PlaneType::Cursor)
    }
}

pub(crate) fn find_plane_for<'a>(
    planes: &'a [Arc<Plane>],
    crtc: &Crtc,
    plane_type: PlaneType,
) -> Option<&'a Arc<Plane>> {
    planes
        .iter()
        .find(|p| p.plane_type() == plane_type && p.is_usable_with(crtc))
}
