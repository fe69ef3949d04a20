// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
    sync::Arc,
    time,
};

use drm::{control::Device as _, Device as _};
use drm_ffi as ffi;
use rustix::io::Errno;
use tracing::trace;

use crate::{
    backend::*,
    crtc::GammaRamp,
    mode::ModeInfo,
    KmsError,
};

fn errno(err: io::Error) -> Errno {
    Errno::from_io_error(&err).unwrap_or(Errno::IO)
}

/// An open DRM device node.
pub struct DrmDevice(File);

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for DrmDevice {}
impl drm::control::Device for DrmDevice {}

impl DrmDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KmsError> {
        let path = path.as_ref();

        let mut options = OpenOptions::new();
        options.read(true);
        options.write(true);
        options.custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK);

        let file = options.open(path).map_err(|err| KmsError::Open {
            path: path.to_owned(),
            source: Arc::new(err),
        })?;

        Ok(Self(file))
    }
}

fn mode_from_ffi(info: &ffi::drm_mode_modeinfo) -> ModeInfo {
    let name: Vec<u8> = info
        .name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();

    ModeInfo {
        clock: info.clock,
        hdisplay: info.hdisplay,
        hsync_start: info.hsync_start,
        hsync_end: info.hsync_end,
        htotal: info.htotal,
        hskew: info.hskew,
        vdisplay: info.vdisplay,
        vsync_start: info.vsync_start,
        vsync_end: info.vsync_end,
        vtotal: info.vtotal,
        vscan: info.vscan,
        vrefresh: info.vrefresh,
        flags: info.flags,
        mode_type: info.type_,
        name: String::from_utf8_lossy(&name).into_owned(),
    }
}

fn mode_to_ffi(mode: &ModeInfo) -> ffi::drm_mode_modeinfo {
    let mut info = ffi::drm_mode_modeinfo {
        clock: mode.clock,
        hdisplay: mode.hdisplay,
        hsync_start: mode.hsync_start,
        hsync_end: mode.hsync_end,
        htotal: mode.htotal,
        hskew: mode.hskew,
        vdisplay: mode.vdisplay,
        vsync_start: mode.vsync_start,
        vsync_end: mode.vsync_end,
        vtotal: mode.vtotal,
        vscan: mode.vscan,
        vrefresh: mode.vrefresh,
        flags: mode.flags,
        type_: mode.mode_type,
        ..Default::default()
    };

    // Leave room for the terminator.
    let len = mode.name.len().min(info.name.len() - 1);
    for (dst, src) in info.name.iter_mut().zip(&mode.name.as_bytes()[..len]) {
        *dst = *src as _;
    }

    info
}

fn c_str(name: &[std::ffi::c_char]) -> String {
    let bytes: Vec<u8> = name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn object_type(object: ObjectId) -> u32 {
    match object {
        ObjectId::Connector(_) => ffi::DRM_MODE_OBJECT_CONNECTOR,
        ObjectId::Crtc(_) => ffi::DRM_MODE_OBJECT_CRTC,
        ObjectId::Plane(_) => ffi::DRM_MODE_OBJECT_PLANE,
    }
}

impl DrmBackend for DrmDevice {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.0.as_raw_fd())
    }

    fn enable_universal_planes(&self) -> BackendResult<()> {
        self.set_client_capability(drm::ClientCapability::UniversalPlanes, true)
            .map_err(errno)
    }

    fn cursor_size(&self) -> Option<(u64, u64)> {
        let width = self
            .get_driver_capability(drm::DriverCapability::CursorWidth)
            .ok()?;
        let height = self
            .get_driver_capability(drm::DriverCapability::CursorHeight)
            .ok()?;

        Some((width, height))
    }

    fn resources(&self) -> BackendResult<Resources> {
        let mut res = Resources::default();
        ffi::mode::get_resources(
            self.as_fd(),
            None,
            Some(&mut res.crtcs),
            Some(&mut res.connectors),
            Some(&mut res.encoders),
        )
        .map_err(errno)?;

        Ok(res)
    }

    fn plane_ids(&self) -> BackendResult<Vec<u32>> {
        let mut planes = Vec::new();
        ffi::mode::get_plane_resources(self.as_fd(), Some(&mut planes)).map_err(errno)?;
        Ok(planes)
    }

    fn connector(&self, id: u32, force_probe: bool) -> BackendResult<ConnectorInfo> {
        let mut props = Vec::new();
        let mut values = Vec::new();
        let mut modes = Vec::new();
        let mut encoders = Vec::new();

        let info = ffi::mode::get_connector(
            self.as_fd(),
            id,
            Some(&mut props),
            Some(&mut values),
            Some(&mut modes),
            Some(&mut encoders),
            force_probe,
        )
        .map_err(errno)?;

        let connection = match info.connection {
            1 => Connection::Connected,
            2 => Connection::Disconnected,
            _ => Connection::Unknown,
        };

        Ok(ConnectorInfo {
            id,
            connector_type: info.connector_type,
            connector_type_id: info.connector_type_id,
            connection,
            mm_width: info.mm_width,
            mm_height: info.mm_height,
            subpixel: info.subpixel,
            modes: modes.iter().map(mode_from_ffi).collect(),
            encoders,
            encoder_id: info.encoder_id,
            props: props.into_iter().zip(values).collect(),
        })
    }

    fn encoder(&self, id: u32) -> BackendResult<EncoderInfo> {
        let info = ffi::mode::get_encoder(self.as_fd(), id).map_err(errno)?;
        Ok(EncoderInfo {
            id,
            crtc_id: info.crtc_id,
            possible_crtcs: info.possible_crtcs,
            possible_clones: info.possible_clones,
        })
    }

    fn crtc(&self, id: u32) -> BackendResult<CrtcInfo> {
        let info = ffi::mode::get_crtc(self.as_fd(), id).map_err(errno)?;
        Ok(CrtcInfo {
            id,
            fb_id: info.fb_id,
            x: info.x,
            y: info.y,
            mode: (info.mode_valid != 0).then(|| mode_from_ffi(&info.mode)),
            gamma_size: info.gamma_size,
        })
    }

    fn plane(&self, id: u32) -> BackendResult<PlaneInfo> {
        let mut formats = Vec::new();
        let info = ffi::mode::get_plane(self.as_fd(), id, Some(&mut formats)).map_err(errno)?;
        Ok(PlaneInfo {
            id,
            possible_crtcs: info.possible_crtcs,
            formats,
        })
    }

    fn object_properties(&self, object: ObjectId) -> BackendResult<Vec<(u32, u64)>> {
        let mut props = Vec::new();
        let mut values = Vec::new();
        ffi::mode::get_properties(
            self.as_fd(),
            object.id(),
            object_type(object),
            Some(&mut props),
            Some(&mut values),
        )
        .map_err(errno)?;

        Ok(props.into_iter().zip(values).collect())
    }

    fn property(&self, id: u32) -> BackendResult<PropertyInfo> {
        let mut values = Vec::new();
        let mut enums = Vec::new();
        let info = ffi::mode::get_property(self.as_fd(), id, Some(&mut values), Some(&mut enums))
            .map_err(errno)?;

        let enum_values = || {
            enums
                .iter()
                .map(|e| PropertyEnum {
                    name: c_str(&e.name),
                    value: e.value,
                })
                .collect()
        };

        let range = |values: &[u64]| match values {
            [min, max, ..] => (*min, *max),
            _ => (0, 0),
        };

        let extended = info.flags & ffi::DRM_MODE_PROP_EXTENDED_TYPE;
        let kind = if info.flags & ffi::DRM_MODE_PROP_RANGE != 0 {
            let (min, max) = range(&values);
            PropertyKind::Range { min, max }
        } else if info.flags & ffi::DRM_MODE_PROP_ENUM != 0 {
            PropertyKind::Enum(enum_values())
        } else if info.flags & ffi::DRM_MODE_PROP_BITMASK != 0 {
            PropertyKind::Bitmask(enum_values())
        } else if info.flags & ffi::DRM_MODE_PROP_BLOB != 0 {
            PropertyKind::Blob
        } else if extended == ffi::DRM_MODE_PROP_OBJECT {
            PropertyKind::Object
        } else if extended == ffi::DRM_MODE_PROP_SIGNED_RANGE {
            let (min, max) = range(&values);
            PropertyKind::SignedRange {
                min: min as i64,
                max: max as i64,
            }
        } else {
            PropertyKind::Unknown
        };

        Ok(PropertyInfo {
            id,
            name: c_str(&info.name),
            kind,
        })
    }

    fn property_blob(&self, blob_id: u32) -> BackendResult<Vec<u8>> {
        let mut data = Vec::new();
        ffi::mode::get_property_blob(self.as_fd(), blob_id, Some(&mut data)).map_err(errno)?;
        Ok(data)
    }

    fn set_property(&self, object: ObjectId, prop_id: u32, value: u64) -> BackendResult<()> {
        ffi::mode::set_property(
            self.as_fd(),
            prop_id,
            object.id(),
            object_type(object),
            value,
        )
        .map_err(errno)
    }

    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> BackendResult<()> {
        ffi::mode::set_crtc(
            self.as_fd(),
            crtc_id,
            fb_id,
            x,
            y,
            connectors,
            mode.map(mode_to_ffi),
        )
        .map_err(errno)?;

        Ok(())
    }

    fn gamma(&self, crtc_id: u32, size: usize) -> BackendResult<GammaRamp> {
        let mut ramp = GammaRamp::new(vec![0; size], vec![0; size], vec![0; size]);
        ffi::mode::get_gamma(
            self.as_fd(),
            crtc_id,
            size,
            &mut ramp.red,
            &mut ramp.green,
            &mut ramp.blue,
        )
        .map_err(errno)?;

        Ok(ramp)
    }

    fn set_gamma(&self, crtc_id: u32, ramp: &GammaRamp) -> BackendResult<()> {
        ffi::mode::set_gamma(
            self.as_fd(),
            crtc_id,
            ramp.size(),
            &ramp.red,
            &ramp.green,
            &ramp.blue,
        )
        .map_err(errno)?;

        Ok(())
    }

    #[allow(deprecated)]
    fn set_cursor2(
        &self,
        crtc_id: u32,
        handle: u32,
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> BackendResult<()> {
        ffi::mode::set_cursor2(self.as_fd(), crtc_id, handle, width, height, hot_x, hot_y)
            .map_err(errno)?;
        Ok(())
    }

    #[allow(deprecated)]
    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> BackendResult<()> {
        ffi::mode::set_cursor(self.as_fd(), crtc_id, handle, width, height).map_err(errno)?;
        Ok(())
    }

    #[allow(deprecated)]
    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> BackendResult<()> {
        ffi::mode::move_cursor(self.as_fd(), crtc_id, x, y).map_err(errno)?;
        Ok(())
    }

    fn page_flip(&self, crtc_id: u32, fb_id: u32) -> BackendResult<()> {
        ffi::mode::page_flip(
            self.as_fd(),
            crtc_id,
            fb_id,
            ffi::DRM_MODE_PAGE_FLIP_EVENT,
            0,
        )
        .map_err(errno)
    }

    fn read_events(&self) -> BackendResult<Vec<DrmEvent>> {
        let events = self.receive_events().map_err(errno)?;

        let mut res = Vec::new();
        for event in events {
            match event {
                drm::control::Event::PageFlip(ev) => res.push(DrmEvent::PageFlip {
                    crtc_id: ev.crtc.into(),
                    sequence: ev.frame,
                    sec: ev.duration.as_secs() as u32,
                    usec: ev.duration.subsec_micros(),
                }),
                _ => trace!("ignoring DRM event"),
            }
        }

        Ok(res)
    }

    fn wait_readable(&self, timeout: time::Duration) -> BackendResult<bool> {
        use rustix::event::{poll, PollFd, PollFlags};

        let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
        let timeout = timeout.as_millis().min(i32::MAX as u128) as i32;

        Ok(poll(&mut fds, timeout)? > 0)
    }
}

/// Opens device nodes directly, which requires DRM master (or a seat that
/// grants it on open).
#[derive(Debug, Default)]
pub struct DirectLauncher;

impl Launcher for DirectLauncher {
    fn open_restricted(&self, path: &Path) -> Result<Box<dyn DrmBackend>, KmsError> {
        Ok(Box::new(DrmDevice::open(path)?))
    }

    fn close_restricted(&self, backend: Box<dyn DrmBackend>) {
        drop(backend)
    }
}
