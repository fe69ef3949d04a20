// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! An in-memory DRM device for tests. It records every mutating call, and
//! lets tests script the results of the calls that matter to the engine.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    os::fd::RawFd,
    path::{Path, PathBuf},
    sync::Arc,
    time,
};

use parking_lot::{Mutex, MutexGuard};
use rustix::io::Errno;

use crate::{
    backend::*,
    crtc::{Crtc, GammaRamp},
    mode::{test_mode, ModeInfo, MODE_TYPE_PREFERRED},
    page_flip::{PageFlipFeedback, PageFlipOutcome},
    plane::{IN_FORMATS_HEADER_LEN, IN_FORMATS_MODIFIER_LEN},
    DeviceFlags, DeviceId, Kms, KmsConfig, KmsError,
};

pub(crate) const PROP_TYPE: u32 = 1;
pub(crate) const PROP_DPMS: u32 = 2;
pub(crate) const PROP_UNDERSCAN: u32 = 3;
pub(crate) const PROP_UNDERSCAN_HBORDER: u32 = 4;
pub(crate) const PROP_UNDERSCAN_VBORDER: u32 = 5;
pub(crate) const PROP_EDID: u32 = 6;
pub(crate) const PROP_ROTATION: u32 = 7;
pub(crate) const PROP_IN_FORMATS: u32 = 8;

pub(crate) const CRTC_0: u32 = 10;
pub(crate) const CRTC_1: u32 = 11;
pub(crate) const HDMI: u32 = 30;
pub(crate) const DP: u32 = 31;
pub(crate) const PRIMARY_0: u32 = 40;
pub(crate) const PRIMARY_1: u32 = 41;
pub(crate) const CURSOR_0: u32 = 42;

const EDID_BLOB: u32 = 100;
const IN_FORMATS_BLOB: u32 = 101;

pub(crate) const FAKE_EDID: &[u8] = &[0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

/// A mutating call made against the device.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    SetProperty {
        object: ObjectId,
        prop_id: u32,
        value: u64,
    },
    SetCrtc {
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: Vec<u32>,
        mode: Option<String>,
    },
    SetGamma {
        crtc_id: u32,
        size: usize,
    },
    SetCursor2 {
        crtc_id: u32,
        handle: u32,
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    },
    SetCursor {
        crtc_id: u32,
        handle: u32,
        width: u32,
        height: u32,
    },
    MoveCursor {
        crtc_id: u32,
        x: i32,
        y: i32,
    },
    PageFlip {
        crtc_id: u32,
        fb_id: u32,
    },
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub resources: Resources,
    pub connectors: HashMap<u32, ConnectorInfo>,
    pub encoders: HashMap<u32, EncoderInfo>,
    pub crtcs: HashMap<u32, CrtcInfo>,
    pub planes: BTreeMap<u32, PlaneInfo>,
    pub plane_props: HashMap<u32, Vec<(u32, u64)>>,
    pub properties: HashMap<u32, PropertyInfo>,
    pub blobs: HashMap<u32, Vec<u8>>,
    pub gamma: HashMap<u32, GammaRamp>,
    pub cursor_size: Option<(u64, u64)>,

    pub universal_planes_error: Option<Errno>,
    pub resources_error: Option<Errno>,
    pub set_property_error: Option<Errno>,
    pub set_cursor2_error: Option<Errno>,
    pub set_cursor_error: Option<Errno>,
    pub set_gamma_error: Option<Errno>,
    /// Consumed by the next read.
    pub read_events_error: Option<Errno>,
    /// Consumed one per call. Calls succeed once these run out.
    pub set_crtc_results: VecDeque<BackendResult<()>>,
    pub page_flip_results: VecDeque<BackendResult<()>>,

    pub calls: Vec<Call>,
    /// Flips accepted by the "kernel", completed by the next wait.
    pub in_flight: VecDeque<u32>,
    pub events: VecDeque<DrmEvent>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

fn enum_prop(id: u32, name: &str, values: &[&str]) -> PropertyInfo {
    let values = values
        .iter()
        .enumerate()
        .map(|(i, name)| PropertyEnum {
            name: name.to_string(),
            value: i as u64,
        })
        .collect();

    PropertyInfo {
        id,
        name: name.to_string(),
        kind: PropertyKind::Enum(values),
    }
}

fn range_prop(id: u32, name: &str, max: u64) -> PropertyInfo {
    PropertyInfo {
        id,
        name: name.to_string(),
        kind: PropertyKind::Range { min: 0, max },
    }
}

fn blob_prop(id: u32, name: &str) -> PropertyInfo {
    PropertyInfo {
        id,
        name: name.to_string(),
        kind: PropertyKind::Blob,
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two CRTCs, a connected HDMI connector and a disconnected DP one, a
    /// primary plane for each CRTC, and one hardware cursor plane for the
    /// first CRTC only.
    pub fn with_standard_layout() -> Self {
        let backend = Self::new();

        {
            let mut state = backend.state();
            state.cursor_size = Some((64, 64));

            for prop in [
                enum_prop(PROP_TYPE, "type", &["Overlay", "Primary", "Cursor"]),
                enum_prop(PROP_DPMS, "DPMS", &["On", "Standby", "Suspend", "Off"]),
                enum_prop(PROP_UNDERSCAN, "underscan", &["off", "on", "auto"]),
                range_prop(PROP_UNDERSCAN_HBORDER, "underscan hborder", 128),
                range_prop(PROP_UNDERSCAN_VBORDER, "underscan vborder", 128),
                blob_prop(PROP_EDID, "EDID"),
                PropertyInfo {
                    id: PROP_ROTATION,
                    name: "rotation".to_string(),
                    kind: PropertyKind::Bitmask(
                        ["rotate-0", "rotate-90", "rotate-180", "rotate-270"]
                            .iter()
                            .enumerate()
                            .map(|(i, name)| PropertyEnum {
                                name: name.to_string(),
                                value: i as u64,
                            })
                            .collect(),
                    ),
                },
                blob_prop(PROP_IN_FORMATS, "IN_FORMATS"),
            ] {
                state.properties.insert(prop.id, prop);
            }

            state.blobs.insert(EDID_BLOB, FAKE_EDID.to_vec());
            state.blobs.insert(
                IN_FORMATS_BLOB,
                in_formats_blob(
                    &[
                        drm_fourcc::DrmFourcc::Xrgb8888 as u32,
                        drm_fourcc::DrmFourcc::Argb8888 as u32,
                    ],
                    &[(0b11, 0, 0)],
                ),
            );

            state.resources = Resources {
                crtcs: vec![CRTC_0, CRTC_1],
                connectors: vec![HDMI, DP],
                encoders: vec![20, 21],
            };

            for id in [CRTC_0, CRTC_1] {
                state.crtcs.insert(
                    id,
                    CrtcInfo {
                        id,
                        fb_id: 0,
                        x: 0,
                        y: 0,
                        mode: None,
                        gamma_size: 256,
                    },
                );
            }

            for id in [20, 21] {
                state.encoders.insert(
                    id,
                    EncoderInfo {
                        id,
                        crtc_id: 0,
                        possible_crtcs: 0b11,
                        possible_clones: 0b11,
                    },
                );
            }

            let mut preferred = test_mode(1920, 1080);
            preferred.mode_type |= MODE_TYPE_PREFERRED;

            state.connectors.insert(
                HDMI,
                ConnectorInfo {
                    id: HDMI,
                    connector_type: 11,
                    connector_type_id: 1,
                    connection: Connection::Connected,
                    mm_width: 600,
                    mm_height: 340,
                    subpixel: 2,
                    modes: vec![preferred, test_mode(1280, 720)],
                    encoders: vec![20],
                    encoder_id: 0,
                    props: vec![
                        (PROP_DPMS, 0),
                        (PROP_UNDERSCAN, 0),
                        (PROP_UNDERSCAN_HBORDER, 0),
                        (PROP_UNDERSCAN_VBORDER, 0),
                        (PROP_EDID, EDID_BLOB as u64),
                    ],
                },
            );

            state.connectors.insert(
                DP,
                ConnectorInfo {
                    id: DP,
                    connector_type: 10,
                    connector_type_id: 1,
                    connection: Connection::Disconnected,
                    mm_width: 0,
                    mm_height: 0,
                    subpixel: 0,
                    modes: vec![],
                    encoders: vec![21],
                    encoder_id: 0,
                    props: vec![(PROP_DPMS, 0)],
                },
            );

            let planes = [
                (PRIMARY_0, 0b01, 1),
                (PRIMARY_1, 0b10, 1),
                (CURSOR_0, 0b01, 2),
            ];

            for (id, possible_crtcs, plane_type) in planes {
                state.planes.insert(
                    id,
                    PlaneInfo {
                        id,
                        possible_crtcs,
                        formats: vec![drm_fourcc::DrmFourcc::Xrgb8888 as u32],
                    },
                );

                state.plane_props.insert(id, vec![(PROP_TYPE, plane_type)]);
            }

            state
                .plane_props
                .get_mut(&PRIMARY_0)
                .unwrap()
                .extend([(PROP_ROTATION, 1), (PROP_IN_FORMATS, IN_FORMATS_BLOB as u64)]);
        }

        backend
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    /// Returns and clears the recorded calls.
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state().calls)
    }

    pub fn push_page_flip_result(&self, res: BackendResult<()>) {
        self.state().page_flip_results.push_back(res);
    }

    pub fn push_set_crtc_result(&self, res: BackendResult<()>) {
        self.state().set_crtc_results.push_back(res);
    }

    /// Completes every accepted flip, as if a vblank happened.
    pub fn vblank(&self) {
        let mut state = self.state();
        while let Some(crtc_id) = state.in_flight.pop_front() {
            state.sequence += 1;
            let sequence = state.sequence;
            state.events.push_back(DrmEvent::PageFlip {
                crtc_id,
                sequence,
                sec: 1,
                usec: sequence * 16_667,
            });
        }
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

fn err_or_ok(errno: Option<Errno>) -> BackendResult<()> {
    match errno {
        Some(errno) => Err(errno),
        None => Ok(()),
    }
}

impl DrmBackend for FakeBackend {
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn enable_universal_planes(&self) -> BackendResult<()> {
        err_or_ok(self.state().universal_planes_error)
    }

    fn cursor_size(&self) -> Option<(u64, u64)> {
        self.state().cursor_size
    }

    fn resources(&self) -> BackendResult<Resources> {
        let state = self.state();
        match state.resources_error {
            Some(errno) => Err(errno),
            None => Ok(state.resources.clone()),
        }
    }

    fn plane_ids(&self) -> BackendResult<Vec<u32>> {
        Ok(self.state().planes.keys().copied().collect())
    }

    fn connector(&self, id: u32, _force_probe: bool) -> BackendResult<ConnectorInfo> {
        self.state().connectors.get(&id).cloned().ok_or(Errno::NOENT)
    }

    fn encoder(&self, id: u32) -> BackendResult<EncoderInfo> {
        self.state().encoders.get(&id).copied().ok_or(Errno::NOENT)
    }

    fn crtc(&self, id: u32) -> BackendResult<CrtcInfo> {
        self.state().crtcs.get(&id).cloned().ok_or(Errno::NOENT)
    }

    fn plane(&self, id: u32) -> BackendResult<PlaneInfo> {
        self.state().planes.get(&id).cloned().ok_or(Errno::NOENT)
    }

    fn object_properties(&self, object: ObjectId) -> BackendResult<Vec<(u32, u64)>> {
        let state = self.state();
        let props = match object {
            ObjectId::Connector(id) => state.connectors.get(&id).map(|c| c.props.clone()),
            ObjectId::Plane(id) => state.plane_props.get(&id).cloned(),
            ObjectId::Crtc(_) => Some(Vec::new()),
        };

        props.ok_or(Errno::NOENT)
    }

    fn property(&self, id: u32) -> BackendResult<PropertyInfo> {
        self.state().properties.get(&id).cloned().ok_or(Errno::NOENT)
    }

    fn property_blob(&self, blob_id: u32) -> BackendResult<Vec<u8>> {
        self.state().blobs.get(&blob_id).cloned().ok_or(Errno::NOENT)
    }

    fn set_property(&self, object: ObjectId, prop_id: u32, value: u64) -> BackendResult<()> {
        self.record(Call::SetProperty {
            object,
            prop_id,
            value,
        });

        let mut state = self.state();
        err_or_ok(state.set_property_error)?;

        if let ObjectId::Connector(id) = object {
            let props = state.connectors.get_mut(&id).map(|c| &mut c.props);
            if let Some((_, v)) = props.and_then(|p| p.iter_mut().find(|(p, _)| *p == prop_id)) {
                *v = value;
            }
        }

        Ok(())
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
        self.record(Call::SetCrtc {
            crtc_id,
            fb_id,
            x,
            y,
            connectors: connectors.to_vec(),
            mode: mode.map(|m| m.name.clone()),
        });

        let mut state = self.state();
        state.set_crtc_results.pop_front().unwrap_or(Ok(()))?;

        if let Some(crtc) = state.crtcs.get_mut(&crtc_id) {
            crtc.fb_id = fb_id;
            crtc.x = x;
            crtc.y = y;
            crtc.mode = mode.cloned();
        }

        Ok(())
    }

    fn gamma(&self, crtc_id: u32, size: usize) -> BackendResult<GammaRamp> {
        Ok(self
            .state()
            .gamma
            .get(&crtc_id)
            .cloned()
            .unwrap_or_else(|| GammaRamp::linear(size)))
    }

    fn set_gamma(&self, crtc_id: u32, ramp: &GammaRamp) -> BackendResult<()> {
        self.record(Call::SetGamma {
            crtc_id,
            size: ramp.size(),
        });

        let mut state = self.state();
        err_or_ok(state.set_gamma_error)?;
        state.gamma.insert(crtc_id, ramp.clone());
        Ok(())
    }

    fn set_cursor2(
        &self,
        crtc_id: u32,
        handle: u32,
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> BackendResult<()> {
        self.record(Call::SetCursor2 {
            crtc_id,
            handle,
            width,
            height,
            hot_x,
            hot_y,
        });

        err_or_ok(self.state().set_cursor2_error)
    }

    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> BackendResult<()> {
        self.record(Call::SetCursor {
            crtc_id,
            handle,
            width,
            height,
        });

        err_or_ok(self.state().set_cursor_error)
    }

    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> BackendResult<()> {
        self.record(Call::MoveCursor { crtc_id, x, y });
        Ok(())
    }

    fn page_flip(&self, crtc_id: u32, fb_id: u32) -> BackendResult<()> {
        self.record(Call::PageFlip { crtc_id, fb_id });

        let mut state = self.state();
        state.page_flip_results.pop_front().unwrap_or(Ok(()))?;
        state.in_flight.push_back(crtc_id);
        Ok(())
    }

    fn read_events(&self) -> BackendResult<Vec<DrmEvent>> {
        let mut state = self.state();
        if let Some(errno) = state.read_events_error.take() {
            return Err(errno);
        }

        if state.events.is_empty() {
            return Err(Errno::AGAIN);
        }

        Ok(state.events.drain(..).collect())
    }

    fn wait_readable(&self, _timeout: time::Duration) -> BackendResult<bool> {
        self.vblank();
        Ok(!self.state().events.is_empty())
    }
}

#[derive(Debug, Default)]
struct LauncherState {
    backends: HashMap<PathBuf, FakeBackend>,
    opened: Vec<PathBuf>,
    closed: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeLauncher {
    inner: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn add(&self, path: impl AsRef<Path>, backend: FakeBackend) {
        self.inner
            .lock()
            .backends
            .insert(path.as_ref().to_owned(), backend);
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.inner.lock().opened.clone()
    }

    pub fn closed(&self) -> usize {
        self.inner.lock().closed
    }
}

impl Launcher for FakeLauncher {
    fn open_restricted(&self, path: &Path) -> Result<Box<dyn DrmBackend>, KmsError> {
        let mut inner = self.inner.lock();
        let Some(backend) = inner.backends.get(path).cloned() else {
            return Err(KmsError::Open {
                path: path.to_owned(),
                source: Arc::new(std::io::ErrorKind::NotFound.into()),
            });
        };

        inner.opened.push(path.to_owned());
        Ok(Box::new(backend))
    }

    fn close_restricted(&self, _backend: Box<dyn DrmBackend>) {
        self.inner.lock().closed += 1;
    }
}

/// A coordinator with one standard device at /dev/dri/card0.
pub(crate) fn test_kms() -> (Kms, FakeBackend, FakeLauncher, DeviceId) {
    let backend = FakeBackend::with_standard_layout();
    let launcher = FakeLauncher::default();
    launcher.add("/dev/dri/card0", backend.clone());

    let mut kms = Kms::new(Box::new(launcher.clone()), KmsConfig::default()).unwrap();
    let id = kms
        .create_device("/dev/dri/card0", DeviceFlags::BOOT_VGA)
        .unwrap();

    (kms, backend, launcher, id)
}

/// Collects page flip outcomes in delivery order, tagged by request.
#[derive(Debug, Clone, Default)]
pub(crate) struct FeedbackLog(Arc<Mutex<Vec<(&'static str, PageFlipOutcome)>>>);

impl FeedbackLog {
    pub fn feedback(&self, tag: &'static str) -> Box<dyn PageFlipFeedback> {
        let log = self.0.clone();
        Box::new(move |_crtc: &Arc<Crtc>, outcome: PageFlipOutcome| {
            log.lock().push((tag, outcome))
        })
    }

    pub fn take(&self) -> Vec<(&'static str, PageFlipOutcome)> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Builds an IN_FORMATS blob. Each modifier is (format mask, offset,
/// modifier).
pub(crate) fn in_formats_blob(formats: &[u32], modifiers: &[(u64, u32, u64)]) -> Vec<u8> {
    let formats_offset = IN_FORMATS_HEADER_LEN;
    let modifiers_offset = (formats_offset + formats.len() * 4).next_multiple_of(8);

    let mut blob = Vec::new();
    for word in [
        1, // version
        0, // flags
        formats.len() as u32,
        formats_offset as u32,
        modifiers.len() as u32,
        modifiers_offset as u32,
    ] {
        blob.extend_from_slice(&word.to_ne_bytes());
    }

    for format in formats {
        blob.extend_from_slice(&format.to_ne_bytes());
    }

    blob.resize(modifiers_offset, 0);
    for (mask, offset, modifier) in modifiers {
        blob.extend_from_slice(&mask.to_ne_bytes());
        blob.extend_from_slice(&offset.to_ne_bytes());
        blob.extend_from_slice(&0u32.to_ne_bytes());
        blob.extend_from_slice(&modifier.to_ne_bytes());
    }

    debug_assert_eq!(
        blob.len(),
        modifiers_offset + modifiers.len() * IN_FORMATS_MODIFIER_LEN
    );
    blob
}
