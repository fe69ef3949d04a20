// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
    time,
};

use rustix::io::Errno;
use tracing::{debug, trace, warn};

use crate::{
    backend::{CrtcInfo, DrmBackend, DrmEvent, ObjectId, PropertyInfo, Resources},
    connector::Connector,
    crtc::Crtc,
    device::{find_plane_for, DeviceCaps, DeviceId, DeviceSnapshot},
    engine::LegacyEngine,
    page_flip::PageFlipData,
    plane::{Plane, PlaneType},
    waking_sender::{Callback, WakingSender},
    KmsError,
};

/// Returned when a device fails to initialize, so that the backend can be
/// handed back to the launcher.
pub(crate) struct InitError {
    pub error: KmsError,
    pub backend: Box<dyn DrmBackend>,
}

/// The impl-context half of a device. Owns the backend, and is the only
/// thing that talks to the kernel.
pub(crate) struct ImplDevice {
    id: DeviceId,
    path: PathBuf,
    backend: Box<dyn DrmBackend>,
    force_probe: bool,
    caps: DeviceCaps,

    connectors: Vec<Arc<Connector>>,
    crtcs: Vec<Arc<Crtc>>,
    planes: Vec<Arc<Plane>>,

    /// Flips submitted to the kernel, waiting for their event. Events only
    /// carry the CRTC, and each CRTC completes flips in submission order.
    pending_flips: HashMap<u32, VecDeque<PageFlipData>>,
}

impl ImplDevice {
    pub fn new(
        id: DeviceId,
        path: &Path,
        backend: Box<dyn DrmBackend>,
        force_probe: bool,
    ) -> Result<Self, InitError> {
        if let Err(errno) = backend.enable_universal_planes() {
            return Err(InitError {
                error: KmsError::UniversalPlanes(errno),
                backend,
            });
        }

        let resources = match backend.resources() {
            Ok(res) => res,
            Err(errno) => {
                return Err(InitError {
                    error: KmsError::Resources(errno),
                    backend,
                })
            }
        };

        let caps = match backend.cursor_size() {
            Some((width, height)) => DeviceCaps {
                cursor_width: Some(width),
                cursor_height: Some(height),
            },
            None => DeviceCaps::default(),
        };

        let mut dev = Self {
            id,
            path: path.to_owned(),
            backend,
            force_probe,
            caps,
            connectors: Vec::new(),
            crtcs: Vec::new(),
            planes: Vec::new(),
            pending_flips: HashMap::new(),
        };

        dev.init_crtcs(&resources);
        dev.init_planes();
        dev.update_connectors(&resources);

        debug!(
            path = ?dev.path,
            connectors = dev.connectors.len(),
            crtcs = dev.crtcs.len(),
            planes = dev.planes.len(),
            "initialized KMS device"
        );

        Ok(dev)
    }

    fn init_crtcs(&mut self, resources: &Resources) {
        for (index, crtc_id) in resources.crtcs.iter().enumerate() {
            let info = match self.backend.crtc(*crtc_id) {
                Ok(info) => info,
                Err(errno) => {
                    warn!(crtc_id, %errno, "failed to query CRTC");
                    CrtcInfo {
                        id: *crtc_id,
                        fb_id: 0,
                        x: 0,
                        y: 0,
                        mode: None,
                        gamma_size: 0,
                    }
                }
            };

            let crtc = Crtc::new(self.id, &info, index, self.backend.as_ref());
            self.crtcs.push(Arc::new(crtc));
        }
    }

    fn init_planes(&mut self) {
        let plane_ids = match self.backend.plane_ids() {
            Ok(ids) => ids,
            Err(errno) => {
                warn!(path = ?self.path, %errno, "failed to list planes");
                return;
            }
        };

        for plane_id in plane_ids {
            let info = match self.backend.plane(plane_id) {
                Ok(info) => info,
                Err(errno) => {
                    warn!(plane_id, %errno, "failed to query plane");
                    continue;
                }
            };

            let props = self.object_properties(ObjectId::Plane(plane_id));
            let plane_type = props
                .iter()
                .find(|(p, _)| p.name == "type")
                .and_then(|(_, value)| PlaneType::from_prop_value(*value));

            let Some(plane_type) = plane_type else {
                warn!(plane_id, "plane has no type property, ignoring");
                continue;
            };

            let plane = Plane::new(self.id, plane_type, &info, &props, self.backend.as_ref());
            self.planes.push(Arc::new(plane));
        }
    }

    /// Reconciles the connector list with the kernel's. Connectors that are
    /// the same hardware are kept, so that references to them stay valid.
    fn update_connectors(&mut self, resources: &Resources) {
        let mut connectors = Vec::with_capacity(resources.connectors.len());
        for connector_id in &resources.connectors {
            let info = match self.backend.connector(*connector_id, self.force_probe) {
                Ok(info) => info,
                Err(errno) => {
                    warn!(connector_id, %errno, "failed to query connector");
                    continue;
                }
            };

            let existing = self.connectors.iter().find(|c| c.is_same_as(&info));
            let connector = match existing {
                Some(connector) => {
                    connector.update_state(&info, resources, self.backend.as_ref());
                    connector.clone()
                }
                None => Arc::new(Connector::new(
                    self.id,
                    &info,
                    resources,
                    self.backend.as_ref(),
                )),
            };

            connectors.push(connector);
        }

        self.connectors = connectors;
    }

    fn object_properties(&self, object: ObjectId) -> Vec<(PropertyInfo, u64)> {
        let props = match self.backend.object_properties(object) {
            Ok(props) => props,
            Err(errno) => {
                warn!(id = object.id(), kind = object.kind(), %errno, "failed to read properties");
                return Vec::new();
            }
        };

        props
            .into_iter()
            .filter_map(|(prop_id, value)| match self.backend.property(prop_id) {
                Ok(prop) => Some((prop, value)),
                Err(errno) => {
                    debug!(prop_id, %errno, "failed to query property");
                    None
                }
            })
            .collect()
    }

    /// Re-reads everything from the kernel. If the resources can't be read,
    /// the device ends up with no entities at all.
    pub fn update_states(&mut self) {
        let resources = match self.backend.resources() {
            Ok(res) => res,
            Err(errno) => {
                warn!(path = ?self.path, %errno, "failed to read resources, clearing state");
                // Anything still holding a connector sees it disconnected.
                for connector in self.connectors.drain(..) {
                    connector.clear_state();
                }

                self.planes.clear();
                self.crtcs.clear();
                return;
            }
        };

        self.update_connectors(&resources);
        for crtc in &self.crtcs {
            crtc.update_state(self.backend.as_ref());
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> &dyn DrmBackend {
        self.backend.as_ref()
    }

    pub fn connectors(&self) -> &[Arc<Connector>] {
        &self.connectors
    }

    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.crtcs
    }

    pub fn has_plane_for(&self, crtc: &Crtc, plane_type: PlaneType) -> bool {
        find_plane_for(&self.planes, crtc, plane_type).is_some()
    }

    pub fn add_fake_plane(&mut self, plane_type: PlaneType, crtc: &Crtc) {
        trace!(crtc_id = crtc.id(), %plane_type, "adding fake plane");
        self.planes.push(Arc::new(Plane::new_fake(plane_type, crtc)));
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            raw_fd: self.backend.raw_fd(),
            caps: self.caps,
            connectors: self.connectors.clone(),
            crtcs: self.crtcs.clone(),
            planes: self.planes.clone(),
        }
    }

    /// Records a flip the kernel accepted.
    pub fn push_pending_flip(&mut self, data: PageFlipData) {
        self.pending_flips
            .entry(data.crtc().id())
            .or_default()
            .push_back(data);
    }

    /// Removes every flip still waiting for a kernel event.
    pub fn take_pending_flips(&mut self) -> Vec<PageFlipData> {
        self.pending_flips
            .drain()
            .flat_map(|(_, flips)| flips)
            .collect()
    }

    /// Reads and handles any queued kernel events. If `timeout` is set and
    /// no events are queued, waits up to that long for one to arrive.
    pub fn dispatch(
        &mut self,
        timeout: Option<time::Duration>,
        engine: &mut LegacyEngine,
        callbacks: &WakingSender<Callback>,
    ) -> Result<usize, KmsError> {
        let deadline = timeout.map(|t| time::Instant::now() + t);

        loop {
            match self.backend.read_events() {
                Ok(events) if !events.is_empty() => {
                    return Ok(self.handle_events(events, engine, callbacks))
                }
                Ok(_) => (),
                Err(errno) if errno == Errno::AGAIN || errno == Errno::INTR => (),
                Err(errno) => return Err(KmsError::Dispatch(errno)),
            }

            let Some(deadline) = deadline else {
                return Ok(0);
            };

            let remaining = deadline.saturating_duration_since(time::Instant::now());
            if remaining.is_zero() {
                return Err(KmsError::DispatchTimeout);
            }

            match self.backend.wait_readable(remaining) {
                Ok(true) => (),
                Ok(false) => return Err(KmsError::DispatchTimeout),
                Err(errno) if errno == Errno::INTR => (),
                Err(errno) => return Err(KmsError::Dispatch(errno)),
            }
        }
    }

    fn handle_events(
        &mut self,
        events: Vec<DrmEvent>,
        engine: &mut LegacyEngine,
        callbacks: &WakingSender<Callback>,
    ) -> usize {
        let mut handled = 0;
        for event in events {
            match event {
                DrmEvent::PageFlip {
                    crtc_id,
                    sequence,
                    sec,
                    usec,
                } => {
                    let data = self
                        .pending_flips
                        .get_mut(&crtc_id)
                        .and_then(|flips| flips.pop_front());

                    let Some(mut data) = data else {
                        warn!(crtc_id, "page flip event for CRTC with no pending flip");
                        continue;
                    };

                    trace!(crtc_id, sequence, "page flip completed");
                    data.set_timings(sequence, sec, usec);
                    engine.handle_page_flip_callback(data, callbacks);
                    handled += 1;
                }
            }
        }

        handled
    }

    pub fn into_backend(self) -> Box<dyn DrmBackend> {
        self.backend
    }
}
