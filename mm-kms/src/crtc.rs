// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::{
    backend::{CrtcInfo, DrmBackend},
    fixed::Rect,
    mode::ModeInfo,
    update::{KmsUpdate, SealedUpdate},
    DeviceId,
};

/// A gamma lookup table, with one entry per step in each channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GammaRamp {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaRamp {
    pub fn new(red: Vec<u16>, green: Vec<u16>, blue: Vec<u16>) -> Self {
        debug_assert!(red.len() == green.len() && green.len() == blue.len());
        Self { red, green, blue }
    }

    /// A ramp applying `out = in ^ (1 / exponent)` to every channel.
    pub fn from_exponent(size: usize, exponent: f64) -> Self {
        let channel: Vec<u16> = (0..size)
            .map(|i| {
                let x = if size > 1 {
                    i as f64 / (size - 1) as f64
                } else {
                    1.0
                };

                (x.powf(1.0 / exponent) * u16::MAX as f64).round() as u16
            })
            .collect();

        Self::new(channel.clone(), channel.clone(), channel)
    }

    pub fn linear(size: usize) -> Self {
        Self::from_exponent(size, 1.0)
    }

    pub fn size(&self) -> usize {
        self.red.len()
    }

    /// Copies another ramp into this one, reusing the existing storage
    /// unless the size changed.
    pub(crate) fn assign(&mut self, other: &GammaRamp) {
        if self.size() == other.size() {
            self.red.copy_from_slice(&other.red);
            self.green.copy_from_slice(&other.green);
            self.blue.copy_from_slice(&other.blue);
        } else {
            self.red = other.red.clone();
            self.green = other.green.clone();
            self.blue = other.blue.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrtcState {
    pub rect: Rect,
    /// The programmed mode, if any.
    pub drm_mode: Option<ModeInfo>,
    pub gamma: GammaRamp,
}

impl CrtcState {
    pub fn is_drm_mode_valid(&self) -> bool {
        self.drm_mode.is_some()
    }
}

#[derive(Debug)]
pub struct Crtc {
    device: DeviceId,
    id: u32,
    index: usize,
    state: RwLock<Arc<CrtcState>>,
}

impl Crtc {
    pub(crate) fn new(
        device: DeviceId,
        info: &CrtcInfo,
        index: usize,
        backend: &dyn DrmBackend,
    ) -> Self {
        Self {
            device,
            id: info.id,
            index,
            state: RwLock::new(Arc::new(read_state(info, backend))),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The position of this CRTC in the device's enumeration order. Bitmasks
    /// of possible CRTCs are tested against `1 << index`.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    pub fn current_state(&self) -> Arc<CrtcState> {
        self.state.read().clone()
    }

    /// The bit for this CRTC in possible-CRTC masks. Zero if the index
    /// doesn't fit.
    pub(crate) fn mask(&self) -> u32 {
        u32::try_from(self.index)
            .ok()
            .and_then(|idx| 1u32.checked_shl(idx))
            .unwrap_or(0)
    }

    /// Stages a gamma write for this CRTC.
    pub fn set_gamma(self: &Arc<Self>, update: &mut KmsUpdate, ramp: GammaRamp) {
        update.set_crtc_gamma(self, ramp);
    }

    pub(crate) fn update_state(&self, backend: &dyn DrmBackend) {
        let state = match backend.crtc(self.id) {
            Ok(info) => read_state(&info, backend),
            Err(errno) => {
                warn!(crtc_id = self.id, %errno, "failed to read CRTC state");
                CrtcState::default()
            }
        };

        *self.state.write() = Arc::new(state);
    }

    /// Updates the cached state to what it will be once the update has been
    /// applied.
    pub(crate) fn predict_state(&self, update: &SealedUpdate) {
        let mut guard = self.state.write();

        let mode_set = update
            .mode_sets()
            .iter()
            .find(|ms| std::ptr::eq(&*ms.crtc, self));

        if let Some(mode_set) = mode_set {
            let state = Arc::make_mut(&mut guard);
            match &mode_set.mode {
                Some(mode) => {
                    let (x, y) = update
                        .primary_plane_assignment(&mode_set.crtc)
                        .map(|pa| (pa.src_rect.x.to_int(), pa.src_rect.y.to_int()))
                        .unwrap_or_default();

                    state.rect = Rect {
                        x,
                        y,
                        width: mode.hdisplay as i32,
                        height: mode.vdisplay as i32,
                    };
                    state.drm_mode = Some(mode.clone());
                }
                None => {
                    state.rect = Rect::default();
                    state.drm_mode = None;
                }
            }
        }

        for gamma in update
            .crtc_gammas()
            .iter()
            .filter(|g| std::ptr::eq(&*g.crtc, self))
        {
            trace!(crtc_id = self.id, size = gamma.ramp.size(), "predicting gamma");
            Arc::make_mut(&mut guard).gamma.assign(&gamma.ramp);
        }
    }
}

fn read_state(info: &CrtcInfo, backend: &dyn DrmBackend) -> CrtcState {
    let (width, height) = info
        .mode
        .as_ref()
        .map(|m| (m.hdisplay as i32, m.vdisplay as i32))
        .unwrap_or_default();

    let gamma = if info.gamma_size > 0 {
        match backend.gamma(info.id, info.gamma_size as usize) {
            Ok(ramp) => ramp,
            Err(errno) => {
                warn!(crtc_id = info.id, %errno, "failed to read gamma ramp");
                GammaRamp::default()
            }
        }
    } else {
        GammaRamp::default()
    };

    CrtcState {
        rect: Rect {
            x: info.x as i32,
            y: info.y as i32,
            width,
            height,
        },
        drm_mode: info.mode.clone(),
        gamma,
    }
}
