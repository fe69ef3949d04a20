// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    backend::{Connection, ConnectorInfo, DrmBackend, PropertyInfo, Resources},
    mode::ModeInfo,
    transform::Transform,
    update::{KmsUpdate, SealedUpdate},
    DeviceId,
};

const CONNECTOR_TYPE_NAMES: [&str; 17] = [
    "None",
    "VGA",
    "DVI-I",
    "DVI-D",
    "DVI-A",
    "Composite",
    "SVIDEO",
    "LVDS",
    "Component",
    "DIN",
    "DP",
    "HDMI",
    "HDMI-B",
    "TV",
    "eDP",
    "Virtual",
    "DSI",
];

/// Builds the human-readable connector name, e.g. "HDMI-1".
pub fn connector_name(connector_type: u32, type_id: u32) -> String {
    match CONNECTOR_TYPE_NAMES.get(connector_type as usize) {
        Some(name) => format!("{}-{}", name, type_id),
        None => format!("Unknown{}-{}", connector_type, type_id),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DpmsState {
    On = 0,
    Standby = 1,
    Suspend = 2,
    Off = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Subpixel {
    #[default]
    Unknown,
    HorizontalRgb,
    HorizontalBgr,
    VerticalRgb,
    VerticalBgr,
    None,
}

impl From<u32> for Subpixel {
    fn from(value: u32) -> Self {
        match value {
            2 => Subpixel::HorizontalRgb,
            3 => Subpixel::HorizontalBgr,
            4 => Subpixel::VerticalRgb,
            5 => Subpixel::VerticalBgr,
            6 => Subpixel::None,
            _ => Subpixel::Unknown,
        }
    }
}

/// Placement of one tile of a tiled display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileInfo {
    pub group_id: i32,
    pub flags: i32,
    pub max_h_tiles: i32,
    pub max_v_tiles: i32,
    pub loc_h_tile: i32,
    pub loc_v_tile: i32,
    pub tile_w: i32,
    pub tile_h: i32,
}

impl TileInfo {
    /// Parses the TILE property blob, which is eight colon-separated
    /// integers.
    pub fn parse(blob: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(blob).ok()?;
        let s = s.trim_end_matches('\0').trim();

        let mut fields = [0; 8];
        let mut parts = s.split(':');
        for field in fields.iter_mut() {
            *field = parts.next()?.trim().parse().ok()?;
        }

        let [group_id, flags, max_h_tiles, max_v_tiles, loc_h_tile, loc_v_tile, tile_w, tile_h] =
            fields;

        Some(Self {
            group_id,
            flags,
            max_h_tiles,
            max_v_tiles,
            loc_h_tile,
            loc_v_tile,
            tile_w,
            tile_h,
        })
    }
}

/// A snapshot of a connected connector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorState {
    /// The CRTC currently driving this connector, or zero.
    pub current_crtc_id: u32,
    pub common_possible_crtcs: u32,
    pub common_possible_clones: u32,
    /// Bit `i` is set if the connector can use the `i`th encoder of the
    /// device.
    pub encoder_device_idxs: u32,
    pub modes: Vec<ModeInfo>,
    pub width_mm: u32,
    pub height_mm: u32,
    pub edid: Option<Vec<u8>>,
    pub tile_info: TileInfo,
    pub subpixel: Subpixel,
    pub panel_orientation_transform: Transform,
    pub suggested_x: Option<i32>,
    pub suggested_y: Option<i32>,
    pub hotplug_mode_update: bool,
    pub has_scaling: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PropIds {
    dpms: Option<u32>,
    underscan: Option<u32>,
    underscan_hborder: Option<u32>,
    underscan_vborder: Option<u32>,
}

#[derive(Debug)]
pub struct Connector {
    device: DeviceId,
    id: u32,
    connector_type: u32,
    type_id: u32,
    name: String,
    prop_ids: PropIds,
    state: RwLock<Option<Arc<ConnectorState>>>,
}

impl Connector {
    pub(crate) fn new(
        device: DeviceId,
        info: &ConnectorInfo,
        resources: &Resources,
        backend: &dyn DrmBackend,
    ) -> Self {
        let props = read_properties(info, backend);
        let name = connector_name(info.connector_type, info.connector_type_id);
        let state = read_state(&name, info, &props, resources, backend);

        Self {
            device,
            id: info.id,
            connector_type: info.connector_type,
            type_id: info.connector_type_id,
            prop_ids: find_property_ids(&props),
            state: RwLock::new(state.map(Arc::new)),
            name,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connector_type(&self) -> u32 {
        self.connector_type
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// The current state, or None if nothing is connected.
    pub fn current_state(&self) -> Option<Arc<ConnectorState>> {
        self.state.read().clone()
    }

    pub fn supports_dpms(&self) -> bool {
        self.prop_ids.dpms.is_some()
    }

    pub fn supports_underscanning(&self) -> bool {
        self.prop_ids.underscan.is_some()
    }

    /// Whether both connectors can be driven by the same CRTC.
    pub fn can_clone(&self, other: &Connector) -> bool {
        let (Some(state), Some(other_state)) = (self.current_state(), other.current_state())
        else {
            return false;
        };

        if state.common_possible_clones == 0 || other_state.common_possible_clones == 0 {
            return false;
        }

        state.encoder_device_idxs == other_state.encoder_device_idxs
    }

    /// Stages a DPMS change. Does nothing if the connector has no DPMS
    /// property; check [Connector::supports_dpms] first.
    pub fn set_dpms_state(self: &Arc<Self>, update: &mut KmsUpdate, state: DpmsState) {
        if let Some(prop_id) = self.prop_ids.dpms {
            update.set_connector_property(self, prop_id, state as u64);
        }
    }

    /// Stages enabling underscan with the given borders. Does nothing if
    /// underscan isn't supported.
    pub fn set_underscanning(
        self: &Arc<Self>,
        update: &mut KmsUpdate,
        hborder: u64,
        vborder: u64,
    ) {
        let Some(prop_id) = self.prop_ids.underscan else {
            return;
        };

        update.set_connector_property(self, prop_id, 1);
        if let Some(prop_id) = self.prop_ids.underscan_hborder {
            update.set_connector_property(self, prop_id, hborder);
        }

        if let Some(prop_id) = self.prop_ids.underscan_vborder {
            update.set_connector_property(self, prop_id, vborder);
        }
    }

    pub fn unset_underscanning(self: &Arc<Self>, update: &mut KmsUpdate) {
        if let Some(prop_id) = self.prop_ids.underscan {
            update.set_connector_property(self, prop_id, 0);
        }
    }

    /// Whether this object represents the same hardware connector.
    pub(crate) fn is_same_as(&self, info: &ConnectorInfo) -> bool {
        self.id == info.id
            && self.connector_type == info.connector_type
            && self.type_id == info.connector_type_id
    }

    pub(crate) fn update_state(
        &self,
        info: &ConnectorInfo,
        resources: &Resources,
        backend: &dyn DrmBackend,
    ) {
        let props = read_properties(info, backend);
        let state = read_state(&self.name, info, &props, resources, backend);
        *self.state.write() = state.map(Arc::new);
    }

    pub(crate) fn clear_state(&self) {
        *self.state.write() = None;
    }

    pub(crate) fn predict_state(&self, update: &SealedUpdate) {
        let mut guard = self.state.write();
        let Some(state) = guard.as_mut() else {
            return;
        };

        let mode_set = update
            .mode_sets()
            .iter()
            .find(|ms| ms.connectors.iter().any(|c| std::ptr::eq(&**c, self)));

        if let Some(mode_set) = mode_set {
            Arc::make_mut(state).current_crtc_id = if mode_set.mode.is_some() {
                mode_set.crtc.id()
            } else {
                0
            };
        }
    }
}

fn read_properties(
    info: &ConnectorInfo,
    backend: &dyn DrmBackend,
) -> Vec<(PropertyInfo, u64)> {
    info.props
        .iter()
        .filter_map(|(prop_id, value)| match backend.property(*prop_id) {
            Ok(prop) => Some((prop, *value)),
            Err(errno) => {
                debug!(connector_id = info.id, prop_id, %errno, "failed to read property");
                None
            }
        })
        .collect()
}

fn find_property_ids(props: &[(PropertyInfo, u64)]) -> PropIds {
    let mut ids = PropIds::default();

    for (prop, _) in props {
        match prop.name.as_str() {
            "DPMS" if prop.is_enum() => ids.dpms = Some(prop.id),
            "underscan" if prop.is_enum() => ids.underscan = Some(prop.id),
            "underscan hborder" if prop.is_range() => ids.underscan_hborder = Some(prop.id),
            "underscan vborder" if prop.is_range() => ids.underscan_vborder = Some(prop.id),
            _ => (),
        }
    }

    ids
}

fn read_state(
    name: &str,
    info: &ConnectorInfo,
    props: &[(PropertyInfo, u64)],
    resources: &Resources,
    backend: &dyn DrmBackend,
) -> Option<ConnectorState> {
    if info.connection != Connection::Connected {
        return None;
    }

    let mut state = ConnectorState {
        subpixel: info.subpixel.into(),
        width_mm: info.mm_width,
        height_mm: info.mm_height,
        modes: info.modes.clone(),
        ..Default::default()
    };

    for (prop, value) in props {
        match prop.name.as_str() {
            "suggested X" if prop.is_range() => state.suggested_x = Some(*value as i32),
            "suggested Y" if prop.is_range() => state.suggested_y = Some(*value as i32),
            "hotplug_mode_update" if prop.is_range() => state.hotplug_mode_update = *value != 0,
            "scaling mode" => state.has_scaling = true,
            "panel orientation" if prop.is_enum() => {
                state.panel_orientation_transform = match prop.enum_name(*value) {
                    Some("Upside Down") => Transform::Rotate180,
                    // Rotate counter-clockwise to correct.
                    Some("Left Side Up") => Transform::Rotate90,
                    Some("Right Side Up") => Transform::Rotate270,
                    _ => Transform::Normal,
                }
            }
            "EDID" if prop.is_blob() && *value != 0 => {
                match backend.property_blob(*value as u32) {
                    Ok(data) => state.edid = Some(data),
                    Err(errno) => warn!(connector = name, %errno, "failed to read EDID"),
                }
            }
            "TILE" if prop.is_blob() && *value != 0 => {
                match backend.property_blob(*value as u32) {
                    Ok(data) if data.is_empty() => (),
                    Ok(data) => match TileInfo::parse(&data) {
                        Some(tile_info) => state.tile_info = tile_info,
                        None => {
                            warn!(connector = name, "couldn't understand TILE property blob")
                        }
                    },
                    Err(errno) => warn!(connector = name, %errno, "failed to read TILE"),
                }
            }
            _ => (),
        }
    }

    let mut common_possible_crtcs = u32::MAX;
    let mut common_possible_clones = u32::MAX;
    let mut encoder_device_idxs = 0;
    for encoder_id in &info.encoders {
        let encoder = match backend.encoder(*encoder_id) {
            Ok(encoder) => encoder,
            Err(_) => continue,
        };

        common_possible_crtcs &= encoder.possible_crtcs;
        common_possible_clones &= encoder.possible_clones;

        let bit = resources
            .encoders
            .iter()
            .position(|id| *id == encoder.id)
            .and_then(|idx| u32::try_from(idx).ok())
            .and_then(|idx| 1u32.checked_shl(idx));
        if let Some(bit) = bit {
            encoder_device_idxs |= bit;
        }

        if info.encoder_id == encoder.id {
            state.current_crtc_id = encoder.crtc_id;
        }
    }

    state.common_possible_crtcs = common_possible_crtcs;
    state.common_possible_clones = common_possible_clones;
    state.encoder_device_idxs = encoder_device_idxs;

    Some(state)
}
