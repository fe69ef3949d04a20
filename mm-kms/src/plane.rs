// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{collections::BTreeMap, io};

use byteorder::{NativeEndian as NE, ReadBytesExt as _};
use drm_fourcc::DrmFourcc;
use tracing::{debug, warn};

use crate::{
    backend::{DrmBackend, PlaneInfo, PropertyInfo, PropertyKind},
    crtc::Crtc,
    transform::Transform,
    update::PlaneAssignment,
    DeviceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    Primary,
    Cursor,
    Overlay,
}

impl PlaneType {
    /// Maps the value of the "type" plane property.
    pub(crate) fn from_prop_value(value: u64) -> Option<Self> {
        match value {
            0 => Some(PlaneType::Overlay),
            1 => Some(PlaneType::Primary),
            2 => Some(PlaneType::Cursor),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlaneType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaneType::Primary => f.write_str("primary"),
            PlaneType::Cursor => f.write_str("cursor"),
            PlaneType::Overlay => f.write_str("overlay"),
        }
    }
}

#[derive(Debug)]
pub struct Plane {
    device: DeviceId,
    /// None for planes synthesized for CRTCs lacking a hardware cursor plane.
    id: Option<u32>,
    plane_type: PlaneType,
    possible_crtcs: u32,

    rotation_prop_id: Option<u32>,
    all_hw_transforms: u32,
    rotation_map: [u64; 8],

    /// Supported formats, each with its supported modifiers, if known.
    formats: BTreeMap<u32, Option<Vec<u64>>>,
}

impl Plane {
    pub(crate) fn new(
        device: DeviceId,
        plane_type: PlaneType,
        info: &PlaneInfo,
        props: &[(PropertyInfo, u64)],
        backend: &dyn DrmBackend,
    ) -> Self {
        let mut plane = Self {
            device,
            id: Some(info.id),
            plane_type,
            possible_crtcs: info.possible_crtcs,
            rotation_prop_id: None,
            all_hw_transforms: 0,
            rotation_map: [0; 8],
            formats: BTreeMap::new(),
        };

        if let Some((prop, _)) = props.iter().find(|(p, _)| p.name == "rotation") {
            plane.rotation_prop_id = Some(prop.id);
            plane.parse_rotations(prop);
        }

        if let Some((_, blob_id)) = props.iter().find(|(p, _)| p.name == "IN_FORMATS") {
            if *blob_id != 0 {
                match backend.property_blob(*blob_id as u32) {
                    Ok(blob) => plane.formats.extend(parse_in_formats(&blob)),
                    Err(errno) => {
                        warn!(plane_id = info.id, %errno, "failed to read IN_FORMATS")
                    }
                }
            }
        }

        if plane.formats.is_empty() {
            plane.formats.extend(info.formats.iter().map(|f| (*f, None)));
        }

        // Fall back to something that is probably supported.
        if plane.formats.is_empty() {
            debug!(plane_id = info.id, "no format list, using defaults");
            plane.formats.insert(DrmFourcc::Xrgb8888 as u32, None);
            if cfg!(target_endian = "little") {
                plane.formats.insert(DrmFourcc::Xbgr8888 as u32, None);
            }
        }

        plane
    }

    pub(crate) fn new_fake(plane_type: PlaneType, crtc: &Crtc) -> Self {
        let mut formats = BTreeMap::new();
        formats.insert(DrmFourcc::Xrgb8888 as u32, None);
        formats.insert(DrmFourcc::Argb8888 as u32, None);
        if cfg!(target_endian = "little") {
            formats.insert(DrmFourcc::Xbgr8888 as u32, None);
            formats.insert(DrmFourcc::Abgr8888 as u32, None);
        }

        Self {
            device: crtc.device_id(),
            id: None,
            plane_type,
            possible_crtcs: crtc.mask(),
            rotation_prop_id: None,
            all_hw_transforms: 0,
            rotation_map: [0; 8],
            formats,
        }
    }

    fn parse_rotations(&mut self, prop: &PropertyInfo) {
        let values = match &prop.kind {
            PropertyKind::Enum(values) | PropertyKind::Bitmask(values) => values,
            _ => return,
        };

        for v in values {
            let transform = match v.name.as_str() {
                "rotate-0" => Transform::Normal,
                "rotate-90" => Transform::Rotate90,
                "rotate-180" => Transform::Rotate180,
                "rotate-270" => Transform::Rotate270,
                _ => continue,
            };

            let Some(hw_value) = u32::try_from(v.value)
                .ok()
                .and_then(|shift| 1u64.checked_shl(shift))
            else {
                warn!(value = v.value, "rotation value out of range");
                continue;
            };

            self.all_hw_transforms |= transform.bit();
            self.rotation_map[transform as usize] = hw_value;
        }
    }

    /// The hardware id, or None for a fake plane.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn is_fake(&self) -> bool {
        self.id.is_none()
    }

    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    pub fn is_usable_with(&self, crtc: &Crtc) -> bool {
        self.possible_crtcs & crtc.mask() != 0
    }

    /// Whether the plane can apply the transform at scan-out. Transforms
    /// that swap the axes are never handled, whatever the hardware claims.
    pub fn is_transform_handled(&self, transform: Transform) -> bool {
        if transform.is_rotated() {
            return false;
        }

        self.all_hw_transforms & transform.bit() != 0
    }

    /// Stages a rotation on the assignment. The transform must be handled.
    pub fn set_rotation(&self, assignment: &mut PlaneAssignment, transform: Transform) {
        debug_assert!(self.is_transform_handled(transform));
        if !self.is_transform_handled(transform) {
            return;
        }

        if let Some(prop_id) = self.rotation_prop_id {
            assignment.set_plane_property(prop_id, self.rotation_map[transform as usize]);
        }
    }

    pub fn is_format_supported(&self, format: u32) -> bool {
        self.formats.contains_key(&format)
    }

    /// The modifiers supported for the format. None means either that the
    /// format is unsupported or that no modifier restrictions are known.
    pub fn modifiers_for_format(&self, format: u32) -> Option<&[u64]> {
        self.formats.get(&format).and_then(|m| m.as_deref())
    }

    pub fn formats(&self) -> impl Iterator<Item = u32> + '_ {
        self.formats.keys().copied()
    }
}

pub(crate) const IN_FORMATS_HEADER_LEN: usize = 24;
pub(crate) const IN_FORMATS_MODIFIER_LEN: usize = 24;

fn read_header(r: &mut io::Cursor<&[u8]>) -> io::Result<(usize, usize, usize, usize)> {
    // Skips the version and flags.
    r.set_position(8);

    Ok((
        r.read_u32::<NE>()? as usize,
        r.read_u32::<NE>()? as usize,
        r.read_u32::<NE>()? as usize,
        r.read_u32::<NE>()? as usize,
    ))
}

fn read_modifier(r: &mut io::Cursor<&[u8]>) -> io::Result<(u64, usize, u64)> {
    let mask = r.read_u64::<NE>()?;
    let offset = r.read_u32::<NE>()? as usize;
    let _pad = r.read_u32::<NE>()?;
    let modifier = r.read_u64::<NE>()?;

    Ok((mask, offset, modifier))
}

/// Parses an IN_FORMATS property blob into formats and their modifiers.
/// Modifier records each cover a window of 64 formats, starting at their
/// offset.
pub fn parse_in_formats(blob: &[u8]) -> Vec<(u32, Option<Vec<u64>>)> {
    if blob.len() < IN_FORMATS_HEADER_LEN {
        return Vec::new();
    }

    let mut r = io::Cursor::new(blob);
    let Ok((count_formats, formats_offset, count_modifiers, modifiers_offset)) =
        read_header(&mut r)
    else {
        return Vec::new();
    };

    // The counts can't be larger than what fits in the blob.
    let count_formats = count_formats.min(blob.len() / 4);
    let count_modifiers = count_modifiers.min(blob.len() / IN_FORMATS_MODIFIER_LEN);

    r.set_position(modifiers_offset as u64);
    let mut modifiers = Vec::with_capacity(count_modifiers);
    for _ in 0..count_modifiers {
        match read_modifier(&mut r) {
            Ok(modifier) => modifiers.push(modifier),
            Err(_) => break,
        }
    }

    r.set_position(formats_offset as u64);
    let mut res = Vec::with_capacity(count_formats);
    for fmt_i in 0..count_formats {
        let Ok(format) = r.read_u32::<NE>() else {
            break;
        };

        let supported: Vec<u64> = modifiers
            .iter()
            .filter(|(mask, offset, _)| {
                fmt_i >= *offset
                    && fmt_i < *offset + 64
                    && *mask & (1u64 << (fmt_i - *offset)) != 0
            })
            .map(|(_, _, modifier)| *modifier)
            .collect();

        res.push((format, (!supported.is_empty()).then_some(supported)));
    }

    res
}
