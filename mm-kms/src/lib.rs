// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Kernel mode setting for a compositor, using the legacy (non-atomic) DRM
//! interface.
//!
//! The entry point is [Kms], which owns a set of [Device]s. Each device
//! exposes its connectors, CRTCs, and planes as shared entities with cached
//! state. Changes are staged in a [KmsUpdate] and submitted with
//! [Kms::post_pending_update_sync]; page flip outcomes are delivered later,
//! through the [PageFlipFeedback] attached to each request.

mod engine;
mod error;
mod impl_device;
mod kms;
mod waking_sender;

pub mod backend;
pub mod connector;
pub mod crtc;
pub mod device;
pub mod drm;
pub mod fixed;
pub mod mode;
pub mod page_flip;
pub mod plane;
pub mod transform;
pub mod update;

#[cfg(test)]
mod testing;

pub use connector::{Connector, ConnectorState, DpmsState};
pub use crtc::{Crtc, CrtcState, GammaRamp};
pub use device::{Device, DeviceCaps, DeviceFlags, DeviceId};
pub use error::KmsError;
pub use kms::{ImplContext, Kms, KmsConfig};
pub use mode::ModeInfo;
pub use page_flip::{PageFlipFeedback, PageFlipOutcome};
pub use plane::{Plane, PlaneType};
pub use transform::Transform;
pub use update::{KmsFeedback, KmsUpdate};
