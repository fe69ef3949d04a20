// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use mm_kms::DeviceFlags;

const DEV_DRI: &str = "/dev/dri";
const SYS_CLASS_DRM: &str = "/sys/class/drm";

/// Lists the primary DRM nodes (card*), in name order.
pub fn card_nodes() -> anyhow::Result<Vec<PathBuf>> {
    card_nodes_in(Path::new(DEV_DRI))
}

fn card_nodes_in(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in dir
        .read_dir()
        .context(format!("reading {}", dir.display()))?
    {
        let entry = entry?;
        if is_card_node(&entry.file_name()) {
            paths.push(entry.path());
        }
    }

    paths.sort();
    Ok(paths)
}

fn is_card_node(name: &OsStr) -> bool {
    name.to_str()
        .and_then(|name| name.strip_prefix("card"))
        .is_some_and(|idx| !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit()))
}

/// Looks up the flags for a device node in sysfs.
pub fn device_flags(path: &Path) -> DeviceFlags {
    device_flags_in(Path::new(SYS_CLASS_DRM), path)
}

fn device_flags_in(sysfs: &Path, path: &Path) -> DeviceFlags {
    let mut flags = DeviceFlags::empty();
    let Some(name) = path.file_name() else {
        return flags;
    };

    let device = sysfs.join(name).join("device");
    if std::fs::read_to_string(device.join("boot_vga")).is_ok_and(|s| s.trim() == "1") {
        flags |= DeviceFlags::BOOT_VGA;
    }

    let subsystem = std::fs::read_link(device.join("subsystem")).ok();
    if subsystem.is_some_and(|p| p.file_name() == Some(OsStr::new("platform"))) {
        flags |= DeviceFlags::PLATFORM_DEVICE;
    }

    flags
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mmkmsctl-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn card_node_names() {
        assert!(is_card_node(OsStr::new("card0")));
        assert!(is_card_node(OsStr::new("card12")));
        assert!(!is_card_node(OsStr::new("card")));
        assert!(!is_card_node(OsStr::new("card0-HDMI-A-1")));
        assert!(!is_card_node(OsStr::new("renderD128")));
    }

    #[test]
    fn list_card_nodes() {
        let dir = temp_dir("nodes");
        for name in ["card1", "renderD128", "card0", "by-path"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        assert_eq!(
            card_nodes_in(&dir).unwrap(),
            vec![dir.join("card0"), dir.join("card1")]
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn flags_from_sysfs() {
        let sysfs = temp_dir("sysfs");

        let card0 = sysfs.join("card0/device");
        std::fs::create_dir_all(&card0).unwrap();
        std::fs::write(card0.join("boot_vga"), b"1\n").unwrap();

        let card1 = sysfs.join("card1/device");
        std::fs::create_dir_all(&card1).unwrap();
        std::fs::write(card1.join("boot_vga"), b"0\n").unwrap();
        std::os::unix::fs::symlink("../../../bus/platform", card1.join("subsystem")).unwrap();

        assert_eq!(
            device_flags_in(&sysfs, Path::new("/dev/dri/card0")),
            DeviceFlags::BOOT_VGA
        );
        assert_eq!(
            device_flags_in(&sysfs, Path::new("/dev/dri/card1")),
            DeviceFlags::PLATFORM_DEVICE
        );
        assert_eq!(
            device_flags_in(&sysfs, Path::new("/dev/dri/card2")),
            DeviceFlags::empty()
        );

        std::fs::remove_dir_all(&sysfs).unwrap();
    }
}
