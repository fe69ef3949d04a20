// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

/// A display mode, field for field the kernel's mode descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

pub const MODE_TYPE_PREFERRED: u32 = 1 << 3;

impl ModeInfo {
    /// The refresh rate in Hz, derived from the pixel clock and the totals.
    /// Zero if the mode has no timings.
    pub fn refresh_rate(&self) -> f32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return 0.0;
        }

        let numerator = self.clock as f64 * 1000.0;
        let denominator = self.htotal as f64 * self.vtotal as f64;
        (numerator / denominator) as f32
    }

    /// The time between two vblanks, used to schedule flip retries.
    pub fn refresh_period(&self) -> Option<std::time::Duration> {
        let rate = self.refresh_rate();
        if rate > 0.0 {
            Some(std::time::Duration::from_micros((1_000_000.0 / rate) as u64))
        } else {
            None
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type & MODE_TYPE_PREFERRED != 0
    }
}

impl std::fmt::Display for ModeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}@{:.2}",
            self.hdisplay,
            self.vdisplay,
            self.refresh_rate()
        )
    }
}

#[cfg(test)]
pub(crate) fn test_mode(width: u16, height: u16) -> ModeInfo {
    // CEA 1080p60 timings, scaled horizontally.
    ModeInfo {
        clock: 148500,
        hdisplay: width,
        hsync_start: width + 88,
        hsync_end: width + 132,
        htotal: width + 280,
        vdisplay: height,
        vsync_start: height + 4,
        vsync_end: height + 9,
        vtotal: height + 45,
        vrefresh: 60,
        name: format!("{}x{}", width, height),
        ..Default::default()
    }
}
