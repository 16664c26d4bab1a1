//! MXCFB display refresh.
//!
//! Every commit to the panel ends in an update ioctl choosing the region,
//! update mode, and waveform. A2 is the fast binary waveform used for
//! partial updates; AUTO lets the controller pick.

use std::ptr;

use crate::framebuffer::{ioctl, EinkError, Framebuffer};

pub mod waveform {
    pub const INIT: u32 = 0;
    pub const DU: u32 = 1;
    pub const GC16: u32 = 2;
    pub const GC4: u32 = 3;
    pub const A2: u32 = 4;
    pub const AUTO: u32 = 257;
}

pub const UPDATE_MODE_PARTIAL: u32 = 0;
pub const UPDATE_MODE_FULL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

/// One refresh request. Defaults mean: full-screen region, partial update,
/// controller-chosen waveform.
#[derive(Debug, Clone, Copy, Default)]
pub struct Update {
    pub region: Option<Region>,
    pub full: bool,
    pub fast: bool,
    pub waveform: Option<u32>,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct MxcfbRect {
    top: u32,
    left: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct MxcfbUpdateData {
    update_region: MxcfbRect,
    waveform_mode: u32,
    update_mode: u32,
    update_marker: u32,
    temp: i32,
    flags: u32,
    alt_buffer: u32,
    alt_stride: u32,
}

const MXCFB_IOC_MAGIC: libc::c_ulong = b'F' as libc::c_ulong;
const MXCFB_SEND_UPDATE_NR: libc::c_ulong = 0x2E;

/// `_IOW('F', 0x2E, mxcfb_update_data)`
const fn iow(size: libc::c_ulong) -> libc::c_ulong {
    (1 << 30) | (size << 16) | (MXCFB_IOC_MAGIC << 8) | MXCFB_SEND_UPDATE_NR
}

const MXCFB_SEND_UPDATE: libc::c_ulong =
    iow(std::mem::size_of::<MxcfbUpdateData>() as libc::c_ulong);

impl Framebuffer {
    /// Issue a refresh for the given update. A no-op for in-memory
    /// framebuffers.
    pub fn refresh(&self, update: Update) -> Result<(), EinkError> {
        let Some(fd) = self.device_fd() else {
            return Ok(());
        };
        let mut data = build_update_data(update, self.width(), self.height());
        ioctl(fd, MXCFB_SEND_UPDATE, ptr::addr_of_mut!(data).cast())?;
        Ok(())
    }
}

fn build_update_data(update: Update, width: u32, height: u32) -> MxcfbUpdateData {
    let region = update.region.unwrap_or(Region {
        top: 0,
        left: 0,
        width,
        height,
    });
    let update_mode = if update.full {
        UPDATE_MODE_FULL
    } else {
        UPDATE_MODE_PARTIAL
    };
    let waveform = update.waveform.unwrap_or(if update.fast {
        waveform::A2
    } else {
        waveform::AUTO
    });
    MxcfbUpdateData {
        update_region: MxcfbRect {
            top: region.top,
            left: region.left,
            width: region.width,
            height: region.height,
        },
        waveform_mode: waveform,
        update_mode,
        update_marker: 0,
        temp: -1,
        flags: 0,
        alt_buffer: 0,
        alt_stride: 0,
    }
}
