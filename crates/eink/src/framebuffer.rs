//! Mapped grayscale framebuffer.
//!
//! Owns the mmap'd screen memory of an 8 bpp panel. An in-memory backing
//! exists so the canvas pipeline can run without a display device; commits
//! succeed and refreshes are no-ops there.

use std::{
    fs,
    io::{self},
    os::fd::{AsRawFd, RawFd},
    path::Path,
    ptr,
};

use {image::GrayImage, tracing::debug};

#[derive(Debug, thiserror::Error)]
pub enum EinkError {
    #[error("unsupported bits-per-pixel: {0}")]
    UnsupportedBpp(u32),

    #[error("image size {got_width}x{got_height} does not match framebuffer {width}x{height}")]
    SizeMismatch {
        got_width: u32,
        got_height: u32,
        width: u32,
        height: u32,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    kind: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

impl Default for FbFixScreeninfo {
    fn default() -> Self {
        // SAFETY: all-zero bytes are a valid value for this C struct.
        unsafe { std::mem::zeroed() }
    }
}

enum Backing {
    Device {
        file: fs::File,
        map: *mut u8,
        map_len: usize,
    },
    Memory(Vec<u8>),
}

pub struct Framebuffer {
    backing: Backing,
    width: u32,
    height: u32,
    stride: usize,
}

// SAFETY: the mapped region is exclusively owned by this value for its
// whole lifetime and only touched through &mut self.
unsafe impl Send for Framebuffer {}

impl Framebuffer {
    /// Open and map a framebuffer device. The panel must expose 8 bpp.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EinkError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let fd = file.as_raw_fd();

        let mut vinfo = FbVarScreeninfo::default();
        ioctl(fd, FBIOGET_VSCREENINFO, ptr::addr_of_mut!(vinfo).cast())?;
        let mut finfo = FbFixScreeninfo::default();
        ioctl(fd, FBIOGET_FSCREENINFO, ptr::addr_of_mut!(finfo).cast())?;

        if vinfo.bits_per_pixel != 8 {
            return Err(EinkError::UnsupportedBpp(vinfo.bits_per_pixel));
        }

        let map_len = finfo.smem_len as usize;
        // SAFETY: fd is a valid open framebuffer and map_len comes from the
        // kernel's own fixed screen info.
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        debug!(
            width = vinfo.xres,
            height = vinfo.yres,
            stride = finfo.line_length,
            "framebuffer mapped"
        );
        Ok(Self {
            backing: Backing::Device {
                file,
                map: map.cast(),
                map_len,
            },
            width: vinfo.xres,
            height: vinfo.yres,
            stride: finfo.line_length as usize,
        })
    }

    /// A framebuffer backed by plain memory. Used when no display device is
    /// available; refreshes succeed as no-ops.
    pub fn new_in_memory(width: u32, height: u32) -> Self {
        Self {
            backing: Backing::Memory(vec![0; (width * height) as usize]),
            width,
            height,
            stride: width as usize,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Blit a full-size grayscale bitmap into the display memory, row by row
    /// to honour the device stride.
    pub fn write_gray(&mut self, image: &GrayImage) -> Result<(), EinkError> {
        if image.width() != self.width || image.height() != self.height {
            return Err(EinkError::SizeMismatch {
                got_width: image.width(),
                got_height: image.height(),
                width: self.width,
                height: self.height,
            });
        }
        let width = self.width as usize;
        let height = self.height as usize;
        let stride = self.stride;
        let src = image.as_raw();
        let dst = self.data_mut();
        for y in 0..height {
            dst[y * stride..y * stride + width]
                .copy_from_slice(&src[y * width..(y + 1) * width]);
        }
        Ok(())
    }

    pub(crate) fn device_fd(&self) -> Option<RawFd> {
        match &self.backing {
            Backing::Device { file, .. } => Some(file.as_raw_fd()),
            Backing::Memory(_) => None,
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            // SAFETY: the mapping stays valid until drop and we hold &mut.
            Backing::Device { map, map_len, .. } => unsafe {
                std::slice::from_raw_parts_mut(*map, *map_len)
            },
            Backing::Memory(data) => data,
        }
    }

    #[cfg(test)]
    pub(crate) fn data(&mut self) -> &[u8] {
        self.data_mut()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Backing::Device { map, map_len, .. } = &self.backing {
            // SAFETY: the mapping was created in open() and not yet unmapped.
            unsafe {
                libc::munmap(map.cast::<libc::c_void>(), *map_len);
            }
        }
    }
}

pub(crate) fn ioctl(
    fd: RawFd,
    request: libc::c_ulong,
    arg: *mut libc::c_void,
) -> io::Result<()> {
    // SAFETY: callers pass an argument struct matching the request.
    let rc = unsafe { libc::ioctl(fd, request as _, arg) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
