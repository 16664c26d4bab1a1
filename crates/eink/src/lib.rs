//! Display and input access for e-ink devices.
//!
//! The framebuffer is the mapped display memory of an 8 bpp grayscale
//! panel; refreshes go through the MXCFB update ioctl with an explicit
//! waveform. Touch and power-button input comes from a raw evdev stream.

pub mod framebuffer;
pub mod input;
pub mod refresh;

pub use framebuffer::{EinkError, Framebuffer};
pub use input::{InputDevice, InputStreams, PowerEvent, TouchEvent};
pub use refresh::{Region, Update};
