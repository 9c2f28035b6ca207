//! Interface to the on-flash filesystem
//!
//! The flasher treats the filesystem region as opaque: reading it,
//! handing it to an implementation of [FlashFilesystem] together with the
//! bundled image, and writing back whatever comes out. The actual
//! filesystem handling (SPIFFS) lives with the caller.

use crate::error::Error;

/// Flash offset of the filesystem region
pub const SPIFFS_OFFSET: u32 = 0x6d000;
/// Size of the filesystem region
pub const SPIFFS_SIZE: u32 = 0x10000;

/// A filesystem that can fold the bundled image into the content already
/// on the device.
///
/// `device` is the raw region read off the chip and `bundled` the region
/// shipped with the firmware (empty when the firmware bundle has none).
/// The returned serialization replaces the bundled image, keeping files
/// the user created on the device while updating the shipped ones.
pub trait FlashFilesystem {
    fn merge(&self, device: &[u8], bundled: &[u8]) -> Result<Vec<u8>, Error>;
}
