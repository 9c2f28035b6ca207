//! The set of firmware images to be written, keyed by flash offset
//!
//! Images come from a directory of `0x*.bin` files whose stems are the
//! flash offsets. The image at offset 0 is the boot image: the boot ROM
//! reads the flash chip parameters out of its header, so it gets patched
//! before writing.

use std::{collections::BTreeMap, fs, path::Path};

use log::{debug, warn};

use crate::{
    error::ImageLoadError,
    flasher::{FlashParams, FLASH_SECTOR_SIZE, FLASH_WRITE_SIZE},
};

/// Firmware image files are named after their flash offset
const IMAGE_PREFIX: &str = "0x";
const IMAGE_EXTENSION: &str = "bin";

/// Magic first byte of a bootable image header
pub(crate) const BOOT_IMAGE_MAGIC: u8 = 0xe9;

#[derive(Debug, Default, Clone)]
pub struct ImageMap {
    images: BTreeMap<u32, Vec<u8>>,
}

impl ImageMap {
    pub fn new() -> Self {
        ImageMap::default()
    }

    /// Loads every `0x*.bin` file in `dir`. The file stem parses as a
    /// base-16 flash offset, which must sit on a sector boundary.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ImageLoadError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ImageLoadError::DirectoryMissing(dir.to_path_buf()));
        }

        let mut map = ImageMap::new();
        let entries = fs::read_dir(dir).map_err(|source| ImageLoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| ImageLoadError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();

            let (stem, extension) = match (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) {
                (Some(stem), Some(extension)) => (stem, extension),
                _ => continue,
            };
            if !stem.starts_with(IMAGE_PREFIX) || !extension.eq_ignore_ascii_case(IMAGE_EXTENSION)
            {
                continue;
            }

            debug!("loading {}", path.display());
            let addr = u32::from_str_radix(&stem[IMAGE_PREFIX.len()..], 16)
                .map_err(|_| ImageLoadError::InvalidAddress(stem.to_string()))?;

            let bytes = fs::read(&path).map_err(|source| ImageLoadError::Io {
                path: path.clone(),
                source,
            })?;

            map.add(addr, bytes).map_err(|_| {
                ImageLoadError::UnalignedAddress {
                    file: stem.to_string(),
                    addr,
                }
            })?;
        }

        if map.is_empty() {
            return Err(ImageLoadError::NoImages(dir.to_path_buf()));
        }

        Ok(map)
    }

    /// Adds an image. The offset must sit on a sector boundary.
    pub fn add(&mut self, addr: u32, bytes: Vec<u8>) -> Result<(), ImageLoadError> {
        if addr as usize % FLASH_SECTOR_SIZE != 0 {
            return Err(ImageLoadError::UnalignedAddress {
                file: format!("{:#x}", addr),
                addr,
            });
        }
        self.images.insert(addr, bytes);
        Ok(())
    }

    pub(crate) fn insert(&mut self, addr: u32, bytes: Vec<u8>) {
        self.images.insert(addr, bytes);
    }

    pub fn get(&self, addr: u32) -> Option<&[u8]> {
        self.images.get(&addr).map(|bytes| bytes.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Iterates images in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.images
            .iter()
            .map(|(addr, bytes)| (*addr, bytes.as_slice()))
    }

    /// Number of write blocks needed to program every image; lets a UI
    /// size its progress bar before flashing starts.
    pub fn total_blocks(&self) -> u32 {
        self.images
            .values()
            .map(|bytes| ((bytes.len() + FLASH_WRITE_SIZE - 1) / FLASH_WRITE_SIZE) as u32)
            .sum()
    }

    /// Patches the boot image header and settles the effective flash
    /// parameters.
    ///
    /// If a boot image is present and `params` is set, its header bytes 2
    /// and 3 are overwritten with `params`. Whatever ends up in the boot
    /// image wins, since that is what the ROM will read after flashing.
    /// Without a boot image `params` passes through unchanged.
    pub fn patch_boot_params(&mut self, params: Option<FlashParams>) -> Option<FlashParams> {
        let boot = match self.images.get_mut(&0) {
            Some(bytes) if bytes.len() >= 4 && bytes[0] == BOOT_IMAGE_MAGIC => bytes,
            _ => return params,
        };

        if let Some(params) = params {
            let [hi, lo] = params.to_bytes();
            boot[2] = hi;
            boot[3] = lo;
            warn!("adjusting flash params in the boot image to {}", params);
        }

        Some(FlashParams::from_bytes(boot[2], boot[3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overwrites_header_and_returns_image_params() {
        let mut map = ImageMap::new();
        map.add(0, vec![0xe9, 0x00, 0xaa, 0xbb, 0x01]).unwrap();

        let params = map.patch_boot_params(Some(FlashParams::from_bytes(0x03, 0x02)));

        assert_eq!(&map.get(0).unwrap()[..4], &[0xe9, 0x00, 0x03, 0x02]);
        assert_eq!(params, Some(FlashParams::from_bytes(0x03, 0x02)));
    }

    #[test]
    fn boot_image_wins_when_no_params_supplied() {
        let mut map = ImageMap::new();
        map.add(0, vec![0xe9, 0x00, 0x02, 0x40]).unwrap();

        let params = map.patch_boot_params(None);
        assert_eq!(params, Some(FlashParams::from_bytes(0x02, 0x40)));
    }

    #[test]
    fn params_pass_through_without_boot_image() {
        let mut map = ImageMap::new();
        map.add(0x10000, vec![0x00; 16]).unwrap();

        let supplied = Some(FlashParams::from_bytes(0x02, 0x40));
        assert_eq!(map.patch_boot_params(supplied), supplied);
    }

    #[test]
    fn non_magic_boot_image_is_left_alone() {
        let mut map = ImageMap::new();
        map.add(0, vec![0x00, 0x00, 0xaa, 0xbb]).unwrap();

        let params = map.patch_boot_params(Some(FlashParams::from_bytes(0x03, 0x02)));
        assert_eq!(&map.get(0).unwrap()[2..4], &[0xaa, 0xbb]);
        assert_eq!(params, Some(FlashParams::from_bytes(0x03, 0x02)));
    }

    #[test]
    fn unaligned_offsets_are_rejected() {
        let mut map = ImageMap::new();
        assert!(map.add(0x1001, vec![0x00]).is_err());
    }

    #[test]
    fn total_blocks_rounds_up() {
        let mut map = ImageMap::new();
        map.add(0, vec![0u8; 1024]).unwrap();
        map.add(0x1000, vec![0u8; 1025]).unwrap();
        map.add(0x2000, vec![0u8; 1]).unwrap();
        assert_eq!(map.total_blocks(), 1 + 2 + 1);
    }
}
