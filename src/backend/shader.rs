// Shader module loading
//
// Vulkan consumes SPIR-V words. Binaries are read through the resource
// loader, validated by `ash::util::read_spv` and wrapped in a module that is
// destroyed as soon as it goes out of scope.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::error::BackendError;
use super::Device;
use crate::resource::read_resource;

/// Decode a SPIR-V binary into aligned words.
pub fn parse_spirv(bytes: &[u8]) -> std::io::Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = read_resource(path)?;
    parse_spirv(&bytes)
        .map_err(|_| BackendError::InvalidSpirv {
            path: path.display().to_string(),
        })
        .with_context(|| format!("Failed to load shader {:?}", path))
}

/// Shader module that lives only as long as pipeline creation needs it.
pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    device: &'a Device,
}

impl<'a> ShaderModule<'a> {
    pub fn new(device: &'a Device, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { module, device })
    }

    pub fn load(device: &'a Device, path: &Path) -> Result<Self> {
        let code = load_spirv(path)?;
        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Self::new(device, &code)
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spirv_words() {
        let magic = 0x0723_0203u32;
        let mut bytes = magic.to_le_bytes().to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());

        assert_eq!(parse_spirv(&bytes).unwrap(), vec![magic, 7]);
    }

    #[test]
    fn test_parse_spirv_rejects_partial_words() {
        assert!(parse_spirv(&[0x03, 0x02, 0x23]).is_err());
    }
}
