use metal::{Buffer, MTLResourceOptions};
use nngraph_core::backend::AccessMode;
use nngraph_core::{NnError, Result};

/// One shared-storage allocation; sub-buffers are offsets into it.
#[derive(Clone)]
pub struct MetalBuffer {
    pub buffer: Buffer,
    pub length: usize,
    pub access: AccessMode,
}

impl MetalBuffer {
    pub fn new(device: &metal::Device, length: usize, access: AccessMode) -> Self {
        let buffer = device.new_buffer(length.max(1) as u64, MTLResourceOptions::StorageModeShared);
        Self { buffer, length, access }
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.length {
            return Err(NnError::Range(format!(
                "{len} bytes at offset {offset} exceed Metal buffer of {} bytes",
                self.length
            )));
        }
        Ok(())
    }

    pub fn upload(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        let contents = self.buffer.contents() as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), contents.add(offset), data.len());
        }
        Ok(())
    }

    pub fn download(&self, offset: usize, output: &mut [u8]) -> Result<()> {
        self.check(offset, output.len())?;
        let contents = self.buffer.contents() as *const u8;
        unsafe {
            std::ptr::copy_nonoverlapping(contents.add(offset), output.as_mut_ptr(), output.len());
        }
        Ok(())
    }

    pub fn zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        let contents = self.buffer.contents() as *mut u8;
        unsafe {
            std::ptr::write_bytes(contents.add(offset), 0, len);
        }
        Ok(())
    }
}
