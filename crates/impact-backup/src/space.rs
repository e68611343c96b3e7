use std::{io, path::Path};

/// Reports free bytes on the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Queries the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSpace;

impl SpaceProbe for DiskSpace {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs4::available_space(path)
    }
}

/// Reports a fixed amount, for tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}
