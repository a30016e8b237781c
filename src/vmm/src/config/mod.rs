use std::path::PathBuf;

mod builder;

pub use builder::VMMConfigBuilder;

/// VMM configuration.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VMMConfig {
    /// Path to the kernel image.
    pub kernel: PathBuf,

    /// Optional initial RAM disk.
    pub initrd: Option<PathBuf>,

    /// Optional disk image backing a virtio-blk device.
    pub disk: Option<PathBuf>,
}

impl VMMConfig {
    /// Create the builder to generate a vmm config.
    pub fn builder<P: Into<PathBuf>>(kernel: P) -> VMMConfigBuilder {
        VMMConfigBuilder::new(kernel)
    }
}
