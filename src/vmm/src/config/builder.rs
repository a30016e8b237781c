use crate::config::VMMConfig;
use std::path::PathBuf;

/// See VMMConfig for explanation about these options
#[derive(Debug, Default)]
pub struct VMMConfigBuilder {
    kernel: PathBuf,
    initrd: Option<PathBuf>,
    disk: Option<PathBuf>,
}

impl VMMConfigBuilder {
    pub fn new<P: Into<PathBuf>>(kernel: P) -> Self {
        VMMConfigBuilder {
            kernel: kernel.into(),
            ..Default::default()
        }
    }

    /// This method should be called when config is done, it generates the
    /// needed config
    pub fn build(self) -> VMMConfig {
        VMMConfig {
            kernel: self.kernel,
            initrd: self.initrd,
            disk: self.disk,
        }
    }

    pub fn initrd(mut self, initrd: Option<PathBuf>) -> Self {
        self.initrd = initrd;
        self
    }

    pub fn disk(mut self, disk: Option<PathBuf>) -> Self {
        self.disk = disk;
        self
    }
}
