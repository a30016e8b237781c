// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Architecture backends.
//!
//! The VM core drives one of these through a fixed surface: `RAM_BASE`,
//! `init`, `cpu_init`, `init_platform_devices`, `load_image`, `load_initrd`,
//! `late_init` and `irq_line`. Everything else is arch-private state behind
//! `ArchState`.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
