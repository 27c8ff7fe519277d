mod catalog;
mod config;
mod error;
mod host;
mod traits;

pub use catalog::{ImageCatalog, SourceImageSpec};
pub use config::{DiskSize, PortForward, ShareMount, SizeUnit, VmConfig, valid_name};
pub use error::{Result, VmError};
pub use host::{HostCapabilities, HostEnvironment};
pub use traits::{GuestIdentity, ImagePreparer, SeedBuilder};
