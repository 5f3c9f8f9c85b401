//! Well-known keys of the storage class parameters, secrets and publish
//! context. Parameters travel verbatim from CreateVolume to every node call
//! as the volume context.

pub const FS_TYPE: &str = "fsType";
pub const POOL: &str = "pool";
pub const TARGET_IQN: &str = "iqn";
pub const PORTALS: &str = "portals";
pub const INITIATOR_NAME: &str = "initiatorName";
pub const UNIQUE_INITIATOR_NAME_BY_PVC: &str = "uniqueInitiatorNameByPvc";
pub const API_ADDRESS: &str = "apiAddress";

pub const USERNAME_SECRET: &str = "username";
pub const PASSWORD_SECRET: &str = "password";

/// Publish context key carrying the LUN chosen by the controller.
pub const LUN: &str = "lun";

/// Highest LUN the array can assign to a host.
pub const MAXIMUM_LUN: u32 = 255;

/// Longest volume name the array accepts.
pub const VOLUME_NAME_MAX_LENGTH: usize = 32;
