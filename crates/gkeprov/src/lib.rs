pub mod common;
pub mod deployer;

pub type Error = crate::common::error::DeployerError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;

pub const GKEPROV_VERSION: &str = {
    match option_env!("GKEPROV_BUILD_VERSION") {
        Some(version) => version,
        None => env!("CARGO_PKG_VERSION"),
    }
};
