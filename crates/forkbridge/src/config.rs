//! Constants and runtime configuration shared with the fuzzer side.

use std::{borrow::Cow, env, os::fd::RawFd};

use typed_builder::TypedBuilder;

use crate::Error;

/// The first descriptor of the forkserver pair: the fuzzer writes requests here.
/// The reply descriptor is `FORKSRV_FD + 1`.
pub const FORKSRV_FD: RawFd = 198;

/// Environment variable holding the SysV id of the coverage map segment.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Environment variable overriding the coverage map size.
pub const AFL_MAP_SIZE_ENV_VAR: &str = "AFL_MAP_SIZE";

/// The coverage map size the fuzzer allocates unless told otherwise.
pub const MAP_SIZE: usize = 1 << 16;

/// Where to find the fuzzer and how large its map is.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct BridgeConfig {
    /// Name of the variable carrying the shared memory id
    #[builder(default = Cow::Borrowed(SHM_ENV_VAR), setter(into))]
    pub shm_env_var: Cow<'static, str>,
    /// Name of the variable carrying an optional map size override
    #[builder(default = Cow::Borrowed(AFL_MAP_SIZE_ENV_VAR), setter(into))]
    pub map_size_env_var: Cow<'static, str>,
    /// Size of the coverage map, in bytes
    #[builder(default = MAP_SIZE)]
    pub map_size: usize,
    /// The request descriptor; replies go to `forkserver_fd + 1`
    #[builder(default = FORKSRV_FD)]
    pub forkserver_fd: RawFd,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BridgeConfig {
    /// Default configuration, with the map size taken from [`AFL_MAP_SIZE_ENV_VAR`] if set.
    pub fn from_env() -> Result<Self, Error> {
        Self::default().with_env_overrides()
    }

    /// Apply the map size override from the environment, if any.
    pub fn with_env_overrides(mut self) -> Result<Self, Error> {
        match env::var(self.map_size_env_var.as_ref()) {
            Ok(size_str) => {
                let map_size: usize = size_str.trim().parse().map_err(|_| {
                    Error::illegal_argument(format!(
                        "Invalid {} value: {size_str:?}",
                        self.map_size_env_var
                    ))
                })?;
                self.map_size = map_size;
            }
            Err(env::VarError::NotPresent) => {}
            Err(env::VarError::NotUnicode(raw)) => {
                return Err(Error::illegal_argument(format!(
                    "{} is not valid unicode: {raw:?}",
                    self.map_size_env_var
                )));
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Check the values make sense before anything touches the fuzzer.
    pub fn validate(&self) -> Result<(), Error> {
        if self.map_size == 0 {
            return Err(Error::illegal_argument("coverage map size must not be zero"));
        }
        if u32::try_from(self.map_size).is_err() {
            return Err(Error::illegal_argument(format!(
                "coverage map size {} does not fit the 32 bit edge hash",
                self.map_size
            )));
        }
        if self.forkserver_fd < 0 || self.forkserver_fd == RawFd::MAX {
            return Err(Error::illegal_argument(format!(
                "invalid forkserver descriptor {}",
                self.forkserver_fd
            )));
        }
        Ok(())
    }

    /// The descriptor we read kill notices from
    #[must_use]
    pub fn control_fd(&self) -> RawFd {
        self.forkserver_fd
    }

    /// The descriptor we write the probe, pids and statuses to
    #[must_use]
    pub fn status_fd(&self) -> RawFd {
        self.forkserver_fd + 1
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use serial_test::serial;

    use super::{BridgeConfig, FORKSRV_FD, MAP_SIZE, SHM_ENV_VAR};
    use crate::Error;

    #[test]
    fn test_defaults_match_afl() {
        let config = BridgeConfig::default();
        assert_eq!(config.shm_env_var, SHM_ENV_VAR);
        assert_eq!(config.map_size, 65536);
        assert_eq!(config.control_fd(), FORKSRV_FD);
        assert_eq!(config.status_fd(), 199);
        config.validate().unwrap();
    }

    #[test]
    fn test_builder_rejects_zero_map() {
        let config = BridgeConfig::builder().map_size(0).build();
        assert!(matches!(config.validate(), Err(Error::IllegalArgument(..))));
    }

    #[test]
    #[serial]
    fn test_map_size_env_override() {
        let config = BridgeConfig::builder()
            .map_size_env_var("FORKBRIDGE_TEST_MAP_SIZE")
            .build();

        env::remove_var("FORKBRIDGE_TEST_MAP_SIZE");
        assert_eq!(config.clone().with_env_overrides().unwrap().map_size, MAP_SIZE);

        env::set_var("FORKBRIDGE_TEST_MAP_SIZE", " 4096 ");
        assert_eq!(config.clone().with_env_overrides().unwrap().map_size, 4096);

        env::set_var("FORKBRIDGE_TEST_MAP_SIZE", "lots");
        assert!(config.clone().with_env_overrides().is_err());

        env::set_var("FORKBRIDGE_TEST_MAP_SIZE", "0");
        assert!(config.with_env_overrides().is_err());

        env::remove_var("FORKBRIDGE_TEST_MAP_SIZE");
    }
}
