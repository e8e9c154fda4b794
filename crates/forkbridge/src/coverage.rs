//! Edge coverage for traced source locations.
//!
//! Every traced event carries a source path and a line. We hash the pair into
//! a bucket of the fuzzer's map and count the edge between this bucket and the
//! previous one, exactly like AFL's compile-time instrumentation does for
//! basic blocks.

use core::fmt::{self, Debug};

pub use crate::config::MAP_SIZE;
use crate::{
    config::BridgeConfig,
    shmem::{ShMem, ShMemProvider},
    Error,
};

const FNV_OFFSET_BASIS: u32 = 0x811C9DC5;
const FNV_PRIME: u32 = 0x01000193;

/// 32-bit FNV-1 style hash over a source location.
///
/// The path is folded in byte by byte, then the line from its least
/// significant byte upwards, stopping as soon as the remaining value is zero.
/// Line `0` therefore adds no bytes at all. Fuzzers pair bitmap bytes with
/// locations through this exact function, so it must not change.
#[must_use]
#[inline]
pub fn fnv_hash(path: &[u8], line: u32) -> u32 {
    let mut h = FNV_OFFSET_BASIS;
    for &byte in path {
        h ^= u32::from(byte);
        h = h.wrapping_mul(FNV_PRIME);
    }
    let mut rest = line;
    while rest > 0 {
        h ^= rest & 0xff;
        h = h.wrapping_mul(FNV_PRIME);
        rest >>= 8;
    }
    h
}

/// The map bucket for a location, in `[0, map_size)`.
#[must_use]
#[inline]
pub fn edge_bucket(path: &[u8], line: u32, map_size: usize) -> u32 {
    // map_size is checked to fit u32 by `BridgeConfig::validate`
    fnv_hash(path, line) % (map_size as u32)
}

/// The coverage bitmap, usually shared with the fuzzer.
pub struct CoverageMap {
    shmem: Box<dyn ShMem>,
}

impl Debug for CoverageMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageMap")
            .field("id", &self.shmem.id())
            .field("len", &self.shmem.len())
            .finish()
    }
}

impl CoverageMap {
    /// Wrap an already mapped region.
    pub fn new<SHM: ShMem + 'static>(shmem: SHM) -> Result<Self, Error> {
        if shmem.is_empty() {
            return Err(Error::illegal_argument("coverage map must not be empty"));
        }
        Ok(Self {
            shmem: Box::new(shmem),
        })
    }

    /// Size of the map, in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    /// Maps are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The counters
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.shmem
    }

    /// Bump the counter at `idx`, wrapping on overflow like AFL does.
    #[inline]
    fn hit(&mut self, idx: usize) {
        let map: &mut [u8] = &mut self.shmem;
        if let Some(counter) = map.get_mut(idx) {
            *counter = counter.wrapping_add(1);
        }
    }
}

/// Records edges between consecutive traced locations.
#[derive(Debug)]
pub struct CoverageRecorder {
    map: Option<CoverageMap>,
    map_size: usize,
    prev_location: u32,
}

impl Default for CoverageRecorder {
    fn default() -> Self {
        Self::new(MAP_SIZE)
    }
}

impl CoverageRecorder {
    /// A recorder without a map. Recording does nothing until a map is attached.
    #[must_use]
    pub fn new(map_size: usize) -> Self {
        Self {
            map: None,
            map_size,
            prev_location: 0,
        }
    }

    /// Attach to the fuzzer's map named in the environment.
    ///
    /// Returns `Ok(false)` if the environment does not name a map. That is
    /// how a program runs without a fuzzer, so it is only logged.
    pub fn attach<SP: ShMemProvider>(
        &mut self,
        provider: &mut SP,
        config: &BridgeConfig,
    ) -> Result<bool, Error>
    where
        SP::ShMem: 'static,
    {
        if self.map.is_some() {
            return Err(Error::illegal_state(
                "coverage map is already attached, refusing to attach twice",
            ));
        }
        let Some(shmem) = provider.existing_from_env(&config.shm_env_var, config.map_size)?
        else {
            log::warn!(
                "{} is not set, running without coverage feedback",
                config.shm_env_var
            );
            return Ok(false);
        };
        log::debug!(
            "Attached coverage map {} ({} bytes)",
            shmem.id(),
            config.map_size
        );
        self.map_size = config.map_size;
        self.map = Some(CoverageMap::new(shmem)?);
        Ok(true)
    }

    /// Use `map` as coverage map. Its length becomes the bucket modulus.
    pub fn attach_map(&mut self, map: CoverageMap) -> Result<(), Error> {
        if self.map.is_some() {
            return Err(Error::illegal_state(
                "coverage map is already attached, refusing to attach twice",
            ));
        }
        if u32::try_from(map.len()).is_err() {
            return Err(Error::illegal_argument(format!(
                "coverage map of {} bytes does not fit the 32 bit edge hash",
                map.len()
            )));
        }
        self.map_size = map.len();
        self.map = Some(map);
        Ok(())
    }

    /// Whether recording reaches a map.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.map.is_some()
    }

    /// The attached map, if any
    #[must_use]
    pub fn map(&self) -> Option<&CoverageMap> {
        self.map.as_ref()
    }

    /// The bucket modulus
    #[must_use]
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// The previous location, already shifted.
    #[must_use]
    pub fn prev_location(&self) -> u32 {
        self.prev_location
    }

    /// Forget the path taken so far. Used at the start of each persistent run.
    pub fn reset_location(&mut self) {
        self.prev_location = 0;
    }

    /// Record one traced event at `path:line`.
    #[inline]
    pub fn record(&mut self, path: &[u8], line: u32) {
        let Some(map) = self.map.as_mut() else {
            return;
        };
        let cur = edge_bucket(path, line, self.map_size);
        map.hit((cur ^ self.prev_location) as usize);
        self.prev_location = cur >> 1;
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use serial_test::serial;

    use super::{edge_bucket, fnv_hash, CoverageMap, CoverageRecorder, MAP_SIZE};
    use crate::{
        config::BridgeConfig,
        shmem::{NopShMemProvider, ShMem, ShMemProvider, UnixShMemProvider},
        Error,
    };

    fn recorder_with_map(size: usize) -> CoverageRecorder {
        let shmem = NopShMemProvider.new_shmem(size).unwrap();
        let mut recorder = CoverageRecorder::default();
        recorder.attach_map(CoverageMap::new(shmem).unwrap()).unwrap();
        recorder
    }

    #[test]
    fn test_fnv_known_vectors() {
        assert_eq!(fnv_hash(b"", 0), 0x811C9DC5);
        assert_eq!(fnv_hash(b"", 42), 789356349);
        assert_eq!(fnv_hash(b"moo", 23), 3934561083);
        assert_eq!(fnv_hash(b"moo", 37), 3162790609);
        assert_eq!(fnv_hash("wół".as_bytes(), 23), 2298935884);
        assert_eq!(fnv_hash("wół".as_bytes(), 37), 3137816834);
    }

    #[test]
    fn test_fnv_is_stable_and_order_sensitive() {
        let a = fnv_hash(b"lib/parser.rb", 120);
        assert_eq!(a, fnv_hash(b"lib/parser.rb", 120));
        assert_ne!(fnv_hash(b"ab", 1), fnv_hash(b"ba", 1));
        // 256 is folded as the bytes 0x00, 0x01, not skipped
        assert_ne!(fnv_hash(b"x", 256), fnv_hash(b"x", 1));
    }

    #[test]
    fn test_bucket_range() {
        for size in [1, 7, 4096, MAP_SIZE] {
            for line in [0, 1, 255, 256, 65535, u32::MAX] {
                for path in [&b""[..], b"a", b"some/long/path/to/file.rb"] {
                    assert!((edge_bucket(path, line, size) as usize) < size);
                }
            }
        }
        assert_eq!(edge_bucket(b"", 0, MAP_SIZE), 0x811C9DC5 % 65536);
    }

    #[test]
    fn test_record_without_map_is_noop() {
        let mut recorder = CoverageRecorder::default();
        recorder.record(b"main.rb", 1);
        recorder.record(b"main.rb", 2);
        assert!(!recorder.is_attached());
        assert_eq!(recorder.prev_location(), 0);
    }

    #[test]
    fn test_previous_location_fold() {
        let mut recorder = recorder_with_map(MAP_SIZE);
        let events: [(&[u8], u32); 4] = [
            (b"a.rb", 1),
            (b"a.rb", 2),
            (b"b.rb", 10),
            (b"a.rb", 1),
        ];

        let mut expected = vec![0u8; MAP_SIZE];
        let mut prev = 0;
        for (path, line) in events {
            let cur = edge_bucket(path, line, MAP_SIZE);
            expected[(cur ^ prev) as usize] += 1;
            prev = cur >> 1;
            recorder.record(path, line);
            assert_eq!(recorder.prev_location(), prev);
        }

        let first = edge_bucket(b"a.rb", 1, MAP_SIZE) as usize;
        assert!(recorder.map().unwrap().as_slice()[first] >= 1);
        assert_eq!(recorder.map().unwrap().as_slice(), &expected[..]);
    }

    #[test]
    fn test_counters_wrap() {
        let mut recorder = recorder_with_map(MAP_SIZE);
        let idx = edge_bucket(b"hot.rb", 3, MAP_SIZE) as usize;
        for _ in 0..256 {
            recorder.record(b"hot.rb", 3);
            recorder.reset_location();
        }
        assert_eq!(recorder.map().unwrap().as_slice()[idx], 0);
        recorder.record(b"hot.rb", 3);
        assert_eq!(recorder.map().unwrap().as_slice()[idx], 1);
    }

    #[test]
    fn test_attach_map_twice_fails() {
        let mut recorder = recorder_with_map(64);
        let again = CoverageMap::new(NopShMemProvider.new_shmem(64).unwrap()).unwrap();
        assert!(matches!(
            recorder.attach_map(again),
            Err(Error::IllegalState(..))
        ));
        assert_eq!(recorder.map_size(), 64);
    }

    #[test]
    #[serial]
    fn test_attach_from_env() {
        let config = BridgeConfig::builder()
            .shm_env_var("FORKBRIDGE_TEST_COVERAGE_SHM")
            .map_size(128)
            .build();
        let mut provider = NopShMemProvider;

        env::remove_var("FORKBRIDGE_TEST_COVERAGE_SHM");
        let mut recorder = CoverageRecorder::default();
        assert!(!recorder.attach(&mut provider, &config).unwrap());
        assert!(!recorder.is_attached());

        env::set_var("FORKBRIDGE_TEST_COVERAGE_SHM", "garbage");
        assert!(matches!(
            recorder.attach(&mut provider, &config),
            Err(Error::IllegalArgument(..))
        ));

        env::set_var("FORKBRIDGE_TEST_COVERAGE_SHM", "17");
        assert!(recorder.attach(&mut provider, &config).unwrap());
        assert_eq!(recorder.map().unwrap().len(), 128);
        assert!(matches!(
            recorder.attach(&mut provider, &config),
            Err(Error::IllegalState(..))
        ));
        env::remove_var("FORKBRIDGE_TEST_COVERAGE_SHM");
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_attach_rejects_small_fuzzer_segment() {
        let mut provider = UnixShMemProvider;
        let segment = provider.new_shmem(4096).unwrap();
        let config = BridgeConfig::builder()
            .shm_env_var("FORKBRIDGE_TEST_SMALL_SHM")
            .build();
        assert_eq!(config.map_size, MAP_SIZE);

        env::set_var("FORKBRIDGE_TEST_SMALL_SHM", segment.id().to_string());
        let mut recorder = CoverageRecorder::default();
        let res = recorder.attach(&mut provider, &config);
        env::remove_var("FORKBRIDGE_TEST_SMALL_SHM");

        assert!(matches!(res, Err(Error::IllegalArgument(..))), "{res:?}");
        assert!(!recorder.is_attached());
        recorder.record(b"lib/parser.rb", 120);
    }
}
