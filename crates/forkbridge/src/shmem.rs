//! The shared memory region the fuzzer reads coverage from.
//!
//! The fuzzer creates a SysV segment with `shmget` and hands us its id through
//! the environment. We only ever attach to it; the fuzzer owns its lifetime.

use core::{
    fmt::{self, Debug, Display},
    mem,
    ops::{Deref, DerefMut},
    ptr, slice,
    str::FromStr,
};
use std::env;

use libc::{c_int, c_uchar, c_void, shmat, shmctl, shmdt, shmget, shmid_ds};

use crate::Error;

/// The id of a SysV shared memory segment, as passed in the environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShMemId(i32);

impl ShMemId {
    /// Create a new id from an int
    #[must_use]
    pub const fn from_int(val: i32) -> Self {
        Self(val)
    }
}

impl FromStr for ShMemId {
    type Err = Error;

    /// Parses a decimal segment id. Whitespace around the number is tolerated,
    /// anything else is not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: i32 = s.trim().parse().map_err(|err| {
            Error::illegal_argument(format!("Invalid shared memory id {s:?}: {err}"))
        })?;
        if id < 0 {
            return Err(Error::illegal_argument(format!(
                "Invalid shared memory id {id}: ids are never negative"
            )));
        }
        Ok(Self(id))
    }
}

impl From<ShMemId> for i32 {
    fn from(id: ShMemId) -> i32 {
        id.0
    }
}

impl Display for ShMemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A [`ShMem`] is an interface to shared maps.
pub trait ShMem: Debug + DerefMut<Target = [u8]> {
    /// Get the id of this shared memory mapping
    fn id(&self) -> ShMemId;
}

/// A [`ShMemProvider`] provides access to shared maps.
pub trait ShMemProvider: Debug {
    /// The actual shared map handed out by this [`ShMemProvider`].
    type ShMem: ShMem;

    /// Create a new shared memory mapping
    fn new_shmem(&mut self, map_size: usize) -> Result<Self::ShMem, Error>;

    /// Get a mapping given its id and size
    fn shmem_from_id_and_size(&mut self, id: ShMemId, size: usize) -> Result<Self::ShMem, Error>;

    /// Attach to the mapping named by `env_name`.
    ///
    /// Returns `Ok(None)` if the variable is not set: there is simply no fuzzer.
    fn existing_from_env(
        &mut self,
        env_name: &str,
        size: usize,
    ) -> Result<Option<Self::ShMem>, Error> {
        let id_str = match env::var(env_name) {
            Ok(id_str) => id_str,
            Err(env::VarError::NotPresent) => return Ok(None),
            Err(env::VarError::NotUnicode(raw)) => {
                return Err(Error::illegal_argument(format!(
                    "{env_name} is not valid unicode: {raw:?}"
                )));
            }
        };
        let id: ShMemId = id_str.parse()?;
        self.shmem_from_id_and_size(id, size).map(Some)
    }
}

/// The default sharedmap impl for unix using shmctl & shmget
#[derive(Debug)]
pub struct UnixShMem {
    id: ShMemId,
    map: *mut u8,
    map_size: usize,
    /// Only segments we created are removed on drop.
    owned: bool,
}

impl UnixShMem {
    /// Create a new shared memory mapping, using shmget/shmat
    pub fn new(map_size: usize) -> Result<Self, Error> {
        unsafe {
            let os_id = shmget(
                libc::IPC_PRIVATE,
                map_size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            );

            if os_id < 0_i32 {
                return Err(Error::last_os_error(format!(
                    "Failed to allocate a shared mapping of size {map_size} - check OS limits (i.e shmall, shmmax)"
                )));
            }

            let map = shmat(os_id, ptr::null(), 0) as *mut c_uchar;

            if ptr::addr_eq(map, ptr::null_mut::<c_uchar>().wrapping_sub(1)) || map.is_null() {
                let err = Error::last_os_error("Failed to map the shared mapping");
                shmctl(os_id, libc::IPC_RMID, ptr::null_mut());
                return Err(err);
            }

            Ok(Self {
                id: ShMemId::from_int(os_id),
                map,
                map_size,
                owned: true,
            })
        }
    }

    /// Get a [`UnixShMem`] of the existing shared memory mapping identified by id
    pub fn shmem_from_id_and_size(id: ShMemId, map_size: usize) -> Result<Self, Error> {
        unsafe {
            let id_int: i32 = id.into();
            let map = shmat(id_int, ptr::null(), 0) as *mut c_uchar;

            if ptr::addr_eq(map, ptr::null_mut::<c_uchar>().wrapping_sub(1)) {
                return Err(Error::last_os_error(format!(
                    "Failed to attach the shared mapping with id {id_int}"
                )));
            }

            // The slice we hand out must not reach past the segment.
            let mut info: shmid_ds = mem::zeroed();
            if shmctl(id_int, libc::IPC_STAT, &mut info) < 0 {
                let err = Error::last_os_error(format!(
                    "Failed to query the size of the shared mapping with id {id_int}"
                ));
                shmdt(map as *const c_void);
                return Err(err);
            }
            if info.shm_segsz < map_size {
                shmdt(map as *const c_void);
                return Err(Error::illegal_argument(format!(
                    "The shared mapping with id {id_int} has {} bytes, expected at least {map_size}",
                    info.shm_segsz
                )));
            }

            Ok(Self {
                id,
                map,
                map_size,
                owned: false,
            })
        }
    }
}

impl ShMem for UnixShMem {
    fn id(&self) -> ShMemId {
        self.id
    }
}

impl Deref for UnixShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map, self.map_size) }
    }
}

impl DerefMut for UnixShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
    }
}

/// Segments we created are marked for removal and detached.
/// Attached segments belong to the fuzzer and stay mapped until exit.
impl Drop for UnixShMem {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        unsafe {
            let id_int: c_int = self.id.into();
            shmctl(id_int, libc::IPC_RMID, ptr::null_mut());
            shmdt(self.map as *mut _);
        }
    }
}

/// A [`ShMemProvider`] which uses `shmget`/`shmat`/`shmctl` to provide shared memory mappings.
#[derive(Clone, Debug, Default)]
pub struct UnixShMemProvider;

impl ShMemProvider for UnixShMemProvider {
    type ShMem = UnixShMem;

    fn new_shmem(&mut self, map_size: usize) -> Result<Self::ShMem, Error> {
        UnixShMem::new(map_size)
    }

    fn shmem_from_id_and_size(&mut self, id: ShMemId, size: usize) -> Result<Self::ShMem, Error> {
        UnixShMem::shmem_from_id_and_size(id, size)
    }
}

/// A [`ShMemProvider`] that hands out plain heap buffers.
///
/// Used when no fuzzer is around but coverage should still be collected,
/// and in tests. Every call returns a fresh, zeroed buffer.
#[derive(Debug, Clone, Default)]
pub struct NopShMemProvider;

impl ShMemProvider for NopShMemProvider {
    type ShMem = NopShMem;

    fn new_shmem(&mut self, map_size: usize) -> Result<Self::ShMem, Error> {
        self.shmem_from_id_and_size(ShMemId::from_int(0), map_size)
    }

    fn shmem_from_id_and_size(
        &mut self,
        id: ShMemId,
        map_size: usize,
    ) -> Result<Self::ShMem, Error> {
        Ok(NopShMem {
            id,
            buf: vec![0; map_size],
        })
    }
}

/// An [`ShMem`] that does not share anything.
#[derive(Debug, Clone)]
pub struct NopShMem {
    id: ShMemId,
    buf: Vec<u8>,
}

impl ShMem for NopShMem {
    fn id(&self) -> ShMemId {
        self.id
    }
}

impl DerefMut for NopShMem {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Deref for NopShMem {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}
