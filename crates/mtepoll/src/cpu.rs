//! CPU topology and thread pinning.
//!
//! Base threads bind to one core each; dynamic threads bind to the
//! union of their group's cores. The pinning mechanism is a leaf
//! policy: on platforms without it the reactor runs unpinned and says
//! so once at WARN.

/// One logical processor, ordered so that siblings sort together:
/// package first, then physical core, then processor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuInfo {
    pub package: i32,
    pub core: i32,
    pub processor: i32,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Wrapper over the kernel cpu set used for mask queries and
        /// dynamic-thread pinning.
        #[derive(Clone)]
        pub struct CpuSet {
            raw: libc::cpu_set_t,
        }

        impl CpuSet {
            pub fn new() -> Self {
                Self {
                    raw: unsafe { std::mem::zeroed() },
                }
            }

            #[inline]
            pub fn set(&mut self, cpu: usize) {
                unsafe { libc::CPU_SET(cpu, &mut self.raw) };
            }

            #[inline]
            pub fn is_set(&self, cpu: usize) -> bool {
                unsafe { libc::CPU_ISSET(cpu, &self.raw) }
            }

            pub fn count(&self) -> u32 {
                unsafe { libc::CPU_COUNT(&self.raw) as u32 }
            }

            /// Processor ids present in the set.
            pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
                (0..libc::CPU_SETSIZE as usize).filter(move |&i| self.is_set(i))
            }
        }

        impl Default for CpuSet {
            fn default() -> Self {
                Self::new()
            }
        }

        /// Count of online processors.
        pub fn online_cpus() -> u32 {
            let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
            if n < 1 {
                1
            } else {
                n as u32
            }
        }

        /// The calling thread's affinity mask, if readable.
        pub fn current_affinity() -> Option<CpuSet> {
            let mut set = CpuSet::new();
            let ret = unsafe {
                libc::sched_getaffinity(
                    0,
                    std::mem::size_of::<libc::cpu_set_t>(),
                    &mut set.raw,
                )
            };
            if ret == 0 {
                Some(set)
            } else {
                None
            }
        }

        /// Enumerate processor topology from sysfs. Processors whose
        /// topology files are unreadable are simply absent; callers
        /// fall back to `{package: 0, core: 0}` for those.
        pub fn topology() -> Vec<CpuInfo> {
            let mut infos = Vec::new();
            for cpu in 0..online_cpus() as i32 {
                let base = format!("/sys/devices/system/cpu/cpu{}/topology", cpu);
                let core = read_sys_i32(&format!("{}/core_id", base));
                let package = read_sys_i32(&format!("{}/physical_package_id", base));
                if let (Some(core), Some(package)) = (core, package) {
                    infos.push(CpuInfo {
                        package,
                        core,
                        processor: cpu,
                    });
                }
            }
            infos
        }

        fn read_sys_i32(path: &str) -> Option<i32> {
            std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
        }

        /// Pin the calling thread to one processor.
        pub fn pin_current_thread(cpu: i32) -> Result<(), i32> {
            let mut set = CpuSet::new();
            set.set(cpu as usize);
            pin_current_thread_to_set(&set)
        }

        /// Pin the calling thread to a set of processors.
        pub fn pin_current_thread_to_set(set: &CpuSet) -> Result<(), i32> {
            let ret = unsafe {
                libc::pthread_setaffinity_np(
                    libc::pthread_self(),
                    std::mem::size_of::<libc::cpu_set_t>(),
                    &set.raw,
                )
            };
            if ret != 0 {
                return Err(ret);
            }
            Ok(())
        }
    } else {
        #[derive(Clone, Default)]
        pub struct CpuSet;

        impl CpuSet {
            pub fn new() -> Self {
                Self
            }
            pub fn set(&mut self, _cpu: usize) {}
            pub fn is_set(&self, _cpu: usize) -> bool {
                false
            }
            pub fn count(&self) -> u32 {
                0
            }
            pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
                std::iter::empty()
            }
        }

        pub fn online_cpus() -> u32 {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        }

        pub fn current_affinity() -> Option<CpuSet> {
            None
        }

        pub fn topology() -> Vec<CpuInfo> {
            Vec::new()
        }

        pub fn pin_current_thread(_cpu: i32) -> Result<(), i32> {
            warn_unsupported();
            Ok(())
        }

        pub fn pin_current_thread_to_set(_set: &CpuSet) -> Result<(), i32> {
            warn_unsupported();
            Ok(())
        }

        fn warn_unsupported() {
            use std::sync::atomic::{AtomicBool, Ordering};
            static WARNED: AtomicBool = AtomicBool::new(false);
            if !WARNED.swap(true, Ordering::Relaxed) {
                mtepoll_core::mtwarn!(
                    "cpu affinity not supported on this platform, threads run unpinned"
                );
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_online_cpus_positive() {
        assert!(online_cpus() >= 1);
    }

    #[test]
    fn test_cpu_set_roundtrip() {
        let mut set = CpuSet::new();
        assert!(!set.is_set(0));
        set.set(0);
        set.set(2);
        assert!(set.is_set(0));
        assert!(!set.is_set(1));
        assert!(set.is_set(2));
        assert_eq!(set.count(), 2);
        assert_eq!(set.iter_set().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_current_affinity_has_cpus() {
        let mask = current_affinity().expect("affinity mask readable");
        assert!(mask.count() >= 1);
    }

    #[test]
    fn test_pin_to_allowed_core() {
        let mask = current_affinity().unwrap();
        let cpu = mask.iter_set().next().unwrap();
        pin_current_thread(cpu as i32).unwrap();
        // Restore the original mask for the rest of the test binary.
        pin_current_thread_to_set(&mask).unwrap();
    }

    #[test]
    fn test_cpu_info_ordering_groups_siblings() {
        let a = CpuInfo { package: 0, core: 0, processor: 0 };
        let b = CpuInfo { package: 0, core: 0, processor: 4 };
        let c = CpuInfo { package: 0, core: 1, processor: 1 };
        let mut v = vec![c, b, a];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }
}
