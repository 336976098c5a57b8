//! Process-wide singleton: group count, affinity plan, lazy init.
//!
//! `get_instance` builds every group exactly once from the host
//! configuration and hands out the immutable slice forever after.
//! Groups are leaked by design; nothing here is ever torn down.

use std::sync::atomic::AtomicI32;
use std::sync::OnceLock;

use mtepoll_core::{log, mtwarn, ReactorError, Result};

use crate::config::{
    ReactorConfig, MAX_EPOLL_EXTRA_GROUPS, MAX_EPOLL_GROUPS, MAX_EPOLL_THREADS_PER_GROUP,
    MAX_EPOLL_WAIT_TOTAL_THREADS, MAX_WORK_QUEUE_CAPACITY, MIN_EPOLL_WAIT_TOTAL_THREADS,
    MIN_WORK_QUEUE_CAPACITY,
};
use crate::cpu::{self, CpuInfo};
use crate::group::EpollGroup;

static GLOBAL_THREAD_COUNT: AtomicI32 = AtomicI32::new(0);

/// Reactor threads alive across all groups.
pub fn global_thread_count() -> &'static AtomicI32 {
    &GLOBAL_THREAD_COUNT
}

/// The arithmetic behind group construction, separated from the OS so
/// it can be computed (and tested) without touching threads.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    /// Base threads per group.
    pub threads: u32,
    /// Groups carrying connection load before extras.
    pub base_groups: u32,
    /// Total groups to build.
    pub groups: u32,
    /// Per-thread pinning targets, one per base thread, possibly
    /// duplicated when threads outnumber cores.
    pub affinities: Vec<CpuInfo>,
    /// Threads per group allowed into the multi-event wait.
    pub wait_threads_per_group: u32,
    /// Local-index stride selecting the waiter threads.
    pub wait_threads_gap: u32,
    /// Clamped work queue ring size.
    pub work_queue_capacity: u32,
}

impl GroupPlan {
    /// `cores` is the online processor count; `allowed` the process
    /// affinity mask as a processor-id list when it could be read;
    /// `topology` whatever sysfs enumeration produced.
    pub fn compute(
        config: &ReactorConfig,
        cores: u32,
        allowed: Option<&[i32]>,
        topology: &[CpuInfo],
    ) -> Self {
        let threads = config
            .threads_per_group
            .clamp(1, MAX_EPOLL_THREADS_PER_GROUP);

        let mut groups = config.groups;
        let mut base_groups = groups;
        if groups == 0 {
            let mut usable = cores.max(1);
            if config.auto_cpu_affinity {
                if let Some(allowed) = allowed {
                    if !allowed.is_empty() {
                        // At most this many can run.
                        usable = allowed.len() as u32;
                    }
                }
            }
            groups = usable / threads + u32::from(usable % threads != 0);
            let min_auto = config.min_auto_groups.max(1);
            if groups < min_auto {
                // Raise to the smallest multiple reaching the minimum.
                groups = (min_auto / groups + u32::from(min_auto % groups != 0)) * groups;
            }
            base_groups = groups;
            groups += config.extra_groups.min(MAX_EPOLL_EXTRA_GROUPS);
        }
        let base_groups = base_groups.min(MAX_EPOLL_GROUPS);
        let groups = groups.min(MAX_EPOLL_GROUPS);

        let mut affinities: Vec<CpuInfo> = Vec::new();
        if config.auto_cpu_affinity {
            if let Some(allowed) = allowed {
                let max_id = topology
                    .iter()
                    .map(|c| c.processor)
                    .chain(allowed.iter().copied())
                    .max()
                    .unwrap_or(-1);
                for i in 0..=max_id {
                    let info = topology.iter().find(|c| c.processor == i);
                    let in_mask = allowed.contains(&i);
                    if in_mask || (config.force_all_cores && info.is_some()) {
                        affinities.push(info.copied().unwrap_or(CpuInfo {
                            package: 0,
                            core: 0,
                            processor: i,
                        }));
                    }
                }
                if !affinities.is_empty() {
                    // Not enough cores for every base thread: duplicate
                    // the list so later groups wrap around it.
                    let needed = (base_groups * threads) as usize;
                    if needed > affinities.len() {
                        let duplicates = needed / affinities.len();
                        if duplicates > 1 {
                            let one_round = affinities.clone();
                            affinities = Vec::with_capacity(duplicates * one_round.len());
                            for _ in 0..duplicates {
                                affinities.extend(one_round.iter().copied());
                            }
                        }
                    }
                    affinities.sort();
                }
            }
        }

        let mut total_wait = config.max_wait_total_threads;
        if total_wait == 0 {
            total_wait = groups * threads;
        } else {
            total_wait = total_wait.clamp(MIN_EPOLL_WAIT_TOTAL_THREADS, MAX_EPOLL_WAIT_TOTAL_THREADS);
        }
        if total_wait < groups {
            // At least one waiter per group.
            total_wait = groups;
        }

        let mut wait_threads_per_group = 1u32;
        while wait_threads_per_group < threads
            && (wait_threads_per_group + 1) * groups <= total_wait
        {
            wait_threads_per_group += 1;
        }
        let wait_threads_gap = threads / wait_threads_per_group;

        let work_queue_capacity = config
            .work_queue_capacity
            .clamp(MIN_WORK_QUEUE_CAPACITY, MAX_WORK_QUEUE_CAPACITY);

        Self {
            threads,
            base_groups,
            groups,
            affinities,
            wait_threads_per_group,
            wait_threads_gap,
            work_queue_capacity,
        }
    }
}

type BuiltGroups = std::result::Result<Box<[&'static EpollGroup]>, ReactorError>;

static INSTANCE: OnceLock<BuiltGroups> = OnceLock::new();

/// Build the singleton from an explicit configuration. Only the first
/// call's configuration matters; later calls return the same slice.
pub fn init_with(config: ReactorConfig) -> Result<&'static [&'static EpollGroup]> {
    match INSTANCE.get_or_init(move || build_groups(config)) {
        Ok(groups) => Ok(groups),
        Err(e) => Err(e.clone()),
    }
}

/// The group list, built on first use from host-provided variables.
/// Construction failure is fatal at process scope.
pub fn get_instance() -> &'static [&'static EpollGroup] {
    init_with(ReactorConfig::from_env()).expect("reactor init failed")
}

fn build_groups(config: ReactorConfig) -> BuiltGroups {
    log::init();

    let cores = cpu::online_cpus();
    let allowed: Option<Vec<i32>> = if config.auto_cpu_affinity {
        cpu::current_affinity().map(|m| m.iter_set().map(|i| i as i32).collect())
    } else {
        None
    };
    let topology = cpu::topology();
    let plan = GroupPlan::compute(&config, cores, allowed.as_deref(), &topology);

    let mut groups: Vec<&'static EpollGroup> = Vec::with_capacity(plan.groups as usize);
    for group_id in 0..plan.groups {
        let group = EpollGroup::new(group_id, &config, plan.work_queue_capacity as usize)?;
        group.start_threads(
            plan.threads,
            &plan.affinities,
            (group_id * plan.threads) as usize,
            plan.wait_threads_per_group as i32,
            plan.wait_threads_gap,
        );
        groups.push(group);
    }

    mtwarn!(
        "start with {} groups, {} threads each, {} pinning slots",
        plan.groups,
        plan.threads,
        plan.affinities.len()
    );
    Ok(groups.into_boxed_slice())
}
