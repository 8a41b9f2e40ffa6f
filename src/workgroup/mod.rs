//! Workgroups: deployable bundles of workers and bridges.
//!
//! - [`WorkgroupManager`] (parent side) launches one process per workgroup
//!   through a [`ProcessManager`](crate::process::ProcessManager) and relays
//!   the children's status messages as [`WorkgroupEvent`]s.
//! - [`Workgroup`] (child side) decodes its configuration, constructs the
//!   components and reports back through a [`ParentNotifier`].

pub mod manager;
pub mod notifier;
pub mod supervisor;

pub use manager::{
    merge_values, workgroup_name, LaunchedWorkgroup, ManagerError, ManagerState, RegistryEntry,
    WorkgroupEvent, WorkgroupManager, WorkgroupStatus, NODE_COMMAND,
};
pub use notifier::{
    notifier_from_env, NullNotifier, ParentNotifier, StatusMessage, StatusPacket, StdoutNotifier,
    PROCESS_MESSAGE, SUPERVISED_ENV,
};
pub use supervisor::{
    resolve_workgroup, ResolvedWorkgroup, SpawnSummary, SupervisorError, Workgroup, ERROR_EVENT,
    METRICS_EVENT, RUN_COMMAND, WORKERS_SPAWNED_EVENT,
};
