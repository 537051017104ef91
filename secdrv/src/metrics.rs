//! secdrv pool metrics.
//!
//! Acquire/release/reclaim counters for both pools plus occupancy gauges,
//! exposed through `metriken` for whatever exporter the driver core runs.

use crate::counter::{Counter, CounterGroup};
use metriken::{Gauge, metric};

static CONTEXT: CounterGroup = CounterGroup::new();
static SG: CounterGroup = CounterGroup::new();

/// Counter slot indices for crypto context metrics.
pub mod context {
    pub const ACQUIRED: usize = 0;
    pub const FREED: usize = 1;
    pub const RETIRED: usize = 2;
    pub const COLLECTED: usize = 3;
    pub const EXHAUSTED: usize = 4;
}

/// Counter slot indices for scatter-gather metrics.
pub mod sg {
    pub const ACQUIRED: usize = 0;
    pub const RELEASED: usize = 1;
    pub const EXHAUSTED: usize = 2;
    pub const TABLES_BUILT: usize = 3;
    pub const TABLES_REJECTED: usize = 4;
}

// ── Crypto contexts ──────────────────────────────────────────────

#[metric(
    name = "secdrv/context/acquired",
    description = "Contexts handed out by get_free_context"
)]
pub static CONTEXTS_ACQUIRED: Counter = Counter::new(&CONTEXT, context::ACQUIRED);

#[metric(
    name = "secdrv/context/freed",
    description = "Contexts released with no packets in flight"
)]
pub static CONTEXTS_FREED: Counter = Counter::new(&CONTEXT, context::FREED);

#[metric(
    name = "secdrv/context/retired",
    description = "Contexts released with packets still in flight"
)]
pub static CONTEXTS_RETIRED: Counter = Counter::new(&CONTEXT, context::RETIRED);

#[metric(
    name = "secdrv/context/collected",
    description = "Retiring contexts reclaimed by the garbage collector"
)]
pub static CONTEXTS_COLLECTED: Counter = Counter::new(&CONTEXT, context::COLLECTED);

#[metric(
    name = "secdrv/context/exhausted",
    description = "get_free_context calls that found no free context"
)]
pub static CONTEXT_POOL_EXHAUSTED: Counter = Counter::new(&CONTEXT, context::EXHAUSTED);

#[metric(name = "secdrv/context/in_use", description = "Contexts currently in use")]
pub static CONTEXTS_IN_USE: Gauge = Gauge::new();

#[metric(
    name = "secdrv/context/retiring",
    description = "Contexts waiting for in-flight packets to drain"
)]
pub static CONTEXTS_RETIRING: Gauge = Gauge::new();

// ── Scatter-gather contexts ──────────────────────────────────────

#[metric(name = "secdrv/sg/acquired", description = "SG contexts handed out")]
pub static SG_ACQUIRED: Counter = Counter::new(&SG, sg::ACQUIRED);

#[metric(name = "secdrv/sg/released", description = "SG contexts returned")]
pub static SG_RELEASED: Counter = Counter::new(&SG, sg::RELEASED);

#[metric(
    name = "secdrv/sg/exhausted",
    description = "SG context requests that found the pool empty"
)]
pub static SG_POOL_EXHAUSTED: Counter = Counter::new(&SG, sg::EXHAUSTED);

#[metric(name = "secdrv/sg/tables_built", description = "SG tables committed")]
pub static SG_TABLES_BUILT: Counter = Counter::new(&SG, sg::TABLES_BUILT);

#[metric(
    name = "secdrv/sg/tables_rejected",
    description = "Fragment lists rejected by build_table"
)]
pub static SG_TABLES_REJECTED: Counter = Counter::new(&SG, sg::TABLES_REJECTED);
