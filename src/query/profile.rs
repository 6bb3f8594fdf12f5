use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of plan compilation and stage profiling metrics.
///
/// Profiling is enabled via the `SOMBRA_PROFILE` environment variable. Each
/// pair records total nanoseconds and the number of timed operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent lowering algebra nodes.
    pub compile_ns: u64,
    /// Number of algebra nodes lowered.
    pub compile_count: u64,
    /// Total nanoseconds spent draining and probing materialized join sides.
    pub join_ns: u64,
    /// Number of materialized join builds.
    pub join_count: u64,
    /// Total nanoseconds spent draining materialized left-join sides.
    pub left_join_ns: u64,
    /// Number of materialized left-join builds.
    pub left_join_count: u64,
    /// Total nanoseconds spent evaluating filter expressions.
    pub filter_ns: u64,
    /// Number of filter evaluations.
    pub filter_count: u64,
    /// Total nanoseconds spent sorting.
    pub sort_ns: u64,
    /// Number of sorts.
    pub sort_count: u64,
    /// Total nanoseconds spent grouping and aggregating.
    pub group_ns: u64,
    /// Number of group builds.
    pub group_count: u64,
    /// Total nanoseconds spent matching triple and path patterns.
    pub pattern_ns: u64,
    /// Number of pattern probes.
    pub pattern_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    compile_ns: AtomicU64,
    compile_count: AtomicU64,
    join_ns: AtomicU64,
    join_count: AtomicU64,
    left_join_ns: AtomicU64,
    left_join_count: AtomicU64,
    filter_ns: AtomicU64,
    filter_count: AtomicU64,
    sort_ns: AtomicU64,
    sort_count: AtomicU64,
    group_ns: AtomicU64,
    group_count: AtomicU64,
    pattern_ns: AtomicU64,
    pattern_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("SOMBRA_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum QueryProfileKind {
    /// Lowering one algebra node.
    Compile,
    /// Materialized join build.
    Join,
    /// Materialized left-join build.
    LeftJoin,
    /// Filter expression evaluation.
    Filter,
    /// Sort stage drain and sort.
    Sort,
    /// Group stage drain and aggregation.
    Group,
    /// Triple or path pattern probe.
    Pattern,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Compile => (&counters.compile_ns, &counters.compile_count),
        QueryProfileKind::Join => (&counters.join_ns, &counters.join_count),
        QueryProfileKind::LeftJoin => (&counters.left_join_ns, &counters.left_join_count),
        QueryProfileKind::Filter => (&counters.filter_ns, &counters.filter_count),
        QueryProfileKind::Sort => (&counters.sort_ns, &counters.sort_count),
        QueryProfileKind::Group => (&counters.group_ns, &counters.group_count),
        QueryProfileKind::Pattern => (&counters.pattern_ns, &counters.pattern_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current profiling metrics.
///
/// Returns `None` unless `SOMBRA_PROFILE` was set when profiling was first
/// consulted. With `reset`, counters are zeroed as they are read.
///
/// ```no_run
/// use sombra_algebra::query::profile::query_profile_snapshot;
///
/// if let Some(snapshot) = query_profile_snapshot(false) {
///     println!("join builds: {}", snapshot.join_count);
/// }
/// ```
pub fn query_profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        compile_ns: load(&counters.compile_ns),
        compile_count: load(&counters.compile_count),
        join_ns: load(&counters.join_ns),
        join_count: load(&counters.join_count),
        left_join_ns: load(&counters.left_join_ns),
        left_join_count: load(&counters.left_join_count),
        filter_ns: load(&counters.filter_ns),
        filter_count: load(&counters.filter_count),
        sort_ns: load(&counters.sort_ns),
        sort_count: load(&counters.sort_count),
        group_ns: load(&counters.group_ns),
        group_count: load(&counters.group_count),
        pattern_ns: load(&counters.pattern_ns),
        pattern_count: load(&counters.pattern_count),
    })
}
