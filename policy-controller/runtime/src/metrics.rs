use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct DriverMetrics {
    cycles: Counter,
    cycles_cancelled: Counter,
    cycle_duration: Histogram,
    diagnostics: Family<GatewayLabels, Counter>,
    validation_failures: Family<ValidationLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct GatewayLabels {
    namespace: String,
    name: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ValidationLabels {
    class: &'static str,
}

// === impl DriverMetrics ===

impl DriverMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let cycles = Counter::default();
        reg.register(
            "cycles",
            "Total number of completed translation cycles",
            cycles.clone(),
        );

        let cycles_cancelled = Counter::default();
        reg.register(
            "cycles_cancelled",
            "Total number of translation cycles abandoned for a newer snapshot",
            cycles_cancelled.clone(),
        );

        let cycle_duration = Histogram::new(exponential_buckets(0.001, 4.0, 8));
        reg.register(
            "cycle_duration_seconds",
            "Time taken to translate and validate every gateway",
            cycle_duration.clone(),
        );

        let diagnostics = Family::<GatewayLabels, Counter>::default();
        reg.register(
            "diagnostics",
            "Total number of translation diagnostics recorded per gateway",
            diagnostics.clone(),
        );

        let validation_failures = Family::<ValidationLabels, Counter>::default();
        reg.register(
            "validation_failures",
            "Total number of proxy configurations that failed validation",
            validation_failures.clone(),
        );

        Self {
            cycles,
            cycles_cancelled,
            cycle_duration,
            diagnostics,
            validation_failures,
        }
    }

    pub(crate) fn cycle_completed(&self, elapsed: time::Duration) {
        self.cycles.inc();
        self.cycle_duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn cycle_cancelled(&self) {
        self.cycles_cancelled.inc();
    }

    pub(crate) fn diagnostics(&self, namespace: &str, name: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.diagnostics
            .get_or_create(&GatewayLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .inc_by(count as u64);
    }

    pub(crate) fn validation_failed(&self, class: &'static str) {
        self.validation_failures
            .get_or_create(&ValidationLabels { class })
            .inc();
    }
}

impl Default for DriverMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
