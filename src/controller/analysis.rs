//! Metric analysis
//!
//! For each declared metric: resolve its template (or the builtin observer),
//! render the query against the canary's routing model, execute it under the
//! process-wide rate limiter with jittered retries, and compare the sample
//! against the absolute and change-rate thresholds. Sentinel provider errors
//! map onto distinct advancement policies.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::Controller;
use crate::crd::{Canary, CanaryMetric, HookType};
use crate::metrics::{
    is_builtin_metric, render_query, MetricError, MetricTemplateModel, BUILTIN_REQUEST_DURATION,
    BUILTIN_REQUEST_SUCCESS_RATE,
};

const QUERY_RETRIES: usize = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(3);
const RETRY_JITTER_MS: u64 = 5_000;
const DEFAULT_METRIC_INTERVAL: &str = "1m";

/// Why analysis halted this tick
#[derive(Debug)]
pub(crate) enum AnalysisFailure {
    /// Provider or operator asked for the run to be skipped
    Skip,
    /// Rate limited upstream; retry next tick without a failed check
    TooManyRequests,
    /// Query returned no samples; retry next tick without a failed check
    NoValues,
    /// Genuine failure; counts against the threshold
    Failed(String),
}

impl From<MetricError> for AnalysisFailure {
    fn from(err: MetricError) -> Self {
        match err {
            MetricError::SkipAnalysis => Self::Skip,
            MetricError::TooManyRequests => Self::TooManyRequests,
            MetricError::NoValuesFound => Self::NoValues,
            MetricError::HistoricalWindowNotConfigured => {
                // Mapped by the change-rate check before it gets here
                Self::Failed("historical window not configured".to_string())
            }
            MetricError::Query(message) => Self::Failed(message),
        }
    }
}

/// Process-wide token bucket gating metric provider calls
pub(crate) struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    state: AsyncMutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl RateLimiter {
    pub(crate) fn new(rate_per_sec: f64, burst: usize) -> Self {
        Self {
            rate_per_sec,
            burst: burst as f64,
            state: AsyncMutex::new(BucketState {
                tokens: burst as f64,
                refreshed: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available
    pub(crate) async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.refreshed).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
                state.refreshed = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.tokens) / self.rate_per_sec,
                    ))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

impl Controller {
    /// Run the external rollout checks, then the metric checks
    pub(crate) async fn run_analysis(&self, canary: &Canary) -> Result<(), AnalysisFailure> {
        for hook in &canary.analysis().webhooks {
            if hook.hook_type != HookType::Rollout {
                continue;
            }
            if let Err(e) = self
                .call_hook(canary, crate::crd::CanaryPhase::Progressing, hook)
                .await
            {
                self.record_event_warning(
                    canary,
                    &format!(
                        "Halt {} advancement external check {} failed {e}",
                        canary.qualified_name(),
                        hook.name
                    ),
                )
                .await;
                return Err(AnalysisFailure::Failed(e.to_string()));
            }
        }

        self.run_metric_checks(canary).await
    }

    /// Evaluate every declared metric; the first halt wins
    pub(crate) async fn run_metric_checks(&self, canary: &Canary) -> Result<(), AnalysisFailure> {
        for metric in &canary.analysis().metrics {
            let interval = metric
                .interval
                .clone()
                .unwrap_or_else(|| DEFAULT_METRIC_INTERVAL.to_string());
            let model =
                MetricTemplateModel::from_canary(canary, &interval, metric.template_variables.as_ref());

            let value = if let Some(template_ref) = &metric.template_ref {
                match self
                    .query_templated_metric(canary, metric, template_ref, &model)
                    .await
                {
                    Ok(value) => value,
                    Err(failure) => return Err(failure),
                }
            } else if is_builtin_metric(&metric.name) || metric.query.is_some() {
                match self.query_builtin_metric(canary, metric, &model).await {
                    Ok(value) => value,
                    Err(failure) => return Err(failure),
                }
            } else {
                self.record_event_error(
                    canary,
                    "Metric query failed: no usable metrics template and query configured",
                )
                .await;
                return Err(AnalysisFailure::Failed(
                    "no usable metrics template and query configured".to_string(),
                ));
            };

            self.metrics.set_analysis(canary, &metric.name, value);
            self.check_thresholds(canary, metric, value).await?;

            // Change-rate check against the value one history window ago
            if metric.history_window.is_some() && metric.change_threshold_range.is_some() {
                if let Some(template_ref) = &metric.template_ref {
                    self.check_change_rate(canary, metric, template_ref, &model, value)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn query_templated_metric(
        &self,
        canary: &Canary,
        metric: &CanaryMetric,
        template_ref: &crate::crd::CrossNamespaceRef,
        model: &MetricTemplateModel,
    ) -> Result<f64, AnalysisFailure> {
        let (provider, query) = self
            .materialize_template_provider(canary, metric, template_ref, model)
            .await?;

        let result = self
            .query_with_retry(canary, || provider.execute_current_query(&query))
            .await;
        self.surface_query_outcome(canary, &metric.name, result).await
    }

    async fn query_builtin_metric(
        &self,
        canary: &Canary,
        metric: &CanaryMetric,
        model: &MetricTemplateModel,
    ) -> Result<f64, AnalysisFailure> {
        let observer = self
            .metric_factory
            .builtin_observer(canary.spec.metrics_server.as_deref())
            .map_err(|e| AnalysisFailure::Failed(e.to_string()))?;

        let result = if let Some(query) = &metric.query {
            let rendered = match render_query(query, model) {
                Ok(q) => q,
                Err(e) => {
                    self.record_event_error(
                        canary,
                        &format!("Metric {} query render error: {e}", metric.name),
                    )
                    .await;
                    return Err(AnalysisFailure::Failed(e.to_string()));
                }
            };
            self.query_with_retry(canary, || observer.raw_query(&rendered))
                .await
        } else if metric.name == BUILTIN_REQUEST_SUCCESS_RATE {
            self.query_with_retry(canary, || observer.request_success_rate(model))
                .await
        } else if metric.name == BUILTIN_REQUEST_DURATION {
            self.query_with_retry(canary, || observer.request_duration(model))
                .await
        } else {
            Err(MetricError::Query(format!(
                "unknown builtin metric {}",
                metric.name
            )))
        };

        self.surface_query_outcome(canary, &metric.name, result).await
    }

    /// Resolve the metric template, its credentials and the rendered query
    async fn materialize_template_provider(
        &self,
        canary: &Canary,
        metric: &CanaryMetric,
        template_ref: &crate::crd::CrossNamespaceRef,
        model: &MetricTemplateModel,
    ) -> Result<(std::sync::Arc<dyn crate::metrics::MetricProvider>, String), AnalysisFailure> {
        let canary_namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let namespace = template_ref
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(canary_namespace);

        let template = match self
            .client
            .get_metric_template(&namespace, &template_ref.name)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.record_event_error(
                    canary,
                    &format!(
                        "Metric template {}.{namespace} error: {e}",
                        template_ref.name
                    ),
                )
                .await;
                return Err(AnalysisFailure::Failed(e.to_string()));
            }
        };

        let mut credentials = BTreeMap::new();
        if let Some(secret_ref) = &template.spec.provider.secret_ref {
            credentials = match self.client.get_secret(&namespace, &secret_ref.name).await {
                Ok(data) => data,
                Err(e) => {
                    self.record_event_error(
                        canary,
                        &format!(
                            "Metric template {}.{namespace} secret {} error: {e}",
                            template_ref.name, secret_ref.name
                        ),
                    )
                    .await;
                    return Err(AnalysisFailure::Failed(e.to_string()));
                }
            };
        }

        let provider = match self
            .metric_factory
            .provider(
                &model.interval,
                metric.history_window.as_deref().unwrap_or_default(),
                &template.spec.provider,
                &credentials,
            )
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.record_event_error(
                    canary,
                    &format!(
                        "Metric template {}.{namespace} provider {} error: {e}",
                        template_ref.name, template.spec.provider.provider_type
                    ),
                )
                .await;
                return Err(AnalysisFailure::Failed(e.to_string()));
            }
        };

        let query = match render_query(&template.spec.query, model) {
            Ok(q) => q,
            Err(e) => {
                self.record_event_error(
                    canary,
                    &format!(
                        "Metric template {}.{namespace} query render error: {e}",
                        template_ref.name
                    ),
                )
                .await;
                return Err(AnalysisFailure::Failed(e.to_string()));
            }
        };
        debug!(
            canary = %canary.qualified_name(),
            template = %template_ref.name,
            query = %query,
            "Rendered metric query"
        );

        Ok((provider, query))
    }

    /// Record the per-sentinel events and map the outcome
    async fn surface_query_outcome(
        &self,
        canary: &Canary,
        metric_name: &str,
        result: Result<f64, MetricError>,
    ) -> Result<f64, AnalysisFailure> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                match &e {
                    MetricError::SkipAnalysis => {
                        self.record_event_warning(
                            canary,
                            &format!("Skipping analysis for {}: {e}", canary.qualified_name()),
                        )
                        .await;
                    }
                    MetricError::TooManyRequests => {
                        self.record_event_warning(
                            canary,
                            &format!(
                                "Too many requests {metric_name} {}: {e}",
                                canary.qualified_name()
                            ),
                        )
                        .await;
                    }
                    MetricError::NoValuesFound => {
                        self.record_event_warning(
                            canary,
                            &format!(
                                "Halt advancement no values found for metric: {metric_name}: {e}"
                            ),
                        )
                        .await;
                    }
                    _ => {
                        self.record_event_error(
                            canary,
                            &format!("Metric query failed for {metric_name}: {e}"),
                        )
                        .await;
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Absolute threshold check: a range when declared, else a bare max
    async fn check_thresholds(
        &self,
        canary: &Canary,
        metric: &CanaryMetric,
        value: f64,
    ) -> Result<(), AnalysisFailure> {
        if let Some(range) = &metric.threshold_range {
            if let Some(min) = range.min {
                if value < min {
                    let message = format!(
                        "Halt {} advancement {} {value:.2} < {min}",
                        canary.qualified_name(),
                        metric.name
                    );
                    self.record_event_warning(canary, &message).await;
                    return Err(AnalysisFailure::Failed(message));
                }
            }
            if let Some(max) = range.max {
                if value > max {
                    let message = format!(
                        "Halt {} advancement {} {value:.2} > {max}",
                        canary.qualified_name(),
                        metric.name
                    );
                    self.record_event_warning(canary, &message).await;
                    return Err(AnalysisFailure::Failed(message));
                }
            }
        } else if let Some(threshold) = metric.threshold {
            if value > threshold {
                let message = format!(
                    "Halt {} advancement {} {value:.2} > {threshold}",
                    canary.qualified_name(),
                    metric.name
                );
                self.record_event_warning(canary, &message).await;
                return Err(AnalysisFailure::Failed(message));
            }
        }
        Ok(())
    }

    async fn check_change_rate(
        &self,
        canary: &Canary,
        metric: &CanaryMetric,
        template_ref: &crate::crd::CrossNamespaceRef,
        model: &MetricTemplateModel,
        value: f64,
    ) -> Result<(), AnalysisFailure> {
        let (provider, query) = self
            .materialize_template_provider(canary, metric, template_ref, model)
            .await?;

        let previous = match self
            .query_with_retry(canary, || provider.get_previous_metric_value(&query))
            .await
        {
            Ok(v) => v,
            Err(MetricError::HistoricalWindowNotConfigured) => return Ok(()),
            Err(e) => {
                return self
                    .surface_query_outcome(canary, &metric.name, Err(e))
                    .await
                    .map(|_| ());
            }
        };

        let change_rate = (value - previous) / previous;
        let range = metric
            .change_threshold_range
            .as_ref()
            .copied()
            .unwrap_or_default();

        if let Some(min) = range.min {
            if change_rate < min {
                let message = format!(
                    "Halt {} advancement {} {change_rate:.2} < {min}",
                    canary.qualified_name(),
                    metric.name
                );
                self.record_event_warning(canary, &message).await;
                return Err(AnalysisFailure::Failed(message));
            }
        }
        if let Some(max) = range.max {
            if change_rate > max {
                let message = format!(
                    "Halt {} advancement {} {change_rate:.2} > {max}",
                    canary.qualified_name(),
                    metric.name
                );
                self.record_event_warning(canary, &message).await;
                return Err(AnalysisFailure::Failed(message));
            }
        }
        Ok(())
    }

    /// Execute a query under the rate limiter, retrying rate-limited calls
    /// with a jittered backoff and bailing out early when the canary opted
    /// into skipping analysis while we slept.
    pub(crate) async fn query_with_retry<F, Fut>(
        &self,
        canary: &Canary,
        mut query: F,
    ) -> Result<f64, MetricError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<f64, MetricError>>,
    {
        for attempt in 0..=QUERY_RETRIES {
            self.rate_limiter.acquire().await;
            match query().await {
                Ok(value) => return Ok(value),
                Err(MetricError::TooManyRequests) => {
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        Duration::from_millis(rng.gen_range(0..RETRY_JITTER_MS))
                    };
                    let delay = RETRY_BASE_DELAY + jitter;
                    debug!(
                        canary = %canary.qualified_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Provider rate limited, retrying later"
                    );
                    tokio::time::sleep(delay).await;
                    if self.check_skip_analysis(canary).await {
                        return Err(MetricError::SkipAnalysis);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(MetricError::TooManyRequests)
    }

    /// Re-read the canary to honor a skip-analysis opt-in set mid-retry
    async fn check_skip_analysis(&self, canary: &Canary) -> bool {
        let namespace = canary.metadata.namespace.clone().unwrap_or_default();
        let name = canary.metadata.name.clone().unwrap_or_default();
        match self.client.get_canary(&namespace, &name).await {
            Ok(fresh) => {
                if fresh.skip_analysis() {
                    info!(canary = %canary.qualified_name(), "Skipping analysis");
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                debug!(canary = %canary.qualified_name(), error = %e, "Canary reload failed");
                false
            }
        }
    }

    /// Probe every declared metric's provider before the first run
    pub(crate) async fn check_metric_provider_availability(
        &self,
        canary: &Canary,
    ) -> Result<(), String> {
        for metric in &canary.analysis().metrics {
            if is_builtin_metric(&metric.name) {
                let observer = self
                    .metric_factory
                    .builtin_observer(canary.spec.metrics_server.as_deref())
                    .map_err(|e| format!("error building builtin observer: {e}"))?;
                match observer.is_online().await {
                    Ok(true) => {}
                    Ok(false) => return Err("builtin observer not available".to_string()),
                    Err(e) => return Err(format!("builtin observer not available: {e}")),
                }
                continue;
            }

            if let Some(template_ref) = &metric.template_ref {
                let canary_namespace = canary.metadata.namespace.clone().unwrap_or_default();
                let namespace = template_ref
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or(canary_namespace);

                let template = self
                    .client
                    .get_metric_template(&namespace, &template_ref.name)
                    .await
                    .map_err(|e| {
                        format!("metric template {}.{namespace} error: {e}", template_ref.name)
                    })?;

                let mut credentials = BTreeMap::new();
                if let Some(secret_ref) = &template.spec.provider.secret_ref {
                    credentials = self
                        .client
                        .get_secret(&namespace, &secret_ref.name)
                        .await
                        .map_err(|e| {
                            format!(
                                "metric template {}.{namespace} secret {} error: {e}",
                                template_ref.name, secret_ref.name
                            )
                        })?;
                }

                let provider = self
                    .metric_factory
                    .provider(
                        metric.interval.as_deref().unwrap_or(DEFAULT_METRIC_INTERVAL),
                        metric.history_window.as_deref().unwrap_or_default(),
                        &template.spec.provider,
                        &credentials,
                    )
                    .await
                    .map_err(|e| {
                        format!(
                            "metric template {}.{namespace} provider {} error: {e}",
                            template_ref.name, template.spec.provider.provider_type
                        )
                    })?;

                match provider.is_online().await {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(format!(
                            "{} in metric template {}.{namespace} not available",
                            template.spec.provider.provider_type, template_ref.name
                        ))
                    }
                    Err(e) => {
                        return Err(format!(
                            "{} in metric template {}.{namespace} not available: {e}",
                            template.spec.provider.provider_type, template_ref.name
                        ))
                    }
                }
            }
        }

        self.record_event_info(canary, "All the metric providers are available!")
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(10.0, 10);
        let start = Instant::now();

        // The burst drains without waiting
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The next acquire has to wait for a refill (~100ms at 10/s)
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_failure_mapping() {
        assert!(matches!(
            AnalysisFailure::from(MetricError::SkipAnalysis),
            AnalysisFailure::Skip
        ));
        assert!(matches!(
            AnalysisFailure::from(MetricError::TooManyRequests),
            AnalysisFailure::TooManyRequests
        ));
        assert!(matches!(
            AnalysisFailure::from(MetricError::NoValuesFound),
            AnalysisFailure::NoValues
        ));
        assert!(matches!(
            AnalysisFailure::from(MetricError::Query("boom".into())),
            AnalysisFailure::Failed(_)
        ));
    }
}
