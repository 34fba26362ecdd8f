//! In-memory collaborator fakes for scheduler tests
//!
//! The advance loop only ever talks to trait seams, so a full run can be
//! driven against these fakes: a one-canary cluster, a workload controller
//! that persists status into it, a router remembering the last applied
//! split, a scripted hook client and recording event/notifier sinks.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use super::clock::{Clock, MockClock};
use super::events::{EventKind, EventRecorder};
use super::webhook::{CanaryWebhookPayload, HookClient, WebhookError};
use super::{Collaborators, Controller, ControllerConfig};
use crate::client::{CanaryClient, ClientError};
use crate::crd::{
    AlertProvider, AlertSeverity, Canary, CanaryAnalysis, CanaryMetric, CanaryPhase,
    CanaryService, CanarySpec, CanaryStatus, MetricTemplate, TargetReference, ThresholdRange,
};
use crate::metrics::{
    MetricError, MetricProvider, MetricProviderFactory, MetricTemplateModel, Observer,
};
use crate::notifier::{AlertField, Notifier, NotifierEndpoint, NotifierError, NotifierFactory};
use crate::router::{MeshRouter, RouterError, RouterTable, Routes, ServiceRouter};
use crate::telemetry::create_metrics;
use crate::workload::{WorkloadController, WorkloadError, WorkloadMetadata, WorkloadTable};

fn not_found(kind: &'static str) -> ClientError {
    ClientError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".into(),
        message: format!("{kind} not found"),
        reason: "NotFound".into(),
        code: 404,
    }))
}

/// One-canary cluster with template/provider/secret stores
pub(crate) struct InMemoryCluster {
    canary: Mutex<Canary>,
    templates: Mutex<HashMap<(String, String), MetricTemplate>>,
    alert_providers: Mutex<HashMap<(String, String), AlertProvider>>,
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryCluster {
    pub fn new(canary: Canary) -> Arc<Self> {
        Arc::new(Self {
            canary: Mutex::new(canary),
            templates: Mutex::new(HashMap::new()),
            alert_providers: Mutex::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
        })
    }

    pub fn canary(&self) -> Canary {
        self.canary.lock().unwrap().clone()
    }

    pub fn status(&self) -> CanaryStatus {
        self.canary().status_or_default()
    }

    pub fn mutate_canary(&self, mutate: impl FnOnce(&mut Canary)) {
        mutate(&mut self.canary.lock().unwrap());
    }

    pub fn put_template(&self, namespace: &str, name: &str, template: MetricTemplate) {
        self.templates
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), template);
    }

    #[allow(dead_code)]
    pub fn put_alert_provider(&self, namespace: &str, name: &str, provider: AlertProvider) {
        self.alert_providers
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), provider);
    }

    #[allow(dead_code)]
    pub fn put_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }
}

#[async_trait]
impl CanaryClient for InMemoryCluster {
    async fn get_canary(&self, namespace: &str, name: &str) -> Result<Canary, ClientError> {
        let canary = self.canary.lock().unwrap().clone();
        if canary.metadata.name.as_deref() == Some(name)
            && canary.metadata.namespace.as_deref() == Some(namespace)
        {
            Ok(canary)
        } else {
            Err(not_found("canary"))
        }
    }

    async fn update_status(&self, canary: &Canary) -> Result<Canary, ClientError> {
        let mut stored = self.canary.lock().unwrap();
        stored.status = canary.status.clone();
        Ok(stored.clone())
    }

    async fn add_finalizer(&self, _canary: &Canary, token: &str) -> Result<(), ClientError> {
        let mut stored = self.canary.lock().unwrap();
        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == token) {
            finalizers.push(token.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, _canary: &Canary, token: &str) -> Result<(), ClientError> {
        let mut stored = self.canary.lock().unwrap();
        if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != token);
        }
        Ok(())
    }

    async fn get_metric_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<MetricTemplate, ClientError> {
        self.templates
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("metric template"))
    }

    async fn get_alert_provider(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AlertProvider, ClientError> {
        self.alert_providers
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("alert provider"))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, ClientError> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("secret"))
    }
}

#[derive(Clone)]
pub(crate) enum Readiness {
    Ready,
    Retriable(String),
    Permanent(String),
}

impl Readiness {
    fn into_result(self) -> Result<(), WorkloadError> {
        match self {
            Self::Ready => Ok(()),
            Self::Retriable(message) => Err(WorkloadError::retriable(message)),
            Self::Permanent(message) => Err(WorkloadError::DeadlineExceeded(message)),
        }
    }
}

/// Workload controller persisting status into the in-memory cluster
///
/// Revision signals are modeled with settable hashes: bump the template hash
/// to simulate a new release, bump the config hash to simulate config drift.
pub(crate) struct FakeWorkload {
    cluster: Arc<InMemoryCluster>,
    clock: Arc<dyn Clock>,
    template_hash: Mutex<String>,
    config_hash: Mutex<String>,
    primary_template: Mutex<String>,
    primary_ready: Mutex<Readiness>,
    canary_ready: Mutex<Readiness>,
    canary_replicas: Mutex<i32>,
    pub promote_calls: AtomicUsize,
}

impl FakeWorkload {
    pub fn new(cluster: Arc<InMemoryCluster>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            clock,
            template_hash: Mutex::new("rev-1".to_string()),
            config_hash: Mutex::new("cfg-1".to_string()),
            primary_template: Mutex::new(String::new()),
            primary_ready: Mutex::new(Readiness::Ready),
            canary_ready: Mutex::new(Readiness::Ready),
            canary_replicas: Mutex::new(1),
            promote_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_template_hash(&self, hash: &str) {
        *self.template_hash.lock().unwrap() = hash.to_string();
    }

    #[allow(dead_code)]
    pub fn set_config_hash(&self, hash: &str) {
        *self.config_hash.lock().unwrap() = hash.to_string();
    }

    pub fn template_hash(&self) -> String {
        self.template_hash.lock().unwrap().clone()
    }

    pub fn primary_template(&self) -> String {
        self.primary_template.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn set_primary_ready(&self, readiness: Readiness) {
        *self.primary_ready.lock().unwrap() = readiness;
    }

    pub fn set_canary_ready(&self, readiness: Readiness) {
        *self.canary_ready.lock().unwrap() = readiness;
    }

    pub fn canary_replicas(&self) -> i32 {
        *self.canary_replicas.lock().unwrap()
    }

    pub(crate) fn tracked_configs(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "configmap/podinfo-config".to_string(),
            self.config_hash.lock().unwrap().clone(),
        )])
    }

    fn store_status(&self, status: CanaryStatus) {
        let mut stored = self.cluster.canary.lock().unwrap();
        stored.status = Some(status);
    }

    fn stamped(&self, mut status: CanaryStatus) -> CanaryStatus {
        status.last_transition_time = Some(self.clock.now().to_rfc3339());
        status
    }
}

#[async_trait]
impl WorkloadController for FakeWorkload {
    async fn initialize(&self, _canary: &Canary) -> Result<(), WorkloadError> {
        let mut primary = self.primary_template.lock().unwrap();
        if primary.is_empty() {
            *primary = self.template_hash.lock().unwrap().clone();
        }
        Ok(())
    }

    async fn promote(&self, _canary: &Canary) -> Result<(), WorkloadError> {
        self.promote_calls.fetch_add(1, Ordering::SeqCst);
        *self.primary_template.lock().unwrap() = self.template_hash.lock().unwrap().clone();
        Ok(())
    }

    async fn is_primary_ready(&self, _canary: &Canary) -> Result<(), WorkloadError> {
        self.primary_ready.lock().unwrap().clone().into_result()
    }

    async fn is_canary_ready(&self, _canary: &Canary) -> Result<(), WorkloadError> {
        self.canary_ready.lock().unwrap().clone().into_result()
    }

    async fn scale_to_zero(&self, _canary: &Canary) -> Result<(), WorkloadError> {
        *self.canary_replicas.lock().unwrap() = 0;
        Ok(())
    }

    async fn scale_from_zero(&self, _canary: &Canary) -> Result<(), WorkloadError> {
        *self.canary_replicas.lock().unwrap() = 1;
        Ok(())
    }

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, WorkloadError> {
        let status = canary.status_or_default();
        let hash = self.template_hash.lock().unwrap().clone();
        if status.last_applied_spec.is_empty() {
            return Ok(true);
        }
        // A spec reverted to the promoted revision is a manual rollback,
        // not a new release
        if status.last_promoted_spec == hash {
            return Ok(false);
        }
        Ok(status.last_applied_spec != hash)
    }

    async fn have_dependencies_changed(&self, canary: &Canary) -> Result<bool, WorkloadError> {
        let status = canary.status_or_default();
        let Some(tracked) = status.tracked_configs else {
            return Ok(false);
        };
        Ok(tracked != self.tracked_configs())
    }

    async fn sync_status(
        &self,
        _canary: &Canary,
        status: &CanaryStatus,
    ) -> Result<(), WorkloadError> {
        let stored = self.cluster.canary().status_or_default();
        let mut next = status.clone();
        next.last_applied_spec = self.template_hash.lock().unwrap().clone();
        next.tracked_configs = Some(self.tracked_configs());
        // Promotion and build markers survive status rewrites
        next.last_promoted_spec = stored.last_promoted_spec;
        next.last_build_id = stored.last_build_id;
        next.conditions = stored.conditions;
        self.store_status(self.stamped(next));
        Ok(())
    }

    async fn set_status_phase(
        &self,
        _canary: &Canary,
        phase: CanaryPhase,
    ) -> Result<(), WorkloadError> {
        let mut status = self.cluster.canary().status_or_default();
        status.phase = phase;
        if phase == CanaryPhase::Succeeded {
            status.last_promoted_spec = status.last_applied_spec.clone();
        }
        self.store_status(self.stamped(status));
        Ok(())
    }

    async fn set_status_weight(&self, _canary: &Canary, weight: i32) -> Result<(), WorkloadError> {
        let mut status = self.cluster.canary().status_or_default();
        status.canary_weight = weight;
        self.store_status(self.stamped(status));
        Ok(())
    }

    async fn set_status_iterations(
        &self,
        _canary: &Canary,
        iterations: i32,
    ) -> Result<(), WorkloadError> {
        let mut status = self.cluster.canary().status_or_default();
        status.iterations = iterations;
        self.store_status(self.stamped(status));
        Ok(())
    }

    async fn set_status_failed_checks(
        &self,
        _canary: &Canary,
        failed_checks: i32,
    ) -> Result<(), WorkloadError> {
        let mut status = self.cluster.canary().status_or_default();
        status.failed_checks = failed_checks;
        self.store_status(self.stamped(status));
        Ok(())
    }

    async fn get_metadata(&self, _canary: &Canary) -> Result<WorkloadMetadata, WorkloadError> {
        Ok(WorkloadMetadata {
            label_selector: "app".to_string(),
            label_value: "podinfo".to_string(),
            ports: BTreeMap::from([("http".to_string(), 9898)]),
            labels: BTreeMap::from([("app".to_string(), "podinfo".to_string())]),
        })
    }

    async fn finalize(&self, canary: &Canary) -> Result<(), WorkloadError> {
        let promoted = canary.status_or_default().last_promoted_spec;
        if !promoted.is_empty() {
            *self.primary_template.lock().unwrap() = promoted;
        }
        Ok(())
    }
}

/// Router remembering the last applied split
pub(crate) struct FakeMeshRouter {
    routes: Mutex<Option<Routes>>,
}

impl FakeMeshRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(None),
        })
    }

    pub fn routes(&self) -> Routes {
        self.routes.lock().unwrap().unwrap_or(Routes {
            primary_weight: 100,
            canary_weight: 0,
            mirrored: false,
        })
    }

    /// Overwrite the split to simulate drift behind the controller's back
    pub fn drift(&self, routes: Routes) {
        *self.routes.lock().unwrap() = Some(routes);
    }
}

#[async_trait]
impl MeshRouter for FakeMeshRouter {
    async fn reconcile(&self, _canary: &Canary) -> Result<(), RouterError> {
        let mut routes = self.routes.lock().unwrap();
        if routes.is_none() {
            *routes = Some(Routes {
                primary_weight: 100,
                canary_weight: 0,
                mirrored: false,
            });
        }
        Ok(())
    }

    async fn set_routes(
        &self,
        _canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<(), RouterError> {
        *self.routes.lock().unwrap() = Some(Routes {
            primary_weight,
            canary_weight,
            mirrored,
        });
        Ok(())
    }

    async fn get_routes(&self, _canary: &Canary) -> Result<Routes, RouterError> {
        Ok(self.routes())
    }
}

pub(crate) struct FakeServiceRouter;

#[async_trait]
impl ServiceRouter for FakeServiceRouter {
    async fn initialize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }

    async fn reconcile(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }
}

/// Scripted hook client; unknown URLs answer 200 with an empty body
pub(crate) struct FakeHookClient {
    responses: Mutex<HashMap<String, Result<Vec<u8>, (u16, String)>>>,
    pub calls: Mutex<Vec<(String, CanaryWebhookPayload)>>,
}

impl FakeHookClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn respond(&self, url: &str, body: &[u8]) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.to_vec()));
    }

    pub fn fail(&self, url: &str, code: u16, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Err((code, body.to_string())));
    }

    pub fn calls_to(&self, url: &str) -> Vec<CanaryWebhookPayload> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl HookClient for FakeHookClient {
    async fn call(
        &self,
        url: &str,
        payload: &CanaryWebhookPayload,
        _timeout: Duration,
        _retries: i32,
    ) -> Result<Vec<u8>, WebhookError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        match self.responses.lock().unwrap().get(url) {
            None => Ok(Vec::new()),
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err((code, body))) => Err(WebhookError::Status {
                code: *code,
                body: body.clone(),
            }),
        }
    }
}

pub(crate) struct RecordingEvents {
    pub events: Mutex<Vec<(EventKind, String)>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, _canary: &Canary, kind: EventKind, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((kind, message.to_string()));
    }
}

pub(crate) struct RecordingNotifier {
    pub alerts: Mutex<Vec<(AlertSeverity, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alerts: Mutex::new(Vec::new()),
        })
    }

    pub fn severities(&self) -> Vec<AlertSeverity> {
        self.alerts.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post(
        &self,
        _name: &str,
        _namespace: &str,
        message: &str,
        _fields: &[AlertField],
        severity: AlertSeverity,
        _canary_id: &str,
    ) -> Result<(), NotifierError> {
        self.alerts
            .lock()
            .unwrap()
            .push((severity, message.to_string()));
        Ok(())
    }
}

pub(crate) struct FakeNotifierFactory {
    notifier: Arc<RecordingNotifier>,
}

impl FakeNotifierFactory {
    pub fn new(notifier: Arc<RecordingNotifier>) -> Arc<Self> {
        Arc::new(Self { notifier })
    }
}

impl NotifierFactory for FakeNotifierFactory {
    fn notifier(
        &self,
        _provider_type: &str,
        _endpoint: NotifierEndpoint,
    ) -> Result<Arc<dyn Notifier>, NotifierError> {
        Ok(self.notifier.clone())
    }
}

/// Observer answering the builtin metric names with settable values
pub(crate) struct FakeObserver {
    pub success_rate: Mutex<f64>,
    pub duration: Mutex<f64>,
    pub raw: Mutex<f64>,
}

impl FakeObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            success_rate: Mutex::new(99.9),
            duration: Mutex::new(100.0),
            raw: Mutex::new(1.0),
        })
    }

    pub fn set_duration(&self, value: f64) {
        *self.duration.lock().unwrap() = value;
    }

    #[allow(dead_code)]
    pub fn set_success_rate(&self, value: f64) {
        *self.success_rate.lock().unwrap() = value;
    }
}

#[async_trait]
impl Observer for FakeObserver {
    async fn request_success_rate(
        &self,
        _model: &MetricTemplateModel,
    ) -> Result<f64, MetricError> {
        Ok(*self.success_rate.lock().unwrap())
    }

    async fn request_duration(&self, _model: &MetricTemplateModel) -> Result<f64, MetricError> {
        Ok(*self.duration.lock().unwrap())
    }

    async fn raw_query(&self, _query: &str) -> Result<f64, MetricError> {
        Ok(*self.raw.lock().unwrap())
    }

    async fn is_online(&self) -> Result<bool, MetricError> {
        Ok(true)
    }
}

/// Provider answering queued results, falling back to a default value
pub(crate) struct FakeProvider {
    pub queue: Mutex<VecDeque<Result<f64, MetricError>>>,
    pub default: f64,
}

impl FakeProvider {
    pub fn with_default(default: f64) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            default,
        })
    }

    #[allow(dead_code)]
    pub fn enqueue(&self, result: Result<f64, MetricError>) {
        self.queue.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl MetricProvider for FakeProvider {
    async fn execute_current_query(&self, _query: &str) -> Result<f64, MetricError> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.default))
    }

    async fn get_previous_metric_value(&self, _query: &str) -> Result<f64, MetricError> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.default))
    }

    async fn is_online(&self) -> Result<bool, MetricError> {
        Ok(true)
    }
}

pub(crate) struct FakeMetricFactory {
    pub observer: Arc<FakeObserver>,
    pub provider: Arc<FakeProvider>,
}

impl FakeMetricFactory {
    pub fn new(observer: Arc<FakeObserver>, provider: Arc<FakeProvider>) -> Arc<Self> {
        Arc::new(Self { observer, provider })
    }
}

#[async_trait]
impl MetricProviderFactory for FakeMetricFactory {
    async fn provider(
        &self,
        _metric_interval: &str,
        _history_window: &str,
        _provider: &crate::crd::MetricTemplateProvider,
        _credentials: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Arc<dyn MetricProvider>, MetricError> {
        Ok(self.provider.clone())
    }

    fn builtin_observer(
        &self,
        _metrics_server: Option<&str>,
    ) -> Result<Arc<dyn Observer>, MetricError> {
        Ok(self.observer.clone())
    }
}

/// Canary guarded by the scenario fixtures
pub(crate) fn test_canary(analysis: CanaryAnalysis) -> Canary {
    let mut canary = Canary::new(
        "podinfo",
        CanarySpec {
            target_ref: TargetReference {
                api_version: Some("apps/v1".into()),
                kind: "Deployment".into(),
                name: "podinfo".into(),
            },
            provider: None,
            metrics_server: None,
            ingress_ref: None,
            route_ref: None,
            service: CanaryService::default(),
            analysis: Some(analysis),
            skip_analysis: false,
            suspend: false,
            revert_on_deletion: false,
            progress_deadline_seconds: None,
        },
    );
    canary.metadata.namespace = Some("test".into());
    canary
}

/// Progressive analysis: 10% steps up to 50%, builtin metrics
pub(crate) fn progressive_analysis() -> CanaryAnalysis {
    CanaryAnalysis {
        interval: Some("1m".into()),
        threshold: Some(10),
        max_weight: Some(50),
        step_weight: Some(10),
        metrics: vec![
            CanaryMetric {
                name: "request-success-rate".into(),
                interval: Some("1m".into()),
                threshold_range: Some(ThresholdRange {
                    min: Some(99.0),
                    max: None,
                }),
                ..Default::default()
            },
            CanaryMetric {
                name: "request-duration".into(),
                interval: Some("30s".into()),
                threshold: Some(500.0),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

/// Everything a scenario test needs, wired together
pub(crate) struct Fixture {
    pub ctrl: Arc<Controller>,
    pub cluster: Arc<InMemoryCluster>,
    pub workload: Arc<FakeWorkload>,
    pub mesh: Arc<FakeMeshRouter>,
    pub hooks: Arc<FakeHookClient>,
    pub events: Arc<RecordingEvents>,
    pub notifier: Arc<RecordingNotifier>,
    pub observer: Arc<FakeObserver>,
    pub clock: Arc<MockClock>,
}

impl Fixture {
    pub fn new(canary: Canary) -> Self {
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let cluster = InMemoryCluster::new(canary);
        let workload = FakeWorkload::new(cluster.clone(), clock.clone());
        let mesh = FakeMeshRouter::new();
        let hooks = FakeHookClient::new();
        let events = RecordingEvents::new();
        let notifier = RecordingNotifier::new();
        let observer = FakeObserver::new();
        let provider = FakeProvider::with_default(1.0);

        let workloads = WorkloadTable::new()
            .with_kind(crate::workload::WorkloadKind::Deployment, workload.clone());
        let routers = RouterTable::new(Arc::new(FakeServiceRouter)).with_mesh("istio", mesh.clone());

        let collaborators = Collaborators {
            workloads,
            routers,
            metric_factory: FakeMetricFactory::new(observer.clone(), provider),
            notifier: Some(notifier.clone() as std::sync::Arc<dyn Notifier>),
            notifier_factory: FakeNotifierFactory::new(notifier.clone()),
            hook_client: hooks.clone(),
            event_recorder: events.clone(),
        };

        let config = ControllerConfig {
            mesh_provider: "istio".to_string(),
            ..Default::default()
        };

        let ctrl = Arc::new(Controller::new(
            cluster.clone(),
            collaborators,
            config,
            create_metrics().expect("metrics registry"),
            clock.clone(),
        ));

        Self {
            ctrl,
            cluster,
            workload,
            mesh,
            hooks,
            events,
            notifier,
            observer,
            clock,
        }
    }

    /// One scheduling tick, one analysis interval later
    pub async fn tick(&self) {
        self.clock.advance(chrono::Duration::seconds(61));
        self.ctrl.advance_canary("podinfo", "test").await;
    }

    /// Put the canary mid-run at the given weight, as if earlier ticks
    /// progressed it there
    pub fn seed_progressing(&self, weight: i32) {
        self.mesh.drift(Routes {
            primary_weight: 100 - weight,
            canary_weight: weight,
            mirrored: false,
        });
        let template_hash = self.workload.template_hash();
        let tracked = self.workload.tracked_configs();
        let stamp = (self.clock.now() - chrono::Duration::seconds(120)).to_rfc3339();
        self.cluster.mutate_canary(|canary| {
            let mut status = canary.status_or_default();
            status.phase = CanaryPhase::Progressing;
            status.canary_weight = weight;
            status.last_applied_spec = template_hash;
            status.tracked_configs = Some(tracked);
            status.last_transition_time = Some(stamp);
            canary.status = Some(status);
        });
    }

    pub fn phase(&self) -> CanaryPhase {
        self.cluster.status().phase
    }

    pub fn routes(&self) -> Routes {
        self.mesh.routes()
    }
}
