//! Service wiring: one shared store handle feeding the report service and
//! the idempotency broker.

use std::sync::Arc;

use reportd_infra::idempotency::IdempotencyBroker;
use reportd_infra::service::ReportService;
use reportd_infra::store::ReportStore;

pub struct AppServices {
    pub reports: ReportService,
    pub broker: IdempotencyBroker,
}

impl AppServices {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        let reports = ReportService::new(store.clone());
        let broker = IdempotencyBroker::new(store, reports.clone());
        Self { reports, broker }
    }
}
