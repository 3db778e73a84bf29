use std::collections::HashMap;
use std::sync::Arc;

use crate::csv::contract::CsvContract;
use crate::csv::{export, CsvPipeline, ImportReport};
use crate::error::{EngineError, Result};
use crate::job::{BulkJob, CancelToken, JobPayload, JobRunner};
use crate::patch::{PatchEngine, PatchOutcome};
use crate::schema::EntitySchema;
use crate::snapshot::Snapshot;
use crate::store::{
    Authorization, Caller, ChangeHistoryStore, EntityReference, MemoryStore, PermitAll,
    Persistence, ReferenceResolver,
};

struct Inner {
    persistence: Arc<dyn Persistence>,
    resolver: Arc<dyn ReferenceResolver>,
    schemas: HashMap<String, EntitySchema>,
    contracts: HashMap<String, CsvContract>,
    patch: PatchEngine,
    jobs: JobRunner,
}

/// The engine façade: single-entity patching, synchronous bulk
/// import/export, and their job-backed asynchronous variants, wired over
/// the collaborator traits in `store`.
#[derive(Clone)]
pub struct CatalogEngine {
    inner: Arc<Inner>,
}

impl CatalogEngine {
    pub fn builder() -> CatalogEngineBuilder {
        CatalogEngineBuilder::default()
    }

    fn schema(&self, entity_type: &str) -> Result<&EntitySchema> {
        self.inner.schemas.get(entity_type).ok_or_else(|| {
            EngineError::Validation(format!(
                "no schema registered for entity type '{}'",
                entity_type
            ))
        })
    }

    fn contract(&self, entity_type: &str) -> Result<&CsvContract> {
        self.inner.contracts.get(entity_type).ok_or_else(|| {
            EngineError::Validation(format!(
                "no csv contract registered for entity type '{}'",
                entity_type
            ))
        })
    }

    pub fn get(&self, entity_type: &str, key: &str) -> Result<Option<Snapshot>> {
        self.inner.persistence.load(entity_type, key)
    }

    pub fn create(
        &self,
        entity_type: &str,
        requested: &Snapshot,
        caller: &Caller,
    ) -> Result<PatchOutcome> {
        let schema = self.schema(entity_type)?;
        self.inner.patch.create(schema, requested, caller)
    }

    /// Applies a full requested snapshot to an existing entity; fails with
    /// `NotFound`, `Forbidden`, or (after bounded retries) `Conflict`.
    pub fn apply_patch(
        &self,
        entity_type: &str,
        key: &str,
        requested: &Snapshot,
        caller: &Caller,
    ) -> Result<PatchOutcome> {
        let schema = self.schema(entity_type)?;
        self.inner.patch.apply(schema, key, requested, caller)
    }

    /// Synchronous bulk import of a CSV payload.
    pub fn import_csv(
        &self,
        entity_type: &str,
        scope: Option<&EntityReference>,
        text: &str,
        dry_run: bool,
        caller: &Caller,
    ) -> Result<ImportReport> {
        let schema = self.schema(entity_type)?;
        let contract = self.contract(entity_type)?;
        let pipeline = CsvPipeline::new(
            schema,
            contract,
            self.inner.persistence.as_ref(),
            self.inner.resolver.as_ref(),
            &self.inner.patch,
        );
        pipeline.run(text, scope, dry_run, &CancelToken::new(), caller)
    }

    /// Synchronous bulk export, the inverse of `import_csv`.
    pub fn export_csv(&self, entity_type: &str, scope: Option<&EntityReference>) -> Result<String> {
        let contract = self.contract(entity_type)?;
        export::export(
            contract,
            self.inner.persistence.as_ref(),
            self.inner.resolver.as_ref(),
            scope,
        )
    }

    /// Queues an import as a background job and returns its id immediately.
    pub fn submit_import(
        &self,
        entity_type: &str,
        scope: Option<EntityReference>,
        text: String,
        dry_run: bool,
        caller: Caller,
    ) -> Result<String> {
        self.schema(entity_type)?;
        self.contract(entity_type)?;
        let engine = self.clone();
        let entity_type = entity_type.to_string();
        self.inner.jobs.submit(move |token| {
            let schema = engine.schema(&entity_type)?;
            let contract = engine.contract(&entity_type)?;
            let pipeline = CsvPipeline::new(
                schema,
                contract,
                engine.inner.persistence.as_ref(),
                engine.inner.resolver.as_ref(),
                &engine.inner.patch,
            );
            let report = pipeline.run(&text, scope.as_ref(), dry_run, token, &caller)?;
            Ok(JobPayload::Import(report))
        })
    }

    /// Queues an export as a background job and returns its id immediately.
    pub fn submit_export(
        &self,
        entity_type: &str,
        scope: Option<EntityReference>,
    ) -> Result<String> {
        self.contract(entity_type)?;
        let engine = self.clone();
        let entity_type = entity_type.to_string();
        self.inner.jobs.submit(move |_token| {
            let csv = engine.export_csv(&entity_type, scope.as_ref())?;
            Ok(JobPayload::Export(csv))
        })
    }

    pub fn job_status(&self, job_id: &str) -> Result<Option<BulkJob>> {
        self.inner.jobs.status(job_id)
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.inner.jobs.cancel(job_id)
    }

    pub fn remove_job(&self, job_id: &str) -> Result<Option<BulkJob>> {
        self.inner.jobs.remove(job_id)
    }
}

#[derive(Default)]
pub struct CatalogEngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    authorization: Option<Arc<dyn Authorization>>,
    resolver: Option<Arc<dyn ReferenceResolver>>,
    history: Option<Arc<dyn ChangeHistoryStore>>,
    schemas: Vec<EntitySchema>,
    contracts: Vec<CsvContract>,
    session_window_ms: Option<i64>,
}

impl CatalogEngineBuilder {
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn authorization(mut self, authorization: Arc<dyn Authorization>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ReferenceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn history(mut self, history: Arc<dyn ChangeHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Wires one `MemoryStore` as persistence, change history, and
    /// reference resolver at once.
    pub fn memory_store(mut self, store: MemoryStore) -> Self {
        self.persistence = Some(Arc::new(store.clone()));
        self.history = Some(Arc::new(store.clone()));
        self.resolver = Some(Arc::new(store));
        self
    }

    pub fn register(mut self, schema: EntitySchema) -> Self {
        self.schemas.push(schema);
        self
    }

    pub fn register_csv(mut self, contract: CsvContract) -> Self {
        self.contracts.push(contract);
        self
    }

    pub fn session_window_ms(mut self, session_window_ms: i64) -> Self {
        self.session_window_ms = Some(session_window_ms);
        self
    }

    pub fn build(self) -> Result<CatalogEngine> {
        let persistence = self
            .persistence
            .ok_or_else(|| EngineError::internal("persistence collaborator not configured"))?;
        let history = self
            .history
            .ok_or_else(|| EngineError::internal("change history collaborator not configured"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| EngineError::internal("reference resolver not configured"))?;
        let authorization = self.authorization.unwrap_or_else(|| Arc::new(PermitAll));

        let mut patch = PatchEngine::new(persistence.clone(), authorization, history);
        if let Some(window) = self.session_window_ms {
            patch = patch.with_session_window_ms(window);
        }

        let schemas = self
            .schemas
            .into_iter()
            .map(|s| (s.entity_type().to_string(), s))
            .collect();
        let contracts = self
            .contracts
            .into_iter()
            .map(|c| (c.entity_type().to_string(), c))
            .collect();

        Ok(CatalogEngine {
            inner: Arc::new(Inner {
                persistence,
                resolver,
                schemas,
                contracts,
                patch,
                jobs: JobRunner::new(),
            }),
        })
    }
}
